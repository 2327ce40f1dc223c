//! Leadership signals from an external election component.

use futures::future::BoxFuture;

/// Handle to the election the current instance takes part in.
pub trait LeadershipContext: Send + Sync {
    /// Give up leadership so another instance can take over.
    fn yield_leadership(&self) -> BoxFuture<'_, ()>;
}

/// Signal delivered by the election component.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum LeadershipEvent {
    /// This instance became leader.
    Granted,
    /// This instance lost leadership.
    Revoked,
}
