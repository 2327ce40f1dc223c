//! Subscription configuration.
//!
//! Loaded from environment variables with defaults, or deserialized from any
//! serde source. Missing fields take their defaults.

use eventstore_tools_core::event_log::{ConsumerStrategy, PersistentSubscriptionSettings};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Prefix of every environment variable read by [`SubscriptionProperties::from_env`].
pub const ENV_PREFIX: &str = "EVENTSTORE_SUBSCRIPTIONS_";

/// Settings shared by the catch-up and persistent subscription managers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionProperties {
    /// Master switch; managers start nothing while this is false.
    pub enabled: bool,
    /// Update existing persistent subscriptions with the declared settings.
    pub update_enabled: bool,
    /// Server-side timeout before an unacknowledged record is retried.
    pub message_timeout_millis: u64,
    /// Server-side retries before a record is parked.
    pub max_retry_count: u32,
    /// Acknowledgements the server batches before checkpointing.
    pub min_checkpoint_count: u32,
    /// Only start catch-up subscriptions once leadership is granted.
    pub enable_catchup_subscription_leader_election: bool,
    /// Leader lock lifetime, passed to the election component.
    pub leader_lock_time_to_live_millis: u64,
    /// Pause between lock attempts, passed to the election component.
    pub leader_lock_idle_between_tries_millis: u64,
    /// Leader heartbeat interval, passed to the election component.
    pub leader_heartbeat_millis: u64,
    /// Busy wait of the election component.
    pub leader_busy_wait_millis: u64,
    /// Pause before an automatic resubscription.
    pub resubscribe_delay_millis: u64,
    /// Upper bound on stopping one live subscription handle.
    pub stop_timeout_millis: u64,
}

impl Default for SubscriptionProperties {
    fn default() -> Self {
        Self {
            enabled: false,
            update_enabled: false,
            message_timeout_millis: 30_000,
            max_retry_count: 10,
            min_checkpoint_count: 10,
            enable_catchup_subscription_leader_election: true,
            leader_lock_time_to_live_millis: 10_000,
            leader_lock_idle_between_tries_millis: 1_000,
            leader_heartbeat_millis: 2_000,
            leader_busy_wait_millis: 2_000,
            resubscribe_delay_millis: 1_000,
            stop_timeout_millis: 60_000,
        }
    }
}

impl SubscriptionProperties {
    /// Load configuration from `EVENTSTORE_SUBSCRIPTIONS_*` environment
    /// variables. Unset or unparsable variables keep their default.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration through `lookup`, which receives full variable
    /// names such as `EVENTSTORE_SUBSCRIPTIONS_ENABLED`.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let read = |key: &str| lookup(&format!("{ENV_PREFIX}{key}"));

        Self {
            enabled: read("ENABLED")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.enabled),
            update_enabled: read("UPDATE_ENABLED")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.update_enabled),
            message_timeout_millis: read("MESSAGE_TIMEOUT_MILLIS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.message_timeout_millis),
            max_retry_count: read("MAX_RETRY_COUNT")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_retry_count),
            min_checkpoint_count: read("MIN_CHECKPOINT_COUNT")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.min_checkpoint_count),
            enable_catchup_subscription_leader_election: read(
                "ENABLE_CATCHUP_SUBSCRIPTION_LEADER_ELECTION",
            )
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.enable_catchup_subscription_leader_election),
            leader_lock_time_to_live_millis: read("LEADER_LOCK_TIME_TO_LIVE_MILLIS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.leader_lock_time_to_live_millis),
            leader_lock_idle_between_tries_millis: read("LEADER_LOCK_IDLE_BETWEEN_TRIES_MILLIS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.leader_lock_idle_between_tries_millis),
            leader_heartbeat_millis: read("LEADER_HEARTBEAT_MILLIS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.leader_heartbeat_millis),
            leader_busy_wait_millis: read("LEADER_BUSY_WAIT_MILLIS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.leader_busy_wait_millis),
            resubscribe_delay_millis: read("RESUBSCRIBE_DELAY_MILLIS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.resubscribe_delay_millis),
            stop_timeout_millis: read("STOP_TIMEOUT_MILLIS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.stop_timeout_millis),
        }
    }

    /// Pause before an automatic resubscription.
    #[must_use]
    pub const fn resubscribe_delay(&self) -> Duration {
        Duration::from_millis(self.resubscribe_delay_millis)
    }

    /// Upper bound on stopping one live subscription handle.
    #[must_use]
    pub const fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_millis)
    }

    /// Server-side settings for a persistent subscription.
    #[must_use]
    pub const fn persistent_settings(
        &self,
        start_from: u64,
        consumer_strategy: ConsumerStrategy,
    ) -> PersistentSubscriptionSettings {
        PersistentSubscriptionSettings {
            start_from,
            consumer_strategy,
            message_timeout: Duration::from_millis(self.message_timeout_millis),
            max_retry_count: self.max_retry_count,
            min_checkpoint_count: self.min_checkpoint_count,
            resolve_link_tos: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults() {
        let properties = SubscriptionProperties::default();
        assert!(!properties.enabled);
        assert!(!properties.update_enabled);
        assert!(properties.enable_catchup_subscription_leader_election);
        assert_eq!(properties.stop_timeout(), Duration::from_secs(60));
        assert_eq!(properties.resubscribe_delay(), Duration::from_secs(1));
    }

    #[test]
    fn lookup_overrides_and_ignores_garbage() {
        let vars: HashMap<String, String> = [
            ("EVENTSTORE_SUBSCRIPTIONS_ENABLED", "true"),
            ("EVENTSTORE_SUBSCRIPTIONS_MAX_RETRY_COUNT", "3"),
            ("EVENTSTORE_SUBSCRIPTIONS_STOP_TIMEOUT_MILLIS", "not a number"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let properties = SubscriptionProperties::from_lookup(|name| vars.get(name).cloned());
        assert!(properties.enabled);
        assert_eq!(properties.max_retry_count, 3);
        assert_eq!(properties.stop_timeout_millis, 60_000);
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn partial_json_keeps_defaults() {
        let properties: SubscriptionProperties =
            serde_json::from_str(r#"{"enabled": true, "update_enabled": true}"#).unwrap();
        assert!(properties.enabled);
        assert!(properties.update_enabled);
        assert_eq!(properties.message_timeout_millis, 30_000);
    }

    #[test]
    fn persistent_settings_carry_limits() {
        let properties = SubscriptionProperties {
            message_timeout_millis: 5_000,
            max_retry_count: 2,
            ..SubscriptionProperties::default()
        };
        let settings = properties.persistent_settings(7, ConsumerStrategy::Pinned);
        assert_eq!(settings.start_from, 7);
        assert_eq!(settings.consumer_strategy, ConsumerStrategy::Pinned);
        assert_eq!(settings.message_timeout, Duration::from_secs(5));
        assert_eq!(settings.max_retry_count, 2);
        assert!(settings.resolve_link_tos);
    }
}
