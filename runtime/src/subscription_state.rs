//! Per-handler subscription handle cell.
//!
//! Each handler owns one cell holding at most one live subscription handle
//! and a generation counter. Every start, drop and accepted close bumps the
//! generation. A listener remembers the generation it was started under, so
//! a close callback from a superseded subscription can be recognised and
//! ignored.

use crate::metrics::SubscriptionMetrics;
use eventstore_tools_core::event_log::SubscriptionHandle;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Generation a subscription was started under.
pub type Generation = u64;

struct Slot {
    generation: Generation,
    handle: Option<Box<dyn SubscriptionHandle>>,
}

/// Labels of the connection gauge.
#[derive(Clone, Debug)]
pub struct ConnectionGauge {
    handler: String,
    group_name: String,
    stream_name: String,
}

impl ConnectionGauge {
    /// Gauge for one catch-up handler.
    #[must_use]
    pub fn new(
        handler: impl Into<String>,
        group_name: impl Into<String>,
        stream_name: impl Into<String>,
    ) -> Self {
        Self {
            handler: handler.into(),
            group_name: group_name.into(),
            stream_name: stream_name.into(),
        }
    }

    fn set(&self, live: bool) {
        SubscriptionMetrics::record_connection(
            &self.handler,
            &self.group_name,
            &self.stream_name,
            live,
        );
    }
}

/// Subscription handle cell of one handler.
pub struct SubscriptionState {
    name: String,
    slot: Mutex<Slot>,
    stop_timeout: Duration,
    gauge: Option<ConnectionGauge>,
}

impl SubscriptionState {
    /// Empty cell for handler `name`; stopping a handle may take at most
    /// `stop_timeout`.
    #[must_use]
    pub fn new(name: impl Into<String>, stop_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            slot: Mutex::new(Slot {
                generation: 0,
                handle: None,
            }),
            stop_timeout,
            gauge: None,
        }
    }

    /// Report liveness through `gauge`.
    #[must_use]
    pub fn with_gauge(mut self, gauge: ConnectionGauge) -> Self {
        self.gauge = Some(gauge);
        self
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_gauge(&self, live: bool) {
        if let Some(gauge) = &self.gauge {
            gauge.set(live);
        }
    }

    /// Current generation.
    #[must_use]
    pub fn generation(&self) -> Generation {
        self.lock().generation
    }

    /// Whether a live handle is installed.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.lock().handle.is_some()
    }

    /// Start a new generation, stopping the current handle if any.
    pub async fn begin(&self) -> Generation {
        let (generation, previous) = {
            let mut slot = self.lock();
            slot.generation += 1;
            (slot.generation, slot.handle.take())
        };
        if let Some(previous) = previous {
            self.set_gauge(false);
            self.stop(previous).await;
        }
        generation
    }

    /// Install `handle` if `generation` is still current; otherwise stop it.
    ///
    /// Returns whether the handle was installed. A previous handle is stopped
    /// before the new one is installed.
    pub async fn update(&self, generation: Generation, handle: Box<dyn SubscriptionHandle>) -> bool {
        let previous = {
            let mut slot = self.lock();
            if slot.generation == generation {
                slot.handle.take()
            } else {
                None
            }
        };
        if let Some(previous) = previous {
            self.stop(previous).await;
        }

        let stale = {
            let mut slot = self.lock();
            if slot.generation == generation {
                slot.handle = Some(handle);
                None
            } else {
                Some(handle)
            }
        };

        match stale {
            None => {
                self.set_gauge(true);
                true
            }
            Some(handle) => {
                tracing::debug!(
                    handler = %self.name,
                    generation,
                    "Subscription superseded while starting, stopping it"
                );
                self.stop(handle).await;
                false
            }
        }
    }

    /// Accept the close of the subscription started under `generation`.
    ///
    /// Returns the new generation, or `None` when the close belongs to a
    /// superseded subscription and must be ignored.
    pub fn close(&self, generation: Generation) -> Option<Generation> {
        let (next, closed) = {
            let mut slot = self.lock();
            if slot.generation != generation {
                return None;
            }
            slot.generation += 1;
            (slot.generation, slot.handle.take())
        };
        drop(closed);
        self.set_gauge(false);
        Some(next)
    }

    /// Stop the live handle, if any. Safe to call repeatedly.
    pub async fn drop_subscription(&self) {
        let handle = {
            let mut slot = self.lock();
            slot.generation += 1;
            slot.handle.take()
        };
        self.set_gauge(false);
        if let Some(handle) = handle {
            tracing::info!(handler = %self.name, "Dropping subscription");
            self.stop(handle).await;
        }
    }

    async fn stop(&self, handle: Box<dyn SubscriptionHandle>) {
        if tokio::time::timeout(self.stop_timeout, handle.stop())
            .await
            .is_err()
        {
            tracing::warn!(
                handler = %self.name,
                timeout_ms = self.stop_timeout.as_millis(),
                "Timed out stopping subscription"
            );
        }
    }
}
