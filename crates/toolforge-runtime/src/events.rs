//! Runtime event bus.
//!
//! Lifecycle, recovery and error events are published to a
//! [`tokio::sync::broadcast`] channel.  Consumers call
//! [`EventBus::subscribe`] and own their receiver; dropping it unsubscribes.
//!
//! Events are wrapped in [`Arc`] so broadcasting to many subscribers does not
//! clone the payload.
//!
//! ```rust,no_run
//! # use toolforge_runtime::events::{EventBus, RuntimeEvent};
//! # async fn example() {
//! let bus = EventBus::new(64);
//! let mut rx = bus.subscribe();
//!
//! bus.publish(RuntimeEvent::ModuleUnloaded {
//!     module_id: "json-formatter".into(),
//! });
//!
//! let event = rx.recv().await.unwrap();
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::classifier::ErrorReport;
use crate::error::ErrorCode;

/// Default channel capacity.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

/// Something observable happened inside the runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RuntimeEvent {
    /// A module finished loading and is cached.
    ModuleLoaded {
        module_id: String,
        version: String,
        /// Time spent materializing and initializing.
        load_time: Duration,
    },

    /// A loaded module was disposed and evicted.
    ModuleUnloaded { module_id: String },

    /// A descriptor was added or replaced in the registry.
    ModuleRegistered { module_id: String, version: String },

    /// A descriptor was replaced by a newer version from the update source.
    ModuleUpdated {
        module_id: String,
        from_version: String,
        to_version: String,
    },

    /// A failed call will be retried after `delay`.
    RetryScheduled {
        module_id: String,
        /// 1-based retry number.
        attempt: u32,
        delay: Duration,
        /// Code of the failure being retried.
        code: ErrorCode,
    },

    /// A module's circuit breaker tripped.
    CircuitOpened {
        module_id: String,
        consecutive_failures: u32,
    },

    /// A module's circuit breaker closed after a successful trial call.
    CircuitClosed { module_id: String },

    /// A fallback module is being tried in place of a failing primary.
    FallbackInvoked { primary: String, fallback: String },

    /// A call failed; the report carries the normalized error.
    ErrorReported(ErrorReport),
}

// ---------------------------------------------------------------------------
// Bus
// ---------------------------------------------------------------------------

/// Publish/subscribe channel for [`RuntimeEvent`]s.
///
/// Cheaply cloneable; all clones publish to the same subscribers.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<EventBusInner>,
}

struct EventBusInner {
    sender: broadcast::Sender<Arc<RuntimeEvent>>,
}

impl EventBus {
    /// Create a bus with the given channel capacity.
    ///
    /// A subscriber that falls more than `capacity` events behind receives
    /// [`broadcast::error::RecvError::Lagged`].
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(EventBusInner { sender }),
        }
    }

    /// Publish to all current subscribers and return how many will see it.
    ///
    /// With no subscribers the event is dropped.
    pub fn publish(&self, event: RuntimeEvent) -> usize {
        match self.inner.sender.send(Arc::new(event)) {
            Ok(n) => {
                tracing::trace!(receivers = n, "runtime event published");
                n
            }
            Err(_) => 0,
        }
    }

    /// Subscribe to events published from now on.  Earlier events are not
    /// replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<RuntimeEvent>> {
        self.inner.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
