//! Subscription types for the watcher's event channel.

use crate::error::WatchError;
use crate::types::{ChangeEvent, EventKind, Namespace};

/// Configuration for a subscription.
#[derive(Clone, Debug)]
pub struct SubscriptionConfig {
    /// Max buffered events before dropping subscriber.
    /// Default: 1000
    pub buffer_size: usize,

    /// Filter criteria.
    pub filter: SubscriptionFilter,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1000,
            filter: SubscriptionFilter::all(),
        }
    }
}

/// Filter criteria for subscriptions.
#[derive(Clone, Debug, Default)]
pub struct SubscriptionFilter {
    /// Event kinds to receive (None = all kinds).
    pub kinds: Option<Vec<EventKind>>,

    /// Include connect/disconnect notices.
    pub include_lifecycle: bool,
}

impl SubscriptionFilter {
    /// Subscribe to insert, update and delete events.
    pub fn changes() -> Self {
        Self::kinds(EventKind::CHANGES.to_vec())
    }

    /// Subscribe to specific event kinds.
    pub fn kinds(kinds: Vec<EventKind>) -> Self {
        Self {
            kinds: Some(kinds),
            include_lifecycle: false,
        }
    }

    /// Subscribe to errors only.
    pub fn errors() -> Self {
        Self::kinds(vec![EventKind::Error])
    }

    /// Subscribe to everything.
    pub fn all() -> Self {
        Self {
            kinds: None,
            include_lifecycle: true,
        }
    }

    pub(crate) fn wants(&self, kind: EventKind) -> bool {
        match self.kinds {
            Some(ref kinds) => kinds.contains(&kind),
            None => true,
        }
    }
}

/// Events delivered to channel subscribers.
#[derive(Clone, Debug, PartialEq)]
pub enum WatchEvent {
    // --- Change Events ---
    /// A classified change from the watched collection.
    Change(ChangeEvent),

    /// A failure reported through the error channel.
    Error(WatchError),

    // --- Lifecycle Events ---
    /// A change stream was opened.
    Connected { namespace: Namespace },

    /// The change stream was lost; a reconnect is scheduled.
    Disconnected { reason: String },

    /// Subscription was dropped.
    Dropped { reason: DropReason },
}

impl WatchEvent {
    /// Event kind, for change and error events.
    pub fn kind(&self) -> Option<EventKind> {
        match self {
            WatchEvent::Change(event) => Some(event.kind()),
            WatchEvent::Error(_) => Some(EventKind::Error),
            _ => None,
        }
    }
}

/// Why a subscription was dropped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DropReason {
    /// Send buffer overflowed (slow consumer).
    BufferOverflow,
    /// The watcher was stopped.
    Stopped,
    /// Explicitly unsubscribed.
    Unsubscribed,
}

/// Unique identifier for a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Handle to a subscription on the event channel.
pub struct EventSubscription {
    pub id: SubscriptionId,
    /// Channel to receive events.
    pub receiver: crossbeam_channel::Receiver<WatchEvent>,
}

impl EventSubscription {
    /// Receive the next event (blocking).
    pub fn recv(&self) -> Result<WatchEvent, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive an event (non-blocking).
    pub fn try_recv(&self) -> Result<WatchEvent, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> Result<WatchEvent, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}
