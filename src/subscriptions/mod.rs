//! Channel subscriptions to watcher events.
//!
//! Alongside the typed callbacks, a watcher publishes every event on a
//! channel-based feed:
//! - Insert, update and delete events
//! - Errors reported through the error channel
//! - Connect/disconnect notices
//!
//! Subscriptions support:
//! - Filtering by event kind
//! - Bounded buffers with slow-subscriber dropping
//!
//! # Example
//!
//! ```ignore
//! let subscription = watcher.subscribe(SubscriptionConfig {
//!     filter: SubscriptionFilter::changes(),
//!     ..Default::default()
//! });
//!
//! loop {
//!     match subscription.recv() {
//!         Ok(WatchEvent::Change(event)) => println!("Got change: {:?}", event),
//!         Ok(WatchEvent::Dropped { reason }) => break,
//!         Ok(_) => {}
//!         Err(_) => break,
//!     }
//! }
//! ```

mod manager;
mod types;

pub use manager::SubscriptionManager;
pub use types::{
    DropReason, EventSubscription, SubscriptionConfig, SubscriptionFilter, SubscriptionId,
    WatchEvent,
};
