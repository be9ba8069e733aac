//! # Stream Watcher
//!
//! A change-data-capture watcher: attaches to one collection, follows its
//! ordered feed of mutations and dispatches each one to typed handlers.
//!
//! ## Core Concepts
//!
//! - **Source**: the opaque connection/change-stream capability the watcher
//!   consumes ([`ChangeSource`], [`ChangeStream`])
//! - **Events**: raw notifications classified into insert, update (full
//!   post-change document) and delete (document key) events
//! - **Handlers**: one typed callback per kind, plus any number of extra
//!   listeners and channel subscriptions
//! - **Reconnect**: stream failures are reported and the stream is reopened
//!   after a delay, for as long as the watcher is not stopped
//!
//! ## Example
//!
//! ```ignore
//! use stream_watcher::{Handlers, MemorySource, Watcher, WatcherConfig};
//! use std::sync::Arc;
//!
//! let source = MemorySource::new();
//! let handlers = Handlers::new()
//!     .on_insert(|doc| {
//!         println!("New document inserted: {:?}", doc);
//!         Ok(())
//!     })
//!     .on_error(|err| eprintln!("Error: {}", err));
//!
//! let watcher = Arc::new(Watcher::new(WatcherConfig::from_env(), handlers, source.clone())?);
//! let worker = watcher.spawn()?;
//!
//! // ... on shutdown
//! watcher.stop();
//! worker.join().unwrap()?;
//! ```

pub mod error;
pub mod source;
pub mod subscriptions;
pub mod types;
pub mod watcher;

// Re-exports
pub use error::{HandlerError, HandlerResult, Result, WatchError};
pub use source::{
    ChangeSource, ChangeStream, ConnectOptions, MemorySource, MemoryStream, OpenOptions,
    StreamItem,
};
pub use subscriptions::{
    DropReason, EventSubscription, SubscriptionConfig, SubscriptionFilter, SubscriptionId,
    SubscriptionManager, WatchEvent,
};
pub use types::*;
pub use watcher::{
    DocumentHandler, ErrorHandler, Handlers, KeyHandler, ListenerId, ReconnectPolicy, Watcher,
    WatcherConfig, WatcherState,
};
