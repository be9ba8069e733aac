//! Subscription adapter boundary.
//!
//! The watcher never talks to a data-source driver directly. It consumes two
//! capabilities:
//! - [`ChangeSource`]: a connection that can open change streams on a
//!   collection and be closed
//! - [`ChangeStream`]: one open subscription, delivering notifications on a
//!   channel in arrival order
//!
//! A stream reports a terminal failure by sending an `Err` item and ends by
//! disconnecting its channel. Delivering notifications over a channel lets the
//! watcher block on the next notification and on its own shutdown signal at
//! the same time.
//!
//! [`MemorySource`] is an in-process implementation backed by JSON documents.

mod memory;

use crate::error::{Result, WatchError};
use crate::types::{Namespace, RawNotification};
use crossbeam_channel::Receiver;
use std::time::Duration;

pub use memory::{MemorySource, MemoryStream};

/// One item delivered by a change stream.
pub type StreamItem = std::result::Result<RawNotification, WatchError>;

/// Options for establishing the source connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Source address.
    pub uri: String,
    /// How long to wait for a usable server.
    pub server_selection_timeout: Duration,
    /// How long to wait for the initial connection.
    pub connect_timeout: Duration,
}

/// Options for opening a change stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OpenOptions {
    /// Attach the full post-change document to update notifications.
    pub full_document: bool,
}

/// A connection to a data source that can open change streams.
pub trait ChangeSource: Send {
    /// Establish the connection.
    fn connect(&mut self, options: &ConnectOptions) -> Result<()>;

    /// Open a change stream on a collection.
    fn open(&mut self, namespace: &Namespace, options: OpenOptions) -> Result<Box<dyn ChangeStream>>;

    /// Close the connection. Closing twice is a no-op.
    fn close(&mut self);
}

/// An open change stream.
pub trait ChangeStream: Send {
    /// Channel the stream delivers notifications on.
    fn notifications(&self) -> Receiver<StreamItem>;

    /// Close the stream. Closing twice is a no-op.
    fn close(&mut self);
}
