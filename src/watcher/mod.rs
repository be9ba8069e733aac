//! The stream watcher.
//!
//! A [`Watcher`] owns one source connection and at most one open change
//! stream. [`Watcher::start`] runs the consume loop on the calling thread:
//!
//! 1. connect (once) and open a change stream with full post-change documents
//! 2. block on the next notification, classify it and dispatch it
//! 3. on a stream failure, report it, wait out the reconnect delay and go
//!    back to 1
//!
//! [`Watcher::stop`] may be called from any thread, including from inside a
//! handler. It wakes the loop out of any wait, closes the stream and the
//! connection, and guarantees that no handler runs once it has returned.

mod config;
mod handlers;
mod reconnect;
mod state;

pub use config::{
    WatcherConfig, DEFAULT_COLLECTION, DEFAULT_DATABASE, DEFAULT_URI, ENV_COLLECTION,
    ENV_DATABASE, ENV_URI,
};
pub use handlers::{DocumentHandler, ErrorHandler, Handlers, KeyHandler, ListenerId};
pub use reconnect::ReconnectPolicy;
pub use state::WatcherState;

use crate::error::{HandlerResult, Result, WatchError};
use crate::source::{ChangeSource, ChangeStream, OpenOptions, StreamItem};
use crate::subscriptions::{
    DropReason, EventSubscription, SubscriptionConfig, SubscriptionFilter, SubscriptionId,
    SubscriptionManager,
};
use crate::types::{ChangeEvent, Document, DocumentKey, EventKind, Namespace, RawNotification};
use crossbeam_channel::{bounded, select, Receiver, RecvTimeoutError, Sender};
use handlers::{guarded, guarded_error, Listeners};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;
use tracing::{debug, info, warn};

struct SourceSlot {
    source: Box<dyn ChangeSource>,
    connected: bool,
}

/// Why the consume loop left a stream.
enum LoopExit {
    Stopped,
    Failed(WatchError),
}

/// Watches one collection and dispatches its changes.
pub struct Watcher {
    config: WatcherConfig,
    namespace: Namespace,
    handlers: Handlers,
    listeners: Listeners,
    subscriptions: SubscriptionManager,

    source: Mutex<SourceSlot>,
    /// The open change stream, if any.
    stream: Mutex<Option<Box<dyn ChangeStream>>>,
    state: Mutex<WatcherState>,

    /// Held while a notification is dispatched.
    dispatch_gate: Mutex<()>,
    /// Thread running the consume loop.
    loop_thread: Mutex<Option<ThreadId>>,

    /// Dropped by `stop` to wake the loop.
    shutdown_tx: Mutex<Option<Sender<()>>>,
    shutdown_rx: Receiver<()>,
}

impl Watcher {
    /// Create a watcher. Nothing is connected until [`Watcher::start`].
    pub fn new<S>(config: WatcherConfig, handlers: Handlers, source: S) -> Result<Self>
    where
        S: ChangeSource + 'static,
    {
        config.validate()?;
        let (shutdown_tx, shutdown_rx) = bounded(0);

        Ok(Self {
            namespace: config.namespace(),
            config,
            handlers,
            listeners: Listeners::new(),
            subscriptions: SubscriptionManager::new(),
            source: Mutex::new(SourceSlot {
                source: Box::new(source),
                connected: false,
            }),
            stream: Mutex::new(None),
            state: Mutex::new(WatcherState::NotStarted),
            dispatch_gate: Mutex::new(()),
            loop_thread: Mutex::new(None),
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            shutdown_rx,
        })
    }

    pub fn config(&self) -> &WatcherConfig {
        &self.config
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn state(&self) -> WatcherState {
        *self.state.lock()
    }

    pub fn is_stopped(&self) -> bool {
        self.state() == WatcherState::Stopped
    }

    // --- Listeners ---

    /// Register an additional insert listener.
    pub fn on_insert<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&Document) -> HandlerResult + Send + Sync + 'static,
    {
        self.listeners.add_insert(Arc::new(listener))
    }

    /// Register an additional update listener.
    pub fn on_update<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&Document) -> HandlerResult + Send + Sync + 'static,
    {
        self.listeners.add_update(Arc::new(listener))
    }

    /// Register an additional delete listener.
    pub fn on_delete<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&DocumentKey) -> HandlerResult + Send + Sync + 'static,
    {
        self.listeners.add_delete(Arc::new(listener))
    }

    /// Register an additional error listener.
    pub fn on_error<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&WatchError) + Send + Sync + 'static,
    {
        self.listeners.add_error(Arc::new(listener))
    }

    /// Remove a listener registered with one of the `on_*` methods.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners.count(kind)
    }

    // --- Event Channel ---

    /// Subscribe to the event channel.
    pub fn subscribe(&self, filter: SubscriptionFilter) -> EventSubscription {
        let subscription = self.subscriptions.subscribe(SubscriptionConfig {
            buffer_size: self.config.event_buffer_size,
            filter,
        });
        if self.is_stopped() {
            self.subscriptions.close_all(DropReason::Stopped);
        }
        subscription
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subscriptions.unsubscribe(id);
    }

    // --- Lifecycle ---

    /// Run the watcher on the calling thread until [`Watcher::stop`].
    ///
    /// Stream failures never surface here: they go to the error handler and
    /// the watcher reconnects. The only error is calling `start` on a watcher
    /// that is already running or stopped.
    pub fn start(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state != WatcherState::NotStarted {
                return Err(WatchError::InvalidState(format!(
                    "cannot start a watcher that is {}",
                    *state
                )));
            }
            *state = WatcherState::Connecting;
        }
        *self.loop_thread.lock() = Some(thread::current().id());
        info!(namespace = %self.namespace, "Starting watcher");

        let mut failures: u32 = 0;
        while !self.is_stopped() {
            let exit = match self.open_stream() {
                Ok(Some(notifications)) => {
                    failures = 0;
                    self.consume(&notifications)
                }
                Ok(None) => LoopExit::Stopped,
                Err(err) => LoopExit::Failed(err),
            };

            let err = match exit {
                LoopExit::Stopped => break,
                LoopExit::Failed(err) => err,
            };
            if !self.recover(err) {
                break;
            }

            failures = failures.saturating_add(1);
            let delay = self.config.reconnect.delay_for(failures);
            warn!(
                namespace = %self.namespace,
                attempt = failures,
                delay_ms = delay.as_millis() as u64,
                "Reconnecting change stream"
            );
            if self.wait_for_shutdown(delay) {
                break;
            }
        }

        self.loop_thread.lock().take();
        debug!(namespace = %self.namespace, "Consume loop exited");
        Ok(())
    }

    /// Run [`Watcher::start`] on a dedicated thread.
    pub fn spawn(self: &Arc<Self>) -> std::io::Result<JoinHandle<Result<()>>> {
        let watcher = Arc::clone(self);
        thread::Builder::new()
            .name(format!("watcher-{}", self.namespace))
            .spawn(move || watcher.start())
    }

    /// Stop the watcher and release the stream and the connection.
    ///
    /// Safe to call before `start`, while `start` is connecting or waiting,
    /// from inside a handler, and more than once.
    pub fn stop(&self) {
        let previous = std::mem::replace(&mut *self.state.lock(), WatcherState::Stopped);
        if previous == WatcherState::Stopped {
            debug!(namespace = %self.namespace, "Watcher already stopped");
            return;
        }

        self.shutdown_tx.lock().take();

        // A handler calling stop already holds the gate.
        let on_loop_thread = *self.loop_thread.lock() == Some(thread::current().id());
        if !on_loop_thread {
            drop(self.dispatch_gate.lock());
        }

        self.release_stream();
        {
            let mut slot = self.source.lock();
            if slot.connected {
                slot.source.close();
                slot.connected = false;
            }
        }
        self.subscriptions.close_all(DropReason::Stopped);

        info!(namespace = %self.namespace, previous = %previous, "Watcher stopped");
    }

    // --- Consume Loop ---

    /// Connect if needed and open a change stream. Returns `None` if the
    /// watcher was stopped meanwhile.
    fn open_stream(&self) -> Result<Option<Receiver<StreamItem>>> {
        let stream = {
            let mut slot = self.source.lock();
            if self.is_stopped() {
                return Ok(None);
            }

            if !slot.connected {
                slot.source.connect(&self.config.connect_options())?;
                slot.connected = true;
                info!(namespace = %self.namespace, "Connected to data source");
            }

            match slot
                .source
                .open(&self.namespace, OpenOptions { full_document: true })
            {
                Ok(stream) => stream,
                Err(err) => {
                    // Start from a fresh connection on the next attempt.
                    slot.source.close();
                    slot.connected = false;
                    return Err(err);
                }
            }
        };

        let notifications = stream.notifications();
        {
            let mut current = self.stream.lock();
            if self.is_stopped() {
                let mut stream = stream;
                stream.close();
                return Ok(None);
            }
            *current = Some(stream);
        }

        if !self.transition(WatcherState::Watching) {
            return Ok(None);
        }
        info!(namespace = %self.namespace, "Change stream opened, waiting for changes");
        self.subscriptions.broadcast_connected(&self.namespace);
        Ok(Some(notifications))
    }

    fn consume(&self, notifications: &Receiver<StreamItem>) -> LoopExit {
        loop {
            select! {
                recv(notifications) -> item => match item {
                    Ok(Ok(raw)) => {
                        if !self.handle_notification(raw) {
                            return LoopExit::Stopped;
                        }
                    }
                    Ok(Err(err)) if !err.triggers_reconnect() => {
                        if !self.handle_stream_error(&err) {
                            return LoopExit::Stopped;
                        }
                    }
                    Ok(Err(err)) => return LoopExit::Failed(err),
                    Err(_) if self.is_stopped() => return LoopExit::Stopped,
                    Err(_) => return LoopExit::Failed(WatchError::StreamClosed),
                },
                recv(self.shutdown_rx) -> _ => return LoopExit::Stopped,
            }
        }
    }

    /// Classify and dispatch one notification. Returns false once the
    /// watcher is stopped.
    fn handle_notification(&self, raw: RawNotification) -> bool {
        let _gate = self.dispatch_gate.lock();
        if self.is_stopped() {
            return false;
        }

        let operation = raw.operation_type.clone();
        match ChangeEvent::classify(raw) {
            Some(event) => self.dispatch(&event),
            None => debug!(
                namespace = %self.namespace,
                operation = %operation,
                "Ignoring change notification"
            ),
        }

        !self.is_stopped()
    }

    /// Report a failure that leaves the stream usable, such as a
    /// notification that could not be decoded. Returns false once the
    /// watcher is stopped.
    fn handle_stream_error(&self, err: &WatchError) -> bool {
        let _gate = self.dispatch_gate.lock();
        if self.is_stopped() {
            return false;
        }

        warn!(namespace = %self.namespace, error = %err, "Skipping bad change notification");
        self.report(err);
        !self.is_stopped()
    }

    fn dispatch(&self, event: &ChangeEvent) {
        let kind = event.kind();
        match event {
            ChangeEvent::Insert(document) => {
                self.invoke(kind, || (self.handlers.on_insert)(document));
                for listener in self.listeners.insert() {
                    self.invoke(kind, || listener(document));
                }
            }
            ChangeEvent::Update(document) => {
                self.invoke(kind, || (self.handlers.on_update)(document));
                for listener in self.listeners.update() {
                    self.invoke(kind, || listener(document));
                }
            }
            ChangeEvent::Delete(key) => {
                self.invoke(kind, || (self.handlers.on_delete)(key));
                for listener in self.listeners.delete() {
                    self.invoke(kind, || listener(key));
                }
            }
        }

        if !self.is_stopped() {
            self.subscriptions.broadcast_change(event);
        }
    }

    fn invoke<F>(&self, kind: EventKind, handler: F)
    where
        F: FnOnce() -> HandlerResult,
    {
        if self.is_stopped() {
            return;
        }
        if let Err(err) = guarded(kind, handler) {
            self.report(&err);
        }
    }

    /// Route a failure to the error handler, the error listeners and the
    /// event channel.
    fn report(&self, err: &WatchError) {
        if self.is_stopped() {
            return;
        }
        guarded_error(&self.handlers.on_error, err);
        for listener in self.listeners.error() {
            if self.is_stopped() {
                return;
            }
            guarded_error(&listener, err);
        }
        if !self.is_stopped() {
            self.subscriptions.broadcast_error(err);
        }
    }

    /// Handle a stream failure. Returns false if the watcher was stopped and
    /// must not reconnect.
    fn recover(&self, err: WatchError) -> bool {
        self.release_stream();

        // A stop from another thread waits for the error handler.
        let _gate = self.dispatch_gate.lock();
        if self.is_stopped() {
            return false;
        }

        warn!(namespace = %self.namespace, error = %err, "Change stream failed");
        self.report(&err);
        if self.is_stopped() {
            return false;
        }
        self.subscriptions.broadcast_disconnected(&err.to_string());
        self.transition(WatcherState::Connecting)
    }

    fn release_stream(&self) {
        let stream = self.stream.lock().take();
        if let Some(mut stream) = stream {
            stream.close();
        }
    }

    /// Move to `next` unless stopped.
    fn transition(&self, next: WatcherState) -> bool {
        let mut state = self.state.lock();
        if *state == WatcherState::Stopped {
            return false;
        }
        let previous = *state;
        debug!(from = %previous, to = %next, "Watcher state change");
        *state = next;
        true
    }

    /// Sleep for `delay` or until stopped. Returns true if stopped.
    fn wait_for_shutdown(&self, delay: Duration) -> bool {
        match self.shutdown_rx.recv_timeout(delay) {
            Err(RecvTimeoutError::Timeout) => self.is_stopped(),
            _ => true,
        }
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.stop();
    }
}
