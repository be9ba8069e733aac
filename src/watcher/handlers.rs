//! Typed handler slots and listener registries.

use crate::error::{HandlerResult, Result, WatchError};
use crate::types::{Document, DocumentKey, EventKind};
use parking_lot::RwLock;
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::error;

/// Callback receiving an inserted or updated document.
pub type DocumentHandler = Arc<dyn Fn(&Document) -> HandlerResult + Send + Sync>;

/// Callback receiving the key of a deleted document.
pub type KeyHandler = Arc<dyn Fn(&DocumentKey) -> HandlerResult + Send + Sync>;

/// Callback receiving a reported failure.
pub type ErrorHandler = Arc<dyn Fn(&WatchError) + Send + Sync>;

/// The four handler slots a watcher is constructed with.
///
/// Unset change slots do nothing; the default error slot logs the failure.
#[derive(Clone)]
pub struct Handlers {
    pub(crate) on_insert: DocumentHandler,
    pub(crate) on_update: DocumentHandler,
    pub(crate) on_delete: KeyHandler,
    pub(crate) on_error: ErrorHandler,
}

impl Default for Handlers {
    fn default() -> Self {
        Self {
            on_insert: Arc::new(ignore_document),
            on_update: Arc::new(ignore_document),
            on_delete: Arc::new(ignore_key),
            on_error: Arc::new(log_error),
        }
    }
}

fn ignore_document(_: &Document) -> HandlerResult {
    Ok(())
}

fn ignore_key(_: &DocumentKey) -> HandlerResult {
    Ok(())
}

fn log_error(err: &WatchError) {
    error!(error = %err, "Stream error");
}

impl Handlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_insert<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Document) -> HandlerResult + Send + Sync + 'static,
    {
        self.on_insert = Arc::new(handler);
        self
    }

    pub fn on_update<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Document) -> HandlerResult + Send + Sync + 'static,
    {
        self.on_update = Arc::new(handler);
        self
    }

    pub fn on_delete<F>(mut self, handler: F) -> Self
    where
        F: Fn(&DocumentKey) -> HandlerResult + Send + Sync + 'static,
    {
        self.on_delete = Arc::new(handler);
        self
    }

    pub fn on_error<F>(mut self, handler: F) -> Self
    where
        F: Fn(&WatchError) + Send + Sync + 'static,
    {
        self.on_error = Arc::new(handler);
        self
    }
}

impl fmt::Debug for Handlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handlers").finish_non_exhaustive()
    }
}

/// Identifier of a registered listener.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

/// Additional observers, one list per event kind.
pub(crate) struct Listeners {
    insert: RwLock<Vec<(ListenerId, DocumentHandler)>>,
    update: RwLock<Vec<(ListenerId, DocumentHandler)>>,
    delete: RwLock<Vec<(ListenerId, KeyHandler)>>,
    error: RwLock<Vec<(ListenerId, ErrorHandler)>>,
    next_id: AtomicU64,
}

impl Listeners {
    pub fn new() -> Self {
        Self {
            insert: RwLock::new(Vec::new()),
            update: RwLock::new(Vec::new()),
            delete: RwLock::new(Vec::new()),
            error: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn next_id(&self) -> ListenerId {
        ListenerId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    pub fn add_insert(&self, handler: DocumentHandler) -> ListenerId {
        let id = self.next_id();
        self.insert.write().push((id, handler));
        id
    }

    pub fn add_update(&self, handler: DocumentHandler) -> ListenerId {
        let id = self.next_id();
        self.update.write().push((id, handler));
        id
    }

    pub fn add_delete(&self, handler: KeyHandler) -> ListenerId {
        let id = self.next_id();
        self.delete.write().push((id, handler));
        id
    }

    pub fn add_error(&self, handler: ErrorHandler) -> ListenerId {
        let id = self.next_id();
        self.error.write().push((id, handler));
        id
    }

    /// Remove a listener of any kind. Returns false if it was not registered.
    pub fn remove(&self, id: ListenerId) -> bool {
        fn remove_from<T>(list: &RwLock<Vec<(ListenerId, T)>>, id: ListenerId) -> bool {
            let mut list = list.write();
            let before = list.len();
            list.retain(|(listener, _)| *listener != id);
            list.len() != before
        }

        remove_from(&self.insert, id)
            || remove_from(&self.update, id)
            || remove_from(&self.delete, id)
            || remove_from(&self.error, id)
    }

    pub fn count(&self, kind: EventKind) -> usize {
        match kind {
            EventKind::Insert => self.insert.read().len(),
            EventKind::Update => self.update.read().len(),
            EventKind::Delete => self.delete.read().len(),
            EventKind::Error => self.error.read().len(),
        }
    }

    // Snapshots, so listeners can (un)register from inside a callback.

    pub fn insert(&self) -> Vec<DocumentHandler> {
        self.insert.read().iter().map(|(_, h)| Arc::clone(h)).collect()
    }

    pub fn update(&self) -> Vec<DocumentHandler> {
        self.update.read().iter().map(|(_, h)| Arc::clone(h)).collect()
    }

    pub fn delete(&self) -> Vec<KeyHandler> {
        self.delete.read().iter().map(|(_, h)| Arc::clone(h)).collect()
    }

    pub fn error(&self) -> Vec<ErrorHandler> {
        self.error.read().iter().map(|(_, h)| Arc::clone(h)).collect()
    }
}

/// Run a change handler, turning an error return or a panic into a
/// dispatch error.
pub(crate) fn guarded<F>(kind: EventKind, handler: F) -> Result<()>
where
    F: FnOnce() -> HandlerResult,
{
    match panic::catch_unwind(AssertUnwindSafe(handler)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(WatchError::Dispatch {
            kind,
            message: e.to_string(),
        }),
        Err(payload) => Err(WatchError::Dispatch {
            kind,
            message: format!("handler panicked: {}", panic_message(payload.as_ref())),
        }),
    }
}

/// Run an error handler. A panicking error handler is logged and swallowed.
pub(crate) fn guarded_error(handler: &ErrorHandler, err: &WatchError) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| handler(err))) {
        error!(
            error = %err,
            panic = %panic_message(payload.as_ref()),
            "Error handler panicked"
        );
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
