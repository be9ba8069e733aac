//! In-process change source backed by JSON documents.

use super::{ChangeSource, ChangeStream, ConnectOptions, OpenOptions, StreamItem};
use crate::error::{Result, WatchError};
use crate::types::{
    Document, DocumentKey, Namespace, OperationType, RawNotification, ResumeToken,
    UpdateDescription,
};
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex, RwLock};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Default per-stream buffer (notifications).
const DEFAULT_STREAM_BUFFER: usize = 1024;

struct OpenStream {
    namespace: Namespace,
    full_document: bool,
    sender: Sender<StreamItem>,
}

impl OpenStream {
    /// Try to deliver an item. Returns false if the stream must be dropped.
    fn try_send(&self, item: StreamItem) -> bool {
        match self.sender.try_send(item) {
            Ok(()) => true,
            Err(crossbeam_channel::TrySendError::Full(_)) => false,
            Err(crossbeam_channel::TrySendError::Disconnected(_)) => false,
        }
    }
}

#[derive(Default)]
struct StreamTable {
    streams: HashMap<u64, OpenStream>,
    /// Streams successfully opened over the source's lifetime.
    opened_total: usize,
}

#[derive(Default)]
struct Faults {
    connect_failures: usize,
    open_failures: usize,
}

struct Shared {
    collections: RwLock<HashMap<Namespace, Vec<Document>>>,
    table: Mutex<StreamTable>,
    table_changed: Condvar,
    faults: Mutex<Faults>,
    next_stream_id: AtomicU64,
    next_token: AtomicU64,
    next_object_id: AtomicU64,
    connect_attempts: AtomicUsize,
    open_attempts: AtomicUsize,
    buffer_size: usize,
}

impl Shared {
    fn remove_stream(&self, id: u64) {
        let mut table = self.table.lock();
        if table.streams.remove(&id).is_some() {
            self.table_changed.notify_all();
        }
    }

    /// Deliver an error item to every stream on the namespace.
    fn broadcast_error(&self, namespace: &Namespace, err: &WatchError) {
        let mut table = self.table.lock();
        let full: Vec<u64> = table
            .streams
            .iter()
            .filter(|(_, stream)| &stream.namespace == namespace)
            .filter(|(_, stream)| !stream.try_send(Err(err.clone())))
            .map(|(id, _)| *id)
            .collect();
        if !full.is_empty() {
            for id in full {
                table.streams.remove(&id);
            }
            self.table_changed.notify_all();
        }
    }

    /// Stamp a notification and deliver it to every stream on the namespace.
    /// Streams whose buffer is full are dropped, which ends them.
    fn broadcast(&self, namespace: &Namespace, mut raw: RawNotification) {
        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        raw.resume_token = Some(ResumeToken(json!({ "_data": format!("{:016x}", token) })));
        raw.cluster_time = Some(token);
        if raw.ns.is_none() {
            raw.ns = Some(namespace.clone());
        }

        let mut table = self.table.lock();
        let mut to_remove = Vec::new();
        for (id, stream) in table.streams.iter() {
            if &stream.namespace != namespace {
                continue;
            }
            let mut item = raw.clone();
            if raw.operation_type == OperationType::Update && !stream.full_document {
                item.full_document = None;
            }
            if !stream.try_send(Ok(item)) {
                to_remove.push(*id);
            }
        }

        if !to_remove.is_empty() {
            for id in to_remove {
                warn!(stream = id, namespace = %namespace, "Dropping change stream with full buffer");
                table.streams.remove(&id);
            }
            self.table_changed.notify_all();
        }
    }

    fn generate_id(&self) -> Value {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);
        let counter = self.next_object_id.fetch_add(1, Ordering::SeqCst);

        let mut bytes = [0u8; 12];
        bytes[..4].copy_from_slice(&secs.to_be_bytes());
        bytes[4..].copy_from_slice(&counter.to_be_bytes());
        Value::String(hex::encode(bytes))
    }
}

/// In-process change source.
///
/// Clones share the same collections and open streams but each clone is its
/// own connection: it starts disconnected, and closing it only ends the
/// streams it opened. A watcher owns one clone while a test or demo keeps
/// another to perform writes and inject faults.
pub struct MemorySource {
    shared: Arc<Shared>,
    connected: bool,
    owned: Vec<u64>,
}

impl MemorySource {
    /// Create an empty source.
    pub fn new() -> Self {
        Self::with_buffer_size(DEFAULT_STREAM_BUFFER)
    }

    /// Create an empty source with a custom per-stream buffer.
    pub fn with_buffer_size(buffer_size: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                collections: RwLock::new(HashMap::new()),
                table: Mutex::new(StreamTable::default()),
                table_changed: Condvar::new(),
                faults: Mutex::new(Faults::default()),
                next_stream_id: AtomicU64::new(1),
                next_token: AtomicU64::new(1),
                next_object_id: AtomicU64::new(1),
                connect_attempts: AtomicUsize::new(0),
                open_attempts: AtomicUsize::new(0),
                buffer_size: buffer_size.max(1),
            }),
            connected: false,
            owned: Vec::new(),
        }
    }

    // --- Writes ---

    /// Insert a document, assigning an `_id` if it has none. Returns the id.
    pub fn insert_one(&self, namespace: &Namespace, mut document: Document) -> Result<Value> {
        let id = match document.get("_id") {
            Some(id) => id.clone(),
            None => {
                let id = self.shared.generate_id();
                document.insert("_id".to_string(), id.clone());
                id
            }
        };

        let mut collections = self.shared.collections.write();
        let docs = collections.entry(namespace.clone()).or_default();
        if docs.iter().any(|d| d.get("_id") == Some(&id)) {
            return Err(WatchError::DuplicateKey(id.to_string()));
        }
        docs.push(document.clone());

        self.shared
            .broadcast(namespace, RawNotification::insert(document));
        Ok(id)
    }

    /// Set fields on the document with the given id. Returns false if no
    /// such document exists.
    pub fn update_one(&self, namespace: &Namespace, id: &Value, changes: Document) -> bool {
        let mut collections = self.shared.collections.write();
        let Some(document) = collections
            .get_mut(namespace)
            .and_then(|docs| docs.iter_mut().find(|d| d.get("_id") == Some(id)))
        else {
            return false;
        };

        for (field, value) in changes.iter() {
            if field != "_id" {
                document.insert(field.clone(), value.clone());
            }
        }

        let mut raw = RawNotification::update(document.clone());
        raw.update_description = Some(UpdateDescription {
            updated_fields: changes,
            removed_fields: Vec::new(),
        });
        self.shared.broadcast(namespace, raw);
        true
    }

    /// Replace the document with the given id, keeping its `_id`.
    pub fn replace_one(&self, namespace: &Namespace, id: &Value, mut replacement: Document) -> bool {
        let mut collections = self.shared.collections.write();
        let Some(document) = collections
            .get_mut(namespace)
            .and_then(|docs| docs.iter_mut().find(|d| d.get("_id") == Some(id)))
        else {
            return false;
        };

        replacement.insert("_id".to_string(), id.clone());
        *document = replacement.clone();

        let mut raw = RawNotification::insert(replacement);
        raw.operation_type = OperationType::Replace;
        self.shared.broadcast(namespace, raw);
        true
    }

    /// Delete the document with the given id.
    pub fn delete_one(&self, namespace: &Namespace, id: &Value) -> bool {
        let mut collections = self.shared.collections.write();
        let Some(docs) = collections.get_mut(namespace) else {
            return false;
        };
        let Some(pos) = docs.iter().position(|d| d.get("_id") == Some(id)) else {
            return false;
        };
        docs.remove(pos);

        self.shared
            .broadcast(namespace, RawNotification::delete(DocumentKey::from_id(id.clone())));
        true
    }

    /// Deliver an arbitrary notification to streams on the namespace.
    pub fn push_raw(&self, namespace: &Namespace, raw: RawNotification) {
        let _collections = self.shared.collections.write();
        self.shared.broadcast(namespace, raw);
    }

    /// Deliver a notification in its JSON wire form. A payload that does
    /// not decode reaches the streams as an error item, the way a driver
    /// surfaces a bad document, and is also returned.
    pub fn push_json(&self, namespace: &Namespace, bytes: &[u8]) -> Result<()> {
        let _collections = self.shared.collections.write();
        match RawNotification::from_json(bytes) {
            Ok(raw) => {
                self.shared.broadcast(namespace, raw);
                Ok(())
            }
            Err(err) => {
                self.shared.broadcast_error(namespace, &err);
                Err(err)
            }
        }
    }

    // --- Reads ---

    pub fn find_one(&self, namespace: &Namespace, id: &Value) -> Option<Document> {
        self.shared
            .collections
            .read()
            .get(namespace)
            .and_then(|docs| docs.iter().find(|d| d.get("_id") == Some(id)).cloned())
    }

    pub fn count(&self, namespace: &Namespace) -> usize {
        self.shared
            .collections
            .read()
            .get(namespace)
            .map_or(0, |docs| docs.len())
    }

    // --- Fault Injection ---

    /// Make the next `n` connection attempts fail.
    pub fn fail_next_connects(&self, n: usize) {
        self.shared.faults.lock().connect_failures = n;
    }

    /// Make the next `n` open attempts fail.
    pub fn fail_next_opens(&self, n: usize) {
        self.shared.faults.lock().open_failures = n;
    }

    /// Terminate every open stream with an error. Returns how many were
    /// terminated.
    pub fn break_streams(&self, message: &str) -> usize {
        let mut table = self.shared.table.lock();
        let broken = table.streams.len();
        for (_, stream) in table.streams.drain() {
            let _ = stream.try_send(Err(WatchError::Stream(message.to_string())));
        }
        self.shared.table_changed.notify_all();
        broken
    }

    /// End every open stream without an error.
    pub fn end_streams(&self) -> usize {
        let mut table = self.shared.table.lock();
        let ended = table.streams.len();
        table.streams.clear();
        self.shared.table_changed.notify_all();
        ended
    }

    // --- Introspection ---

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn connect_attempts(&self) -> usize {
        self.shared.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn open_attempts(&self) -> usize {
        self.shared.open_attempts.load(Ordering::SeqCst)
    }

    /// Streams successfully opened so far, including closed ones.
    pub fn opened_total(&self) -> usize {
        self.shared.table.lock().opened_total
    }

    /// Streams currently open.
    pub fn open_stream_count(&self) -> usize {
        self.shared.table.lock().streams.len()
    }

    /// Block until at least `total` streams have been opened. Returns false
    /// on timeout.
    pub fn wait_for_opens(&self, total: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut table = self.shared.table.lock();
        while table.opened_total < total {
            if self
                .shared
                .table_changed
                .wait_until(&mut table, deadline)
                .timed_out()
            {
                return table.opened_total >= total;
            }
        }
        true
    }
}

impl Default for MemorySource {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for MemorySource {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            connected: false,
            owned: Vec::new(),
        }
    }
}

impl ChangeSource for MemorySource {
    fn connect(&mut self, options: &ConnectOptions) -> Result<()> {
        self.shared.connect_attempts.fetch_add(1, Ordering::SeqCst);

        {
            let mut faults = self.shared.faults.lock();
            if faults.connect_failures > 0 {
                faults.connect_failures -= 1;
                return Err(WatchError::Connection(format!(
                    "server selection timed out after {:?} for {}",
                    options.server_selection_timeout, options.uri
                )));
            }
        }

        self.connected = true;
        debug!(uri = %options.uri, "Memory source connected");
        Ok(())
    }

    fn open(&mut self, namespace: &Namespace, options: OpenOptions) -> Result<Box<dyn ChangeStream>> {
        self.shared.open_attempts.fetch_add(1, Ordering::SeqCst);

        if !self.connected {
            return Err(WatchError::Connection("not connected".to_string()));
        }

        {
            let mut faults = self.shared.faults.lock();
            if faults.open_failures > 0 {
                faults.open_failures -= 1;
                return Err(WatchError::Connection(format!(
                    "failed to open change stream on {}",
                    namespace
                )));
            }
        }

        let id = self.shared.next_stream_id.fetch_add(1, Ordering::SeqCst);
        let (sender, receiver) = bounded(self.shared.buffer_size);

        {
            let mut table = self.shared.table.lock();
            table.streams.insert(
                id,
                OpenStream {
                    namespace: namespace.clone(),
                    full_document: options.full_document,
                    sender,
                },
            );
            table.opened_total += 1;
            self.shared.table_changed.notify_all();

            self.owned.retain(|owned| table.streams.contains_key(owned));
            self.owned.push(id);
        }

        Ok(Box::new(MemoryStream {
            id,
            receiver,
            shared: Arc::clone(&self.shared),
        }))
    }

    fn close(&mut self) {
        for id in self.owned.drain(..) {
            self.shared.remove_stream(id);
        }
        self.connected = false;
    }
}

/// A stream opened on a [`MemorySource`].
pub struct MemoryStream {
    id: u64,
    receiver: Receiver<StreamItem>,
    shared: Arc<Shared>,
}

impl ChangeStream for MemoryStream {
    fn notifications(&self) -> Receiver<StreamItem> {
        self.receiver.clone()
    }

    fn close(&mut self) {
        self.shared.remove_stream(self.id);
    }
}

impl Drop for MemoryStream {
    fn drop(&mut self) {
        self.shared.remove_stream(self.id);
    }
}
