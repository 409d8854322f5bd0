//! Mock transport for testing.
//!
//! An in-memory document tree with live child listeners, scriptable
//! procedures and failure injection. Clones share state, so a test can hand
//! one clone to the phone side and another to the desktop side.

use super::{
    BatchEntry, BlobUploader, ChildEvent, ChildStream, FileMeta, SyncTransport, TransportError,
    UploadConfirmation, UploadTicket,
};
use async_trait::async_trait;
use link_types::UserId;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

const LISTENER_BUFFER: usize = 64;

/// Scripted response for a server-side procedure.
pub type ProcedureHandler = Arc<dyn Fn(&Value) -> Result<Value, TransportError> + Send + Sync>;

/// Mock transport for testing.
#[derive(Default, Clone)]
pub struct MockTransport {
    inner: Arc<Mutex<MockTransportInner>>,
}

#[derive(Default)]
struct MockTransportInner {
    user_id: Option<UserId>,
    offline: bool,
    docs: BTreeMap<String, Value>,
    listeners: Vec<(String, mpsc::Sender<ChildEvent>)>,
    writes: Vec<(String, String)>,
    batch_sizes: Vec<usize>,
    calls: Vec<(String, Value)>,
    procedures: HashMap<String, ProcedureHandler>,
    confirmed_uploads: Vec<UploadConfirmation>,
    fail_writes: VecDeque<TransportError>,
    fail_next_batch: Option<TransportError>,
    fail_next_list: Option<TransportError>,
    fail_next_call: Option<TransportError>,
    fail_next_upload_url: Option<TransportError>,
    upload_counter: u64,
}

fn split_parent(path: &str) -> Option<(&str, &str)> {
    path.rsplit_once('/')
}

impl MockTransportInner {
    fn check_online(&self) -> Result<(), TransportError> {
        if self.offline {
            return Err(TransportError::Offline);
        }
        Ok(())
    }

    fn notify(&mut self, path: &str, event: ChildEvent) {
        let Some((parent, _)) = split_parent(path) else {
            return;
        };
        // try_send: a full or dropped listener must not block writers
        self.listeners.retain(|(collection, tx)| {
            if collection != parent {
                return !tx.is_closed();
            }
            match tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => true,
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    fn put(&mut self, path: &str, value: Value) {
        let Some((_, key)) = split_parent(path) else {
            self.docs.insert(path.to_string(), value);
            return;
        };
        let key = key.to_string();
        let event = if self.docs.contains_key(path) {
            ChildEvent::Changed {
                key,
                value: value.clone(),
            }
        } else {
            ChildEvent::Added {
                key,
                value: value.clone(),
            }
        };
        self.docs.insert(path.to_string(), value);
        self.notify(path, event);
    }

    fn remove(&mut self, path: &str) {
        if self.docs.remove(path).is_none() {
            return;
        }
        if let Some((_, key)) = split_parent(path) {
            let event = ChildEvent::Removed {
                key: key.to_string(),
            };
            self.notify(path, event);
        }
    }

    fn children(&self, path: &str) -> Vec<(String, Value)> {
        let prefix = format!("{}/", path);
        self.docs
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter_map(|(k, v)| {
                let key = &k[prefix.len()..];
                (!key.contains('/')).then(|| (key.to_string(), v.clone()))
            })
            .collect()
    }
}

impl MockTransport {
    /// Create a signed-out transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a transport signed in as `user_id`.
    pub fn signed_in(user_id: &str) -> Self {
        let transport = Self::new();
        transport.sign_in(user_id);
        transport
    }

    /// Set the session user.
    pub fn sign_in(&self, user_id: &str) {
        self.inner.lock().unwrap().user_id = Some(UserId::new(user_id));
    }

    /// Drop the session user.
    pub fn sign_out(&self) {
        self.inner.lock().unwrap().user_id = None;
    }

    /// Toggle connectivity. While offline every operation fails.
    pub fn set_online(&self, online: bool) {
        self.inner.lock().unwrap().offline = !online;
    }

    /// Register a procedure handler.
    pub fn on_call<F>(&self, procedure: &str, handler: F)
    where
        F: Fn(&Value) -> Result<Value, TransportError> + Send + Sync + 'static,
    {
        self.inner
            .lock()
            .unwrap()
            .procedures
            .insert(procedure.to_string(), Arc::new(handler));
    }

    /// Insert a document directly, as another writer would (listeners fire).
    pub fn seed(&self, path: &str, value: Value) {
        self.inner.lock().unwrap().put(path, value);
    }

    /// Delete a document directly, as another writer would.
    pub fn unseed(&self, path: &str) {
        self.inner.lock().unwrap().remove(path);
    }

    /// Document at `path`, if any.
    pub fn doc(&self, path: &str) -> Option<Value> {
        self.inner.lock().unwrap().docs.get(path).cloned()
    }

    /// Children of `path`.
    pub fn children(&self, path: &str) -> Vec<(String, Value)> {
        self.inner.lock().unwrap().children(path)
    }

    /// Every successful single write as `(path, idempotency_key)`.
    pub fn writes(&self) -> Vec<(String, String)> {
        self.inner.lock().unwrap().writes.clone()
    }

    /// Size of every successful batch write.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.inner.lock().unwrap().batch_sizes.clone()
    }

    /// Every procedure call as `(name, args)`.
    pub fn calls(&self) -> Vec<(String, Value)> {
        self.inner.lock().unwrap().calls.clone()
    }

    /// Every confirmed upload.
    pub fn confirmed_uploads(&self) -> Vec<UploadConfirmation> {
        self.inner.lock().unwrap().confirmed_uploads.clone()
    }

    /// Number of live listeners.
    pub fn listener_count(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        inner.listeners.retain(|(_, tx)| !tx.is_closed());
        inner.listeners.len()
    }

    /// Cause the next write() to fail with the given error.
    pub fn fail_next_write(&self, error: TransportError) {
        self.inner.lock().unwrap().fail_writes.push_back(error);
    }

    /// Cause the next `n` write() calls to fail with transient errors.
    pub fn fail_writes(&self, n: usize) {
        let mut inner = self.inner.lock().unwrap();
        for _ in 0..n {
            inner
                .fail_writes
                .push_back(TransportError::remote("unavailable", "injected"));
        }
    }

    /// Cause the next write_batch() to fail with the given error.
    pub fn fail_next_batch(&self, error: TransportError) {
        self.inner.lock().unwrap().fail_next_batch = Some(error);
    }

    /// Cause the next list_children() to fail with the given error.
    pub fn fail_next_list(&self, error: TransportError) {
        self.inner.lock().unwrap().fail_next_list = Some(error);
    }

    /// Cause the next call() to fail with the given error.
    pub fn fail_next_call(&self, error: TransportError) {
        self.inner.lock().unwrap().fail_next_call = Some(error);
    }

    /// Cause the next get_upload_url() to fail with the given error.
    pub fn fail_next_upload_url(&self, error: TransportError) {
        self.inner.lock().unwrap().fail_next_upload_url = Some(error);
    }

    /// Clear all state (documents, listeners, history, session).
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        *inner = MockTransportInner::default();
    }
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("MockTransport")
            .field("user_id", &inner.user_id)
            .field("offline", &inner.offline)
            .field("docs", &inner.docs.len())
            .finish()
    }
}

#[async_trait]
impl SyncTransport for MockTransport {
    fn session_user_id(&self) -> Option<UserId> {
        self.inner.lock().unwrap().user_id.clone()
    }

    fn is_online(&self) -> bool {
        !self.inner.lock().unwrap().offline
    }

    async fn write(
        &self,
        path: &str,
        idempotency_key: &str,
        value: Value,
    ) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().unwrap();
        inner.check_online()?;

        // Check for forced failure
        if let Some(error) = inner.fail_writes.pop_front() {
            return Err(error);
        }

        inner.put(path, value);
        inner
            .writes
            .push((path.to_string(), idempotency_key.to_string()));
        Ok(())
    }

    async fn write_batch(&self, entries: Vec<BatchEntry>) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().unwrap();
        inner.check_online()?;

        if let Some(error) = inner.fail_next_batch.take() {
            return Err(error);
        }

        inner.batch_sizes.push(entries.len());
        for entry in entries {
            inner.put(&entry.path, entry.value);
        }
        Ok(())
    }

    async fn read(&self, path: &str) -> Result<Value, TransportError> {
        let inner = self.inner.lock().unwrap();
        inner.check_online()?;
        inner
            .docs
            .get(path)
            .cloned()
            .ok_or_else(|| TransportError::NotFound(path.to_string()))
    }

    async fn delete(&self, path: &str) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().unwrap();
        inner.check_online()?;
        inner.remove(path);
        Ok(())
    }

    async fn list_children(&self, path: &str) -> Result<Vec<(String, Value)>, TransportError> {
        let mut inner = self.inner.lock().unwrap();
        inner.check_online()?;
        if let Some(error) = inner.fail_next_list.take() {
            return Err(error);
        }
        Ok(inner.children(path))
    }

    async fn listen_children(&self, path: &str) -> Result<ChildStream, TransportError> {
        let mut inner = self.inner.lock().unwrap();
        inner.check_online()?;

        let existing = inner.children(path);
        let (tx, rx) = mpsc::channel(LISTENER_BUFFER.max(existing.len() + 1));
        for (key, value) in existing {
            // capacity covers the snapshot
            let _ = tx.try_send(ChildEvent::Added { key, value });
        }
        inner.listeners.push((path.to_string(), tx));
        Ok(ChildStream::new(rx))
    }

    async fn call(&self, procedure: &str, args: Value) -> Result<Value, TransportError> {
        let handler = {
            let mut inner = self.inner.lock().unwrap();
            inner.check_online()?;
            if inner.user_id.is_none() {
                return Err(TransportError::Unauthenticated);
            }
            inner.calls.push((procedure.to_string(), args.clone()));
            if let Some(error) = inner.fail_next_call.take() {
                return Err(error);
            }
            inner.procedures.get(procedure).cloned()
        };

        match handler {
            Some(handler) => handler(&args),
            None => Err(TransportError::remote(
                "not-found",
                &format!("no procedure {}", procedure),
            )),
        }
    }

    async fn get_upload_url(&self, meta: &FileMeta) -> Result<UploadTicket, TransportError> {
        let mut inner = self.inner.lock().unwrap();
        inner.check_online()?;
        if let Some(error) = inner.fail_next_upload_url.take() {
            return Err(error);
        }
        inner.upload_counter += 1;
        let n = inner.upload_counter;
        Ok(UploadTicket {
            upload_url: format!("https://uploads.invalid/{}/{}", meta.message_key, n),
            file_key: format!("files/{}/{}", meta.message_key, meta.file_name),
            file_id: format!("file-{}", n),
        })
    }

    async fn confirm_upload(
        &self,
        confirmation: &UploadConfirmation,
    ) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().unwrap();
        inner.check_online()?;
        inner.confirmed_uploads.push(confirmation.clone());
        Ok(())
    }
}

/// Blob uploader that records uploads in memory.
#[derive(Debug, Default, Clone)]
pub struct MockUploader {
    inner: Arc<Mutex<MockUploaderInner>>,
}

#[derive(Debug, Default)]
struct MockUploaderInner {
    uploads: Vec<(String, usize, String)>,
    fail_next: Option<String>,
}

impl MockUploader {
    /// Create an uploader that accepts everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every upload as `(url, byte count, content type)`.
    pub fn uploads(&self) -> Vec<(String, usize, String)> {
        self.inner.lock().unwrap().uploads.clone()
    }

    /// Cause the next put() to fail.
    pub fn fail_next(&self, error: &str) {
        self.inner.lock().unwrap().fail_next = Some(error.to_string());
    }
}

#[async_trait]
impl BlobUploader for MockUploader {
    async fn put(
        &self,
        url: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(error) = inner.fail_next.take() {
            return Err(TransportError::Upload(error));
        }
        inner
            .uploads
            .push((url.to_string(), bytes.len(), content_type.to_string()));
        Ok(())
    }
}
