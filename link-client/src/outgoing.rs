//! Outgoing message listener.
//!
//! Paired devices queue messages under `users/{uid}/outgoing_messages/{id}`.
//! The phone decrypts each one, hands it to the platform's SMS sender and
//! deletes the queue entry only after the send is confirmed. A failed send
//! leaves the entry in place for the next attempt.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use link_core::BoundedIdSet;
use link_types::{DeviceId, ErrorKind, OutgoingMessage, StoragePaths};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::envelope::{open, EnvelopeError};
use crate::keystore::{load_keyring, KeyStore, KeyStoreError};
use crate::shutdown::Shutdown;
use crate::transport::{ChildEvent, SyncTransport, TransportError};

const SENT_CACHE_CAPACITY: usize = 512;

/// Sends an SMS through the phone's telephony stack.
#[async_trait]
pub trait MessageSender: Send + Sync {
    /// Send `body` to `address`. `Ok` means the platform confirmed the send.
    async fn send(&self, address: &str, body: &str) -> Result<(), String>;
}

/// Outgoing message errors.
#[derive(Debug, Error)]
pub enum OutgoingError {
    /// Transport error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The queued body could not be decrypted.
    #[error("envelope error: {0}")]
    Envelope(#[from] EnvelopeError),

    /// Key store error.
    #[error("key store error: {0}")]
    KeyStore(#[from] KeyStoreError),

    /// The queue entry is not a valid outgoing message.
    #[error("invalid outgoing message: {0}")]
    Invalid(#[from] serde_json::Error),

    /// The platform refused to send.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// No authenticated session.
    #[error("not signed in")]
    SignedOut,
}

impl OutgoingError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            OutgoingError::Transport(e) => e.kind(),
            OutgoingError::Envelope(e) => e.kind(),
            OutgoingError::KeyStore(_) | OutgoingError::SendFailed(_) => ErrorKind::Transient,
            OutgoingError::Invalid(_) => ErrorKind::Protocol,
            OutgoingError::SignedOut => ErrorKind::Policy,
        }
    }
}

/// What happened to one queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Sent and removed from the queue.
    Sent,
    /// Sent earlier; only the queue entry was removed now.
    AlreadySent,
    /// Another task is sending it right now.
    InFlight,
}

/// Consumes the outgoing queue.
pub struct OutgoingListener {
    transport: Arc<dyn SyncTransport>,
    keys: Arc<dyn KeyStore>,
    device_id: Option<DeviceId>,
    sender: Arc<dyn MessageSender>,
    in_flight: Mutex<HashSet<String>>,
    sent: Mutex<BoundedIdSet<String>>,
}

impl OutgoingListener {
    /// Create a listener.
    pub fn new(
        transport: Arc<dyn SyncTransport>,
        keys: Arc<dyn KeyStore>,
        device_id: Option<DeviceId>,
        sender: Arc<dyn MessageSender>,
    ) -> Self {
        Self {
            transport,
            keys,
            device_id,
            sender,
            in_flight: Mutex::new(HashSet::new()),
            sent: Mutex::new(BoundedIdSet::new(SENT_CACHE_CAPACITY)),
        }
    }

    fn paths(&self) -> Result<StoragePaths, OutgoingError> {
        self.transport
            .session_user_id()
            .map(|uid| StoragePaths::for_user(&uid))
            .ok_or(OutgoingError::SignedOut)
    }

    /// Handle one queue entry.
    pub async fn handle(&self, id: &str, value: Value) -> Result<Delivery, OutgoingError> {
        let paths = self.paths()?;
        let path = paths.outgoing_message(id);

        let already_sent = lock(&self.sent).contains(&id.to_string());
        if already_sent {
            debug!(id, "Already sent, removing queue entry");
            self.transport.delete(&path).await?;
            return Ok(Delivery::AlreadySent);
        }
        let claimed = lock(&self.in_flight).insert(id.to_string());
        if !claimed {
            return Ok(Delivery::InFlight);
        }

        let result = self.deliver(id, &path, value).await;
        lock(&self.in_flight).remove(id);
        result
    }

    async fn deliver(&self, id: &str, path: &str, value: Value) -> Result<Delivery, OutgoingError> {
        let message: OutgoingMessage = serde_json::from_value(value)?;

        let body = if message.encrypted {
            let keyring = load_keyring(self.keys.as_ref(), self.device_id.clone()).await?;
            zeroize::Zeroizing::new(open((&message).into(), &keyring)?)
        } else {
            zeroize::Zeroizing::new(message.body.clone())
        };

        self.sender
            .send(&message.address, &body)
            .await
            .map_err(OutgoingError::SendFailed)?;
        lock(&self.sent).insert(id.to_string());
        info!(id, "Outgoing message sent");

        if let Err(e) = self.transport.delete(path).await {
            // Next delivery of this entry only retries the delete.
            warn!(id, error = %e, "Failed to remove sent queue entry");
        }
        Ok(Delivery::Sent)
    }

    /// Listen to the queue until shutdown or until the transport closes it.
    pub async fn run(&self, shutdown: Shutdown) -> Result<(), OutgoingError> {
        let paths = self.paths()?;
        let mut stream = self
            .transport
            .listen_children(&paths.outgoing_messages())
            .await?;
        info!("Outgoing listener started");

        loop {
            let event = tokio::select! {
                _ = shutdown.wait() => break,
                event = stream.next() => event,
            };
            match event {
                Some(ChildEvent::Added { key, value }) | Some(ChildEvent::Changed { key, value }) => {
                    if let Err(e) = self.handle(&key, value).await {
                        warn!(id = %key, error = %e, "Outgoing message left for retry");
                    }
                }
                Some(ChildEvent::Removed { .. }) => {}
                None => break,
            }
        }

        info!("Outgoing listener stopped");
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use crate::envelope::{seal, Recipients};
    use crate::keystore::{MemoryKeyStore, SyncGroupKey};
    use crate::transport::MockTransport;
    use link_types::SyncGroupId;
    use serde_json::json;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingSender {
        sent: Mutex<Vec<(String, String)>>,
        fail_next: Mutex<bool>,
    }

    #[async_trait]
    impl MessageSender for RecordingSender {
        async fn send(&self, address: &str, body: &str) -> Result<(), String> {
            if std::mem::take(&mut *self.fail_next.lock().unwrap()) {
                return Err("radio off".into());
            }
            self.sent
                .lock()
                .unwrap()
                .push((address.to_string(), body.to_string()));
            Ok(())
        }
    }

    const QUEUE: &str = "users/u1/outgoing_messages";

    fn setup(keys: MemoryKeyStore) -> (MockTransport, Arc<RecordingSender>, OutgoingListener) {
        let transport = MockTransport::signed_in("u1");
        let sender = Arc::new(RecordingSender::default());
        let listener = OutgoingListener::new(
            Arc::new(transport.clone()),
            Arc::new(keys),
            None,
            sender.clone(),
        );
        (transport, sender, listener)
    }

    fn plain(body: &str) -> Value {
        json!({"address": "+15552223333", "body": body, "timestamp": 1})
    }

    // ===========================================
    // Delivery Tests
    // ===========================================

    #[tokio::test]
    async fn plaintext_is_sent_then_deleted() {
        let (transport, sender, listener) = setup(MemoryKeyStore::new());
        transport.seed(&format!("{}/m1", QUEUE), plain("hi"));

        let delivery = listener.handle("m1", plain("hi")).await.unwrap();
        assert_eq!(delivery, Delivery::Sent);
        assert_eq!(sender.sent.lock().unwrap().len(), 1);
        assert!(transport.doc(&format!("{}/m1", QUEUE)).is_none());
    }

    #[tokio::test]
    async fn encrypted_body_is_decrypted_before_sending() {
        let group = KeyPair::generate();
        let keys = MemoryKeyStore::with_group_key(SyncGroupKey {
            id: SyncGroupId::new("g1"),
            keypair: group.clone(),
        });
        let (_transport, sender, listener) = setup(keys);

        let sealed = seal(
            b"meet at 6",
            &Recipients::group(SyncGroupId::new("g1"), group.public_key()),
        )
        .unwrap();
        let mut message: OutgoingMessage = serde_json::from_value(plain("")).unwrap();
        sealed.apply_to_outgoing(&mut message);

        listener
            .handle("m2", serde_json::to_value(&message).unwrap())
            .await
            .unwrap();
        assert_eq!(sender.sent.lock().unwrap()[0].1, "meet at 6");
    }

    #[tokio::test]
    async fn failed_send_leaves_entry_for_retry() {
        let (transport, sender, listener) = setup(MemoryKeyStore::new());
        transport.seed(&format!("{}/m1", QUEUE), plain("hi"));
        *sender.fail_next.lock().unwrap() = true;

        let result = listener.handle("m1", plain("hi")).await;
        assert!(matches!(result, Err(OutgoingError::SendFailed(_))));
        assert!(transport.doc(&format!("{}/m1", QUEUE)).is_some());

        listener.handle("m1", plain("hi")).await.unwrap();
        assert!(transport.doc(&format!("{}/m1", QUEUE)).is_none());
    }

    #[tokio::test]
    async fn sent_id_is_not_sent_twice() {
        let (transport, sender, listener) = setup(MemoryKeyStore::new());
        listener.handle("m1", plain("hi")).await.unwrap();

        transport.seed(&format!("{}/m1", QUEUE), plain("hi"));
        let delivery = listener.handle("m1", plain("hi")).await.unwrap();

        assert_eq!(delivery, Delivery::AlreadySent);
        assert_eq!(sender.sent.lock().unwrap().len(), 1);
        assert!(transport.doc(&format!("{}/m1", QUEUE)).is_none());
    }

    #[tokio::test]
    async fn undecryptable_entry_is_kept() {
        let (transport, sender, listener) = setup(MemoryKeyStore::new());
        let doc = json!({
            "address": "+1", "body": "AAAA", "encrypted": true, "nonce": "AAAA", "keyVersion": 3
        });
        transport.seed(&format!("{}/m3", QUEUE), doc.clone());

        assert!(listener.handle("m3", doc).await.is_err());
        assert!(sender.sent.lock().unwrap().is_empty());
        assert!(transport.doc(&format!("{}/m3", QUEUE)).is_some());
    }

    #[tokio::test]
    async fn signed_out_is_an_error() {
        let (transport, _sender, listener) = setup(MemoryKeyStore::new());
        transport.sign_out();
        let result = listener.handle("m1", plain("hi")).await;
        assert!(matches!(result, Err(OutgoingError::SignedOut)));
    }

    // ===========================================
    // Listener Loop Tests
    // ===========================================

    #[tokio::test]
    async fn run_drains_queue_until_shutdown() {
        let (transport, sender, listener) = setup(MemoryKeyStore::new());
        transport.seed(&format!("{}/m1", QUEUE), plain("first"));
        let listener = Arc::new(listener);
        let shutdown = Shutdown::new();

        let task = {
            let listener = listener.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { listener.run(shutdown).await })
        };

        transport.seed(&format!("{}/m2", QUEUE), plain("second"));
        for _ in 0..50 {
            if sender.sent.lock().unwrap().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        shutdown.trigger();
        task.await.unwrap().unwrap();
        assert_eq!(sender.sent.lock().unwrap().len(), 2);
        assert!(transport.children(QUEUE).is_empty());
    }
}
