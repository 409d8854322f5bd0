//! Message sync engine.
//!
//! Turns messages read from the phone's local store into sealed
//! [`MessageRecord`]s under `users/{uid}/messages/{messageKey}`.
//!
//! # Architecture
//!
//! ```text
//! LocalMessage → RCS filter → resolve (link-core) → seal (envelope)
//!              → attachments (upload | inline | metadata) → write (retry)
//! ```
//!
//! Writes are overwrites keyed by the message key, so re-syncing a message
//! is harmless. A single message sync never fails the caller: every problem
//! ends up in the returned [`SyncOutcome`].

use std::sync::Arc;
use std::time::Duration;

use link_core::{
    is_rcs_address, plan, resolve, LocalAttachment, LocalMessage, Progress, Resolution,
    RetryPolicy, SkipReason, ThreadLookup,
};
use link_types::{
    Attachment, EnvelopeVersion, ErrorKind, FailureReason, LinkError, MessageKey, MessageRecord,
    StoragePaths,
};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cache::{content_hash, SyncCaches, UploadedBlob};
use crate::config::Config;
use crate::envelope::{seal_record, EnvelopeError, Recipients};
use crate::keystore::{KeyStore, KeyStoreError};
use crate::transport::{
    BatchEntry, BlobUploader, FileMeta, SyncTransport, TransportError, UploadConfirmation,
};

/// Sync errors.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Transport error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Envelope error.
    #[error("envelope error: {0}")]
    Envelope(#[from] EnvelopeError),

    /// Key store error.
    #[error("key store error: {0}")]
    KeyStore(#[from] KeyStoreError),

    /// A document could not be built.
    #[error("document error: {0}")]
    Document(#[from] LinkError),

    /// No authenticated session.
    #[error("not signed in")]
    SignedOut,
}

impl SyncError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Transport(e) => e.kind(),
            SyncError::Envelope(e) => e.kind(),
            SyncError::KeyStore(_) => ErrorKind::Transient,
            SyncError::Document(e) => e.kind(),
            SyncError::SignedOut => ErrorKind::Policy,
        }
    }
}

/// Options for [`MessageSyncEngine`].
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// The phone's own numbers.
    pub own_numbers: Vec<String>,
    /// Encrypt message bodies.
    pub e2ee_enabled: bool,
    /// Messages per bulk write.
    pub batch_size: usize,
    /// Pause between bulk writes.
    pub batch_delay: Duration,
    /// Largest attachment stored inline when its upload fails.
    pub inline_attachment_limit: usize,
    /// Retry policy for single writes.
    pub retry: RetryPolicy,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl SyncOptions {
    /// Build options from the loaded configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            own_numbers: config.device.own_numbers.clone(),
            e2ee_enabled: config.sync.e2ee_enabled,
            batch_size: config.sync.batch_size,
            batch_delay: config.sync.batch_delay(),
            inline_attachment_limit: config.sync.inline_attachment_limit,
            retry: config.sync.retry_policy(),
        }
    }
}

/// How a written body was protected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    /// Sealed with the given envelope generation.
    Sealed(EnvelopeVersion),
    /// E2EE is disabled; the real body was written.
    Plaintext,
    /// Sealing failed; the placeholder was written.
    Redacted(FailureReason),
}

/// Why a message was not written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipCause {
    /// No network.
    Offline,
    /// No authenticated session.
    SignedOut,
    /// RCS business-messaging identifier.
    Rcs,
    /// Address resolution dropped it.
    Address(SkipReason),
}

/// Result of syncing one message.
#[derive(Debug)]
pub enum SyncOutcome {
    /// The record was written.
    Written {
        /// Message key.
        key: MessageKey,
        /// Body protection.
        protection: Protection,
    },
    /// The message was dropped on purpose.
    Skipped(SkipCause),
    /// The write failed after retries.
    Failed {
        /// Message key.
        key: MessageKey,
        /// Last error.
        error: SyncError,
    },
}

impl SyncOutcome {
    /// Whether the record landed in the store.
    pub fn is_written(&self) -> bool {
        matches!(self, SyncOutcome::Written { .. })
    }
}

/// Totals of a bulk run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncReport {
    /// Records written.
    pub written: usize,
    /// Messages dropped on purpose (RCS, own address, already synced).
    pub skipped: usize,
    /// Messages whose write failed.
    pub failed: usize,
}

enum Prepared {
    Ready(MessageRecord, Protection),
    Skip(SkipCause),
}

/// Writes local messages to the cloud store.
pub struct MessageSyncEngine {
    transport: Arc<dyn SyncTransport>,
    uploader: Arc<dyn BlobUploader>,
    keys: Arc<dyn KeyStore>,
    caches: Arc<SyncCaches>,
    options: SyncOptions,
}

impl MessageSyncEngine {
    /// Create an engine.
    pub fn new(
        transport: Arc<dyn SyncTransport>,
        uploader: Arc<dyn BlobUploader>,
        keys: Arc<dyn KeyStore>,
        caches: Arc<SyncCaches>,
        options: SyncOptions,
    ) -> Self {
        Self {
            transport,
            uploader,
            keys,
            caches,
            options,
        }
    }

    /// Shared caches.
    pub fn caches(&self) -> &Arc<SyncCaches> {
        &self.caches
    }

    /// Engine options.
    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    /// Who message bodies are currently sealed for.
    ///
    /// The sync-group key wins; paired device keys are the v2 fallback.
    /// Returns `None` when there is no key material at all.
    pub async fn recipients(&self, paths: &StoragePaths) -> Option<Recipients> {
        let mut recipients = Recipients::default();

        match self.keys.group_key().await {
            Ok(Some(group)) => {
                recipients.group = Some((group.id.clone(), group.keypair.public_key()));
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Failed to load sync-group key"),
        }

        match self.transport.list_children(&paths.devices()).await {
            Ok(children) => {
                for (key, value) in children {
                    match serde_json::from_value::<link_types::Device>(value) {
                        Ok(device) => {
                            if let Some(pk) = device.public_key {
                                recipients.devices.push((device.id, pk));
                            }
                        }
                        Err(e) => debug!(device = %key, error = %e, "Ignoring unreadable device"),
                    }
                }
            }
            Err(e) => warn!(error = %e, "Failed to list paired devices"),
        }

        (!recipients.is_empty()).then_some(recipients)
    }

    /// Sync a single message. Never returns an error.
    pub async fn sync_one(
        &self,
        message: &LocalMessage,
        lookup: &(dyn ThreadLookup + Sync),
        skip_attachments: bool,
    ) -> SyncOutcome {
        let Some(paths) = self.session_paths() else {
            return SyncOutcome::Skipped(if self.transport.is_online() {
                SkipCause::SignedOut
            } else {
                SkipCause::Offline
            });
        };
        if !self.transport.is_online() {
            debug!("Offline, not syncing message");
            return SyncOutcome::Skipped(SkipCause::Offline);
        }

        let recipients = if self.options.e2ee_enabled {
            self.recipients(&paths).await
        } else {
            None
        };

        self.sync_with(message, lookup, skip_attachments, &paths, recipients.as_ref())
            .await
    }

    /// Sync many messages: bulk writes for plain messages, one by one for
    /// MMS with attachments.
    ///
    /// `on_progress` is called after every chunk and every individual
    /// message.
    pub async fn sync_many<F>(
        &self,
        messages: &[LocalMessage],
        lookup: &(dyn ThreadLookup + Sync),
        mut on_progress: F,
    ) -> SyncReport
    where
        F: FnMut(Progress) + Send,
    {
        let mut report = SyncReport::default();
        let candidates: Vec<&LocalMessage> = messages
            .iter()
            .filter(|m| {
                let rcs = is_rcs(m);
                if rcs {
                    report.skipped += 1;
                }
                !rcs
            })
            .collect();

        let batch = plan(candidates, self.options.batch_size, false);
        let mut progress = Progress::new(batch.total());

        let Some(paths) = self.session_paths() else {
            warn!(count = batch.total(), "Not signed in, skipping bulk sync");
            report.skipped += batch.total();
            return report;
        };
        if !self.transport.is_online() {
            debug!(count = batch.total(), "Offline, skipping bulk sync");
            report.skipped += batch.total();
            return report;
        }

        let recipients = if self.options.e2ee_enabled {
            self.recipients(&paths).await
        } else {
            None
        };
        let recipients = recipients.as_ref();

        info!(
            batched = batch.total() - batch.individual.len(),
            individual = batch.individual.len(),
            "Starting bulk sync"
        );

        for (index, chunk) in batch.chunks.iter().enumerate() {
            if index > 0 && !self.options.batch_delay.is_zero() {
                tokio::time::sleep(self.options.batch_delay).await;
            }
            self.sync_chunk(chunk, lookup, &paths, recipients, &mut report)
                .await;
            on_progress(progress.advance(chunk.len()));
        }

        for message in &batch.individual {
            let outcome = self
                .sync_with(message, lookup, false, &paths, recipients)
                .await;
            tally(&mut report, &outcome);
            on_progress(progress.advance(1));
        }

        info!(
            written = report.written,
            skipped = report.skipped,
            failed = report.failed,
            "Bulk sync finished"
        );
        report
    }

    async fn sync_chunk(
        &self,
        chunk: &[&LocalMessage],
        lookup: &(dyn ThreadLookup + Sync),
        paths: &StoragePaths,
        recipients: Option<&Recipients>,
        report: &mut SyncReport,
    ) {
        let mut entries = Vec::with_capacity(chunk.len());
        let mut pending = Vec::with_capacity(chunk.len());

        for message in chunk {
            let key = MessageKey::new(message.source_id, message.is_mms);
            if self.caches.is_synced(&key) {
                report.skipped += 1;
                continue;
            }
            match self.prepare(message, lookup, true, recipients).await {
                Prepared::Skip(cause) => {
                    debug!(key = %key, cause = ?cause, "Dropping message");
                    report.skipped += 1;
                }
                Prepared::Ready(record, _) => match record.to_value() {
                    Ok(value) => {
                        entries.push(BatchEntry {
                            path: paths.message(&record.id),
                            idempotency_key: record.id.to_string(),
                            value,
                        });
                        pending.push(*message);
                    }
                    Err(e) => {
                        warn!(key = %key, error = %e, "Failed to encode message");
                        report.failed += 1;
                    }
                },
            }
        }

        if entries.is_empty() {
            return;
        }

        let keys: Vec<MessageKey> = pending
            .iter()
            .map(|m| MessageKey::new(m.source_id, m.is_mms))
            .collect();
        match self.transport.write_batch(entries).await {
            Ok(()) => {
                report.written += keys.len();
                for key in keys {
                    self.caches.mark_synced(key);
                }
            }
            Err(e) => {
                warn!(count = pending.len(), error = %e, "Bulk write failed, falling back to single writes");
                for message in pending {
                    let outcome = self.sync_with(message, lookup, true, paths, recipients).await;
                    tally(report, &outcome);
                }
            }
        }
    }

    async fn sync_with(
        &self,
        message: &LocalMessage,
        lookup: &(dyn ThreadLookup + Sync),
        skip_attachments: bool,
        paths: &StoragePaths,
        recipients: Option<&Recipients>,
    ) -> SyncOutcome {
        let (record, protection) = match self
            .prepare(message, lookup, skip_attachments, recipients)
            .await
        {
            Prepared::Ready(record, protection) => (record, protection),
            Prepared::Skip(cause) => {
                debug!(source_id = message.source_id, cause = ?cause, "Dropping message");
                return SyncOutcome::Skipped(cause);
            }
        };

        let key = record.id.clone();
        match self.write_record(paths, &record).await {
            Ok(()) => {
                self.caches.mark_synced(key.clone());
                debug!(key = %key, protection = ?protection, "Message synced");
                SyncOutcome::Written { key, protection }
            }
            Err(error) => {
                warn!(key = %key, error = %error, "Message write failed");
                SyncOutcome::Failed { key, error }
            }
        }
    }

    async fn prepare(
        &self,
        message: &LocalMessage,
        lookup: &(dyn ThreadLookup + Sync),
        skip_attachments: bool,
        recipients: Option<&Recipients>,
    ) -> Prepared {
        if is_rcs(message) {
            return Prepared::Skip(SkipCause::Rcs);
        }

        let address = match resolve(message, lookup, &self.options.own_numbers) {
            Resolution::Address(address) => address,
            Resolution::Skip(reason) => return Prepared::Skip(SkipCause::Address(reason)),
        };

        let mut record = MessageRecord::plaintext(
            message.source_id,
            message.is_mms,
            &address,
            message.date,
            message.direction,
            &message.body,
        );
        record.thread_id = message.thread_id;

        if message.is_mms {
            for part in &message.attachments {
                let attachment = if skip_attachments {
                    metadata_only(part)
                } else {
                    self.attachment(&record.id, part).await
                };
                record.attachments.push(attachment);
            }
        }

        let protection = if self.options.e2ee_enabled {
            match seal_record(&mut record, recipients) {
                Ok(version) => Protection::Sealed(version),
                Err(e) => {
                    warn!(key = %record.id, error = %e, "Storing redacted placeholder");
                    Protection::Redacted(e.failure_reason())
                }
            }
        } else {
            Protection::Plaintext
        };

        Prepared::Ready(record, protection)
    }

    /// Upload a media part, falling back to inline data or metadata only.
    async fn attachment(&self, key: &MessageKey, part: &LocalAttachment) -> Attachment {
        let mut attachment = metadata_only(part);
        if !part.is_media() {
            return attachment;
        }

        let hash = content_hash(&part.data);
        if let Some(blob) = self.caches.uploaded(&hash) {
            attachment.file_key = Some(blob.file_key);
            attachment.file_id = Some(blob.file_id);
            return attachment;
        }

        match self.upload(key, part).await {
            Ok(blob) => {
                attachment.file_key = Some(blob.file_key.clone());
                attachment.file_id = Some(blob.file_id.clone());
                self.caches.mark_uploaded(hash, blob);
            }
            Err(e) if part.data.len() < self.options.inline_attachment_limit => {
                warn!(key = %key, part = %part.id, error = %e, "Upload failed, storing inline");
                attachment.inline_data = Some(part.data.clone());
            }
            Err(e) => {
                warn!(
                    key = %key,
                    part = %part.id,
                    size = part.data.len(),
                    error = %e,
                    "Upload failed, attachment too large to inline"
                );
            }
        }
        attachment
    }

    async fn upload(
        &self,
        key: &MessageKey,
        part: &LocalAttachment,
    ) -> Result<UploadedBlob, TransportError> {
        let meta = FileMeta {
            file_name: part
                .file_name
                .clone()
                .unwrap_or_else(|| format!("{}_{}", key, part.id)),
            content_type: part.content_type.clone(),
            size: part.data.len() as u64,
            message_key: key.to_string(),
        };

        let ticket = self.transport.get_upload_url(&meta).await?;
        self.uploader
            .put(&ticket.upload_url, part.data.clone(), &part.content_type)
            .await?;
        self.transport
            .confirm_upload(&UploadConfirmation {
                file_id: ticket.file_id.clone(),
                file_key: ticket.file_key.clone(),
                file_meta: meta,
            })
            .await?;

        Ok(UploadedBlob {
            file_key: ticket.file_key,
            file_id: ticket.file_id,
        })
    }

    async fn write_record(
        &self,
        paths: &StoragePaths,
        record: &MessageRecord,
    ) -> Result<(), SyncError> {
        let value = record.to_value()?;
        let path = paths.message(&record.id);
        let policy = self.options.retry;
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self
                .transport
                .write(&path, record.id.as_str(), value.clone())
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && policy.should_retry(attempt) => {
                    let delay = policy.delay(attempt);
                    debug!(key = %record.id, attempt, ?delay, error = %e, "Retrying write");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn session_paths(&self) -> Option<StoragePaths> {
        self.transport
            .session_user_id()
            .map(|uid| StoragePaths::for_user(&uid))
    }
}

fn is_rcs(message: &LocalMessage) -> bool {
    is_rcs_address(&message.address) || message.recipients.iter().any(|r| is_rcs_address(r))
}

fn metadata_only(part: &LocalAttachment) -> Attachment {
    Attachment::metadata(
        &part.id,
        &part.content_type,
        part.file_name.clone(),
        part.data.len() as u64,
    )
}

fn tally(report: &mut SyncReport, outcome: &SyncOutcome) {
    match outcome {
        SyncOutcome::Written { .. } => report.written += 1,
        SyncOutcome::Skipped(_) => report.skipped += 1,
        SyncOutcome::Failed { .. } => report.failed += 1,
    }
}
