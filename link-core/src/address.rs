//! Conversation partner resolution.
//!
//! The address stored on a *sent* message cannot be trusted: some platform
//! implementations record the phone's own number there. Resolution works out
//! who the conversation is really with, or decides the message should not be
//! synced at all.

use crate::phone;
use link_types::Direction;

/// A message as read from the local message store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalMessage {
    /// Row id in the SMS or MMS table.
    pub source_id: i64,
    /// Whether the row came from the MMS table.
    pub is_mms: bool,
    /// Conversation thread, if the store reports one.
    pub thread_id: Option<i64>,
    /// Stored address (sender for received, recipient for sent).
    pub address: String,
    /// All recipients of a sent MMS (empty for SMS).
    pub recipients: Vec<String>,
    /// Timestamp (Unix ms).
    pub date: u64,
    /// Received or sent.
    pub direction: Direction,
    /// Plaintext body.
    pub body: String,
    /// MMS parts.
    pub attachments: Vec<LocalAttachment>,
}

impl LocalMessage {
    /// A plain SMS with no thread information.
    pub fn sms(source_id: i64, address: &str, date: u64, direction: Direction, body: &str) -> Self {
        Self {
            source_id,
            is_mms: false,
            thread_id: None,
            address: address.to_string(),
            recipients: Vec::new(),
            date,
            direction,
            body: body.to_string(),
            attachments: Vec::new(),
        }
    }

    /// Whether syncing this message needs per-attachment uploads.
    pub fn needs_upload(&self) -> bool {
        self.is_mms && !self.attachments.is_empty()
    }
}

/// An MMS part as read from the local store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalAttachment {
    /// Part id.
    pub id: String,
    /// MIME type.
    pub content_type: String,
    /// File name, if any.
    pub file_name: Option<String>,
    /// Raw bytes.
    pub data: Vec<u8>,
}

impl LocalAttachment {
    /// Images and video are uploaded; everything else keeps metadata only.
    pub fn is_media(&self) -> bool {
        self.content_type.starts_with("image/") || self.content_type.starts_with("video/")
    }
}

/// Thread lookups supplied by the platform wrapper.
pub trait ThreadLookup {
    /// Recipient addresses of a conversation thread.
    fn thread_recipients(&self, thread_id: i64) -> Vec<String>;

    /// Address of the most recent received message in a thread.
    fn latest_received_address(&self, thread_id: i64) -> Option<String>;
}

/// A lookup that knows nothing. Resolution falls back to the stored address.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoThreads;

impl ThreadLookup for NoThreads {
    fn thread_recipients(&self, _thread_id: i64) -> Vec<String> {
        Vec::new()
    }

    fn latest_received_address(&self, _thread_id: i64) -> Option<String> {
        None
    }
}

/// Why a message was dropped from sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Every recipient of a group send is one of our own numbers.
    AllRecipientsOwn,
    /// No partner could be found and the stored address is our own.
    OwnAddress,
    /// Stored address is empty.
    EmptyAddress,
}

/// Outcome of [`resolve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Sync the message under this partner address.
    Address(String),
    /// Drop the message silently.
    Skip(SkipReason),
}

/// Determine the conversation partner of a local message.
///
/// `own_numbers` may hold several numbers (multi-SIM); matching is on the
/// last ten digits.
pub fn resolve<S: AsRef<str>>(
    message: &LocalMessage,
    lookup: &dyn ThreadLookup,
    own_numbers: &[S],
) -> Resolution {
    if message.direction == Direction::Received {
        if message.address.trim().is_empty() {
            return Resolution::Skip(SkipReason::EmptyAddress);
        }
        return Resolution::Address(message.address.clone());
    }

    if message.recipients.len() > 1 {
        return match first_foreign(&message.recipients, own_numbers) {
            Some(addr) => Resolution::Address(addr),
            None => Resolution::Skip(SkipReason::AllRecipientsOwn),
        };
    }

    if let Some(thread_id) = message.thread_id {
        if let Some(addr) = first_foreign(&lookup.thread_recipients(thread_id), own_numbers) {
            return Resolution::Address(addr);
        }
        if let Some(addr) = lookup.latest_received_address(thread_id) {
            if !addr.trim().is_empty() && !phone::is_own_number(&addr, own_numbers) {
                return Resolution::Address(addr);
            }
        }
    }

    let stored = message
        .recipients
        .first()
        .map(String::as_str)
        .unwrap_or(&message.address);

    if stored.trim().is_empty() {
        Resolution::Skip(SkipReason::EmptyAddress)
    } else if phone::is_own_number(stored, own_numbers) {
        Resolution::Skip(SkipReason::OwnAddress)
    } else {
        Resolution::Address(stored.to_string())
    }
}

fn first_foreign<S: AsRef<str>>(candidates: &[String], own_numbers: &[S]) -> Option<String> {
    candidates
        .iter()
        .find(|c| !c.trim().is_empty() && !phone::is_own_number(c, own_numbers))
        .cloned()
}

/// Whether an address is an RCS business-messaging identifier.
///
/// These are never synced.
pub fn is_rcs_address(address: &str) -> bool {
    let lower = address.trim().to_ascii_lowercase();
    if lower.starts_with("rcs:") || lower.contains("@rbm.goog") {
        return true;
    }
    match lower.split_once('@') {
        Some((_, domain)) => domain.starts_with("rcs.") || domain.contains(".rcs."),
        None => lower.starts_with("rcs."),
    }
}
