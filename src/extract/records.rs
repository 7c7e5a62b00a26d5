//! Extracted entity records
//!
//! Records are immutable snapshots. Contact and SMS ids are the provider
//! `_id`; photo ids derive from the storage-relative path, so ids are stable
//! across repeated extractions of an unchanged device.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt::{self, Display};

/// Data domain an extractor covers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Domain {
    Contacts,
    Sms,
    Photos,
}

impl Domain {
    pub const ALL: [Domain; 3] = [Domain::Contacts, Domain::Sms, Domain::Photos];
}

impl Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Domain::Contacts => "Contacts",
            Domain::Sms => "SMS",
            Domain::Photos => "Photos",
        };
        write!(f, "{}", name)
    }
}

impl std::str::FromStr for Domain {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "contacts" | "contact" => Ok(Domain::Contacts),
            "sms" | "messages" => Ok(Domain::Sms),
            "photos" | "photo" => Ok(Domain::Photos),
            other => Err(format!("unknown domain '{}' (expected contacts, sms or photos)", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Contact {
    pub id: u64,
    pub display_name: String,
    /// E.164, deduplicated, first-seen order
    pub phone_numbers: Vec<String>,
    /// Lower-cased
    pub emails: BTreeSet<String>,
    pub group_ids: BTreeSet<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContactGroup {
    pub id: u64,
    pub title: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SmsDirection {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SmsStatus {
    Received,
    Sent,
    Draft,
    Outbox,
    Failed,
    Queued,
    Pending,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SmsMessage {
    pub id: u64,
    /// Normalized peer address (E.164 when parseable)
    pub conversation_key: String,
    /// Address as stored on the device
    pub address: String,
    pub thread_id: Option<u64>,
    pub direction: SmsDirection,
    pub timestamp: DateTime<Utc>,
    pub body: String,
    pub status: SmsStatus,
    pub read: bool,
}

/// Messages exchanged with one peer, oldest first (ties by id)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Conversation {
    pub key: String,
    pub messages: Vec<SmsMessage>,
}

/// Lazy pointer to a photo's thumbnail; resolved through the thumbnail cache
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThumbnailRef {
    pub photo_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Photo {
    /// First 16 hex digits of SHA-256 of the storage-relative path
    pub id: String,
    /// Storage-relative folder, e.g. "DCIM/Camera"
    pub folder_path: String,
    pub file_name: String,
    pub remote_path: String,
    pub mime_type: String,
    pub capture_timestamp: Option<DateTime<Utc>>,
    pub file_size: u64,
    pub thumbnail_ref: ThumbnailRef,
}

impl Photo {
    /// Lowercase file extension, "bin" if the name has none
    pub fn extension(&self) -> String {
        self.file_name
            .rfind('.')
            .filter(|idx| *idx > 0 && *idx + 1 < self.file_name.len())
            .map(|idx| self.file_name[idx + 1..].to_lowercase())
            .unwrap_or_else(|| "bin".to_string())
    }
}

/// Any extracted record
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "record", rename_all = "lowercase")]
pub enum Record {
    Contact(Contact),
    Sms(SmsMessage),
    Photo(Photo),
}

impl Record {
    pub fn domain(&self) -> Domain {
        match self {
            Record::Contact(_) => Domain::Contacts,
            Record::Sms(_) => Domain::Sms,
            Record::Photo(_) => Domain::Photos,
        }
    }
}

impl From<Contact> for Record {
    fn from(contact: Contact) -> Self {
        Record::Contact(contact)
    }
}

impl From<SmsMessage> for Record {
    fn from(message: SmsMessage) -> Self {
        Record::Sms(message)
    }
}

impl From<Photo> for Record {
    fn from(photo: Photo) -> Self {
        Record::Photo(photo)
    }
}

/// A malformed input record that was skipped
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordWarning {
    pub domain: Domain,
    /// Provider id, path or raw line identifying the input
    pub record_ref: String,
    pub message: String,
}

impl RecordWarning {
    pub fn new(domain: Domain, record_ref: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            domain,
            record_ref: record_ref.into(),
            message: message.into(),
        }
    }
}

impl Display for RecordWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} record {}: {}", self.domain, self.record_ref, self.message)
    }
}
