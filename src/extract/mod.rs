//! Record extraction
//!
//! # Submodules
//!
//! - `records` - Contact, SMS and photo record types
//! - `query` - `content query` command builder and row parser
//! - `phone` - E.164 phone number normalization
//! - `stream` - Paged, lazily evaluated record streams
//! - `contacts` - Contacts and contact groups
//! - `sms` - SMS messages and conversations
//! - `photos` - Photo scan and download
//! - `thumbnail` - Thumbnail generation and cache

pub mod contacts;
pub mod phone;
pub mod photos;
pub mod query;
pub mod records;
pub mod sms;
pub mod stream;
pub mod thumbnail;

pub use contacts::{ContactFilter, ContactsExtractor};
pub use phone::normalize_e164;
pub use photos::{PhotoExtractor, PhotoFilter, PhotoScan};
pub use query::{ContentQuery, ContentRow, Selection};
pub use records::{
    Contact, ContactGroup, Conversation, Domain, Photo, Record, RecordWarning, SmsDirection, SmsMessage,
    SmsStatus, ThumbnailRef,
};
pub use sms::{group_conversations, SmsExtractor, SmsFilter};
pub use stream::{Page, PageSource, RecordStream};
pub use thumbnail::{Thumbnail, ThumbnailCache};
