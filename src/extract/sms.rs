//! SMS extraction over the telephony content provider

use crate::core::cancel::CancelToken;
use crate::core::config::ExtractionConfig;
use crate::core::error::Result;
use crate::device::Capability;
use crate::extract::phone::normalize_e164;
use crate::extract::query::{parse_rows, ContentQuery, ContentRow, Selection};
use crate::extract::records::{Conversation, Domain, RecordWarning, SmsDirection, SmsMessage, SmsStatus};
use crate::extract::stream::{Page, PageSource, RecordStream};
use crate::session::Session;
use chrono::{DateTime, TimeZone, Utc};
use log::debug;
use std::collections::BTreeMap;
use std::sync::Arc;

pub const SMS_PROJECTION: &[&str] = &["_id", "thread_id", "address", "date", "type", "status", "read", "body"];

/// Provider `status` values for outgoing messages
const STATUS_PENDING: i64 = 32;
const STATUS_FAILED: i64 = 64;

/// Map the provider `type` and `status` columns
pub fn classify(message_type: i64, status: i64) -> (SmsDirection, SmsStatus) {
    match message_type {
        1 => (SmsDirection::Inbound, SmsStatus::Received),
        2 => match status {
            STATUS_PENDING => (SmsDirection::Outbound, SmsStatus::Pending),
            STATUS_FAILED => (SmsDirection::Outbound, SmsStatus::Failed),
            _ => (SmsDirection::Outbound, SmsStatus::Sent),
        },
        3 => (SmsDirection::Outbound, SmsStatus::Draft),
        4 => (SmsDirection::Outbound, SmsStatus::Outbox),
        5 => (SmsDirection::Outbound, SmsStatus::Failed),
        6 => (SmsDirection::Outbound, SmsStatus::Queued),
        _ => (SmsDirection::Outbound, SmsStatus::Unknown),
    }
}

/// Normalized peer address used to group conversations
pub fn conversation_key(address: &str, country_code: &str) -> String {
    if let Some(number) = normalize_e164(address, country_code) {
        return number;
    }
    let trimmed = address.trim();
    if trimmed.is_empty() {
        "unknown".to_string()
    } else {
        trimmed.to_lowercase()
    }
}

/// Group messages by peer; messages ordered by timestamp, ties by id
pub fn group_conversations(messages: impl IntoIterator<Item = SmsMessage>) -> Vec<Conversation> {
    let mut grouped: BTreeMap<String, Vec<SmsMessage>> = BTreeMap::new();
    for message in messages {
        grouped.entry(message.conversation_key.clone()).or_default().push(message);
    }
    grouped
        .into_iter()
        .map(|(key, mut messages)| {
            messages.sort_by_key(|m| (m.timestamp, m.id));
            Conversation { key, messages }
        })
        .collect()
}

#[derive(Debug, Clone, Default)]
pub struct SmsFilter {
    /// Case-insensitive match on body or address
    pub keyword: Option<String>,
    /// Peer address; compared in normalized form
    pub address: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl SmsFilter {
    pub fn matches(&self, message: &SmsMessage, country_code: &str) -> bool {
        if let Some(keyword) = &self.keyword {
            let keyword = keyword.to_lowercase();
            if !message.body.to_lowercase().contains(&keyword)
                && !message.address.to_lowercase().contains(&keyword)
            {
                return false;
            }
        }
        if let Some(address) = &self.address {
            if conversation_key(address, country_code) != message.conversation_key {
                return false;
            }
        }
        if self.since.is_some_and(|since| message.timestamp < since) {
            return false;
        }
        if self.until.is_some_and(|until| message.timestamp > until) {
            return false;
        }
        true
    }

    fn is_empty(&self) -> bool {
        self.keyword.is_none() && self.address.is_none() && self.since.is_none() && self.until.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct SmsExtractor {
    page_size: usize,
    country_code: String,
}

impl SmsExtractor {
    pub fn new(config: &ExtractionConfig) -> Self {
        Self {
            page_size: config.page_size.max(1),
            country_code: config.default_country_code.clone(),
        }
    }

    /// Stream every message in provider order
    pub fn extract(
        &self,
        session: &Arc<Session>,
        filter: Option<SmsFilter>,
        cancel: &CancelToken,
    ) -> Result<RecordStream<SmsMessage>> {
        session.require_shell("sms extraction")?;
        session.require(Capability::ReadSms)?;

        let source = SmsPages {
            session: Arc::clone(session),
            page_size: self.page_size,
            country_code: self.country_code.clone(),
            cursor: 0,
            done: false,
        };
        let stream = RecordStream::new(Domain::Sms, Box::new(source), cancel.clone());
        Ok(match filter.filter(|f| !f.is_empty()) {
            Some(filter) => {
                let country_code = self.country_code.clone();
                stream.with_filter(move |m| filter.matches(m, &country_code))
            }
            None => stream,
        })
    }

    /// Read everything and group it into conversations
    pub fn conversations(
        &self,
        session: &Arc<Session>,
        filter: Option<SmsFilter>,
        cancel: &CancelToken,
    ) -> Result<Vec<Conversation>> {
        let messages = self
            .extract(session, filter, cancel)?
            .collect::<Result<Vec<SmsMessage>>>()?;
        Ok(group_conversations(messages))
    }
}

struct SmsPages {
    session: Arc<Session>,
    page_size: usize,
    country_code: String,
    cursor: u64,
    done: bool,
}

impl SmsPages {
    fn query(&self) -> ContentQuery {
        let profile = self.session.profile();
        let query = ContentQuery::new(&profile.sms_uri, SMS_PROJECTION).sorted_by("_id ASC");
        if profile.supports_sort_limit {
            query
                .with_selection(Selection::IdGreaterThan {
                    column: "_id".to_string(),
                    value: self.cursor,
                })
                .with_limit(self.page_size)
        } else {
            query
        }
    }

    fn parse_message(&self, id: u64, row: &ContentRow) -> std::result::Result<SmsMessage, String> {
        let millis = row
            .get_i64("date")
            .ok_or_else(|| format!("unparseable date '{}'", row.get("date").unwrap_or("NULL")))?;
        let timestamp = Utc
            .timestamp_millis_opt(millis)
            .single()
            .ok_or_else(|| format!("date {} out of range", millis))?;

        let (direction, status) = classify(
            row.get_i64("type").unwrap_or(0),
            row.get_i64("status").unwrap_or(-1),
        );
        let address = row.get("address").unwrap_or_default().to_string();

        Ok(SmsMessage {
            id,
            conversation_key: conversation_key(&address, &self.country_code),
            address,
            thread_id: row.get_u64("thread_id"),
            direction,
            timestamp,
            body: row.get("body").unwrap_or_default().to_string(),
            status,
            read: row.get("read").map(str::trim) == Some("1"),
        })
    }
}

impl PageSource<SmsMessage> for SmsPages {
    fn next_page(&mut self, cancel: &CancelToken) -> Result<Option<Page<SmsMessage>>> {
        if self.done {
            return Ok(None);
        }

        let query = self.query();
        let output = self.session.shell(&query.to_command(), cancel)?;
        let parsed = parse_rows(&output, &query.projection);
        if parsed.raw_count() == 0 {
            self.done = true;
            return Ok(None);
        }
        if !self.session.profile().supports_sort_limit {
            self.done = true;
        }

        let mut warnings: Vec<RecordWarning> = parsed
            .malformed
            .iter()
            .map(|bad| {
                let line: String = bad.line.chars().take(60).collect();
                RecordWarning::new(Domain::Sms, line, bad.reason.clone())
            })
            .collect();

        let mut messages = Vec::with_capacity(parsed.rows.len());
        let mut last_id = None;
        for row in &parsed.rows {
            let Some(id) = row.get_u64("_id") else {
                warnings.push(RecordWarning::new(
                    Domain::Sms,
                    row.get("_id").unwrap_or("NULL"),
                    "missing or invalid _id",
                ));
                continue;
            };
            last_id = last_id.max(Some(id));
            match self.parse_message(id, row) {
                Ok(message) => messages.push(message),
                Err(reason) => warnings.push(RecordWarning::new(Domain::Sms, id.to_string(), reason)),
            }
        }

        match last_id {
            Some(last) => self.cursor = self.cursor.max(last),
            None => self.done = true,
        }
        debug!(
            "SMS page: {} records, {} warnings (cursor {})",
            messages.len(),
            warnings.len(),
            self.cursor
        );
        Ok(Some(Page::new(messages, warnings)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::ExtractionError;
    use crate::device::{DeviceProfile, PermissionState};
    use crate::session::{RetryPolicy, SessionState};
    use crate::testdb::{MockDataGenerator, MockDeviceData, MockTransport, SmsSeed};

    fn config(page_size: usize) -> ExtractionConfig {
        ExtractionConfig {
            page_size,
            ..ExtractionConfig::default()
        }
    }

    fn session(mock: Arc<MockTransport>) -> Arc<Session> {
        Session::open(
            "Pixel 8",
            mock,
            DeviceProfile::default(),
            PermissionState::granting(&Capability::ALL),
            RetryPolicy::immediate(3),
        )
    }

    fn seed(id: u64, address: &str, date: &str, message_type: &str, body: &str) -> SmsSeed {
        SmsSeed {
            id,
            thread_id: Some(1),
            address: address.to_string(),
            date: date.to_string(),
            message_type: message_type.to_string(),
            status: "-1".to_string(),
            read: true,
            body: body.to_string(),
        }
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify(1, -1), (SmsDirection::Inbound, SmsStatus::Received));
        assert_eq!(classify(2, 0), (SmsDirection::Outbound, SmsStatus::Sent));
        assert_eq!(classify(2, 32), (SmsDirection::Outbound, SmsStatus::Pending));
        assert_eq!(classify(2, 64), (SmsDirection::Outbound, SmsStatus::Failed));
        assert_eq!(classify(6, -1), (SmsDirection::Outbound, SmsStatus::Queued));
        assert_eq!(classify(99, -1), (SmsDirection::Outbound, SmsStatus::Unknown));
    }

    #[test]
    fn test_conversation_key() {
        assert_eq!(conversation_key("(555) 123-4567", "1"), "+15551234567");
        assert_eq!(conversation_key(" VERIZON ", "1"), "verizon");
        assert_eq!(conversation_key("", "1"), "unknown");
    }

    #[test]
    fn test_corrupt_row_is_skipped_with_warning() {
        let profile = DeviceProfile::default();
        let mut data = MockDeviceData::default();
        data.add_sms(&profile, seed(1, "5551234567", "1700000000000", "1", "hi, there"));
        data.add_sms(&profile, seed(2, "5551234567", "yesterday", "2", "broken"));
        data.add_sms(&profile, seed(3, "+15551234567", "1700000060000", "2", "multi\nline"));
        let session = session(Arc::new(MockTransport::adb("ABC123", data)));

        let mut stream = SmsExtractor::new(&config(2))
            .extract(&session, None, &CancelToken::new())
            .unwrap();
        let messages: Vec<SmsMessage> = stream.by_ref().map(|r| r.unwrap()).collect();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].body, "hi, there");
        assert_eq!(messages[1].body, "multi\nline");
        assert_eq!(stream.warnings().len(), 1);
        assert_eq!(stream.warnings()[0].record_ref, "2");
    }

    #[test]
    fn test_conversations_are_time_ordered() {
        let profile = DeviceProfile::default();
        let mut data = MockDeviceData::default();
        data.add_sms(&profile, seed(10, "5551234567", "1700000090000", "2", "third"));
        data.add_sms(&profile, seed(4, "+15551234567", "1700000000000", "1", "first"));
        data.add_sms(&profile, seed(7, "555-123-4567", "1700000000000", "1", "second"));
        data.add_sms(&profile, seed(5, "BANK", "1700000050000", "1", "otp"));
        let session = session(Arc::new(MockTransport::adb("ABC123", data)));

        let conversations = SmsExtractor::new(&config(50))
            .conversations(&session, None, &CancelToken::new())
            .unwrap();
        assert_eq!(conversations.len(), 2);
        let peer = conversations.iter().find(|c| c.key == "+15551234567").unwrap();
        let bodies: Vec<&str> = peer.messages.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, vec!["first", "second", "third"]);
    }

    #[test]
    fn test_disconnect_after_k_rows_yields_k_and_partial_result() {
        let data = MockDataGenerator::new(11).sms(25).build(&DeviceProfile::default());
        let mock = Arc::new(MockTransport::adb("ABC123", data));
        mock.disconnect_after_rows(13);
        let session = session(mock);

        let results: Vec<Result<SmsMessage>> = SmsExtractor::new(&config(10))
            .extract(&session, None, &CancelToken::new())
            .unwrap()
            .collect();
        let ok = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(ok, 13);
        assert_eq!(results.len(), 14);
        match results.last() {
            Some(Err(ExtractionError::PartialResult { domain, delivered, .. })) => {
                assert_eq!(*domain, Domain::Sms);
                assert_eq!(*delivered, 13);
            }
            other => panic!("expected PartialResult, got {:?}", other),
        }
        assert_eq!(session.state(), SessionState::Lost);
    }

    #[test]
    fn test_filter_by_address_and_date() {
        let profile = DeviceProfile::default();
        let mut data = MockDeviceData::default();
        data.add_sms(&profile, seed(1, "5551234567", "1700000000000", "1", "old"));
        data.add_sms(&profile, seed(2, "5551234567", "1800000000000", "1", "new"));
        data.add_sms(&profile, seed(3, "5559999999", "1800000000000", "1", "other"));
        let session = session(Arc::new(MockTransport::adb("ABC123", data)));

        let filter = SmsFilter {
            address: Some("+1 555 123 4567".to_string()),
            since: Utc.timestamp_millis_opt(1_750_000_000_000).single(),
            ..SmsFilter::default()
        };
        let found: Vec<SmsMessage> = SmsExtractor::new(&config(50))
            .extract(&session, Some(filter), &CancelToken::new())
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].body, "new");
    }
}
