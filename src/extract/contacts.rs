//! Contacts extraction over the contacts content provider
//!
//! The contacts table is read by keyset pages; the data rows (phones,
//! emails, group memberships) of each page are fetched with one `IN (...)`
//! query and folded into the page's contacts.

use crate::core::cancel::CancelToken;
use crate::core::config::ExtractionConfig;
use crate::core::error::Result;
use crate::device::Capability;
use crate::extract::phone::normalize_e164;
use crate::extract::query::{parse_rows, ContentQuery, MalformedRow, Selection};
use crate::extract::records::{Contact, ContactGroup, Domain, RecordWarning};
use crate::extract::stream::{Page, PageSource, RecordStream};
use crate::session::Session;
use log::{debug, warn};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

pub const CONTACT_PROJECTION: &[&str] = &["_id", "display_name"];
pub const DATA_PROJECTION: &[&str] = &["contact_id", "mimetype", "data1"];
pub const GROUP_PROJECTION: &[&str] = &["_id", "title"];

pub const MIME_PHONE: &str = "vnd.android.cursor.item/phone_v2";
pub const MIME_EMAIL: &str = "vnd.android.cursor.item/email_v2";
pub const MIME_GROUP_MEMBERSHIP: &str = "vnd.android.cursor.item/group_membership";

/// Search over extracted contacts
#[derive(Debug, Clone, Default)]
pub struct ContactFilter {
    /// Case-insensitive match on name, number or email
    pub keyword: Option<String>,
    pub group_id: Option<u64>,
}

impl ContactFilter {
    pub fn matches(&self, contact: &Contact) -> bool {
        if let Some(group) = self.group_id {
            if !contact.group_ids.contains(&group) {
                return false;
            }
        }
        match &self.keyword {
            Some(keyword) => {
                let keyword = keyword.to_lowercase();
                contact.display_name.to_lowercase().contains(&keyword)
                    || contact.phone_numbers.iter().any(|p| p.contains(&keyword))
                    || contact.emails.iter().any(|e| e.contains(&keyword))
            }
            None => true,
        }
    }

    fn is_empty(&self) -> bool {
        self.keyword.is_none() && self.group_id.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct ContactsExtractor {
    page_size: usize,
    country_code: String,
}

impl ContactsExtractor {
    pub fn new(config: &ExtractionConfig) -> Self {
        Self {
            page_size: config.page_size.max(1),
            country_code: config.default_country_code.clone(),
        }
    }

    /// Stream every contact on the device.
    ///
    /// Fails up front if the session has no shell or lacks `ReadContacts`.
    pub fn extract(
        &self,
        session: &Arc<Session>,
        filter: Option<ContactFilter>,
        cancel: &CancelToken,
    ) -> Result<RecordStream<Contact>> {
        session.require_shell("contacts extraction")?;
        session.require(Capability::ReadContacts)?;

        let source = ContactPages {
            session: Arc::clone(session),
            page_size: self.page_size,
            country_code: self.country_code.clone(),
            cursor: 0,
            done: false,
        };
        let stream = RecordStream::new(Domain::Contacts, Box::new(source), cancel.clone());
        Ok(match filter.filter(|f| !f.is_empty()) {
            Some(filter) => stream.with_filter(move |c| filter.matches(c)),
            None => stream,
        })
    }

    /// Contact groups defined on the device
    pub fn groups(&self, session: &Session, cancel: &CancelToken) -> Result<Vec<ContactGroup>> {
        session.require_shell("contact groups")?;
        session.require(Capability::ReadContacts)?;

        let query = ContentQuery::new(&session.profile().groups_uri, GROUP_PROJECTION);
        let output = session.shell(&query.to_command(), cancel)?;
        let parsed = parse_rows(&output, &query.projection);
        for bad in &parsed.malformed {
            warn!("{}", malformed_warning(bad));
        }

        let mut groups: Vec<ContactGroup> = parsed
            .rows
            .iter()
            .filter_map(|row| {
                Some(ContactGroup {
                    id: row.get_u64("_id")?,
                    title: row.get("title").unwrap_or_default().to_string(),
                })
            })
            .collect();
        groups.sort_by_key(|g| g.id);
        Ok(groups)
    }
}

fn malformed_warning(bad: &MalformedRow) -> RecordWarning {
    let line: String = bad.line.chars().take(60).collect();
    RecordWarning::new(Domain::Contacts, line, bad.reason.clone())
}

/// Keyset pager over the contacts table
struct ContactPages {
    session: Arc<Session>,
    page_size: usize,
    country_code: String,
    cursor: u64,
    done: bool,
}

impl ContactPages {
    fn contacts_query(&self) -> ContentQuery {
        let profile = self.session.profile();
        let query = ContentQuery::new(&profile.contacts_uri, CONTACT_PROJECTION);
        if profile.supports_sort_limit {
            query
                .with_selection(Selection::IdGreaterThan {
                    column: "_id".to_string(),
                    value: self.cursor,
                })
                .sorted_by("_id ASC")
                .with_limit(self.page_size)
        } else {
            query.sorted_by("_id ASC")
        }
    }

    /// Fold phone, email and group rows into the page's contacts
    fn attach_data(
        &self,
        contacts: &mut BTreeMap<u64, Contact>,
        warnings: &mut Vec<RecordWarning>,
        cancel: &CancelToken,
    ) -> Result<()> {
        let ids: Vec<String> = contacts.keys().map(|id| id.to_string()).collect();
        let query = ContentQuery::new(&self.session.profile().contacts_data_uri, DATA_PROJECTION)
            .with_selection(Selection::ColumnIn {
                column: "contact_id".to_string(),
                values: ids,
            });
        let output = self.session.shell(&query.to_command(), cancel)?;
        let parsed = parse_rows(&output, &query.projection);
        warnings.extend(parsed.malformed.iter().map(malformed_warning));

        for row in &parsed.rows {
            let Some(contact) = row.get_u64("contact_id").and_then(|id| contacts.get_mut(&id)) else {
                continue;
            };
            let Some(value) = row.get("data1").map(str::trim).filter(|v| !v.is_empty()) else {
                continue;
            };
            match row.get("mimetype") {
                Some(MIME_PHONE) => match normalize_e164(value, &self.country_code) {
                    Some(number) => {
                        if !contact.phone_numbers.contains(&number) {
                            contact.phone_numbers.push(number);
                        }
                    }
                    None => warnings.push(RecordWarning::new(
                        Domain::Contacts,
                        contact.id.to_string(),
                        format!("unparseable phone number '{}'", value),
                    )),
                },
                Some(MIME_EMAIL) => {
                    contact.emails.insert(value.to_lowercase());
                }
                Some(MIME_GROUP_MEMBERSHIP) => match value.parse() {
                    Ok(group) => {
                        contact.group_ids.insert(group);
                    }
                    Err(_) => warnings.push(RecordWarning::new(
                        Domain::Contacts,
                        contact.id.to_string(),
                        format!("invalid group id '{}'", value),
                    )),
                },
                _ => {}
            }
        }
        Ok(())
    }
}

impl PageSource<Contact> for ContactPages {
    fn next_page(&mut self, cancel: &CancelToken) -> Result<Option<Page<Contact>>> {
        if self.done {
            return Ok(None);
        }

        let query = self.contacts_query();
        let output = self.session.shell(&query.to_command(), cancel)?;
        let parsed = parse_rows(&output, &query.projection);
        if parsed.raw_count() == 0 {
            self.done = true;
            return Ok(None);
        }
        if !self.session.profile().supports_sort_limit {
            self.done = true;
        }

        let mut warnings: Vec<RecordWarning> = parsed.malformed.iter().map(malformed_warning).collect();
        let mut contacts = BTreeMap::new();
        for row in &parsed.rows {
            match row.get_u64("_id") {
                Some(id) => {
                    contacts.insert(
                        id,
                        Contact {
                            id,
                            display_name: row.get("display_name").unwrap_or_default().trim().to_string(),
                            phone_numbers: Vec::new(),
                            emails: BTreeSet::new(),
                            group_ids: BTreeSet::new(),
                        },
                    );
                }
                None => warnings.push(RecordWarning::new(
                    Domain::Contacts,
                    row.get("_id").unwrap_or("NULL"),
                    "missing or invalid _id",
                )),
            }
        }

        match contacts.keys().next_back() {
            Some(&last) => self.cursor = self.cursor.max(last),
            // no usable id to advance the keyset cursor past
            None => self.done = true,
        }

        if !contacts.is_empty() {
            self.attach_data(&mut contacts, &mut warnings, cancel)?;
        }
        debug!(
            "Contacts page: {} records, {} warnings (cursor {})",
            contacts.len(),
            warnings.len(),
            self.cursor
        );
        Ok(Some(Page::new(contacts.into_values().collect(), warnings)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::ExtractionError;
    use crate::device::{DeviceProfile, PermissionState};
    use crate::session::RetryPolicy;
    use crate::testdb::{MockDataGenerator, MockDeviceData, MockTransport};

    fn config(page_size: usize) -> ExtractionConfig {
        ExtractionConfig {
            page_size,
            ..ExtractionConfig::default()
        }
    }

    fn session(mock: Arc<MockTransport>, profile: DeviceProfile) -> Arc<Session> {
        Session::open(
            "Pixel 8",
            mock,
            profile,
            PermissionState::granting(&Capability::ALL),
            RetryPolicy::immediate(3),
        )
    }

    fn sample_device() -> MockDeviceData {
        let mut data = MockDeviceData::default();
        let profile = DeviceProfile::default();
        data.add_contact(&profile, 3, "Ada Lovelace", &["(555) 123-4567", "555.123.4567"], &["Ada@Example.com"], &[1]);
        data.add_contact(&profile, 1, "Alan Turing", &["+44 20 7946 0018", "not a number"], &[], &[]);
        data.add_contact(&profile, 7, "Grace Hopper", &[], &["grace@navy.mil"], &[1, 2]);
        data.add_group(&profile, 1, "Friends");
        data.add_group(&profile, 2, "Work");
        data
    }

    #[test]
    fn test_extract_normalizes_and_keeps_bad_numbers_out() {
        let mock = Arc::new(MockTransport::adb("ABC123", sample_device()));
        let session = session(mock, DeviceProfile::default());
        let mut stream = ContactsExtractor::new(&config(2))
            .extract(&session, None, &CancelToken::new())
            .unwrap();

        let mut contacts: Vec<Contact> = stream.by_ref().map(|r| r.unwrap()).collect();
        contacts.sort_by_key(|c| c.id);
        assert_eq!(contacts.len(), 3);

        let ada = &contacts[1];
        assert_eq!(ada.phone_numbers, vec!["+15551234567".to_string()]);
        assert!(ada.emails.contains("ada@example.com"));
        assert!(ada.group_ids.contains(&1));

        let alan = &contacts[0];
        assert_eq!(alan.phone_numbers, vec!["+442079460018".to_string()]);
        assert_eq!(stream.warnings().len(), 1);
        assert!(stream.warnings()[0].message.contains("not a number"));
    }

    #[test]
    fn test_repeated_extraction_is_stable() {
        let data = MockDataGenerator::new(7).contacts(45).build(&DeviceProfile::default());
        let mock = Arc::new(MockTransport::adb("ABC123", data));
        let session = session(mock, DeviceProfile::default());
        let extractor = ContactsExtractor::new(&config(10));

        let run = || -> Vec<Contact> {
            extractor
                .extract(&session, None, &CancelToken::new())
                .unwrap()
                .map(|r| r.unwrap())
                .collect()
        };
        let first = run();
        let second = run();
        assert_eq!(first.len(), 45);
        assert_eq!(first, second);
    }

    #[test]
    fn test_single_query_when_limit_is_ignored() {
        let profile = DeviceProfile {
            supports_sort_limit: false,
            ..DeviceProfile::default()
        };
        let data = MockDataGenerator::new(3).contacts(30).build(&profile);
        let mock = Arc::new(MockTransport::adb("ABC123", data));
        mock.set_honours_limit(false);
        let session = session(mock, profile);

        let count = ContactsExtractor::new(&config(10))
            .extract(&session, None, &CancelToken::new())
            .unwrap()
            .filter(Result::is_ok)
            .count();
        assert_eq!(count, 30);
    }

    #[test]
    fn test_filter_by_keyword_and_group() {
        let mock = Arc::new(MockTransport::adb("ABC123", sample_device()));
        let session = session(mock, DeviceProfile::default());
        let extractor = ContactsExtractor::new(&config(50));

        let filter = ContactFilter {
            keyword: Some("grace".to_string()),
            group_id: None,
        };
        let found: Vec<Contact> = extractor
            .extract(&session, Some(filter), &CancelToken::new())
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].display_name, "Grace Hopper");

        let filter = ContactFilter {
            keyword: None,
            group_id: Some(1),
        };
        let count = extractor
            .extract(&session, Some(filter), &CancelToken::new())
            .unwrap()
            .count();
        assert_eq!(count, 2);
    }

    #[test]
    fn test_groups() {
        let mock = Arc::new(MockTransport::adb("ABC123", sample_device()));
        let session = session(mock, DeviceProfile::default());
        let groups = ContactsExtractor::new(&config(50))
            .groups(&session, &CancelToken::new())
            .unwrap();
        let titles: Vec<&str> = groups.iter().map(|g| g.title.as_str()).collect();
        assert_eq!(titles, vec!["Friends", "Work"]);
    }

    #[test]
    fn test_mtp_session_is_unsupported() {
        let mock = Arc::new(MockTransport::mtp("ABC123", sample_device()));
        let session = session(mock, DeviceProfile::default());
        let result = ContactsExtractor::new(&config(50)).extract(&session, None, &CancelToken::new());
        assert!(matches!(result, Err(ExtractionError::Unsupported { .. })));
    }

    #[test]
    fn test_missing_permission_is_denied() {
        let mock = Arc::new(MockTransport::adb("ABC123", sample_device()));
        let session = Session::open(
            "Pixel 8",
            mock,
            DeviceProfile::default(),
            PermissionState::granting(&[Capability::Shell, Capability::ReadStorage]),
            RetryPolicy::immediate(1),
        );
        let result = ContactsExtractor::new(&config(50)).extract(&session, None, &CancelToken::new());
        assert!(matches!(result, Err(ExtractionError::PermissionDenied { .. })));
    }
}
