//! Mock transport for testing without a real device
//!
//! [`MockTransport`] answers `content query` commands from in-memory tables
//! and storage calls from an in-memory file tree. Failure behaviour
//! (latency, disconnects, refused permissions, failing probes) is scripted
//! per test, and every data call is logged with its start and end time so
//! tests can check that calls never overlap.

use crate::core::error::{ExtractionError, Result};
use crate::device::{
    Capability, DeviceDescriptor, DeviceProfile, PermissionState, RemoteEntry, Transport, TransportBackend,
    TransportKind,
};
use crate::extract::contacts::{MIME_EMAIL, MIME_GROUP_MEMBERSHIP, MIME_PHONE};
use crate::extract::query::{render_rows, ContentQuery, ContentRow, Selection};
use chrono::{DateTime, Utc};
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread;
use std::time::{Duration, Instant};

/// One provider row; `None` renders as `NULL`
pub type MockRow = BTreeMap<String, Option<String>>;

/// A file in the mock storage
#[derive(Debug, Clone, PartialEq)]
pub struct MockFile {
    pub data: Vec<u8>,
    pub modified: Option<DateTime<Utc>>,
}

/// Raw SMS provider row
#[derive(Debug, Clone)]
pub struct SmsSeed {
    pub id: u64,
    pub thread_id: Option<u64>,
    pub address: String,
    /// Milliseconds since the epoch, as text so tests can corrupt it
    pub date: String,
    pub message_type: String,
    pub status: String,
    pub read: bool,
    pub body: String,
}

/// Content of a simulated device
#[derive(Debug, Clone, Default)]
pub struct MockDeviceData {
    /// Provider URI -> rows
    pub tables: HashMap<String, Vec<MockRow>>,
    /// Absolute path -> file
    pub files: BTreeMap<String, MockFile>,
    /// Folders that exist even when empty
    pub dirs: BTreeSet<String>,
}

impl MockDeviceData {
    pub fn add_row(&mut self, uri: &str, columns: &[(&str, Option<&str>)]) {
        let row = columns
            .iter()
            .map(|(k, v)| (k.to_string(), v.map(str::to_string)))
            .collect();
        self.tables.entry(uri.to_string()).or_default().push(row);
    }

    pub fn rows(&self, uri: &str) -> &[MockRow] {
        self.tables.get(uri).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn add_contact(
        &mut self,
        profile: &DeviceProfile,
        id: u64,
        name: &str,
        phones: &[&str],
        emails: &[&str],
        groups: &[u64],
    ) {
        let id_text = id.to_string();
        self.add_row(&profile.contacts_uri, &[("_id", Some(id_text.as_str())), ("display_name", Some(name))]);

        let data_uri = profile.contacts_data_uri.clone();
        for phone in phones {
            self.add_row(
                &data_uri,
                &[("contact_id", Some(id_text.as_str())), ("mimetype", Some(MIME_PHONE)), ("data1", Some(*phone))],
            );
        }
        for email in emails {
            self.add_row(
                &data_uri,
                &[("contact_id", Some(id_text.as_str())), ("mimetype", Some(MIME_EMAIL)), ("data1", Some(*email))],
            );
        }
        for group in groups {
            let group = group.to_string();
            self.add_row(
                &data_uri,
                &[
                    ("contact_id", Some(id_text.as_str())),
                    ("mimetype", Some(MIME_GROUP_MEMBERSHIP)),
                    ("data1", Some(group.as_str())),
                ],
            );
        }
    }

    pub fn add_group(&mut self, profile: &DeviceProfile, id: u64, title: &str) {
        let id = id.to_string();
        self.add_row(&profile.groups_uri, &[("_id", Some(id.as_str())), ("title", Some(title))]);
    }

    pub fn add_sms(&mut self, profile: &DeviceProfile, seed: SmsSeed) {
        let id = seed.id.to_string();
        let thread = seed.thread_id.map(|t| t.to_string());
        let read = if seed.read { "1" } else { "0" };
        self.add_row(
            &profile.sms_uri,
            &[
                ("_id", Some(id.as_str())),
                ("thread_id", thread.as_deref()),
                ("address", Some(seed.address.as_str())),
                ("date", Some(seed.date.as_str())),
                ("type", Some(seed.message_type.as_str())),
                ("status", Some(seed.status.as_str())),
                ("read", Some(read)),
                ("body", Some(seed.body.as_str())),
            ],
        );
    }

    pub fn add_file(&mut self, path: &str, data: Vec<u8>, modified: Option<DateTime<Utc>>) {
        self.files.insert(path.to_string(), MockFile { data, modified });
    }

    pub fn add_dir(&mut self, path: &str) {
        self.dirs.insert(path.trim_end_matches('/').to_string());
    }

    fn folder_exists(&self, path: &str) -> bool {
        let prefix = format!("{}/", path);
        self.dirs.contains(path)
            || self.dirs.iter().any(|d| d.starts_with(&prefix))
            || self.files.keys().any(|f| f.starts_with(&prefix))
    }
}

/// Start and end of one data call, relative to transport creation
#[derive(Debug, Clone, PartialEq)]
pub struct CallRecord {
    pub operation: String,
    pub start: Duration,
    pub end: Duration,
}

#[derive(Debug)]
struct MockState {
    connected: bool,
    latency: Duration,
    rows_remaining: Option<usize>,
    calls_remaining: Option<usize>,
    honours_limit: bool,
    denied: BTreeSet<Capability>,
    /// Capabilities whose grant requests are refused
    locked: BTreeSet<Capability>,
    grant_requests: Vec<Capability>,
    failing_pings: u32,
    failing_calls: u32,
    failing_reconnects: u32,
    call_log: Vec<CallRecord>,
}

/// Scriptable in-memory [`Transport`]
pub struct MockTransport {
    kind: TransportKind,
    serial: String,
    data: RwLock<MockDeviceData>,
    state: Mutex<MockState>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    calls: AtomicUsize,
    reconnects: AtomicUsize,
    created: Instant,
}

impl MockTransport {
    pub fn new(kind: TransportKind, serial: &str, data: MockDeviceData) -> Self {
        Self {
            kind,
            serial: serial.to_string(),
            data: RwLock::new(data),
            state: Mutex::new(MockState {
                connected: true,
                latency: Duration::ZERO,
                rows_remaining: None,
                calls_remaining: None,
                honours_limit: true,
                denied: BTreeSet::new(),
                locked: BTreeSet::new(),
                grant_requests: Vec::new(),
                failing_pings: 0,
                failing_calls: 0,
                failing_reconnects: 0,
                call_log: Vec::new(),
            }),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            reconnects: AtomicUsize::new(0),
            created: Instant::now(),
        }
    }

    pub fn adb(serial: &str, data: MockDeviceData) -> Self {
        Self::new(TransportKind::Adb, serial, data)
    }

    pub fn mtp(serial: &str, data: MockDeviceData) -> Self {
        Self::new(TransportKind::Mtp, serial, data)
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Delay added to every data call and probe
    pub fn set_latency(&self, latency: Duration) {
        self.state().latency = latency;
    }

    /// Serve `rows` provider rows in total, then drop the connection
    pub fn disconnect_after_rows(&self, rows: usize) {
        self.state().rows_remaining = Some(rows);
    }

    /// Serve `calls` data calls, then drop the connection
    pub fn disconnect_after_calls(&self, calls: usize) {
        self.state().calls_remaining = Some(calls);
    }

    /// Whether `LIMIT` in the sort clause is applied
    pub fn set_honours_limit(&self, honours: bool) {
        self.state().honours_limit = honours;
    }

    pub fn deny(&self, capability: Capability) {
        self.state().denied.insert(capability);
    }

    /// Deny a capability and refuse every request to grant it
    pub fn lock_permission(&self, capability: Capability) {
        let mut state = self.state();
        state.denied.insert(capability);
        state.locked.insert(capability);
    }

    /// Capabilities passed to `request_permission`, in order
    pub fn grant_requests(&self) -> Vec<Capability> {
        self.state().grant_requests.clone()
    }

    pub fn fail_next_pings(&self, count: u32) {
        self.state().failing_pings = count;
    }

    /// Fail the next data calls with a transient disconnect
    pub fn fail_next_calls(&self, count: u32) {
        self.state().failing_calls = count;
    }

    pub fn fail_next_reconnects(&self, count: u32) {
        self.state().failing_reconnects = count;
    }

    pub fn set_connected(&self, connected: bool) {
        self.state().connected = connected;
    }

    pub fn is_connected(&self) -> bool {
        self.state().connected
    }

    /// Data calls (list, pull, push, shell) that reached the transport
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn reconnect_attempts(&self) -> usize {
        self.reconnects.load(Ordering::SeqCst)
    }

    /// Highest number of data calls seen in flight at once
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn call_log(&self) -> Vec<CallRecord> {
        self.state().call_log.clone()
    }

    /// Whether any two logged calls overlapped in time
    pub fn has_overlapping_calls(&self) -> bool {
        let mut log = self.call_log();
        log.sort_by(|a, b| a.start.cmp(&b.start));
        log.windows(2).any(|w| w[1].start < w[0].end)
    }

    pub fn with_data<T>(&self, f: impl FnOnce(&MockDeviceData) -> T) -> T {
        f(&self.data.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn data_call<T>(&self, operation: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let start = self.created.elapsed();

        let (latency, failure) = {
            let mut state = self.state();
            match state.calls_remaining {
                Some(0) => state.connected = false,
                Some(left) => state.calls_remaining = Some(left - 1),
                None => {}
            }
            let failure = if !state.connected {
                Some(ExtractionError::Disconnected(format!("{} is offline", self.serial)))
            } else if state.failing_calls > 0 {
                state.failing_calls -= 1;
                Some(ExtractionError::Disconnected("scripted call failure".to_string()))
            } else {
                None
            };
            (state.latency, failure)
        };
        if !latency.is_zero() {
            thread::sleep(latency);
        }
        let result = match failure {
            Some(e) => Err(e),
            None => f(),
        };

        let end = self.created.elapsed();
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.state().call_log.push(CallRecord {
            operation: operation.to_string(),
            start,
            end,
        });
        result
    }

    fn check(&self, capability: Capability) -> Result<()> {
        if self.state().denied.contains(&capability) {
            Err(ExtractionError::PermissionDenied {
                serial: self.serial.clone(),
                capability: capability.to_string(),
            })
        } else {
            Ok(())
        }
    }

    fn run_query(&self, query: &ContentQuery) -> Result<String> {
        if query.uri.contains("sms") {
            self.check(Capability::ReadSms)?;
        } else if query.uri.contains("contacts") {
            self.check(Capability::ReadContacts)?;
        }

        let mut rows: Vec<MockRow> = self.with_data(|data| {
            data.rows(&query.uri)
                .iter()
                .filter(|row| selects(query.selection.as_ref(), row))
                .cloned()
                .collect()
        });

        if let Some((column, descending)) = query.sort.as_deref().and_then(parse_sort) {
            rows.sort_by(|a, b| {
                let ordering = compare_column(a, b, &column);
                if descending {
                    ordering.reverse()
                } else {
                    ordering
                }
            });
        }

        let mut state = self.state();
        if let (Some(limit), true) = (query.limit, state.honours_limit) {
            rows.truncate(limit);
        }
        if let Some(remaining) = state.rows_remaining {
            rows.truncate(remaining);
            let left = remaining - rows.len();
            state.rows_remaining = Some(left);
            if left == 0 {
                state.connected = false;
            }
        }
        drop(state);

        let rendered: Vec<ContentRow> = rows
            .iter()
            .map(|row| ContentRow::from_pairs(row.iter().map(|(k, v)| (k.as_str(), v.as_deref()))))
            .collect();
        Ok(render_rows(&rendered, &query.projection))
    }

    fn run_shell(&self, command: &str) -> Result<String> {
        let command = command.trim();
        if command == "echo ok" {
            return Ok("ok\n".to_string());
        }
        if command.starts_with("content query") {
            let query = ContentQuery::parse_command(command).ok_or_else(|| ExtractionError::CommandFailed {
                command: command.to_string(),
                message: "usage: content query --uri <URI> [--projection ...]".to_string(),
            })?;
            return self.run_query(&query);
        }
        if let Some(path) = command.strip_prefix("ls ") {
            let entries = self.list_entries(path.trim())?;
            let names: Vec<&str> = entries.iter().map(RemoteEntry::name).collect();
            return Ok(names.join("\n"));
        }
        Err(ExtractionError::CommandFailed {
            command: command.to_string(),
            message: format!("/system/bin/sh: {}: not found", command),
        })
    }

    fn list_entries(&self, path: &str) -> Result<Vec<RemoteEntry>> {
        self.check(Capability::ReadStorage)?;
        let path = path.trim_end_matches('/');
        let prefix = format!("{}/", path);
        self.with_data(|data| {
            if !data.folder_exists(path) {
                return if self.kind == TransportKind::Mtp {
                    Ok(Vec::new())
                } else {
                    Err(ExtractionError::CommandFailed {
                        command: format!("find {}", path),
                        message: format!("find: '{}': No such file or directory", path),
                    })
                };
            }
            let dirs = data
                .dirs
                .iter()
                .filter(|d| d.starts_with(&prefix))
                .map(|d| RemoteEntry::dir(d));
            let files = data
                .files
                .iter()
                .filter(|(p, _)| p.starts_with(&prefix))
                .map(|(p, f)| RemoteEntry::file(p, f.data.len() as u64, f.modified));
            Ok(dirs.chain(files).collect())
        })
    }
}

fn selects(selection: Option<&Selection>, row: &MockRow) -> bool {
    let value = |column: &str| row.get(column).and_then(|v| v.as_deref());
    match selection {
        None => true,
        Some(Selection::IdGreaterThan { column, value: bound }) => value(column.as_str())
            .and_then(|v| v.parse::<u64>().ok())
            .is_some_and(|v| v > *bound),
        Some(Selection::ColumnIn { column, values }) => {
            value(column.as_str()).is_some_and(|v| values.iter().any(|wanted| wanted == v))
        }
    }
}

fn parse_sort(sort: &str) -> Option<(String, bool)> {
    let mut parts = sort.split_whitespace();
    let column = parts.next()?.to_string();
    let descending = parts.next().is_some_and(|d| d.eq_ignore_ascii_case("DESC"));
    Some((column, descending))
}

fn compare_column(a: &MockRow, b: &MockRow, column: &str) -> CmpOrdering {
    let a = a.get(column).and_then(|v| v.as_deref());
    let b = b.get(column).and_then(|v| v.as_deref());
    match (a.and_then(|v| v.parse::<i64>().ok()), b.and_then(|v| v.parse::<i64>().ok())) {
        (Some(x), Some(y)) => x.cmp(&y),
        _ => a.cmp(&b),
    }
}

impl Transport for MockTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn serial(&self) -> &str {
        &self.serial
    }

    fn list(&self, path: &str) -> Result<Vec<RemoteEntry>> {
        self.data_call("list", || self.list_entries(path))
    }

    fn pull(&self, remote_path: &str, local_path: &Path) -> Result<u64> {
        self.data_call("pull", || {
            self.check(Capability::ReadStorage)?;
            let file = self
                .with_data(|data| data.files.get(remote_path).cloned())
                .ok_or_else(|| ExtractionError::CommandFailed {
                    command: format!("pull {}", remote_path),
                    message: "remote object does not exist".to_string(),
                })?;
            fs::write(local_path, &file.data)?;
            Ok(file.data.len() as u64)
        })
    }

    fn push(&self, local_path: &Path, remote_path: &str) -> Result<()> {
        self.data_call("push", || {
            let data = fs::read(local_path)?;
            self.data
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .add_file(remote_path, data, Some(Utc::now()));
            Ok(())
        })
    }

    fn shell(&self, command: &str) -> Result<String> {
        if self.kind == TransportKind::Mtp {
            return Err(ExtractionError::Unsupported {
                operation: "shell".to_string(),
                transport: self.kind.to_string(),
            });
        }
        self.data_call("shell", || {
            self.check(Capability::Shell)?;
            self.run_shell(command)
        })
    }

    fn ping(&self) -> Result<()> {
        let latency = {
            let mut state = self.state();
            if state.failing_pings > 0 {
                state.failing_pings -= 1;
                return Err(ExtractionError::TransportTimeout {
                    operation: "ping".to_string(),
                    timeout_ms: 0,
                });
            }
            if !state.connected {
                return Err(ExtractionError::Disconnected(format!("{} is offline", self.serial)));
            }
            state.latency
        };
        if !latency.is_zero() {
            thread::sleep(latency);
        }
        Ok(())
    }

    fn reconnect(&self) -> Result<()> {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state();
        if state.failing_reconnects > 0 {
            state.failing_reconnects -= 1;
            return Err(ExtractionError::Disconnected("scripted reconnect failure".to_string()));
        }
        if state.connected {
            Ok(())
        } else {
            Err(ExtractionError::Disconnected(format!("{} is offline", self.serial)))
        }
    }

    fn probe_permissions(&self) -> Result<PermissionState> {
        let state = self.state();
        let offered: &[Capability] = match self.kind {
            TransportKind::Adb => &Capability::ALL,
            TransportKind::Mtp => &[Capability::ReadStorage],
        };
        let mut permissions = PermissionState::none();
        for capability in offered {
            permissions.set(*capability, !state.denied.contains(capability));
        }
        Ok(permissions)
    }

    fn request_permission(&self, capability: Capability) -> Result<bool> {
        if self.kind == TransportKind::Mtp {
            return Err(ExtractionError::Unsupported {
                operation: format!("grant {}", capability),
                transport: self.kind.to_string(),
            });
        }
        let mut state = self.state();
        if !state.connected {
            return Err(ExtractionError::Disconnected(format!("{} is offline", self.serial)));
        }
        state.grant_requests.push(capability);
        if state.locked.contains(&capability) {
            return Ok(false);
        }
        state.denied.remove(&capability);
        Ok(true)
    }
}

/// In-memory [`TransportBackend`] handing out [`MockTransport`]s
pub struct MockBackend {
    kind: TransportKind,
    available: AtomicBool,
    devices: Mutex<Vec<(DeviceDescriptor, Arc<MockTransport>)>>,
    enumerate_error: Mutex<Option<ExtractionError>>,
    open_delay: Mutex<Duration>,
    opens: AtomicUsize,
}

impl MockBackend {
    pub fn new(kind: TransportKind) -> Self {
        Self {
            kind,
            available: AtomicBool::new(true),
            devices: Mutex::new(Vec::new()),
            enumerate_error: Mutex::new(None),
            open_delay: Mutex::new(Duration::ZERO),
            opens: AtomicUsize::new(0),
        }
    }

    fn devices(&self) -> MutexGuard<'_, Vec<(DeviceDescriptor, Arc<MockTransport>)>> {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Plug a device in (replacing one with the same serial)
    pub fn attach(&self, descriptor: DeviceDescriptor, transport: Arc<MockTransport>) {
        let mut devices = self.devices();
        devices.retain(|(d, _)| d.serial_id != descriptor.serial_id);
        devices.push((descriptor, transport));
    }

    /// Unplug a device
    pub fn detach(&self, serial: &str) {
        self.devices().retain(|(d, _)| d.serial_id != serial);
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn set_enumerate_error(&self, error: Option<ExtractionError>) {
        *self.enumerate_error.lock().unwrap_or_else(PoisonError::into_inner) = error;
    }

    /// Time `open` takes, as a slow USB handshake would
    pub fn set_open_delay(&self, delay: Duration) {
        *self.open_delay.lock().unwrap_or_else(PoisonError::into_inner) = delay;
    }

    /// Channels opened so far
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

impl TransportBackend for MockBackend {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>> {
        if let Some(error) = self.enumerate_error.lock().unwrap_or_else(PoisonError::into_inner).clone() {
            return Err(error);
        }
        Ok(self.devices().iter().map(|(d, _)| d.clone()).collect())
    }

    fn open(&self, serial: &str) -> Result<Arc<dyn Transport>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let delay = *self.open_delay.lock().unwrap_or_else(PoisonError::into_inner);
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        self.devices()
            .iter()
            .find(|(d, _)| d.serial_id == serial)
            .map(|(_, t)| Arc::clone(t) as Arc<dyn Transport>)
            .ok_or_else(|| ExtractionError::DeviceNotFound(serial.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> MockDeviceData {
        let profile = DeviceProfile::default();
        let mut data = MockDeviceData::default();
        for (id, name) in [(5, "E"), (2, "B"), (9, "I")] {
            data.add_contact(&profile, id, name, &[], &[], &[]);
        }
        data.add_file("/sdcard/DCIM/Camera/a.jpg", vec![1, 2, 3], None);
        data
    }

    #[test]
    fn test_content_query_is_sorted_and_limited() {
        let mock = MockTransport::adb("S", sample());
        let out = mock
            .shell("content query --uri content://com.android.contacts/contacts --projection _id:display_name --where \"_id>2\" --sort \"_id ASC LIMIT 1\"")
            .unwrap();
        assert_eq!(out, "Row: 0 _id=5, display_name=E\n");

        mock.set_honours_limit(false);
        let out = mock
            .shell("content query --uri content://com.android.contacts/contacts --projection _id --sort \"_id DESC LIMIT 1\"")
            .unwrap();
        assert_eq!(out, "Row: 0 _id=9\nRow: 1 _id=5\nRow: 2 _id=2\n");
    }

    #[test]
    fn test_row_budget_disconnects() {
        let mock = MockTransport::adb("S", sample());
        mock.disconnect_after_rows(2);
        let out = mock
            .shell("content query --uri content://com.android.contacts/contacts --projection _id")
            .unwrap();
        assert_eq!(out.lines().count(), 2);
        assert!(!mock.is_connected());
        assert!(matches!(mock.shell("echo ok"), Err(ExtractionError::Disconnected(_))));
        assert!(mock.reconnect().is_err());
    }

    #[test]
    fn test_denied_capability() {
        let mock = MockTransport::adb("S", sample());
        mock.deny(Capability::ReadContacts);
        let result = mock.shell("content query --uri content://com.android.contacts/contacts --projection _id");
        assert!(matches!(result, Err(ExtractionError::PermissionDenied { .. })));
        assert!(!mock.probe_permissions().unwrap().is_granted(Capability::ReadContacts));
    }

    #[test]
    fn test_request_permission() {
        let mock = MockTransport::adb("S", sample());
        mock.deny(Capability::ReadSms);
        mock.lock_permission(Capability::ReadContacts);
        assert!(mock.request_permission(Capability::ReadSms).unwrap());
        assert!(!mock.request_permission(Capability::ReadContacts).unwrap());
        let permissions = mock.probe_permissions().unwrap();
        assert!(permissions.is_granted(Capability::ReadSms));
        assert_eq!(permissions.denied(), vec![Capability::ReadContacts]);

        let mtp = MockTransport::mtp("S", sample());
        assert!(matches!(
            mtp.request_permission(Capability::ReadSms),
            Err(ExtractionError::Unsupported { .. })
        ));
    }

    #[test]
    fn test_storage_calls() {
        let mock = MockTransport::mtp("S", sample());
        let entries = mock.list("/sdcard/DCIM").unwrap();
        assert_eq!(entries.len(), 1);
        assert!(mock.list("/sdcard/Music").unwrap().is_empty());

        let dir = TempDir::new().unwrap();
        let local = dir.path().join("a.jpg");
        assert_eq!(mock.pull("/sdcard/DCIM/Camera/a.jpg", &local).unwrap(), 3);
        mock.push(&local, "/sdcard/Download/a.jpg").unwrap();
        assert!(mock.with_data(|d| d.files.contains_key("/sdcard/Download/a.jpg")));
        assert_eq!(mock.call_count(), 4);
        assert_eq!(mock.call_log().len(), 4);
        assert!(!mock.has_overlapping_calls());
    }

    #[test]
    fn test_backend_open() {
        let backend = MockBackend::new(TransportKind::Adb);
        backend.attach(
            DeviceDescriptor::new("S", "Pixel", "Google"),
            Arc::new(MockTransport::adb("S", MockDeviceData::default())),
        );
        assert_eq!(backend.enumerate().unwrap().len(), 1);
        assert!(backend.open("S").is_ok());
        assert!(matches!(backend.open("X"), Err(ExtractionError::DeviceNotFound(_))));
        assert_eq!(backend.open_count(), 2);
    }
}
