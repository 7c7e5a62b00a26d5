//! Extraction coordinator
//!
//! Runs one worker thread per requested domain against a shared session.
//! Workers forward records on a channel as they arrive; the transport gate
//! inside the session keeps their device calls from interleaving. A failing
//! domain is reported in the summary and never stops its siblings.

use crate::core::cancel::CancelToken;
use crate::core::config::ExtractionConfig;
use crate::core::error::{ExtractionError, Result};
use crate::extract::{
    ContactFilter, ContactsExtractor, Domain, PhotoExtractor, PhotoFilter, Record, RecordStream, RecordWarning,
    SmsExtractor, SmsFilter,
};
use crate::session::Session;
use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Why a domain stopped early
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DomainFailure {
    pub message: String,
    /// Records obtained before the failure
    pub delivered: usize,
    pub retryable: bool,
}

impl DomainFailure {
    fn from_error(error: &ExtractionError, delivered: usize) -> Self {
        Self {
            message: error.to_string(),
            delivered,
            retryable: error.is_retryable(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DomainOutcome {
    pub records: usize,
    pub warnings: Vec<RecordWarning>,
    pub error: Option<DomainFailure>,
}

impl DomainOutcome {
    pub fn is_complete(&self) -> bool {
        self.error.is_none()
    }
}

/// Per-domain results of one coordinated run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExtractionSummary {
    pub outcomes: BTreeMap<Domain, DomainOutcome>,
    pub cancelled: bool,
}

impl ExtractionSummary {
    pub fn outcome(&self, domain: Domain) -> Option<&DomainOutcome> {
        self.outcomes.get(&domain)
    }

    pub fn total_records(&self) -> usize {
        self.outcomes.values().map(|o| o.records).sum()
    }

    pub fn total_warnings(&self) -> usize {
        self.outcomes.values().map(|o| o.warnings.len()).sum()
    }

    pub fn failed_domains(&self) -> Vec<Domain> {
        self.outcomes
            .iter()
            .filter(|(_, o)| o.error.is_some())
            .map(|(d, _)| *d)
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        !self.cancelled && self.outcomes.values().all(DomainOutcome::is_complete)
    }
}

impl fmt::Display for ExtractionSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (index, (domain, outcome)) in self.outcomes.iter().enumerate() {
            if index > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: ({}, {} warnings, ", domain, outcome.records, outcome.warnings.len())?;
            match &outcome.error {
                Some(failure) => write!(f, "error: {})", failure.message)?,
                None => write!(f, "no error)")?,
            }
        }
        write!(f, "}}")
    }
}

/// Progress events sent while a run is in flight
#[derive(Debug, Clone)]
pub enum ExtractionEvent {
    Record(Record),
    Finished { domain: Domain, records: usize, failed: bool },
}

/// Filters applied per domain
#[derive(Debug, Clone, Default)]
pub struct DomainFilters {
    pub contacts: Option<ContactFilter>,
    pub sms: Option<SmsFilter>,
    pub photos: Option<PhotoFilter>,
}

#[derive(Debug, Clone)]
pub struct ExtractionCoordinator {
    config: ExtractionConfig,
    filters: DomainFilters,
}

impl ExtractionCoordinator {
    pub fn new(config: ExtractionConfig) -> Self {
        Self {
            config,
            filters: DomainFilters::default(),
        }
    }

    pub fn with_filters(mut self, filters: DomainFilters) -> Self {
        self.filters = filters;
        self
    }

    /// Spawn a worker per domain; duplicate domains run once
    pub fn start(&self, session: &Arc<Session>, domains: &[Domain], cancel: CancelToken) -> ExtractionHandle {
        let domains: BTreeSet<Domain> = domains.iter().copied().collect();
        let (sender, receiver) = unbounded();
        info!(
            "Starting extraction of {:?} on {} over {}",
            domains,
            session.serial(),
            session.transport_kind()
        );

        let mut workers = Vec::with_capacity(domains.len());
        for domain in domains {
            let worker = DomainWorker {
                domain,
                config: self.config.clone(),
                filters: self.filters.clone(),
                session: Arc::clone(session),
                cancel: cancel.clone(),
                sender: sender.clone(),
            };
            let spawned = thread::Builder::new()
                .name(format!("extract-{}", domain.to_string().to_lowercase()))
                .spawn(move || worker.run());
            match spawned {
                Ok(handle) => workers.push((domain, WorkerSlot::Running(handle))),
                Err(e) => {
                    warn!("Could not start {} worker: {}", domain, e);
                    let failure = DomainFailure::from_error(&ExtractionError::from(e), 0);
                    workers.push((domain, WorkerSlot::Failed(failure)));
                }
            }
        }

        ExtractionHandle {
            session: Arc::clone(session),
            cancel,
            receiver,
            workers,
        }
    }

    /// Blocking run that collects every record
    pub fn run(
        &self,
        session: &Arc<Session>,
        domains: &[Domain],
        cancel: CancelToken,
    ) -> (Vec<Record>, ExtractionSummary) {
        self.start(session, domains, cancel).collect()
    }
}

enum WorkerSlot {
    Running(JoinHandle<DomainOutcome>),
    Failed(DomainFailure),
}

/// A run in progress
pub struct ExtractionHandle {
    session: Arc<Session>,
    cancel: CancelToken,
    receiver: Receiver<ExtractionEvent>,
    workers: Vec<(Domain, WorkerSlot)>,
}

impl ExtractionHandle {
    /// Live event feed; closes once every worker has finished
    pub fn events(&self) -> &Receiver<ExtractionEvent> {
        &self.receiver
    }

    /// Only the records from the event feed
    pub fn records(&self) -> impl Iterator<Item = Record> + '_ {
        self.receiver.iter().filter_map(|event| match event {
            ExtractionEvent::Record(record) => Some(record),
            ExtractionEvent::Finished { .. } => None,
        })
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Join every worker and build the summary.
    ///
    /// A cancelled run leaves the session `DEGRADED` so it can be reused.
    pub fn wait(self) -> ExtractionSummary {
        let mut summary = ExtractionSummary::default();
        for (domain, slot) in self.workers {
            let outcome = match slot {
                WorkerSlot::Running(handle) => handle.join().unwrap_or_else(|_| DomainOutcome {
                    error: Some(DomainFailure {
                        message: format!("{} worker panicked", domain),
                        delivered: 0,
                        retryable: true,
                    }),
                    ..DomainOutcome::default()
                }),
                WorkerSlot::Failed(failure) => DomainOutcome {
                    error: Some(failure),
                    ..DomainOutcome::default()
                },
            };
            summary.outcomes.insert(domain, outcome);
        }

        if self.cancel.is_cancelled() {
            summary.cancelled = true;
            self.session.mark_degraded("extraction cancelled");
        }
        info!("Extraction finished on {}: {}", self.session.serial(), summary);
        summary
    }

    /// Drain every record, then wait
    pub fn collect(self) -> (Vec<Record>, ExtractionSummary) {
        let records: Vec<Record> = self.records().collect();
        (records, self.wait())
    }
}

struct DomainWorker {
    domain: Domain,
    config: ExtractionConfig,
    filters: DomainFilters,
    session: Arc<Session>,
    cancel: CancelToken,
    sender: Sender<ExtractionEvent>,
}

impl DomainWorker {
    fn run(self) -> DomainOutcome {
        let opened = self.open();
        let outcome = match opened {
            Ok(Opened::Contacts(stream)) => self.drain(stream),
            Ok(Opened::Sms(stream)) => self.drain(stream),
            Ok(Opened::Photos(stream)) => self.drain(stream),
            Err(e) => {
                warn!("{} extraction could not start: {}", self.domain, e);
                DomainOutcome {
                    error: Some(DomainFailure::from_error(&e, 0)),
                    ..DomainOutcome::default()
                }
            }
        };
        // the receiver may already be gone
        let _ = self.sender.send(ExtractionEvent::Finished {
            domain: self.domain,
            records: outcome.records,
            failed: outcome.error.is_some(),
        });
        outcome
    }

    fn open(&self) -> Result<Opened> {
        let session = &self.session;
        let cancel = &self.cancel;
        Ok(match self.domain {
            Domain::Contacts => Opened::Contacts(ContactsExtractor::new(&self.config).extract(
                session,
                self.filters.contacts.clone(),
                cancel,
            )?),
            Domain::Sms => {
                Opened::Sms(SmsExtractor::new(&self.config).extract(session, self.filters.sms.clone(), cancel)?)
            }
            Domain::Photos => Opened::Photos(PhotoExtractor::new(&self.config).extract(
                session,
                self.filters.photos.clone(),
                cancel,
            )?),
        })
    }

    fn drain<T: Into<Record>>(&self, mut stream: RecordStream<T>) -> DomainOutcome {
        let mut records = 0;
        let mut error = None;
        for item in stream.by_ref() {
            match item {
                Ok(record) => {
                    records += 1;
                    let _ = self.sender.send(ExtractionEvent::Record(record.into()));
                }
                Err(e) => {
                    warn!("{} extraction stopped after {} record(s): {}", self.domain, records, e);
                    error = Some(DomainFailure::from_error(&e, records));
                }
            }
        }
        let warnings = stream.take_warnings();
        debug!("{} worker done: {} records, {} warnings", self.domain, records, warnings.len());
        DomainOutcome {
            records,
            warnings,
            error,
        }
    }
}

enum Opened {
    Contacts(RecordStream<crate::extract::Contact>),
    Sms(RecordStream<crate::extract::SmsMessage>),
    Photos(RecordStream<crate::extract::Photo>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Capability, DeviceProfile, PermissionState};
    use crate::session::{RetryPolicy, SessionState};
    use crate::testdb::{MockDataGenerator, MockTransport};
    use std::time::{Duration, Instant};

    fn config(page_size: usize) -> ExtractionConfig {
        ExtractionConfig {
            page_size,
            ..ExtractionConfig::default()
        }
    }

    fn session(mock: &Arc<MockTransport>, permissions: &[Capability]) -> Arc<Session> {
        Session::open(
            "Pixel 8",
            mock.clone(),
            DeviceProfile::default(),
            PermissionState::granting(permissions),
            RetryPolicy::immediate(3),
        )
    }

    #[test]
    fn test_photo_scenario() {
        let profile = DeviceProfile::default();
        let data = MockDataGenerator::new(42).photos("DCIM/Camera", 100).build(&profile);
        let mock = Arc::new(MockTransport::adb("ABC123", data));
        let session = session(&mock, &Capability::ALL);

        let coordinator = ExtractionCoordinator::new(config(200));
        let (records, summary) = coordinator.run(&session, &[Domain::Photos], CancelToken::new());

        assert_eq!(records.len(), 100);
        assert_eq!(summary.to_string(), "{Photos: (100, 0 warnings, no error)}");
        assert!(summary.is_complete());
        assert_eq!(session.state(), SessionState::Active);
    }

    #[test]
    fn test_domains_never_overlap_transport_calls() {
        let profile = DeviceProfile::default();
        let data = MockDataGenerator::new(5)
            .contacts(30)
            .sms(40)
            .photos("DCIM/Camera", 10)
            .build(&profile);
        let mock = Arc::new(MockTransport::adb("ABC123", data));
        mock.set_latency(Duration::from_millis(3));
        let session = session(&mock, &Capability::ALL);

        let coordinator = ExtractionCoordinator::new(config(10));
        let handle = coordinator.start(&session, &Domain::ALL, CancelToken::new());
        let mut per_domain: BTreeMap<Domain, usize> = BTreeMap::new();
        for record in handle.records() {
            *per_domain.entry(record.domain()).or_default() += 1;
        }
        let summary = handle.wait();

        assert!(summary.is_complete(), "{}", summary);
        assert_eq!(per_domain.get(&Domain::Contacts), Some(&30));
        assert_eq!(per_domain.get(&Domain::Sms), Some(&40));
        assert_eq!(per_domain.get(&Domain::Photos), Some(&10));
        assert!(mock.call_count() > 3);
        assert!(!mock.has_overlapping_calls());
        assert_eq!(mock.max_in_flight(), 1);
    }

    #[test]
    fn test_failed_domain_does_not_stop_others() {
        let profile = DeviceProfile::default();
        let data = MockDataGenerator::new(8).contacts(12).sms(12).build(&profile);
        let mock = Arc::new(MockTransport::adb("ABC123", data));
        let session = session(&mock, &[Capability::Shell, Capability::ReadContacts, Capability::ReadStorage]);

        let coordinator = ExtractionCoordinator::new(config(5));
        let (_, summary) = coordinator.run(&session, &[Domain::Contacts, Domain::Sms], CancelToken::new());

        let contacts = summary.outcome(Domain::Contacts).unwrap();
        assert_eq!(contacts.records, 12);
        assert!(contacts.error.is_none());

        let sms = summary.outcome(Domain::Sms).unwrap();
        let failure = sms.error.as_ref().unwrap();
        assert_eq!(failure.delivered, 0);
        assert!(!failure.retryable);
        assert_eq!(summary.failed_domains(), vec![Domain::Sms]);
    }

    #[test]
    fn test_partial_failure_reports_delivered_count() {
        let profile = DeviceProfile::default();
        let data = MockDataGenerator::new(11).sms(25).build(&profile);
        let mock = Arc::new(MockTransport::adb("ABC123", data));
        mock.disconnect_after_rows(13);
        let session = session(&mock, &Capability::ALL);

        let coordinator = ExtractionCoordinator::new(config(5));
        let (records, summary) = coordinator.run(&session, &[Domain::Sms], CancelToken::new());

        assert_eq!(records.len(), 13);
        let failure = summary.outcome(Domain::Sms).unwrap().error.clone().unwrap();
        assert_eq!(failure.delivered, 13);
        assert!(failure.retryable);
        assert!(session.is_lost());
    }

    #[test]
    fn test_cancel_is_prompt_and_leaves_session_degraded() {
        let profile = DeviceProfile::default();
        let data = MockDataGenerator::new(3).contacts(400).sms(400).build(&profile);
        let mock = Arc::new(MockTransport::adb("ABC123", data));
        let latency = Duration::from_millis(40);
        mock.set_latency(latency);
        let session = session(&mock, &Capability::ALL);

        let coordinator = ExtractionCoordinator::new(config(2));
        let handle = coordinator.start(&session, &Domain::ALL, CancelToken::new());
        std::thread::sleep(latency * 3);

        let cancelled_at = Instant::now();
        handle.cancel();
        let summary = handle.wait();
        let elapsed = cancelled_at.elapsed();

        assert!(elapsed < latency * 4, "cancel took {:?}", elapsed);
        assert!(summary.cancelled);
        assert!(!summary.is_complete());
        assert_eq!(session.state(), SessionState::Degraded);
        assert!(mock.max_in_flight() <= 1);
    }

    #[test]
    fn test_cancel_during_reconnect_backoff_is_prompt() {
        let profile = DeviceProfile::default();
        let data = MockDataGenerator::new(4).contacts(40).build(&profile);
        let mock = Arc::new(MockTransport::adb("ABC123", data));
        mock.set_latency(Duration::from_millis(5));
        mock.fail_next_calls(1);
        mock.fail_next_reconnects(3);
        let session = Session::open(
            "Pixel 8",
            mock.clone(),
            DeviceProfile::default(),
            PermissionState::granting(&Capability::ALL),
            RetryPolicy::default(),
        );

        let coordinator = ExtractionCoordinator::new(config(5));
        let handle = coordinator.start(&session, &[Domain::Contacts], CancelToken::new());
        // the first page fails and the session waits out its first backoff
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(session.state(), SessionState::Degraded);

        let cancelled_at = Instant::now();
        handle.cancel();
        let summary = handle.wait();
        let elapsed = cancelled_at.elapsed();

        assert!(elapsed < Duration::from_millis(250), "cancel took {:?}", elapsed);
        assert!(summary.cancelled);
        assert_eq!(session.state(), SessionState::Degraded);
        assert_eq!(mock.reconnect_attempts(), 0);
    }

    #[test]
    fn test_duplicate_domains_run_once() {
        let profile = DeviceProfile::default();
        let data = MockDataGenerator::new(2).contacts(4).build(&profile);
        let mock = Arc::new(MockTransport::adb("ABC123", data));
        let session = session(&mock, &Capability::ALL);

        let coordinator = ExtractionCoordinator::new(config(50));
        let (records, summary) =
            coordinator.run(&session, &[Domain::Contacts, Domain::Contacts], CancelToken::new());
        assert_eq!(records.len(), 4);
        assert_eq!(summary.outcomes.len(), 1);
    }

    #[test]
    fn test_summary_display_with_error() {
        let mut summary = ExtractionSummary::default();
        summary.outcomes.insert(
            Domain::Sms,
            DomainOutcome {
                records: 13,
                warnings: Vec::new(),
                error: Some(DomainFailure {
                    message: "boom".to_string(),
                    delivered: 13,
                    retryable: true,
                }),
            },
        );
        summary.outcomes.insert(Domain::Contacts, DomainOutcome::default());
        assert_eq!(
            summary.to_string(),
            "{Contacts: (0, 0 warnings, no error), SMS: (13, 0 warnings, error: boom)}"
        );
        assert_eq!(summary.total_records(), 13);
    }
}
