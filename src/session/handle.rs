//! A live device session
//!
//! A [`Session`] binds one device to one open transport. It owns the state
//! machine, serializes transport access through the [`TransportGate`], and
//! runs the bounded reconnect loop when the channel fails.
//!
//! Extractors only ever see this handle, never the manager.

use crate::core::cancel::CancelToken;
use crate::core::error::{ExtractionError, Result};
use crate::device::{Capability, DeviceProfile, PermissionState, RemoteEntry, Transport, TransportKind};
use crate::session::gate::TransportGate;
use crate::session::state::{RetryPolicy, SessionState, StateMachine, StateTransition};
use log::{debug, info, warn};
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, TryLockError};
use std::thread;
use std::time::{Duration, Instant};

/// Recoveries attempted by a single call before its error surfaces
const MAX_CALL_RECOVERIES: usize = 1;

/// Granularity of the cancel check during reconnect backoff
const BACKOFF_SLICE: Duration = Duration::from_millis(10);

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

pub struct Session {
    id: u64,
    serial: String,
    model: String,
    transport: Arc<dyn Transport>,
    profile: DeviceProfile,
    permissions: RwLock<PermissionState>,
    policy: RetryPolicy,
    machine: Mutex<StateMachine>,
    gate: TransportGate,
    recovery: Mutex<()>,
    pins: Arc<Mutex<usize>>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("serial", &self.serial)
            .field("transport", &self.transport.kind())
            .field("state", &self.state())
            .finish()
    }
}

impl Session {
    /// Create a session in `CONNECTING` for an already opened transport
    pub fn new(
        model: &str,
        transport: Arc<dyn Transport>,
        profile: DeviceProfile,
        permissions: PermissionState,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            serial: transport.serial().to_string(),
            model: model.to_string(),
            transport,
            profile,
            permissions: RwLock::new(permissions),
            policy,
            machine: Mutex::new(StateMachine::new()),
            gate: TransportGate::new(),
            recovery: Mutex::new(()),
            pins: Arc::new(Mutex::new(0)),
        }
    }

    /// Create a session and move it straight to `ACTIVE`
    pub fn open(
        model: &str,
        transport: Arc<dyn Transport>,
        profile: DeviceProfile,
        permissions: PermissionState,
        policy: RetryPolicy,
    ) -> Arc<Self> {
        let session = Self::new(model, transport, profile, permissions, policy);
        session.transition(SessionState::Active, "transport opened");
        Arc::new(session)
    }

    fn machine(&self) -> MutexGuard<'_, StateMachine> {
        self.machine.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, to: SessionState, reason: &str) -> bool {
        let mut machine = self.machine();
        let from = machine.state();
        let changed = machine.transition(to, reason);
        if changed {
            info!("Session #{} ({}): {} -> {} ({})", self.id, self.serial, from, to, reason);
        }
        changed
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.transport.kind()
    }

    pub fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    /// Snapshot of the granted capabilities
    pub fn permissions(&self) -> PermissionState {
        self.permissions.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Count of short-lived references (running heartbeats) that do not own
    /// the session; the registry leaves them out of its holder count
    pub(crate) fn pins(&self) -> &Arc<Mutex<usize>> {
        &self.pins
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn state(&self) -> SessionState {
        self.machine().state()
    }

    pub fn is_lost(&self) -> bool {
        self.state() == SessionState::Lost
    }

    /// Snapshot of the transition log
    pub fn transitions(&self) -> Vec<StateTransition> {
        self.machine().transitions().to_vec()
    }

    /// Number of logged transitions from `from` to `to`
    pub fn transition_count(&self, from: SessionState, to: SessionState) -> usize {
        self.machine().count(from, to)
    }

    /// Fail with `PermissionDenied` unless the capability was granted
    pub fn require(&self, capability: Capability) -> Result<()> {
        if self.permissions().is_granted(capability) {
            Ok(())
        } else {
            Err(ExtractionError::PermissionDenied {
                serial: self.serial.clone(),
                capability: capability.to_string(),
            })
        }
    }

    /// Fail with `Unsupported` on transports without a shell
    pub fn require_shell(&self, operation: &str) -> Result<()> {
        if self.transport_kind() == TransportKind::Mtp {
            return Err(ExtractionError::Unsupported {
                operation: operation.to_string(),
                transport: self.transport_kind().to_string(),
            });
        }
        self.require(Capability::Shell)
    }

    /// Run one transport operation under the gate.
    ///
    /// Transient failures degrade the session and run the reconnect loop;
    /// the call is retried once the channel is back.
    pub fn call<T>(
        &self,
        operation: &str,
        cancel: &CancelToken,
        f: impl Fn(&dyn Transport) -> Result<T>,
    ) -> Result<T> {
        let mut recoveries = 0;
        loop {
            if self.is_lost() {
                return Err(ExtractionError::SessionLost(self.serial.clone()));
            }
            if cancel.is_cancelled() {
                return Err(ExtractionError::Cancelled);
            }

            let result = {
                let _permit = self.gate.acquire(cancel)?;
                if cancel.is_cancelled() {
                    return Err(ExtractionError::Cancelled);
                }
                f(self.transport.as_ref())
            };

            match result {
                Err(e) if e.is_transient() && recoveries < MAX_CALL_RECOVERIES => {
                    warn!("{} on {} failed: {}", operation, self.serial, e);
                    recoveries += 1;
                    self.mark_degraded(&format!("{} failed: {}", operation, e));
                    self.recover(cancel)?;
                }
                other => return other,
            }
        }
    }

    /// Ask the device for a capability this session lacks.
    ///
    /// Returns whether the capability is granted afterwards; the session's
    /// permission state follows the answer.
    pub fn request_permission(&self, capability: Capability, cancel: &CancelToken) -> Result<bool> {
        if self.permissions().is_granted(capability) {
            return Ok(true);
        }
        let granted = self.call("request permission", cancel, |t| t.request_permission(capability))?;
        self.permissions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .set(capability, granted);
        if granted {
            info!("Session #{} ({}) now holds {}", self.id, self.serial, capability);
        }
        Ok(granted)
    }

    pub fn shell(&self, command: &str, cancel: &CancelToken) -> Result<String> {
        self.call("shell", cancel, |t| t.shell(command))
    }

    pub fn list(&self, path: &str, cancel: &CancelToken) -> Result<Vec<RemoteEntry>> {
        self.call("list", cancel, |t| t.list(path))
    }

    pub fn pull(&self, remote_path: &str, local_path: &Path, cancel: &CancelToken) -> Result<u64> {
        self.call("pull", cancel, |t| t.pull(remote_path, local_path))
    }

    pub fn push(&self, local_path: &Path, remote_path: &str, cancel: &CancelToken) -> Result<()> {
        self.call("push", cancel, |t| t.push(local_path, remote_path))
    }

    /// Probe the channel ahead of queued calls.
    ///
    /// A missed beat moves `ACTIVE -> DEGRADED` and runs the reconnect loop
    /// before returning false.
    pub fn heartbeat(&self) -> bool {
        if self.is_lost() {
            return false;
        }

        let probe = {
            let _permit = self.gate.acquire_priority();
            self.transport.ping()
        };

        match probe {
            Ok(()) => {
                if self.state() == SessionState::Degraded {
                    self.transition(SessionState::Active, "heartbeat answered");
                }
                true
            }
            Err(e) => {
                warn!("Heartbeat missed on {}: {}", self.serial, e);
                self.mark_degraded(&format!("missed heartbeat: {}", e));
                if let Err(e) = self.recover(&CancelToken::new()) {
                    debug!("Recovery of {} ended: {}", self.serial, e);
                }
                false
            }
        }
    }

    /// Reconnect with exponential backoff; `LOST` once attempts run out.
    ///
    /// A cancel during the backoff returns `Cancelled` and leaves the
    /// session `DEGRADED`.
    pub fn recover(&self, cancel: &CancelToken) -> Result<()> {
        let _recovering = loop {
            match self.recovery.try_lock() {
                Ok(guard) => break guard,
                Err(TryLockError::Poisoned(poisoned)) => break poisoned.into_inner(),
                Err(TryLockError::WouldBlock) => {
                    if cancel.is_cancelled() {
                        return Err(ExtractionError::Cancelled);
                    }
                    thread::sleep(BACKOFF_SLICE);
                }
            }
        };

        match self.state() {
            SessionState::Active => return Ok(()),
            SessionState::Lost => return Err(ExtractionError::SessionLost(self.serial.clone())),
            _ => {}
        }

        for attempt in 0..self.policy.max_attempts {
            let delay = self.policy.delay_for(attempt);
            debug!(
                "Reconnect attempt {}/{} for {} in {:?}",
                attempt + 1,
                self.policy.max_attempts,
                self.serial,
                delay
            );
            sleep_unless_cancelled(delay, cancel)?;

            let result = {
                let _permit = self.gate.acquire_priority();
                self.transport.reconnect()
            };
            match result {
                Ok(()) => {
                    self.transition(
                        SessionState::Active,
                        &format!("reconnected after {} attempt(s)", attempt + 1),
                    );
                    return Ok(());
                }
                Err(e) => warn!("Reconnect attempt {} for {} failed: {}", attempt + 1, self.serial, e),
            }
        }

        self.transition(
            SessionState::Lost,
            &format!("{} reconnect attempt(s) failed", self.policy.max_attempts),
        );
        Err(ExtractionError::SessionLost(self.serial.clone()))
    }

    /// `ACTIVE -> DEGRADED`; no-op in any other state
    pub fn mark_degraded(&self, reason: &str) {
        if self.state() == SessionState::Active {
            self.transition(SessionState::Degraded, reason);
        }
    }

    /// Tear the session down for good
    pub fn close(&self) {
        self.transition(SessionState::Lost, "closed");
    }
}

fn sleep_unless_cancelled(delay: Duration, cancel: &CancelToken) -> Result<()> {
    let started = Instant::now();
    loop {
        if cancel.is_cancelled() {
            return Err(ExtractionError::Cancelled);
        }
        let elapsed = started.elapsed();
        if elapsed >= delay {
            return Ok(());
        }
        thread::sleep(BACKOFF_SLICE.min(delay - elapsed));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testdb::{MockDeviceData, MockTransport};

    fn session_with(mock: Arc<MockTransport>, attempts: u32) -> Arc<Session> {
        Session::open(
            "Pixel 8",
            mock,
            DeviceProfile::default(),
            PermissionState::granting(&Capability::ALL),
            RetryPolicy::immediate(attempts),
        )
    }

    #[test]
    fn test_open_is_active() {
        let mock = Arc::new(MockTransport::adb("ABC123", MockDeviceData::default()));
        let session = session_with(mock, 3);
        assert_eq!(session.state(), SessionState::Active);
        assert_eq!(session.serial(), "ABC123");
        assert_eq!(session.transitions().len(), 1);
    }

    #[test]
    fn test_missed_heartbeat_degrades_once_then_recovers() {
        let mock = Arc::new(MockTransport::adb("ABC123", MockDeviceData::default()));
        mock.fail_next_pings(1);
        let session = session_with(mock.clone(), 3);

        assert!(!session.heartbeat());
        assert_eq!(session.state(), SessionState::Active);
        assert_eq!(session.transition_count(SessionState::Active, SessionState::Degraded), 1);
        assert_eq!(mock.reconnect_attempts(), 1);

        assert!(session.heartbeat());
        assert_eq!(session.transition_count(SessionState::Active, SessionState::Degraded), 1);
    }

    #[test]
    fn test_three_failed_reconnects_lose_session() {
        let mock = Arc::new(MockTransport::adb("ABC123", MockDeviceData::default()));
        let session = session_with(mock.clone(), 3);
        mock.set_connected(false);

        assert!(!session.heartbeat());
        assert_eq!(session.state(), SessionState::Lost);
        assert_eq!(mock.reconnect_attempts(), 3);
        assert_eq!(session.transition_count(SessionState::Active, SessionState::Degraded), 1);
        assert_eq!(session.transition_count(SessionState::Degraded, SessionState::Lost), 1);

        // LOST is terminal: no more probes or reconnects
        assert!(!session.heartbeat());
        assert_eq!(mock.reconnect_attempts(), 3);
        let err = session.shell("echo ok", &CancelToken::new()).unwrap_err();
        assert!(matches!(err, ExtractionError::SessionLost(_)));
    }

    #[test]
    fn test_transient_call_failure_reconnects_and_retries() {
        let mock = Arc::new(MockTransport::adb("ABC123", MockDeviceData::default()));
        let session = session_with(mock.clone(), 3);
        mock.fail_next_calls(1);

        let out = session.shell("echo ok", &CancelToken::new()).unwrap();
        assert_eq!(out.trim(), "ok");
        assert_eq!(session.state(), SessionState::Active);
        assert_eq!(session.transition_count(SessionState::Active, SessionState::Degraded), 1);
        assert_eq!(session.transition_count(SessionState::Degraded, SessionState::Active), 1);
    }

    #[test]
    fn test_cancelled_call_does_not_touch_transport() {
        let mock = Arc::new(MockTransport::adb("ABC123", MockDeviceData::default()));
        let session = session_with(mock.clone(), 3);
        let cancel = CancelToken::new();
        cancel.cancel();

        let err = session.shell("echo ok", &cancel).unwrap_err();
        assert_eq!(err, ExtractionError::Cancelled);
        assert_eq!(mock.call_count(), 0);
    }

    #[test]
    fn test_cancel_during_backoff_leaves_session_degraded() {
        let mock = Arc::new(MockTransport::adb("ABC123", MockDeviceData::default()));
        let session = Session::open(
            "Pixel 8",
            mock.clone(),
            DeviceProfile::default(),
            PermissionState::granting(&Capability::ALL),
            RetryPolicy::default(),
        );
        mock.set_connected(false);
        mock.fail_next_reconnects(3);

        let cancel = CancelToken::new();
        let canceller = {
            let cancel = cancel.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                cancel.cancel();
            })
        };

        let started = Instant::now();
        let err = session.shell("echo ok", &cancel).unwrap_err();
        canceller.join().unwrap();

        assert_eq!(err, ExtractionError::Cancelled);
        assert!(started.elapsed() < Duration::from_millis(400));
        assert_eq!(session.state(), SessionState::Degraded);
        assert_eq!(mock.reconnect_attempts(), 0);
    }

    #[test]
    fn test_require_capabilities() {
        let mock = Arc::new(MockTransport::mtp("XYZ", MockDeviceData::default()));
        let session = Session::open(
            "Pixel 8",
            mock,
            DeviceProfile::default(),
            PermissionState::granting(&[Capability::ReadStorage]),
            RetryPolicy::immediate(1),
        );
        assert!(session.require(Capability::ReadStorage).is_ok());
        assert!(matches!(
            session.require(Capability::ReadSms),
            Err(ExtractionError::PermissionDenied { .. })
        ));
        assert!(matches!(
            session.require_shell("sms extraction"),
            Err(ExtractionError::Unsupported { .. })
        ));
    }

    #[test]
    fn test_request_permission_updates_state() {
        let mock = Arc::new(MockTransport::adb("ABC123", MockDeviceData::default()));
        mock.deny(Capability::ReadSms);
        mock.lock_permission(Capability::ReadContacts);
        let session = Session::open(
            "Pixel 8",
            mock.clone(),
            DeviceProfile::default(),
            PermissionState::granting(&[Capability::Shell, Capability::ReadStorage]),
            RetryPolicy::immediate(1),
        );
        let cancel = CancelToken::new();

        assert!(session.request_permission(Capability::ReadSms, &cancel).unwrap());
        assert!(session.require(Capability::ReadSms).is_ok());
        assert!(!session.request_permission(Capability::ReadContacts, &cancel).unwrap());
        assert_eq!(session.permissions().denied(), vec![Capability::ReadContacts]);

        // Already held: the device is not asked again
        assert!(session.request_permission(Capability::Shell, &cancel).unwrap());
        assert_eq!(mock.grant_requests(), vec![Capability::ReadSms, Capability::ReadContacts]);
    }

    #[test]
    fn test_close_is_terminal() {
        let mock = Arc::new(MockTransport::adb("ABC123", MockDeviceData::default()));
        let session = session_with(mock, 3);
        session.close();
        assert!(session.is_lost());
        session.mark_degraded("late cancel");
        assert_eq!(session.state(), SessionState::Lost);
    }
}
