//! Caller-owned registry of live sessions (serial -> session)

use crate::core::error::{ExtractionError, Result};
use crate::session::handle::Session;
use log::info;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Registered session plus how many handles exist outside the registry
#[derive(Debug, Clone)]
pub struct RegisteredSession {
    pub session: Arc<Session>,
    pub external_holders: usize,
}

/// At most one session per device serial
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, Arc<Session>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, serial: &str) -> Option<Arc<Session>> {
        self.sessions().get(serial).cloned()
    }

    /// Look up a session and count the handles held outside the registry.
    ///
    /// References pinned by a running heartbeat are not counted.
    pub fn lookup(&self, serial: &str) -> Option<RegisteredSession> {
        let sessions = self.sessions();
        let session = sessions.get(serial)?;
        let external_holders = {
            let pins = session.pins().lock().unwrap_or_else(PoisonError::into_inner);
            (Arc::strong_count(session) - 1).saturating_sub(*pins)
        };
        Some(RegisteredSession {
            external_holders,
            session: session.clone(),
        })
    }

    /// Register a session, returning the one it replaced
    pub fn insert(&self, session: Arc<Session>) -> Option<Arc<Session>> {
        self.sessions()
            .insert(session.serial().to_string(), session)
    }

    /// Register a session unless a live one already owns the serial.
    ///
    /// A LOST entry is replaced; a live entry is kept and `DeviceBusy`
    /// returned.
    pub fn try_insert(&self, session: Arc<Session>) -> Result<()> {
        let mut sessions = self.sessions();
        if let Some(existing) = sessions.get(session.serial()) {
            if !existing.is_lost() && !Arc::ptr_eq(existing, &session) {
                return Err(ExtractionError::DeviceBusy(session.serial().to_string()));
            }
        }
        sessions.insert(session.serial().to_string(), session);
        Ok(())
    }

    pub fn remove(&self, serial: &str) -> Option<Arc<Session>> {
        self.sessions().remove(serial)
    }

    pub fn contains(&self, serial: &str) -> bool {
        self.sessions().contains_key(serial)
    }

    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions().is_empty()
    }

    pub fn serials(&self) -> Vec<String> {
        let mut serials: Vec<String> = self.sessions().keys().cloned().collect();
        serials.sort();
        serials
    }

    /// Close and forget every session
    pub fn shutdown(&self) {
        let drained: Vec<Arc<Session>> = self.sessions().drain().map(|(_, s)| s).collect();
        for session in &drained {
            session.close();
        }
        if !drained.is_empty() {
            info!("Closed {} session(s)", drained.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Capability, DeviceProfile, PermissionState};
    use crate::session::{RetryPolicy, SessionState};
    use crate::testdb::{MockDeviceData, MockTransport};

    fn session(serial: &str) -> Arc<Session> {
        Session::open(
            "Pixel 8",
            Arc::new(MockTransport::adb(serial, MockDeviceData::default())),
            DeviceProfile::default(),
            PermissionState::granting(&Capability::ALL),
            RetryPolicy::immediate(1),
        )
    }

    #[test]
    fn test_insert_lookup_remove() {
        let registry = SessionRegistry::new();
        assert!(registry.insert(session("A")).is_none());
        assert!(registry.contains("A"));

        assert_eq!(registry.lookup("A").unwrap().external_holders, 0);

        let held = registry.get("A").unwrap();
        assert_eq!(registry.lookup("A").unwrap().external_holders, 1);
        drop(held);

        assert!(registry.remove("A").is_some());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_try_insert_rejects_live_owner() {
        let registry = SessionRegistry::new();
        let first = session("A");
        registry.try_insert(first.clone()).unwrap();

        let second = session("A");
        assert_eq!(
            registry.try_insert(second.clone()),
            Err(ExtractionError::DeviceBusy("A".to_string()))
        );
        assert!(Arc::ptr_eq(&registry.get("A").unwrap(), &first));

        first.close();
        registry.try_insert(second.clone()).unwrap();
        assert!(Arc::ptr_eq(&registry.get("A").unwrap(), &second));
    }

    #[test]
    fn test_pinned_references_are_not_holders() {
        let registry = SessionRegistry::new();
        registry.insert(session("A"));

        let pinned = {
            let session = registry.get("A").unwrap();
            *session.pins().lock().unwrap() += 1;
            session
        };
        assert_eq!(registry.lookup("A").unwrap().external_holders, 0);

        *pinned.pins().lock().unwrap() -= 1;
        assert_eq!(registry.lookup("A").unwrap().external_holders, 1);
    }

    #[test]
    fn test_shutdown_closes_sessions() {
        let registry = SessionRegistry::new();
        let a = session("A");
        registry.insert(a.clone());
        registry.insert(session("B"));
        assert_eq!(registry.serials(), vec!["A".to_string(), "B".to_string()]);

        registry.shutdown();
        assert!(registry.is_empty());
        assert_eq!(a.state(), SessionState::Lost);
    }
}
