//! Device discovery, transport selection and session lifecycle
//!
//! The manager is the only component that mutates [`Device`] records. It
//! enumerates every backend, merges what they report by serial, and opens
//! sessions with ADB-first selection and MTP fallback.

use crate::core::cancel::CancelToken;
use crate::core::error::{ExtractionError, Result};
use crate::device::{
    Capability, Device, PermissionState, ProfileStore, Transport, TransportBackend, TransportKind,
};
use crate::session::handle::Session;
use crate::session::monitor::HeartbeatMonitor;
use crate::session::registry::SessionRegistry;
use crate::session::state::RetryPolicy;
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

type DeviceTable = RwLock<BTreeMap<String, Device>>;

/// Reported when the requested transport could not be used
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransportSubstitution {
    pub requested: TransportKind,
    pub actual: TransportKind,
    pub reason: String,
}

/// Result of a successful `connect`
#[derive(Debug, Clone)]
pub struct Connection {
    pub session: Arc<Session>,
    pub substitution: Option<TransportSubstitution>,
    /// True when an existing idle session was handed back
    pub reused: bool,
}

pub struct DeviceSessionManager {
    backends: Vec<Arc<dyn TransportBackend>>,
    registry: Arc<SessionRegistry>,
    profiles: ProfileStore,
    policy: RetryPolicy,
    preferred: Option<TransportKind>,
    /// Run `request_permission` for capabilities a fresh channel lacks
    request_missing: bool,
    devices: Arc<DeviceTable>,
    /// Held for the whole of a `connect` so lookup, open and register are
    /// one step per serial
    connecting: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl DeviceSessionManager {
    pub fn new(
        backends: Vec<Arc<dyn TransportBackend>>,
        registry: Arc<SessionRegistry>,
        profiles: ProfileStore,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            backends,
            registry,
            profiles,
            policy,
            preferred: None,
            request_missing: false,
            devices: Arc::new(RwLock::new(BTreeMap::new())),
            connecting: Mutex::new(HashMap::new()),
        }
    }

    /// Transport tried first when `connect` is not given a preference
    pub fn with_default_preference(mut self, preferred: Option<TransportKind>) -> Self {
        self.preferred = preferred;
        self
    }

    pub fn with_permission_requests(mut self, enabled: bool) -> Self {
        self.request_missing = enabled;
        self
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn profiles(&self) -> &ProfileStore {
        &self.profiles
    }

    fn backend(&self, kind: TransportKind) -> Option<&Arc<dyn TransportBackend>> {
        self.backends.iter().find(|b| b.kind() == kind)
    }

    /// Devices from the last discovery
    pub fn devices(&self) -> Vec<Device> {
        self.devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn device(&self, serial: &str) -> Option<Device> {
        self.devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(serial)
            .cloned()
    }

    fn update_device(&self, serial: &str, f: impl FnOnce(&mut Device)) {
        update_device(&self.devices, serial, f);
    }

    fn connect_lock(&self, serial: &str) -> Arc<Mutex<()>> {
        self.connecting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(serial.to_string())
            .or_default()
            .clone()
    }

    /// Enumerate all backends and merge their reports by serial.
    ///
    /// Zero devices is a valid answer; failing every backend is not.
    pub fn discover(&self) -> Result<Vec<Device>> {
        let mut available = 0;
        let mut failures = Vec::new();
        let mut reports = Vec::new();

        for backend in &self.backends {
            let kind = backend.kind();
            if !backend.is_available() {
                debug!("{} backend is not available", kind);
                continue;
            }
            available += 1;
            match backend.enumerate() {
                Ok(found) => reports.push((kind, found)),
                Err(e) => {
                    warn!("{} enumeration failed: {}", kind, e);
                    failures.push(format!("{}: {}", kind, e));
                }
            }
        }

        if available == 0 {
            return Err(ExtractionError::Discovery(
                "no transport backend available (install adb or the libmtp tools)".to_string(),
            ));
        }
        if reports.is_empty() {
            return Err(ExtractionError::Discovery(failures.join("; ")));
        }

        let mut merged: BTreeMap<String, Device> = BTreeMap::new();
        for (kind, descriptors) in &reports {
            for descriptor in descriptors {
                merged
                    .entry(descriptor.serial_id.clone())
                    .and_modify(|d| d.merge_descriptor(descriptor, *kind))
                    .or_insert_with(|| Device::from_descriptor(descriptor, *kind));
            }
        }

        let mut devices = self.devices.write().unwrap_or_else(PoisonError::into_inner);
        for (serial, device) in merged.iter_mut() {
            if let Some(previous) = devices.get(serial) {
                device.active_transport = previous.active_transport;
                device.permission_state = previous.permission_state.clone();
            }
        }

        let gone: Vec<String> = devices
            .keys()
            .filter(|serial| !merged.contains_key(*serial))
            .cloned()
            .collect();
        for serial in &gone {
            info!("Device {} is no longer attached", serial);
            if let Some(session) = self.registry.remove(serial) {
                session.close();
            }
        }
        for serial in merged.keys().filter(|s| !devices.contains_key(*s)) {
            info!("Discovered device {}", serial);
        }

        *devices = merged;
        Ok(devices.values().cloned().collect())
    }

    /// Open (or reuse) the session for a device.
    ///
    /// ADB is tried before MTP unless a preference is given; an unusable
    /// preference falls back and is reported as a substitution.
    pub fn connect(&self, serial: &str, preferred: Option<TransportKind>) -> Result<Connection> {
        let lock = self.connect_lock(serial);
        let _connecting = lock.lock().unwrap_or_else(PoisonError::into_inner);

        if self.device(serial).is_none() {
            self.discover()?;
        }
        let device = self
            .device(serial)
            .ok_or_else(|| ExtractionError::DeviceNotFound(serial.to_string()))?;
        let preferred = preferred.or(self.preferred);

        if let Some(existing) = self.registry.lookup(serial) {
            let session = existing.session;
            if session.is_lost() {
                info!("Replacing lost session for {}", serial);
                self.registry.remove(serial);
            } else if existing.external_holders > 0 {
                return Err(ExtractionError::DeviceBusy(serial.to_string()));
            } else if preferred.map_or(true, |p| p == session.transport_kind()) {
                debug!("Reusing idle session #{} for {}", session.id(), serial);
                return Ok(Connection {
                    session,
                    substitution: None,
                    reused: true,
                });
            } else {
                info!(
                    "Tearing down {} session for {} to switch transport",
                    session.transport_kind(),
                    serial
                );
                self.registry.remove(serial);
                session.close();
            }
        }

        let mut reasons: BTreeMap<TransportKind, String> = BTreeMap::new();
        let mut denied = false;
        let mut last_error = None;
        let mut opened = None;

        for kind in TransportKind::selection_order(preferred) {
            if !device.is_visible_on(kind) {
                reasons.insert(kind, format!("device is not visible over {}", kind));
                continue;
            }
            if !device.is_authorized_on(kind) {
                reasons.insert(kind, format!("device has not authorized this computer for {}", kind));
                denied = true;
                continue;
            }
            let Some(backend) = self.backend(kind) else {
                reasons.insert(kind, format!("no {} backend configured", kind));
                continue;
            };
            match self.open_session(backend.as_ref(), &device) {
                Ok(session) => {
                    opened = Some(session);
                    break;
                }
                Err(e) => {
                    warn!("Opening {} over {} failed: {}", serial, kind, e);
                    denied |= matches!(e, ExtractionError::PermissionDenied { .. });
                    reasons.insert(kind, e.to_string());
                    last_error = Some(e);
                }
            }
        }

        let Some(session) = opened else {
            if denied {
                return Err(ExtractionError::PermissionDenied {
                    serial: serial.to_string(),
                    capability: Capability::ReadStorage.to_string(),
                });
            }
            return Err(last_error.unwrap_or_else(|| ExtractionError::DeviceNotFound(serial.to_string())));
        };

        let actual = session.transport_kind();
        let substitution = preferred.filter(|p| *p != actual).map(|requested| {
            let reason = reasons
                .remove(&requested)
                .unwrap_or_else(|| format!("{} unavailable", requested));
            info!("Requested {} for {}, using {}: {}", requested, serial, actual, reason);
            TransportSubstitution {
                requested,
                actual,
                reason,
            }
        });

        if let Err(e) = self.registry.try_insert(session.clone()) {
            warn!("Session #{} for {} lost the race to register: {}", session.id(), serial, e);
            session.close();
            return Err(e);
        }
        let permissions = session.permissions();
        self.update_device(serial, |d| {
            d.active_transport = Some(actual);
            d.permission_state = permissions;
        });
        info!("Session #{} active on {} over {}", session.id(), serial, actual);

        Ok(Connection {
            session,
            substitution,
            reused: false,
        })
    }

    fn open_session(&self, backend: &dyn TransportBackend, device: &Device) -> Result<Arc<Session>> {
        let transport = backend.open(&device.serial_id)?;
        let mut permissions = transport.probe_permissions()?;
        if self.request_missing {
            permissions = negotiate(transport.as_ref(), permissions);
        }
        if !permissions.is_granted(Capability::ReadStorage) {
            return Err(ExtractionError::PermissionDenied {
                serial: device.serial_id.clone(),
                capability: Capability::ReadStorage.to_string(),
            });
        }
        let profile = self.profiles.resolve(&device.model).clone();
        debug!("Using profile '{}' for {}", profile.name, device.serial_id);
        Ok(Session::open(
            &device.model,
            transport,
            profile,
            permissions,
            self.policy,
        ))
    }

    /// Ask the device for each listed capability the session lacks and
    /// record the outcome on the device. Transports that cannot grant
    /// anything leave the state unchanged.
    pub fn request_permissions(
        &self,
        session: &Session,
        capabilities: &[Capability],
        cancel: &CancelToken,
    ) -> Result<PermissionState> {
        for capability in capabilities {
            match session.request_permission(*capability, cancel) {
                Ok(true) => {}
                Ok(false) => warn!("{} did not grant {}", session.serial(), capability),
                Err(ExtractionError::Unsupported { transport, .. }) => {
                    debug!("{} cannot grant {}", transport, capability);
                }
                Err(e) => return Err(e),
            }
        }
        let permissions = session.permissions();
        let recorded = permissions.clone();
        self.update_device(session.serial(), |d| d.permission_state = recorded);
        Ok(permissions)
    }

    /// Check a session; a LOST session clears the device's active transport
    pub fn heartbeat(&self, session: &Session) -> bool {
        beat(&self.devices, session)
    }

    /// Start a background monitor whose beats go through [`Self::heartbeat`]
    pub fn monitor(&self, session: &Arc<Session>, interval: Duration) -> HeartbeatMonitor {
        let devices = Arc::clone(&self.devices);
        HeartbeatMonitor::with_check(session, interval, Arc::new(move |s: &Session| beat(&devices, s)))
    }

    /// Tear down the session for a device; returns false if there was none
    pub fn disconnect(&self, serial: &str) -> bool {
        let Some(session) = self.registry.remove(serial) else {
            return false;
        };
        session.close();
        self.update_device(serial, |d| d.active_transport = None);
        info!("Disconnected {}", serial);
        true
    }
}

fn update_device(devices: &DeviceTable, serial: &str, f: impl FnOnce(&mut Device)) {
    let mut devices = devices.write().unwrap_or_else(PoisonError::into_inner);
    if let Some(device) = devices.get_mut(serial) {
        f(device);
    }
}

/// Request every denied capability on a freshly opened channel
fn negotiate(transport: &dyn Transport, mut permissions: PermissionState) -> PermissionState {
    for capability in permissions.denied() {
        match transport.request_permission(capability) {
            Ok(granted) => permissions.set(capability, granted),
            Err(ExtractionError::Unsupported { .. }) => {}
            Err(e) => warn!("Requesting {} on {} failed: {}", capability, transport.serial(), e),
        }
    }
    let missing = permissions.denied();
    if !missing.is_empty() {
        let names: Vec<String> = missing.iter().map(|c| c.to_string()).collect();
        info!("{} is missing permissions: {}", transport.serial(), names.join(", "));
    }
    permissions
}

fn beat(devices: &DeviceTable, session: &Session) -> bool {
    let alive = session.heartbeat();
    if session.is_lost() {
        update_device(devices, session.serial(), |d| d.active_transport = None);
    }
    alive
}
