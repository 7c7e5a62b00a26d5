//! Device and transport abstraction traits
//!
//! This module defines the capability-typed transport boundary. Both the
//! real ADB/MTP transports and the mock transports in `testdb` implement
//! these traits, so sessions and extractors can be exercised without a
//! device attached.
//!
//! # Architecture
//!
//! - `TransportBackend` - Enumerates devices on one transport and opens them
//! - `Transport` - A live channel to one device (`list`, `pull`, `push`, `shell`)
//! - `Device` - Discovered device record, mutated only by the session manager
//! - `DeviceDescriptor` - What a single backend reports about a device

use crate::core::error::{ExtractionError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Display};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

/// Transport used to talk to a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Android Debug Bridge: command/shell channel
    Adb,
    /// Media Transfer Protocol: file-oriented channel
    Mtp,
}

impl TransportKind {
    /// Default selection order when no preference is given
    pub const PREFERENCE_ORDER: [TransportKind; 2] = [TransportKind::Adb, TransportKind::Mtp];

    pub fn display_name(&self) -> &'static str {
        match self {
            TransportKind::Adb => "ADB",
            TransportKind::Mtp => "MTP",
        }
    }

    /// Selection order with `preferred` moved to the front
    pub fn selection_order(preferred: Option<TransportKind>) -> Vec<TransportKind> {
        let mut order = Self::PREFERENCE_ORDER.to_vec();
        if let Some(preferred) = preferred {
            order.retain(|k| *k != preferred);
            order.insert(0, preferred);
        }
        order
    }
}

impl Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "adb" => Ok(TransportKind::Adb),
            "mtp" => Ok(TransportKind::Mtp),
            other => Err(format!("unknown transport '{}' (expected adb or mtp)", other)),
        }
    }
}

/// Something a transport may or may not be allowed to do on a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Capability {
    /// Query the contacts provider
    ReadContacts,
    /// Query the SMS provider
    ReadSms,
    /// List and pull files from shared storage
    ReadStorage,
    /// Run shell commands
    Shell,
}

impl Capability {
    pub const ALL: [Capability; 4] = [
        Capability::ReadContacts,
        Capability::ReadSms,
        Capability::ReadStorage,
        Capability::Shell,
    ];

    /// Android permission name, as shown to users
    pub fn permission_name(&self) -> &'static str {
        match self {
            Capability::ReadContacts => "android.permission.READ_CONTACTS",
            Capability::ReadSms => "android.permission.READ_SMS",
            Capability::ReadStorage => "android.permission.READ_EXTERNAL_STORAGE",
            Capability::Shell => "shell",
        }
    }
}

impl Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.permission_name())
    }
}

/// Capability -> granted/denied mapping
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionState {
    grants: BTreeMap<Capability, bool>,
}

impl PermissionState {
    /// Every capability denied
    pub fn none() -> Self {
        Self {
            grants: Capability::ALL.iter().map(|c| (*c, false)).collect(),
        }
    }

    /// Grant exactly the given capabilities, deny the rest
    pub fn granting(capabilities: &[Capability]) -> Self {
        let mut state = Self::none();
        for capability in capabilities {
            state.set(*capability, true);
        }
        state
    }

    pub fn set(&mut self, capability: Capability, granted: bool) {
        self.grants.insert(capability, granted);
    }

    /// Unknown capabilities count as denied
    pub fn is_granted(&self, capability: Capability) -> bool {
        self.grants.get(&capability).copied().unwrap_or(false)
    }

    pub fn denied(&self) -> Vec<Capability> {
        Capability::ALL
            .iter()
            .copied()
            .filter(|c| !self.is_granted(*c))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Capability, &bool)> {
        self.grants.iter()
    }
}

/// What one backend reports about an attached device
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceDescriptor {
    /// Stable serial number of the physical device
    pub serial_id: String,
    /// Device model (e.g., "Pixel 8", "SM-S928B")
    pub model: String,
    /// Device manufacturer (e.g., "Google", "samsung")
    pub manufacturer: String,
    /// Android release, when the backend can read it
    pub android_version: Option<String>,
    /// False when the device is visible but refused the host (e.g. adb "unauthorized")
    pub authorized: bool,
}

impl DeviceDescriptor {
    pub fn new(serial_id: &str, model: &str, manufacturer: &str) -> Self {
        Self {
            serial_id: serial_id.to_string(),
            model: model.to_string(),
            manufacturer: manufacturer.to_string(),
            android_version: None,
            authorized: true,
        }
    }

    pub fn with_android_version(mut self, version: &str) -> Self {
        self.android_version = Some(version.to_string());
        self
    }

    pub fn unauthorized(mut self) -> Self {
        self.authorized = false;
        self
    }
}

/// A discovered device
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Device {
    /// Unique, stable per physical device
    pub serial_id: String,
    pub model: String,
    pub manufacturer: String,
    pub android_version: Option<String>,
    /// Transport of the current session (None = no session)
    pub active_transport: Option<TransportKind>,
    /// Transports the device is visible on
    pub available_transports: BTreeSet<TransportKind>,
    /// Transports on which the device refused the host
    pub unauthorized_transports: BTreeSet<TransportKind>,
    /// Capabilities granted by the active transport
    pub permission_state: PermissionState,
}

impl Device {
    /// Create a device record from the first backend that reports it
    pub fn from_descriptor(descriptor: &DeviceDescriptor, kind: TransportKind) -> Self {
        let mut device = Self {
            serial_id: descriptor.serial_id.clone(),
            model: descriptor.model.clone(),
            manufacturer: descriptor.manufacturer.clone(),
            android_version: descriptor.android_version.clone(),
            active_transport: None,
            available_transports: BTreeSet::new(),
            unauthorized_transports: BTreeSet::new(),
            permission_state: PermissionState::none(),
        };
        device.merge_descriptor(descriptor, kind);
        device
    }

    /// Fold in what another backend reports about the same serial.
    ///
    /// ADB metadata wins over MTP metadata; blanks are always filled.
    pub fn merge_descriptor(&mut self, descriptor: &DeviceDescriptor, kind: TransportKind) {
        self.available_transports.insert(kind);
        if !descriptor.authorized {
            self.unauthorized_transports.insert(kind);
        }

        let overwrite = kind == TransportKind::Adb && descriptor.authorized;
        if overwrite || self.model.is_empty() {
            if !descriptor.model.is_empty() {
                self.model = descriptor.model.clone();
            }
        }
        if overwrite || self.manufacturer.is_empty() {
            if !descriptor.manufacturer.is_empty() {
                self.manufacturer = descriptor.manufacturer.clone();
            }
        }
        if self.android_version.is_none() || (overwrite && descriptor.android_version.is_some()) {
            if descriptor.android_version.is_some() {
                self.android_version = descriptor.android_version.clone();
            }
        }
    }

    pub fn is_visible_on(&self, kind: TransportKind) -> bool {
        self.available_transports.contains(&kind)
    }

    pub fn is_authorized_on(&self, kind: TransportKind) -> bool {
        self.is_visible_on(kind) && !self.unauthorized_transports.contains(&kind)
    }

    /// "ADB", "MTP" or "NONE"
    pub fn active_transport_label(&self) -> &'static str {
        self.active_transport
            .map(|k| k.display_name())
            .unwrap_or("NONE")
    }

    /// User-facing name, e.g. "Google Pixel 8 (ABC123)"
    pub fn display_name(&self) -> String {
        let name = format!("{} {}", self.manufacturer, self.model);
        format!("{} ({})", name.trim(), self.serial_id)
    }
}

/// A file or folder on device storage
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteEntry {
    /// Absolute path on the device (e.g., "/sdcard/DCIM/Camera/IMG_0001.jpg")
    pub path: String,
    /// Whether this is a folder
    pub is_dir: bool,
    /// Size in bytes (0 for folders)
    pub size: u64,
    /// Last modification time, when the transport reports it
    pub modified: Option<DateTime<Utc>>,
}

impl RemoteEntry {
    pub fn file(path: &str, size: u64, modified: Option<DateTime<Utc>>) -> Self {
        Self {
            path: path.to_string(),
            is_dir: false,
            size,
            modified,
        }
    }

    pub fn dir(path: &str) -> Self {
        Self {
            path: path.to_string(),
            is_dir: true,
            size: 0,
            modified: None,
        }
    }

    /// Final path component
    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    /// Lowercase extension, if any
    pub fn extension(&self) -> Option<String> {
        let name = self.name();
        name.rfind('.')
            .filter(|idx| *idx > 0 && *idx + 1 < name.len())
            .map(|idx| name[idx + 1..].to_lowercase())
    }
}

/// A live channel to one device.
///
/// Every call must be bounded in time: implementations enforce their own
/// timeouts and fail with `TransportTimeout` instead of blocking forever.
/// Callers serialize access; implementations need not be re-entrant.
pub trait Transport: Send + Sync {
    /// Which transport this is
    fn kind(&self) -> TransportKind;

    /// Serial of the device this channel is bound to
    fn serial(&self) -> &str;

    /// Recursively list files and folders below `path`
    fn list(&self, path: &str) -> Result<Vec<RemoteEntry>>;

    /// Copy a remote file to a local path, returning the bytes written
    fn pull(&self, remote_path: &str, local_path: &Path) -> Result<u64>;

    /// Copy a local file to the device
    fn push(&self, local_path: &Path, remote_path: &str) -> Result<()>;

    /// Run a shell command and return its stdout
    fn shell(&self, command: &str) -> Result<String>;

    /// Cheap liveness probe
    fn ping(&self) -> Result<()>;

    /// Re-establish the channel after a failure, then verify it
    fn reconnect(&self) -> Result<()> {
        self.ping()
    }

    /// Determine which capabilities this channel grants
    fn probe_permissions(&self) -> Result<PermissionState>;

    /// Ask the device to grant a capability, returning whether it is held
    /// afterwards. A refusal is `Ok(false)`, not an error.
    fn request_permission(&self, capability: Capability) -> Result<bool> {
        Err(ExtractionError::Unsupported {
            operation: format!("grant {}", capability),
            transport: self.kind().to_string(),
        })
    }
}

/// Enumerates devices on one transport and opens channels to them
pub trait TransportBackend: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Whether the backend binaries/libraries are usable at all
    fn is_available(&self) -> bool;

    /// List attached devices; an empty list is a valid answer
    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>>;

    /// Open a channel to the device with this serial
    fn open(&self, serial: &str) -> Result<Arc<dyn Transport>>;
}

/// Guess a MIME type from a file extension
pub fn guess_mime_type(extension: &str) -> &'static str {
    match extension.to_lowercase().as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "heic" | "heif" => "image/heic",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "dng" => "image/x-adobe-dng",
        "bmp" => "image/bmp",
        "tif" | "tiff" => "image/tiff",
        "mp4" | "m4v" => "video/mp4",
        "3gp" => "video/3gpp",
        "mkv" => "video/x-matroska",
        "webm" => "video/webm",
        "mov" => "video/quicktime",
        _ => "application/octet-stream",
    }
}

/// Video extensions recognised by the photo scan when videos are enabled
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "m4v", "3gp", "mkv", "webm", "mov"];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selection_order() {
        assert_eq!(
            TransportKind::selection_order(None),
            vec![TransportKind::Adb, TransportKind::Mtp]
        );
        assert_eq!(
            TransportKind::selection_order(Some(TransportKind::Mtp)),
            vec![TransportKind::Mtp, TransportKind::Adb]
        );
    }

    #[test]
    fn test_transport_kind_parse_and_display() {
        assert_eq!("ADB".parse::<TransportKind>(), Ok(TransportKind::Adb));
        assert_eq!("mtp".parse::<TransportKind>(), Ok(TransportKind::Mtp));
        assert!("usb".parse::<TransportKind>().is_err());
        assert_eq!(TransportKind::Mtp.to_string(), "MTP");
    }

    #[test]
    fn test_permission_state() {
        let state = PermissionState::granting(&[Capability::ReadStorage]);
        assert!(state.is_granted(Capability::ReadStorage));
        assert!(!state.is_granted(Capability::ReadSms));
        assert_eq!(state.denied().len(), 3);
        assert!(!PermissionState::default().is_granted(Capability::Shell));
    }

    #[test]
    fn test_device_merge_prefers_adb_metadata() {
        let mtp = DeviceDescriptor::new("ABC123", "SAMSUNG_Android", "");
        let adb = DeviceDescriptor::new("ABC123", "SM-S928B", "samsung").with_android_version("14");

        let mut device = Device::from_descriptor(&mtp, TransportKind::Mtp);
        assert_eq!(device.model, "SAMSUNG_Android");
        device.merge_descriptor(&adb, TransportKind::Adb);

        assert_eq!(device.model, "SM-S928B");
        assert_eq!(device.manufacturer, "samsung");
        assert_eq!(device.android_version.as_deref(), Some("14"));
        assert!(device.is_visible_on(TransportKind::Adb));
        assert!(device.is_visible_on(TransportKind::Mtp));
        assert_eq!(device.active_transport_label(), "NONE");
    }

    #[test]
    fn test_unauthorized_adb_keeps_mtp_metadata() {
        let mtp = DeviceDescriptor::new("XYZ", "Pixel 8", "Google");
        let adb = DeviceDescriptor::new("XYZ", "", "").unauthorized();

        let mut device = Device::from_descriptor(&mtp, TransportKind::Mtp);
        device.merge_descriptor(&adb, TransportKind::Adb);
        assert_eq!(device.model, "Pixel 8");
        assert!(!device.is_authorized_on(TransportKind::Adb));
        assert!(device.is_authorized_on(TransportKind::Mtp));
    }

    #[test]
    fn test_remote_entry_helpers() {
        let entry = RemoteEntry::file("/sdcard/DCIM/Camera/IMG_0001.JPG", 10, None);
        assert_eq!(entry.name(), "IMG_0001.JPG");
        assert_eq!(entry.extension().as_deref(), Some("jpg"));
        assert_eq!(RemoteEntry::file("/sdcard/.nomedia", 0, None).extension(), None);
        assert_eq!(RemoteEntry::dir("/sdcard/DCIM").name(), "DCIM");
    }

    #[test]
    fn test_guess_mime_type() {
        assert_eq!(guess_mime_type("JPG"), "image/jpeg");
        assert_eq!(guess_mime_type("heif"), "image/heic");
        assert_eq!(guess_mime_type("mp4"), "video/mp4");
        assert_eq!(guess_mime_type("txt"), "application/octet-stream");
    }
}
