//! Device profiles store
//!
//! Vendor/model profiles describe where a device keeps its data and which
//! provider quirks it has. Profiles are loaded from a JSON store keyed by
//! model string:
//!
//! ```json
//! {
//!   "version": 1,
//!   "profiles": {
//!     "SM-*": { "name": "Samsung Galaxy", "photo_roots": ["DCIM", "Pictures", "Download"] },
//!     "Pixel 8": { "name": "Pixel 8", "filename_timestamps": true }
//!   }
//! }
//! ```
//!
//! Lookup is an exact case-insensitive match first, then the longest
//! matching `prefix*` key, then the built-in default profile.

use crate::core::error::{ExtractionError, Result};
use chrono::Utc;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

/// Current version of the profile store format
const STORE_VERSION: u32 = 1;

/// Capabilities and content locations of one device family
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceProfile {
    /// Human readable profile name
    pub name: String,

    /// Contacts table URI
    pub contacts_uri: String,

    /// Contact data rows (phones, emails, group memberships)
    pub contacts_data_uri: String,

    /// Contact groups URI
    pub groups_uri: String,

    /// SMS provider URI
    pub sms_uri: String,

    /// Root of shared storage
    pub storage_root: String,

    /// Photo folders relative to the storage root
    pub photo_roots: Vec<String>,

    /// Whether the content providers honour `LIMIT` in the sort clause
    pub supports_sort_limit: bool,

    /// Parse `YYYYMMDD_HHMMSS` capture times out of file names
    pub filename_timestamps: bool,
}

impl Default for DeviceProfile {
    fn default() -> Self {
        Self {
            name: "Generic Android".to_string(),
            contacts_uri: "content://com.android.contacts/contacts".to_string(),
            contacts_data_uri: "content://com.android.contacts/data".to_string(),
            groups_uri: "content://com.android.contacts/groups".to_string(),
            sms_uri: "content://sms".to_string(),
            storage_root: "/sdcard".to_string(),
            photo_roots: vec!["DCIM".to_string(), "Pictures".to_string()],
            supports_sort_limit: true,
            filename_timestamps: false,
        }
    }
}

impl DeviceProfile {
    /// Absolute photo folders on the device
    pub fn photo_folders(&self) -> Vec<String> {
        let root = self.storage_root.trim_end_matches('/');
        self.photo_roots
            .iter()
            .map(|r| format!("{}/{}", root, r.trim_matches('/')))
            .collect()
    }

    /// Path relative to the storage root, used for stable photo ids
    pub fn storage_relative<'a>(&self, remote_path: &'a str) -> &'a str {
        let root = self.storage_root.trim_end_matches('/');
        remote_path
            .strip_prefix(root)
            .map(|rest| rest.trim_start_matches('/'))
            .unwrap_or(remote_path)
    }
}

/// Serialized profile store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileDatabase {
    /// Version of the store format
    pub version: u32,

    /// Profiles keyed by model string or `prefix*` pattern
    pub profiles: BTreeMap<String, DeviceProfile>,

    /// Last updated timestamp
    #[serde(default)]
    pub last_updated: Option<String>,
}

impl Default for ProfileDatabase {
    fn default() -> Self {
        Self {
            version: STORE_VERSION,
            profiles: BTreeMap::new(),
            last_updated: None,
        }
    }
}

/// Loads profiles and resolves a model string to a profile
#[derive(Debug, Clone, Default)]
pub struct ProfileStore {
    /// Backing file, if any
    path: Option<PathBuf>,

    /// Loaded profiles
    database: ProfileDatabase,

    /// Fallback profile
    default_profile: DeviceProfile,
}

impl ProfileStore {
    /// Store containing only the default profile
    pub fn new() -> Self {
        Self::default()
    }

    /// Load profiles from a JSON file; a missing file yields an empty store
    pub fn load(path: &Path) -> Result<Self> {
        let mut store = Self {
            path: Some(path.to_path_buf()),
            ..Self::default()
        };

        if !path.exists() {
            debug!("Profile store does not exist: {}", path.display());
            return Ok(store);
        }

        let file = File::open(path).map_err(|e| {
            ExtractionError::IoError(format!("Failed to open profile store: {}", e))
        })?;

        store.database = serde_json::from_reader(BufReader::new(file)).map_err(|e| {
            ExtractionError::Parse(format!(
                "Failed to parse profile store '{}': {}",
                path.display(),
                e
            ))
        })?;

        info!(
            "Loaded {} device profile(s) from {}",
            store.database.profiles.len(),
            path.display()
        );

        Ok(store)
    }

    /// Write the store back to its file
    pub fn save(&mut self) -> Result<()> {
        let Some(path) = self.path.clone() else {
            return Ok(());
        };

        self.database.last_updated = Some(Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string());

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                ExtractionError::IoError(format!("Failed to create profiles directory: {}", e))
            })?;
        }

        let file = File::create(&path).map_err(|e| {
            ExtractionError::IoError(format!("Failed to create profile store: {}", e))
        })?;

        serde_json::to_writer_pretty(BufWriter::new(file), &self.database).map_err(|e| {
            ExtractionError::IoError(format!("Failed to write profile store: {}", e))
        })?;

        debug!(
            "Saved {} device profile(s) to {}",
            self.database.profiles.len(),
            path.display()
        );
        Ok(())
    }

    /// Add or replace a profile under a model key or `prefix*` pattern
    pub fn insert(&mut self, key: &str, profile: DeviceProfile) {
        self.database.profiles.insert(key.to_string(), profile);
    }

    pub fn len(&self) -> usize {
        self.database.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.database.profiles.is_empty()
    }

    pub fn default_profile(&self) -> &DeviceProfile {
        &self.default_profile
    }

    /// Resolve the profile for a device model
    pub fn resolve(&self, model: &str) -> &DeviceProfile {
        let model_lower = model.trim().to_lowercase();

        let exact = self
            .database
            .profiles
            .iter()
            .find(|(key, _)| !key.ends_with('*') && key.to_lowercase() == model_lower);
        if let Some((key, profile)) = exact {
            debug!("Profile '{}' matched model '{}' exactly", key, model);
            return profile;
        }

        let prefix = self
            .database
            .profiles
            .iter()
            .filter_map(|(key, profile)| {
                let stem = key.strip_suffix('*')?.to_lowercase();
                model_lower.starts_with(&stem).then_some((stem.len(), key, profile))
            })
            .max_by_key(|(len, _, _)| *len);
        if let Some((_, key, profile)) = prefix {
            debug!("Profile '{}' matched model '{}' by prefix", key, model);
            return profile;
        }

        &self.default_profile
    }
}
