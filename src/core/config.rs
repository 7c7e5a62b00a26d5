//! Configuration module for the extraction tool
//!
//! Supports loading configuration from a TOML file.
//! Configuration is stored in a standard location:
//! - Windows: %APPDATA%\android_extraction_tool\config.toml
//! - Linux: ~/.config/android_extraction_tool/config.toml
//! - macOS: ~/Library/Application Support/android_extraction_tool/config.toml

use crate::device::TransportKind;
use crate::session::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application name used for config and cache directories
const APP_NAME: &str = "android_extraction_tool";

/// Default config file name
const CONFIG_FILE_NAME: &str = "config.toml";

/// Get the standard configuration directory for the application.
pub fn get_config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_NAME))
}

/// Get the standard configuration file path.
pub fn get_config_path() -> Option<PathBuf> {
    get_config_dir().map(|dir| dir.join(CONFIG_FILE_NAME))
}

/// Default directory for generated thumbnails
fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .map(|dir| dir.join(APP_NAME).join("thumbnails"))
        .unwrap_or_else(|| PathBuf::from("./thumbnails"))
}

/// Default location of the device profile store
fn default_profiles_file() -> PathBuf {
    get_config_dir()
        .map(|dir| dir.join("device_profiles.json"))
        .unwrap_or_else(|| PathBuf::from("./device_profiles.json"))
}

/// Ensure the configuration directory exists.
pub fn ensure_config_dir() -> Result<PathBuf, ConfigError> {
    let config_dir = get_config_dir().ok_or(ConfigError::ConfigDirNotFound)?;

    if !config_dir.exists() {
        fs::create_dir_all(&config_dir)
            .map_err(|e| ConfigError::WriteError(config_dir.clone(), e.to_string()))?;
    }

    Ok(config_dir)
}

/// Initialize the configuration file if it doesn't exist.
///
/// With `reset` the file is overwritten with the default template.
pub fn init_config(reset: bool) -> Result<PathBuf, ConfigError> {
    let config_dir = ensure_config_dir()?;
    let config_path = config_dir.join(CONFIG_FILE_NAME);

    if reset || !config_path.exists() {
        fs::write(&config_path, Config::generate_default_config())
            .map_err(|e| ConfigError::WriteError(config_path.clone(), e.to_string()))?;
    }

    Ok(config_path)
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Transport settings (adb/mtp binaries and timeouts)
    pub transport: TransportConfig,

    /// Session lifecycle settings
    pub session: SessionConfig,

    /// Record extraction settings
    pub extraction: ExtractionConfig,

    /// Thumbnail cache settings
    pub thumbnails: ThumbnailConfig,

    /// Device profile store
    pub profiles: ProfilesConfig,

    /// Logging settings
    pub logging: LoggingConfig,
}

/// Transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Path to the adb executable ("adb" = look it up on PATH)
    pub adb_path: PathBuf,

    /// Directory containing the libmtp tools (None = PATH)
    pub mtp_tools_dir: Option<PathBuf>,

    /// Preferred transport when connecting (None = ADB, then MTP)
    pub preferred: Option<TransportKind>,

    /// Timeout for ADB commands in milliseconds
    pub adb_timeout_ms: u64,

    /// Timeout for MTP commands in milliseconds (device probing is slow)
    pub mtp_timeout_ms: u64,

    /// Timeout for payload transfers (pull/push) in milliseconds
    pub transfer_timeout_ms: u64,

    /// Package that runtime permissions are granted to over ADB
    pub grant_package: String,
}

/// Session lifecycle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Interval between heartbeat probes in milliseconds
    pub heartbeat_interval_ms: u64,

    /// Reconnect attempts before a session is marked lost
    pub max_reconnect_attempts: u32,

    /// First reconnect backoff in milliseconds (doubles each attempt)
    pub backoff_base_ms: u64,

    /// Upper bound for a single backoff delay in milliseconds
    pub backoff_max_ms: u64,

    /// Ask the device to grant missing permissions while connecting
    pub request_permissions: bool,
}

/// Record extraction configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    /// Rows requested per content query page
    pub page_size: usize,

    /// Country calling code used to normalize national phone numbers
    pub default_country_code: String,

    /// Photo file extensions picked up by the photo scan
    pub photo_extensions: Vec<String>,

    /// Also treat video files as photo records
    pub include_videos: bool,
}

/// Thumbnail cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThumbnailConfig {
    /// Directory for cached thumbnails and originals
    pub cache_dir: PathBuf,

    /// Default edge length in pixels
    pub default_size: u32,

    /// JPEG quality (1-100)
    pub quality: u8,

    /// Maximum number of thumbnails kept in memory
    pub max_entries: usize,

    /// Lifetime of an in-memory entry in seconds
    pub lifetime_secs: u64,
}

/// Device profile store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfilesConfig {
    /// JSON file with vendor/model profiles
    pub store_file: PathBuf,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: error, warn, info, debug, trace
    pub level: String,

    /// Log to file
    pub log_to_file: bool,

    /// Log file path
    pub log_file: PathBuf,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            adb_path: PathBuf::from("adb"),
            mtp_tools_dir: None,
            preferred: None,
            adb_timeout_ms: 10_000,
            mtp_timeout_ms: 30_000,
            transfer_timeout_ms: 300_000,
            grant_package: "com.android.shell".to_string(),
        }
    }
}

impl TransportConfig {
    pub fn adb_timeout(&self) -> Duration {
        Duration::from_millis(self.adb_timeout_ms)
    }

    pub fn mtp_timeout(&self) -> Duration {
        Duration::from_millis(self.mtp_timeout_ms)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_ms)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 5_000,
            max_reconnect_attempts: 3,
            backoff_base_ms: 500,
            backoff_max_ms: 8_000,
            request_permissions: false,
        }
    }
}

impl SessionConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_reconnect_attempts,
            base_delay: Duration::from_millis(self.backoff_base_ms),
            max_delay: Duration::from_millis(self.backoff_max_ms),
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            page_size: 200,
            default_country_code: "1".to_string(),
            photo_extensions: ["jpg", "jpeg", "png", "heic", "heif", "gif", "webp", "dng", "bmp"]
                .iter()
                .map(|e| e.to_string())
                .collect(),
            include_videos: false,
        }
    }
}

impl Default for ThumbnailConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            default_size: 256,
            quality: 80,
            max_entries: 500,
            lifetime_secs: 300,
        }
    }
}

impl Default for ProfilesConfig {
    fn default() -> Self {
        Self {
            store_file: default_profiles_file(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_to_file: false,
            log_file: PathBuf::from("./android_extraction.log"),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(path.to_path_buf(), e.to_string()))?;

        toml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))
    }

    /// Load configuration from default locations
    ///
    /// Search order:
    /// 1. ./config.toml
    /// 2. ./android_extractor.toml
    /// 3. Standard config location
    ///
    /// If no config file is found, returns default configuration.
    pub fn load_default() -> Result<Self, ConfigError> {
        Self::load_first_existing(&Self::search_paths())
    }

    fn search_paths() -> Vec<PathBuf> {
        let mut paths = vec![
            PathBuf::from("./config.toml"),
            PathBuf::from("./android_extractor.toml"),
        ];
        if let Some(standard) = get_config_path() {
            paths.push(standard);
        }
        paths
    }

    fn load_first_existing(paths: &[PathBuf]) -> Result<Self, ConfigError> {
        match paths.iter().find(|p| p.exists()) {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    /// Path of the config file in use, or the standard location if none exists
    pub fn get_active_config_path() -> PathBuf {
        Self::search_paths()
            .into_iter()
            .find(|p| p.exists())
            .or_else(get_config_path)
            .unwrap_or_else(|| PathBuf::from("./config.toml"))
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        fs::write(path.as_ref(), content)
            .map_err(|e| ConfigError::WriteError(path.as_ref().to_path_buf(), e.to_string()))
    }

    /// Commented default config file
    pub fn generate_default_config() -> String {
        include_str!("../../config.example.toml").to_string()
    }
}

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// Configuration file was not found at the specified path
    FileNotFound(PathBuf),
    /// Failed to read the configuration file
    ReadError(PathBuf, String),
    /// Failed to parse the configuration file (invalid TOML)
    ParseError(PathBuf, String),
    /// Failed to serialize configuration to TOML
    SerializeError(String),
    /// Failed to write configuration file
    WriteError(PathBuf, String),
    /// Could not determine config directory
    ConfigDirNotFound,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileNotFound(path) => {
                write!(f, "Configuration file not found: {}", path.display())
            }
            ConfigError::ReadError(path, err) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), err)
            }
            ConfigError::ParseError(path, err) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), err)
            }
            ConfigError::SerializeError(err) => {
                write!(f, "Failed to serialize configuration: {}", err)
            }
            ConfigError::WriteError(path, err) => {
                write!(f, "Failed to write config file '{}': {}", path.display(), err)
            }
            ConfigError::ConfigDirNotFound => {
                write!(f, "Could not determine configuration directory")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.session.max_reconnect_attempts, 3);
        assert_eq!(config.transport.adb_timeout_ms, 10_000);
        assert_eq!(config.extraction.page_size, 200);
        assert!(config.transport.preferred.is_none());
        assert!(config.extraction.photo_extensions.contains(&"jpg".to_string()));
    }

    #[test]
    fn test_example_config_parses() {
        let config: Config = toml::from_str(&Config::generate_default_config()).unwrap();
        assert_eq!(config.session.max_reconnect_attempts, 3);
        assert_eq!(config.extraction.default_country_code, "1");
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "[transport]\npreferred = \"mtp\"\n\n[session]\nbackoff_base_ms = 10\n",
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.transport.preferred, Some(TransportKind::Mtp));
        assert_eq!(config.session.backoff_base_ms, 10);
        assert_eq!(config.session.max_reconnect_attempts, 3);
        assert_eq!(config.extraction.page_size, 200);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("saved.toml");
        let mut config = Config::default();
        config.extraction.default_country_code = "44".to_string();
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.extraction.default_country_code, "44");
    }

    #[test]
    fn test_missing_file_is_error() {
        let result = Config::load("/definitely/not/here.toml");
        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
    }

    #[test]
    fn test_load_first_existing_falls_back_to_default() {
        let config = Config::load_first_existing(&[PathBuf::from("/nope/a.toml")]).unwrap();
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_retry_policy_from_session_config() {
        let policy = SessionConfig::default().retry_policy();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay, Duration::from_millis(500));
    }
}
