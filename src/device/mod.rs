//! Device interaction module
//!
//! This module provides the transport boundary to Android devices attached
//! over USB.
//!
//! # Submodules
//!
//! - `traits` - Capability-typed `Transport` and `TransportBackend` traits
//! - `command` - Bounded subprocess execution shared by both transports
//! - `adb` - ADB backend (`adb` executable)
//! - `mtp` - MTP backend (libmtp command-line tools)
//! - `profiles` - Vendor/model device profiles
//!
//! Both the real transports and the mock transports in `testdb` implement
//! the same traits, allowing sessions and extractors to work with either.

pub mod adb;
pub mod command;
pub mod mtp;
pub mod profiles;
pub mod traits;

pub use adb::{AdbBackend, AdbTransport};
pub use command::{CommandOutput, CommandRunner};
pub use mtp::{MtpBackend, MtpTransport};
pub use profiles::{DeviceProfile, ProfileStore};
pub use traits::{
    guess_mime_type, Capability, Device, DeviceDescriptor, PermissionState, RemoteEntry,
    Transport, TransportBackend, TransportKind, VIDEO_EXTENSIONS,
};

use crate::core::config::TransportConfig;
use std::sync::Arc;

/// The real backends, ADB first
pub fn default_backends(config: &TransportConfig) -> Vec<Arc<dyn TransportBackend>> {
    vec![
        Arc::new(AdbBackend::new(config)),
        Arc::new(MtpBackend::new(config)),
    ]
}
