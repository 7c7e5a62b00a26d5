//! Android Extraction Tool Library
//!
//! Device session management and record extraction for Android devices
//! attached over USB. Contacts, SMS and photo metadata are streamed off the
//! device over ADB or MTP while the session rides out disconnects.
//!
//! # Architecture
//!
//! - [`device`] - Transport boundary: `adb` and the libmtp tools run as
//!   subprocesses behind the `Transport` trait, plus vendor profiles
//! - [`session`] - Discovery, transport selection, session state machine,
//!   the transport gate and the heartbeat monitor
//! - [`extract`] - Contacts, SMS and photo extractors, record streams and
//!   the thumbnail cache
//! - [`core`] - Configuration, errors, cancellation and the extraction
//!   coordinator
//! - [`cli`] - Command-line interface (only used by the binary)
//! - [`testdb`] - Mock transports and a seeded data generator
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use android_extraction_tool::core::cancel::CancelToken;
//! use android_extraction_tool::core::config::Config;
//! use android_extraction_tool::core::coordinator::ExtractionCoordinator;
//! use android_extraction_tool::device::{default_backends, ProfileStore};
//! use android_extraction_tool::extract::Domain;
//! use android_extraction_tool::session::{DeviceSessionManager, SessionRegistry};
//! use std::sync::Arc;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!     let registry = Arc::new(SessionRegistry::new());
//!     let manager = DeviceSessionManager::new(
//!         default_backends(&config.transport),
//!         Arc::clone(&registry),
//!         ProfileStore::load(&config.profiles.store_file)?,
//!         config.session.retry_policy(),
//!     );
//!
//!     let devices = manager.discover()?;
//!     if let Some(device) = devices.first() {
//!         let session = manager.connect(&device.serial_id, None)?.session;
//!         let coordinator = ExtractionCoordinator::new(config.extraction.clone());
//!         let (records, summary) = coordinator.run(&session, &Domain::ALL, CancelToken::new());
//!         println!("{} records: {}", records.len(), summary);
//!     }
//!
//!     registry.shutdown();
//!     Ok(())
//! }
//! ```
//!
//! # Testing Without a Device
//!
//! ```rust,no_run
//! use android_extraction_tool::device::DeviceProfile;
//! use android_extraction_tool::testdb::{MockDataGenerator, MockTransport};
//!
//! let data = MockDataGenerator::new(1).contacts(20).build(&DeviceProfile::default());
//! let transport = MockTransport::adb("emulator-5554", data);
//! assert!(transport.is_connected());
//! ```

pub mod cli;
pub mod core;
pub mod device;
pub mod extract;
pub mod session;
pub mod testdb;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
