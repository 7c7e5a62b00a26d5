//! Simulated devices
//!
//! Lets every extraction path run without a phone attached. The CLI's
//! `simulate` command and the unit tests both drive the same mock
//! transport.
//!
//! - `mock_device` - In-memory device content, mock transport and backend
//! - `generator` - Seeded generator for contacts, SMS and photo trees
//!
//! ```rust,no_run
//! use android_extraction_tool::device::DeviceProfile;
//! use android_extraction_tool::testdb::{MockDataGenerator, MockTransport};
//!
//! let profile = DeviceProfile::default();
//! let data = MockDataGenerator::new(7)
//!     .contacts(50)
//!     .sms(200)
//!     .photos("DCIM/Camera", 40)
//!     .build(&profile);
//! let transport = MockTransport::adb("emulator-5554", data);
//! ```

pub mod generator;
pub mod mock_device;

pub use generator::{at_offset, jpeg_payload, png_payload, MockDataGenerator, BASE_TIMESTAMP};
pub use mock_device::{CallRecord, MockBackend, MockDeviceData, MockFile, MockRow, MockTransport, SmsSeed};
