//! Error types for the extraction core
//!
//! One error enum covers discovery, session, transport and extraction
//! failures. Per-record parse problems are not errors; they are reported as
//! [`RecordWarning`](crate::extract::RecordWarning)s on the stream.

use crate::extract::Domain;
use thiserror::Error;

/// Main error type for the extraction core
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExtractionError {
    /// No transport backend could be used for discovery
    #[error("Device discovery failed: {0}")]
    Discovery(String),

    /// A transport backend binary or library is missing
    #[error("Transport backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The device did not grant a capability the operation needs
    #[error("Permission denied on device '{serial}': {capability} not granted")]
    PermissionDenied { serial: String, capability: String },

    /// Another session owns the device and cannot be superseded
    #[error("Device '{0}' is busy: another session owns it")]
    DeviceBusy(String),

    /// No backend reports a device with this serial
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// A transport call exceeded its bounded wait
    #[error("Transport call '{operation}' timed out after {timeout_ms} ms")]
    TransportTimeout { operation: String, timeout_ms: u64 },

    /// The transport channel dropped (unplugged, offline, adb server died)
    #[error("Device disconnected: {0}")]
    Disconnected(String),

    /// A command reached the device but failed there
    #[error("Command '{command}' failed: {message}")]
    CommandFailed { command: String, message: String },

    /// The active transport cannot perform this operation
    #[error("Operation '{operation}' is not supported over {transport}")]
    Unsupported { operation: String, transport: String },

    /// The session exhausted its reconnect attempts
    #[error("Session for device '{0}' is lost; reconnect required")]
    SessionLost(String),

    /// A record stream ended early after delivering a prefix of records
    #[error("{domain} extraction ended early after {delivered} records: {reason}")]
    PartialResult {
        domain: Domain,
        delivered: usize,
        reason: String,
    },

    /// The caller cancelled the operation
    #[error("Operation cancelled")]
    Cancelled,

    /// Transport output could not be understood at all
    #[error("Parse error: {0}")]
    Parse(String),

    /// Thumbnail decoding or encoding failed
    #[error("Thumbnail error for '{photo_id}': {message}")]
    Thumbnail { photo_id: String, message: String },

    /// General I/O error
    #[error("IO error: {0}")]
    IoError(String),
}

impl ExtractionError {
    /// Transient errors trigger the reconnection path instead of surfacing
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ExtractionError::TransportTimeout { .. } | ExtractionError::Disconnected(_)
        )
    }

    /// Whether a user-visible retry makes sense after this error
    pub fn is_retryable(&self) -> bool {
        match self {
            ExtractionError::PermissionDenied { .. }
            | ExtractionError::Unsupported { .. }
            | ExtractionError::BackendUnavailable(_)
            | ExtractionError::Parse(_) => false,
            ExtractionError::PartialResult { reason, .. } => !reason.contains("Permission"),
            _ => true,
        }
    }

    /// Errors that interrupt a stream of data (as opposed to refusing it)
    pub(crate) fn is_interruption(&self) -> bool {
        matches!(
            self,
            ExtractionError::TransportTimeout { .. }
                | ExtractionError::Disconnected(_)
                | ExtractionError::SessionLost(_)
                | ExtractionError::CommandFailed { .. }
                | ExtractionError::Parse(_)
                | ExtractionError::IoError(_)
        )
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, ExtractionError>;

impl From<std::io::Error> for ExtractionError {
    fn from(err: std::io::Error) -> Self {
        ExtractionError::IoError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let timeout = ExtractionError::TransportTimeout {
            operation: "shell".to_string(),
            timeout_ms: 10,
        };
        assert!(timeout.is_transient());
        assert!(ExtractionError::Disconnected("gone".to_string()).is_transient());
        assert!(!ExtractionError::DeviceBusy("A".to_string()).is_transient());
        assert!(!ExtractionError::SessionLost("A".to_string()).is_transient());
    }

    #[test]
    fn test_partial_result_message_carries_domain_and_count() {
        let err = ExtractionError::PartialResult {
            domain: Domain::Sms,
            delivered: 13,
            reason: "Device disconnected: usb".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("SMS"));
        assert!(text.contains("13"));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_permission_denied_is_not_retryable() {
        let err = ExtractionError::PermissionDenied {
            serial: "ABC".to_string(),
            capability: "READ_SMS".to_string(),
        };
        assert!(!err.is_retryable());
        assert!(!err.is_interruption());
    }
}
