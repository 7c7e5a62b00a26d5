//! ADB transport
//!
//! Talks to devices through the `adb` executable. Listing uses `find` +
//! `stat` on the device, content providers are read with `content query`
//! through [`Transport::shell`].

use crate::core::config::TransportConfig;
use crate::core::error::{ExtractionError, Result};
use crate::device::command::{shell_quote, CommandOutput, CommandRunner};
use crate::device::traits::{
    Capability, DeviceDescriptor, PermissionState, RemoteEntry, Transport, TransportBackend,
    TransportKind,
};
use chrono::{TimeZone, Utc};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Output markers meaning the device went away
const DISCONNECT_MARKERS: &[&str] = &[
    "device offline",
    "no devices/emulators found",
    "device not found",
    "error: closed",
    "protocol fault",
    "cannot connect to daemon",
];

/// Output markers meaning the device refused the operation
const DENIAL_MARKERS: &[&str] = &[
    "Permission Denial",
    "SecurityException",
    "Permission denied",
    "unauthorized",
];

/// One line of `adb devices -l`
#[derive(Debug, Clone, PartialEq)]
pub struct AdbDeviceLine {
    pub serial: String,
    pub state: String,
    pub properties: HashMap<String, String>,
}

/// Parse `adb devices -l`
pub fn parse_devices_output(output: &str) -> Vec<AdbDeviceLine> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| !line.starts_with("List of devices") && !line.starts_with('*'))
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let serial = parts.next()?.to_string();
            let state = parts.next()?.to_string();
            let properties = parts
                .filter_map(|p| p.split_once(':'))
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            Some(AdbDeviceLine {
                serial,
                state,
                properties,
            })
        })
        .collect()
}

/// Parse `getprop` output (`[key]: [value]` per line)
pub fn parse_getprop(output: &str) -> HashMap<String, String> {
    output
        .lines()
        .filter_map(|line| {
            let (key, value) = line.trim().split_once("]: [")?;
            let key = key.strip_prefix('[')?;
            let value = value.strip_suffix(']')?;
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

/// Parse `stat -c '%F|%s|%Y|%n'` lines into entries; malformed lines are skipped
pub fn parse_stat_listing(output: &str) -> Vec<RemoteEntry> {
    let mut entries = Vec::new();
    for line in output.lines().map(str::trim_end).filter(|l| !l.is_empty()) {
        let mut fields = line.splitn(4, '|');
        let (Some(kind), Some(size), Some(mtime), Some(path)) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            warn!("Skipping malformed listing line: {}", line);
            continue;
        };
        let (Ok(size), Ok(mtime)) = (size.parse::<u64>(), mtime.parse::<i64>()) else {
            warn!("Skipping malformed listing line: {}", line);
            continue;
        };
        let modified = Utc.timestamp_opt(mtime, 0).single();
        if kind == "directory" {
            let mut entry = RemoteEntry::dir(path);
            entry.modified = modified;
            entries.push(entry);
        } else if kind.contains("regular") {
            entries.push(RemoteEntry::file(path, size, modified));
        }
    }
    entries
}

/// First refusal marker in the output. Provider rows on stdout are data,
/// so a query that printed rows is only checked on stderr.
fn refusal_marker(output: &CommandOutput, markers: &[&'static str]) -> Option<&'static str> {
    let text = if output.stdout.trim_start().starts_with("Row: ") {
        output.stderr.clone()
    } else {
        output.combined()
    };
    markers.iter().copied().find(|m| text.contains(m))
}

/// Map a failed adb invocation onto the error taxonomy
fn classify_failure(serial: &str, command: &str, output: &CommandOutput) -> ExtractionError {
    let text = output.combined();
    if let Some(marker) = refusal_marker(output, DENIAL_MARKERS) {
        return ExtractionError::PermissionDenied {
            serial: serial.to_string(),
            capability: format!("{} ({})", command, marker),
        };
    }
    let lower = text.to_lowercase();
    let missing_serial = lower.contains(&format!("device '{}' not found", serial.to_lowercase()));
    if missing_serial || DISCONNECT_MARKERS.iter().any(|m| lower.contains(m)) {
        return ExtractionError::Disconnected(format!("{}: {}", serial, text.trim()));
    }
    ExtractionError::CommandFailed {
        command: command.to_string(),
        message: text.trim().to_string(),
    }
}

/// Enumerates devices with `adb devices -l`
pub struct AdbBackend {
    runner: CommandRunner,
    transfer_timeout: Duration,
    grant_package: String,
}

impl AdbBackend {
    pub fn new(config: &TransportConfig) -> Self {
        Self {
            runner: CommandRunner::new(&config.adb_path, config.adb_timeout()),
            transfer_timeout: config.transfer_timeout(),
            grant_package: config.grant_package.clone(),
        }
    }

    fn describe(&self, line: &AdbDeviceLine) -> DeviceDescriptor {
        let model_hint = line
            .properties
            .get("model")
            .map(|m| m.replace('_', " "))
            .unwrap_or_default();

        if line.state != "device" {
            let mut descriptor = DeviceDescriptor::new(&line.serial, &model_hint, "");
            descriptor.authorized = false;
            return descriptor;
        }

        let serial_args = ["-s", line.serial.as_str(), "shell", "getprop"];
        let props = match self.runner.run(&serial_args) {
            Ok(output) if output.success() => parse_getprop(&output.stdout),
            Ok(output) => {
                debug!("getprop failed on {}: {}", line.serial, output.combined());
                HashMap::new()
            }
            Err(e) => {
                debug!("getprop failed on {}: {}", line.serial, e);
                HashMap::new()
            }
        };

        let model = props
            .get("ro.product.model")
            .cloned()
            .unwrap_or(model_hint);
        let manufacturer = props
            .get("ro.product.manufacturer")
            .cloned()
            .unwrap_or_default();
        let mut descriptor = DeviceDescriptor::new(&line.serial, &model, &manufacturer);
        descriptor.android_version = props.get("ro.build.version.release").cloned();
        descriptor
    }
}

impl TransportBackend for AdbBackend {
    fn kind(&self) -> TransportKind {
        TransportKind::Adb
    }

    fn is_available(&self) -> bool {
        self.runner.is_available(&["version"])
    }

    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>> {
        let output = self.runner.run(&["devices", "-l"])?;
        if !output.success() {
            return Err(ExtractionError::CommandFailed {
                command: "adb devices -l".to_string(),
                message: output.combined().trim().to_string(),
            });
        }

        let devices: Vec<DeviceDescriptor> = parse_devices_output(&output.stdout)
            .iter()
            .map(|line| self.describe(line))
            .collect();
        debug!("adb reports {} device(s)", devices.len());
        Ok(devices)
    }

    fn open(&self, serial: &str) -> Result<Arc<dyn Transport>> {
        let output = self.runner.run(&["-s", serial, "get-state"])?;
        let state = output.stdout.trim();
        if state != "device" {
            return Err(classify_failure(serial, "adb get-state", &output));
        }
        info!("Opened ADB channel to {}", serial);
        Ok(Arc::new(AdbTransport {
            serial: serial.to_string(),
            runner: self.runner.clone(),
            transfer_timeout: self.transfer_timeout,
            grant_package: self.grant_package.clone(),
        }))
    }
}

/// Live ADB channel to one device
pub struct AdbTransport {
    serial: String,
    runner: CommandRunner,
    transfer_timeout: Duration,
    /// Package that `pm grant` targets; content queries run as this uid
    grant_package: String,
}

impl AdbTransport {
    fn adb(&self, args: &[&str], timeout: Duration) -> Result<CommandOutput> {
        let mut full = vec!["-s", self.serial.as_str()];
        full.extend_from_slice(args);
        self.runner.run_with_timeout(&full, timeout)
    }

    fn probe(&self, command: &str) -> Result<bool> {
        match self.shell(command) {
            Ok(_) => Ok(true),
            Err(ExtractionError::PermissionDenied { .. }) | Err(ExtractionError::CommandFailed { .. }) => {
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn has_capability(&self, capability: Capability) -> Result<bool> {
        match capability {
            Capability::Shell => self.probe("echo ok"),
            Capability::ReadStorage => self.probe("ls /sdcard/"),
            Capability::ReadContacts => self.probe(
                "content query --uri content://com.android.contacts/contacts --projection _id --sort \"_id ASC LIMIT 1\"",
            ),
            Capability::ReadSms => {
                self.probe("content query --uri content://sms --projection _id --sort \"_id ASC LIMIT 1\"")
            }
        }
    }
}

impl Transport for AdbTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Adb
    }

    fn serial(&self) -> &str {
        &self.serial
    }

    fn list(&self, path: &str) -> Result<Vec<RemoteEntry>> {
        let command = format!(
            "find {} -mindepth 1 -exec stat -c '%F|%s|%Y|%n' {{}} +",
            shell_quote(path)
        );
        let output = self.adb(&["shell", &command], self.runner.timeout())?;
        if !output.success() && output.stdout.trim().is_empty() {
            return Err(classify_failure(&self.serial, "list", &output));
        }
        Ok(parse_stat_listing(&output.stdout))
    }

    fn pull(&self, remote_path: &str, local_path: &Path) -> Result<u64> {
        let local = local_path.to_string_lossy();
        let output = self.adb(&["pull", remote_path, &local], self.transfer_timeout)?;
        if !output.success() {
            return Err(classify_failure(&self.serial, "pull", &output));
        }
        Ok(fs::metadata(local_path)?.len())
    }

    fn push(&self, local_path: &Path, remote_path: &str) -> Result<()> {
        let local = local_path.to_string_lossy();
        let output = self.adb(&["push", &local, remote_path], self.transfer_timeout)?;
        if !output.success() {
            return Err(classify_failure(&self.serial, "push", &output));
        }
        Ok(())
    }

    fn shell(&self, command: &str) -> Result<String> {
        let output = self.adb(&["shell", command], self.runner.timeout())?;
        // `content query` exits 0 even when the provider refuses
        if !output.success() || refusal_marker(&output, &DENIAL_MARKERS[..2]).is_some() {
            return Err(classify_failure(&self.serial, command, &output));
        }
        Ok(output.stdout)
    }

    fn ping(&self) -> Result<()> {
        let out = self.shell("echo ok")?;
        if out.trim() == "ok" {
            Ok(())
        } else {
            Err(ExtractionError::Disconnected(format!(
                "{}: unexpected ping reply '{}'",
                self.serial,
                out.trim()
            )))
        }
    }

    fn reconnect(&self) -> Result<()> {
        if let Err(e) = self.adb(&["reconnect"], self.runner.timeout()) {
            debug!("adb reconnect for {} failed: {}", self.serial, e);
        }
        self.adb(&["wait-for-device"], self.runner.timeout())?;
        self.ping()
    }

    fn probe_permissions(&self) -> Result<PermissionState> {
        let mut state = PermissionState::none();
        for capability in Capability::ALL {
            state.set(capability, self.has_capability(capability)?);
        }
        debug!("ADB permissions for {}: {:?}", self.serial, state);
        Ok(state)
    }

    fn request_permission(&self, capability: Capability) -> Result<bool> {
        if capability == Capability::Shell {
            return self.has_capability(capability);
        }
        let command = format!(
            "pm grant {} {}",
            shell_quote(&self.grant_package),
            capability.permission_name()
        );
        match self.shell(&command) {
            Ok(_) => info!("Granted {} to {} on {}", capability, self.grant_package, self.serial),
            Err(e @ (ExtractionError::PermissionDenied { .. } | ExtractionError::CommandFailed { .. })) => {
                warn!("{} refused to grant {}: {}", self.serial, capability, e);
                return Ok(false);
            }
            Err(e) => return Err(e),
        }
        self.has_capability(capability)
    }
}
