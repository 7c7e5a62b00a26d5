//! MTP transport
//!
//! Uses the libmtp command-line tools (`mtp-detect`, `mtp-folders`,
//! `mtp-files`, `mtp-getfile`, `mtp-sendfile`). The tools always operate on
//! the first attached MTP device, so this backend exposes at most one device.
//!
//! MTP has no shell; paths are mapped under a virtual storage root
//! (`/sdcard`) so the rest of the crate sees the same layout as over ADB.

use crate::core::config::TransportConfig;
use crate::core::error::{ExtractionError, Result};
use crate::device::command::{CommandOutput, CommandRunner};
use crate::device::traits::{
    Capability, DeviceDescriptor, PermissionState, RemoteEntry, Transport, TransportBackend,
    TransportKind,
};
use chrono::{TimeZone, Utc};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Virtual mount point of the device storage
pub const MTP_STORAGE_ROOT: &str = "/sdcard";

/// The libmtp tools used by this backend
#[derive(Debug, Clone)]
struct MtpTools {
    detect: CommandRunner,
    folders: CommandRunner,
    files: CommandRunner,
    getfile: CommandRunner,
    sendfile: CommandRunner,
}

impl MtpTools {
    fn new(config: &TransportConfig) -> Self {
        let tool = |name: &str, timeout: Duration| {
            let program = match &config.mtp_tools_dir {
                Some(dir) => dir.join(name),
                None => PathBuf::from(name),
            };
            CommandRunner::new(program, timeout)
        };
        Self {
            detect: tool("mtp-detect", config.mtp_timeout()),
            folders: tool("mtp-folders", config.mtp_timeout()),
            files: tool("mtp-files", config.mtp_timeout()),
            getfile: tool("mtp-getfile", config.transfer_timeout()),
            sendfile: tool("mtp-sendfile", config.transfer_timeout()),
        }
    }
}

/// Device identity as printed by `mtp-detect`
pub fn parse_detect_output(output: &str) -> Option<DeviceDescriptor> {
    if output.contains("No raw devices found") {
        return None;
    }

    let field = |name: &str| {
        output
            .lines()
            .map(str::trim)
            .find_map(|line| line.strip_prefix(name))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty() && v != "(NULL)")
    };

    let serial = field("Serial number:")?;
    let model = field("Model:").unwrap_or_default();
    let manufacturer = field("Manufacturer:").unwrap_or_default();
    Some(DeviceDescriptor::new(&serial, &model, &manufacturer))
}

/// Folder id -> storage-relative path, from `mtp-folders`
///
/// Each line is `<id>\t<indent><name>`, two spaces of indent per level.
pub fn parse_folders_output(output: &str) -> HashMap<u32, String> {
    let mut folders = HashMap::new();
    let mut stack: Vec<String> = Vec::new();

    for line in output.lines() {
        let Some((id, rest)) = line.split_once('\t') else {
            continue;
        };
        let Ok(id) = id.trim().parse::<u32>() else {
            continue;
        };
        let name = rest.trim_start_matches(' ');
        if name.is_empty() {
            continue;
        }
        let level = (rest.len() - name.len()) / 2;
        stack.truncate(level);
        stack.push(name.trim_end().to_string());
        folders.insert(id, stack.join("/"));
    }
    folders
}

/// One file block from `mtp-files`
#[derive(Debug, Clone, PartialEq)]
pub struct MtpFile {
    pub id: u32,
    pub name: String,
    pub size: u64,
    pub parent_id: u32,
    pub modified: Option<i64>,
}

/// File block being accumulated while parsing `mtp-files`
#[derive(Default)]
struct FileBlock {
    id: u32,
    name: Option<String>,
    size: u64,
    parent_id: Option<u32>,
    modified: Option<i64>,
}

impl FileBlock {
    fn finish(self) -> Option<MtpFile> {
        match (self.name, self.parent_id) {
            (Some(name), Some(parent_id)) => Some(MtpFile {
                id: self.id,
                name,
                size: self.size,
                parent_id,
                modified: self.modified,
            }),
            _ => {
                warn!("Skipping incomplete MTP file entry {}", self.id);
                None
            }
        }
    }
}

/// Parse `mtp-files`; blocks without a name or parent are skipped
pub fn parse_files_output(output: &str) -> Vec<MtpFile> {
    let mut files = Vec::new();
    let mut current: Option<FileBlock> = None;

    for line in output.lines().map(str::trim) {
        if let Some(id) = line.strip_prefix("File ID:") {
            files.extend(current.take().and_then(FileBlock::finish));
            current = id.trim().parse().ok().map(|id| FileBlock {
                id,
                ..FileBlock::default()
            });
            continue;
        }
        let Some(block) = current.as_mut() else {
            continue;
        };
        if let Some(name) = line.strip_prefix("Filename:") {
            block.name = Some(name.trim().to_string());
        } else if let Some(size) = line.strip_prefix("File size") {
            block.size = size
                .split_whitespace()
                .next()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);
        } else if let Some(parent) = line.strip_prefix("Parent ID:") {
            block.parent_id = parent.trim().parse().ok();
        } else if let Some(date) = line.strip_prefix("Date:") {
            block.modified = date.split_whitespace().next().and_then(|s| s.parse().ok());
        }
    }
    files.extend(current.and_then(FileBlock::finish));
    files
}

/// Map a device-absolute path to a storage-relative one
fn relative(path: &str) -> &str {
    path.strip_prefix(MTP_STORAGE_ROOT)
        .unwrap_or(path)
        .trim_matches('/')
}

fn absolute(relative: &str) -> String {
    if relative.is_empty() {
        MTP_STORAGE_ROOT.to_string()
    } else {
        format!("{}/{}", MTP_STORAGE_ROOT, relative)
    }
}

fn command_error(command: &str, output: &CommandOutput) -> ExtractionError {
    let text = output.combined();
    if text.contains("No devices") || text.contains("No raw devices found") {
        return ExtractionError::Disconnected(format!("{}: no MTP device attached", command));
    }
    ExtractionError::CommandFailed {
        command: command.to_string(),
        message: text.trim().to_string(),
    }
}

/// Enumerates the first MTP device with `mtp-detect`
pub struct MtpBackend {
    tools: MtpTools,
}

impl MtpBackend {
    pub fn new(config: &TransportConfig) -> Self {
        Self {
            tools: MtpTools::new(config),
        }
    }

    fn detect(&self) -> Result<Option<DeviceDescriptor>> {
        let output = self.tools.detect.run(&[])?;
        Ok(parse_detect_output(&output.stdout))
    }
}

impl TransportBackend for MtpBackend {
    fn kind(&self) -> TransportKind {
        TransportKind::Mtp
    }

    fn is_available(&self) -> bool {
        // mtp-detect exits non-zero without a device, only spawning matters here
        !matches!(
            self.tools.detect.run(&[]),
            Err(ExtractionError::BackendUnavailable(_))
        )
    }

    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>> {
        let devices: Vec<DeviceDescriptor> = self.detect()?.into_iter().collect();
        debug!("mtp reports {} device(s)", devices.len());
        Ok(devices)
    }

    fn open(&self, serial: &str) -> Result<Arc<dyn Transport>> {
        match self.detect()? {
            Some(found) if found.serial_id == serial => {
                info!("Opened MTP channel to {}", serial);
                Ok(Arc::new(MtpTransport {
                    serial: serial.to_string(),
                    tools: self.tools.clone(),
                    index: Mutex::new(HashMap::new()),
                }))
            }
            _ => Err(ExtractionError::DeviceNotFound(serial.to_string())),
        }
    }
}

/// Live MTP channel to the first attached device
pub struct MtpTransport {
    serial: String,
    tools: MtpTools,
    /// Remote path -> object id, filled by `list`
    index: Mutex<HashMap<String, u32>>,
}

impl MtpTransport {
    fn folders(&self) -> Result<HashMap<u32, String>> {
        let output = self.tools.folders.run(&[])?;
        if !output.success() {
            return Err(command_error("mtp-folders", &output));
        }
        Ok(parse_folders_output(&output.stdout))
    }

    /// Full storage listing as device-absolute entries plus their object ids
    fn snapshot(&self) -> Result<Vec<(u32, RemoteEntry)>> {
        let folders = self.folders()?;
        let output = self.tools.files.run(&[])?;
        if !output.success() {
            return Err(command_error("mtp-files", &output));
        }

        let mut entries: Vec<(u32, RemoteEntry)> = folders
            .iter()
            .map(|(id, path)| (*id, RemoteEntry::dir(&absolute(path))))
            .collect();

        for file in parse_files_output(&output.stdout) {
            let parent = match file.parent_id {
                0 => String::new(),
                id => match folders.get(&id) {
                    Some(path) => path.clone(),
                    None => {
                        debug!("MTP file {} has unknown parent {}", file.name, id);
                        continue;
                    }
                },
            };
            let rel = if parent.is_empty() {
                file.name.clone()
            } else {
                format!("{}/{}", parent, file.name)
            };
            let modified = file.modified.and_then(|t| Utc.timestamp_opt(t, 0).single());
            entries.push((file.id, RemoteEntry::file(&absolute(&rel), file.size, modified)));
        }
        Ok(entries)
    }

    fn object_id(&self, remote_path: &str) -> Result<u32> {
        if let Some(id) = self.lookup(remote_path) {
            return Ok(id);
        }
        self.list(MTP_STORAGE_ROOT)?;
        self.lookup(remote_path).ok_or_else(|| ExtractionError::CommandFailed {
            command: "mtp-getfile".to_string(),
            message: format!("no such file on device: {}", remote_path),
        })
    }

    fn lookup(&self, remote_path: &str) -> Option<u32> {
        self.index
            .lock()
            .ok()
            .and_then(|index| index.get(remote_path).copied())
    }
}

impl Transport for MtpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Mtp
    }

    fn serial(&self) -> &str {
        &self.serial
    }

    fn list(&self, path: &str) -> Result<Vec<RemoteEntry>> {
        let snapshot = self.snapshot()?;

        if let Ok(mut index) = self.index.lock() {
            index.clear();
            index.extend(snapshot.iter().map(|(id, e)| (e.path.clone(), *id)));
        }

        let base = relative(path);
        let prefix = if base.is_empty() {
            String::new()
        } else {
            format!("{}/", base)
        };
        Ok(snapshot
            .into_iter()
            .map(|(_, entry)| entry)
            .filter(|entry| relative(&entry.path).starts_with(&prefix))
            .collect())
    }

    fn pull(&self, remote_path: &str, local_path: &Path) -> Result<u64> {
        let id = self.object_id(remote_path)?.to_string();
        let local = local_path.to_string_lossy();
        let output = self.tools.getfile.run(&[&id, &local])?;
        if !output.success() || !local_path.exists() {
            return Err(command_error("mtp-getfile", &output));
        }
        Ok(fs::metadata(local_path)?.len())
    }

    fn push(&self, local_path: &Path, remote_path: &str) -> Result<()> {
        let local = local_path.to_string_lossy();
        let output = self.tools.sendfile.run(&[&local, relative(remote_path)])?;
        if !output.success() {
            return Err(command_error("mtp-sendfile", &output));
        }
        Ok(())
    }

    fn shell(&self, _command: &str) -> Result<String> {
        Err(ExtractionError::Unsupported {
            operation: "shell".to_string(),
            transport: TransportKind::Mtp.to_string(),
        })
    }

    fn ping(&self) -> Result<()> {
        let output = self.tools.detect.run(&[])?;
        match parse_detect_output(&output.stdout) {
            Some(found) if found.serial_id == self.serial => Ok(()),
            _ => Err(ExtractionError::Disconnected(format!(
                "{}: not visible over MTP",
                self.serial
            ))),
        }
    }

    fn probe_permissions(&self) -> Result<PermissionState> {
        let mut state = PermissionState::none();
        // A locked phone exposes no storage
        let readable = match self.folders() {
            Ok(folders) => !folders.is_empty(),
            Err(ExtractionError::CommandFailed { .. }) => false,
            Err(e) => return Err(e),
        };
        state.set(Capability::ReadStorage, readable);
        debug!("MTP permissions for {}: {:?}", self.serial, state);
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DETECT: &str = "libmtp version: 1.1.19\n\nListing raw device(s)\n\
        Device 0 (VID=18d1 and PID=4ee1) is a Google Inc Nexus/Pixel (MTP).\n\
        Device info:\n   Manufacturer: Google\n   Model: Pixel 7\n   Device version: 1.0\n\
           Serial number: 2A111FDH2000XY\n";

    #[test]
    fn test_parse_detect_output() {
        let device = parse_detect_output(DETECT).unwrap();
        assert_eq!(device.serial_id, "2A111FDH2000XY");
        assert_eq!(device.model, "Pixel 7");
        assert_eq!(device.manufacturer, "Google");
        assert!(parse_detect_output("No raw devices found.\n").is_none());
    }

    #[test]
    fn test_parse_folders_output() {
        let output = "Storage: Internal shared storage\n\
            5\tDCIM\n\
            6\t  Camera\n\
            9\t  Screenshots\n\
            7\tPictures\n\
            8\t  Saved\n\
            10\t    Old\n";
        let folders = parse_folders_output(output);
        assert_eq!(folders.get(&6).map(String::as_str), Some("DCIM/Camera"));
        assert_eq!(folders.get(&9).map(String::as_str), Some("DCIM/Screenshots"));
        assert_eq!(folders.get(&10).map(String::as_str), Some("Pictures/Saved/Old"));
        assert_eq!(folders.len(), 6);
    }

    #[test]
    fn test_parse_files_output() {
        let output = "File ID: 12\n   Filename: IMG_0001.jpg\n   File size 2048 (0x0000000000000800) bytes\n\
               Parent ID: 6\n   Storage ID: 0x00010001\n   Filetype: JPEG file\n   Date: 1700000000\n\
            File ID: 13\n   File size 1 (0x1) bytes\n\
            File ID: 14\n   Filename: notes.txt\n   File size 10 (0xA) bytes\n   Parent ID: 0\n";
        let files = parse_files_output(output);
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].id, 12);
        assert_eq!(files[0].size, 2048);
        assert_eq!(files[0].parent_id, 6);
        assert_eq!(files[0].modified, Some(1_700_000_000));
        assert_eq!(files[1].name, "notes.txt");
        assert_eq!(files[1].modified, None);
    }

    #[test]
    fn test_path_mapping() {
        assert_eq!(relative("/sdcard/DCIM/Camera"), "DCIM/Camera");
        assert_eq!(relative("/sdcard"), "");
        assert_eq!(absolute("DCIM"), "/sdcard/DCIM");
        assert_eq!(absolute(""), "/sdcard");
    }
}
