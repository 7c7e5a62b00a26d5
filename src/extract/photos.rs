//! Photo scanning and download
//!
//! `scan` only reads the storage listing; bytes are fetched on demand with
//! `download`. Photo ids hash the storage-relative path, so the same file
//! gets the same id over ADB and MTP.

use crate::core::cancel::CancelToken;
use crate::core::config::ExtractionConfig;
use crate::core::error::{ExtractionError, Result};
use crate::device::{guess_mime_type, Capability, DeviceProfile, RemoteEntry, VIDEO_EXTENSIONS};
use crate::extract::records::{Domain, Photo, RecordWarning, ThumbnailRef};
use crate::extract::stream::{Page, PageSource, RecordStream};
use crate::session::Session;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use log::{debug, info};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::collections::{HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// First 16 hex digits of SHA-256 over the storage-relative path
pub fn photo_id(relative_path: &str) -> String {
    let digest = Sha256::digest(relative_path.as_bytes());
    digest.iter().take(8).map(|b| format!("{:02x}", b)).collect()
}

/// Capture time from names like `IMG_20240131_235959.jpg`
pub fn filename_timestamp(file_name: &str) -> Option<DateTime<Utc>> {
    (0..file_name.len().saturating_sub(14)).find_map(|start| {
        let candidate = file_name.get(start..start + 15)?;
        let (date, time) = candidate.split_once('_')?;
        let digits = date.bytes().chain(time.bytes()).all(|b| b.is_ascii_digit());
        if date.len() != 8 || time.len() != 6 || !digits {
            return None;
        }
        let date = NaiveDate::parse_from_str(date, "%Y%m%d").ok()?;
        let time = NaiveTime::parse_from_str(time, "%H%M%S").ok()?;
        Some(NaiveDateTime::new(date, time).and_utc())
    })
}

/// Folders ascending, then newest first; undated photos last, ties by id
pub fn photo_order(a: &Photo, b: &Photo) -> Ordering {
    a.folder_path
        .cmp(&b.folder_path)
        .then_with(|| match (a.capture_timestamp, b.capture_timestamp) {
            (Some(x), Some(y)) => y.cmp(&x),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
        .then_with(|| a.id.cmp(&b.id))
}

#[derive(Debug, Clone, Default)]
pub struct PhotoFilter {
    /// Storage-relative folder prefix, e.g. "DCIM/Camera"
    pub folder_prefix: Option<String>,
    /// e.g. "image/" or "video/mp4"
    pub mime_prefix: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl PhotoFilter {
    pub fn matches(&self, photo: &Photo) -> bool {
        if let Some(prefix) = &self.folder_prefix {
            if !photo.folder_path.starts_with(prefix.trim_matches('/')) {
                return false;
            }
        }
        if let Some(prefix) = &self.mime_prefix {
            if !photo.mime_type.starts_with(prefix.as_str()) {
                return false;
            }
        }
        if self.since.is_some() || self.until.is_some() {
            let Some(taken) = photo.capture_timestamp else {
                return false;
            };
            if self.since.is_some_and(|since| taken < since) || self.until.is_some_and(|until| taken > until) {
                return false;
            }
        }
        true
    }
}

/// Result of a metadata scan
#[derive(Debug, Clone, Default)]
pub struct PhotoScan {
    /// In display order (see [`photo_order`])
    pub photos: Vec<Photo>,
    pub warnings: Vec<RecordWarning>,
}

#[derive(Debug, Clone)]
pub struct PhotoExtractor {
    extensions: HashSet<String>,
}

impl PhotoExtractor {
    pub fn new(config: &ExtractionConfig) -> Self {
        let mut extensions: HashSet<String> = config
            .photo_extensions
            .iter()
            .map(|e| e.trim_start_matches('.').to_lowercase())
            .collect();
        if config.include_videos {
            extensions.extend(VIDEO_EXTENSIONS.iter().map(|e| e.to_string()));
        }
        Self { extensions }
    }

    fn to_photo(&self, profile: &DeviceProfile, entry: &RemoteEntry) -> Option<Photo> {
        if entry.is_dir {
            return None;
        }
        let extension = entry.extension()?;
        if !self.extensions.contains(&extension) {
            return None;
        }

        let relative = profile.storage_relative(&entry.path);
        let folder_path = relative.rsplit_once('/').map(|(folder, _)| folder).unwrap_or("");
        let file_name = entry.name().to_string();
        let capture_timestamp = if profile.filename_timestamps {
            filename_timestamp(&file_name).or(entry.modified)
        } else {
            entry.modified
        };
        let id = photo_id(relative);

        Some(Photo {
            thumbnail_ref: ThumbnailRef { photo_id: id.clone() },
            id,
            folder_path: folder_path.to_string(),
            file_name,
            remote_path: entry.path.clone(),
            mime_type: guess_mime_type(&extension).to_string(),
            capture_timestamp,
            file_size: entry.size,
        })
    }

    /// List every photo under the profile's photo folders
    pub fn scan(&self, session: &Session, cancel: &CancelToken) -> Result<PhotoScan> {
        session.require(Capability::ReadStorage)?;

        let mut scan = PhotoScan::default();
        let mut seen = HashSet::new();
        for folder in scan_order(session.profile()) {
            let page = self.scan_folder(session, &folder, &mut seen, cancel)?;
            scan.photos.extend(page.records);
            scan.warnings.extend(page.warnings);
        }

        scan.photos.sort_by(photo_order);
        info!(
            "Photo scan of {} found {} photos ({} warnings)",
            session.serial(),
            scan.photos.len(),
            scan.warnings.len()
        );
        Ok(scan)
    }

    /// Photos directly or transitively under one root folder, in display
    /// order; ids already in `seen` are skipped
    fn scan_folder(
        &self,
        session: &Session,
        folder: &str,
        seen: &mut HashSet<String>,
        cancel: &CancelToken,
    ) -> Result<Page<Photo>> {
        let profile = session.profile();
        let entries = match session.list(folder, cancel) {
            Ok(entries) => entries,
            Err(ExtractionError::CommandFailed { message, .. }) => {
                debug!("Skipping photo folder {}: {}", folder, message);
                let warning = RecordWarning::new(
                    Domain::Photos,
                    folder,
                    format!("folder not readable: {}", message),
                );
                return Ok(Page::new(Vec::new(), vec![warning]));
            }
            Err(e) => return Err(e),
        };

        let mut photos: Vec<Photo> = entries
            .iter()
            .filter_map(|entry| self.to_photo(profile, entry))
            .filter(|photo| seen.insert(photo.id.clone()))
            .collect();
        photos.sort_by(photo_order);
        Ok(Page::new(photos, Vec::new()))
    }

    /// Stream scanned photos, optionally filtered.
    ///
    /// Folders are listed one page at a time, so photos from folders read
    /// before an interruption are still delivered.
    pub fn extract(
        &self,
        session: &Arc<Session>,
        filter: Option<PhotoFilter>,
        cancel: &CancelToken,
    ) -> Result<RecordStream<Photo>> {
        session.require(Capability::ReadStorage)?;
        let source = FolderPages {
            extractor: self.clone(),
            session: Arc::clone(session),
            folders: scan_order(session.profile()).into(),
            seen: HashSet::new(),
        };
        let stream = RecordStream::new(Domain::Photos, Box::new(source), cancel.clone());
        Ok(match filter {
            Some(filter) => stream.with_filter(move |p| filter.matches(p)),
            None => stream,
        })
    }

    /// Fetch a photo's bytes into `destination`, returning `<destination>/<id>.<ext>`
    pub fn download(
        &self,
        session: &Session,
        photo: &Photo,
        destination: &Path,
        cancel: &CancelToken,
    ) -> Result<PathBuf> {
        session.require(Capability::ReadStorage)?;
        fs::create_dir_all(destination)?;
        let local = destination.join(format!("{}.{}", photo.id, photo.extension()));
        let bytes = session.pull(&photo.remote_path, &local, cancel)?;
        debug!("Downloaded {} ({} bytes) to {}", photo.remote_path, bytes, local.display());
        Ok(local)
    }
}

/// Root folders sorted so that per-folder pages concatenate in display order
fn scan_order(profile: &DeviceProfile) -> Vec<String> {
    let mut folders = profile.photo_folders();
    folders.sort_by_cached_key(|folder| format!("{}/", profile.storage_relative(folder)));
    folders.dedup();
    folders
}

/// One page per root folder, listed when the page is requested
struct FolderPages {
    extractor: PhotoExtractor,
    session: Arc<Session>,
    folders: VecDeque<String>,
    seen: HashSet<String>,
}

impl PageSource<Photo> for FolderPages {
    fn next_page(&mut self, cancel: &CancelToken) -> Result<Option<Page<Photo>>> {
        let Some(folder) = self.folders.pop_front() else {
            return Ok(None);
        };
        self.extractor
            .scan_folder(&self.session, &folder, &mut self.seen, cancel)
            .map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::PermissionState;
    use crate::session::RetryPolicy;
    use crate::testdb::{MockDataGenerator, MockDeviceData, MockTransport};
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn session_for(mock: MockTransport, profile: DeviceProfile) -> Arc<Session> {
        Session::open(
            "Pixel 8",
            Arc::new(mock),
            profile,
            PermissionState::granting(&Capability::ALL),
            RetryPolicy::immediate(3),
        )
    }

    fn at(secs: i64) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(secs, 0).single()
    }

    #[test]
    fn test_photo_id_is_stable_hex() {
        let id = photo_id("DCIM/Camera/IMG_0001.jpg");
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(id, photo_id("DCIM/Camera/IMG_0001.jpg"));
        assert_ne!(id, photo_id("DCIM/Camera/IMG_0002.jpg"));
    }

    #[test]
    fn test_filename_timestamp() {
        let parsed = filename_timestamp("IMG_20240131_235959.jpg").unwrap();
        assert_eq!(parsed.to_rfc3339(), "2024-01-31T23:59:59+00:00");
        assert!(filename_timestamp("IMG_20241399_000000.jpg").is_none());
        assert!(filename_timestamp("holiday.jpg").is_none());
    }

    #[test]
    fn test_scan_orders_and_filters_extensions() {
        let mut data = MockDeviceData::default();
        data.add_file("/sdcard/DCIM/Camera/a.jpg", b"a".to_vec(), at(100));
        data.add_file("/sdcard/DCIM/Camera/b.JPG", b"b".to_vec(), at(300));
        data.add_file("/sdcard/DCIM/Camera/c.png", b"c".to_vec(), None);
        data.add_file("/sdcard/DCIM/Camera/clip.mp4", b"v".to_vec(), at(200));
        data.add_file("/sdcard/DCIM/Camera/notes.txt", b"t".to_vec(), at(200));
        data.add_file("/sdcard/Pictures/Screenshots/s.png", b"s".to_vec(), at(50));
        let session = session_for(MockTransport::adb("ABC123", data), DeviceProfile::default());

        let scan = PhotoExtractor::new(&ExtractionConfig::default())
            .scan(&session, &CancelToken::new())
            .unwrap();
        let names: Vec<&str> = scan.photos.iter().map(|p| p.file_name.as_str()).collect();
        assert_eq!(names, vec!["b.JPG", "a.jpg", "c.png", "s.png"]);
        assert_eq!(scan.photos[0].folder_path, "DCIM/Camera");
        assert_eq!(scan.photos[0].mime_type, "image/jpeg");
        assert_eq!(scan.photos[3].folder_path, "Pictures/Screenshots");

        let with_videos = PhotoExtractor::new(&ExtractionConfig {
            include_videos: true,
            ..ExtractionConfig::default()
        })
        .scan(&session, &CancelToken::new())
        .unwrap();
        assert_eq!(with_videos.photos.len(), 5);
    }

    #[test]
    fn test_ids_match_across_transports() {
        let mut data = MockDeviceData::default();
        data.add_file("/sdcard/DCIM/Camera/a.jpg", b"a".to_vec(), at(100));
        let over_adb = session_for(MockTransport::adb("ABC123", data.clone()), DeviceProfile::default());
        let over_mtp = session_for(MockTransport::mtp("ABC123", data), DeviceProfile::default());

        let extractor = PhotoExtractor::new(&ExtractionConfig::default());
        let a = extractor.scan(&over_adb, &CancelToken::new()).unwrap();
        let b = extractor.scan(&over_mtp, &CancelToken::new()).unwrap();
        assert_eq!(a.photos[0].id, b.photos[0].id);
    }

    #[test]
    fn test_filename_timestamps_from_profile() {
        let mut data = MockDeviceData::default();
        data.add_file("/sdcard/DCIM/Camera/IMG_20230102_030405.jpg", b"x".to_vec(), at(1));
        let profile = DeviceProfile {
            filename_timestamps: true,
            ..DeviceProfile::default()
        };
        let session = session_for(MockTransport::adb("ABC123", data), profile);
        let scan = PhotoExtractor::new(&ExtractionConfig::default())
            .scan(&session, &CancelToken::new())
            .unwrap();
        assert_eq!(
            scan.photos[0].capture_timestamp.map(|t| t.to_rfc3339()),
            Some("2023-01-02T03:04:05+00:00".to_string())
        );
    }

    #[test]
    fn test_scenario_hundred_camera_photos() {
        let data = MockDataGenerator::new(42).photos("DCIM/Camera", 100).build(&DeviceProfile::default());
        let session = session_for(MockTransport::adb("ABC123", data), DeviceProfile::default());
        let extractor = PhotoExtractor::new(&ExtractionConfig::default());

        let scan = extractor.scan(&session, &CancelToken::new()).unwrap();
        assert_eq!(scan.photos.len(), 100);
        assert!(scan.warnings.is_empty());
        assert!(scan
            .photos
            .windows(2)
            .all(|w| w[0].capture_timestamp >= w[1].capture_timestamp));

        let dest = TempDir::new().unwrap();
        let first = &scan.photos[0];
        let local = extractor.download(&session, first, dest.path(), &CancelToken::new()).unwrap();
        assert_eq!(local, dest.path().join(format!("{}.jpg", first.id)));
        assert_eq!(fs::metadata(&local).unwrap().len(), first.file_size);
    }

    #[test]
    fn test_extract_with_filter() {
        let mut data = MockDeviceData::default();
        data.add_file("/sdcard/DCIM/Camera/a.jpg", b"a".to_vec(), at(100));
        data.add_file("/sdcard/Pictures/b.png", b"b".to_vec(), at(100));
        let session = session_for(MockTransport::mtp("ABC123", data), DeviceProfile::default());

        let filter = PhotoFilter {
            mime_prefix: Some("image/png".to_string()),
            ..PhotoFilter::default()
        };
        let photos: Vec<Photo> = PhotoExtractor::new(&ExtractionConfig::default())
            .extract(&session, Some(filter), &CancelToken::new())
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(photos.len(), 1);
        assert_eq!(photos[0].file_name, "b.png");
    }

    #[test]
    fn test_interrupted_scan_delivers_listed_folders() {
        let mut data = MockDataGenerator::new(3).photos("DCIM/Camera", 10).build(&DeviceProfile::default());
        data.add_file("/sdcard/Pictures/p.png", b"p".to_vec(), at(100));
        let mock = MockTransport::adb("ABC123", data);
        mock.disconnect_after_calls(1);
        let session = session_for(mock, DeviceProfile::default());

        let results: Vec<Result<Photo>> = PhotoExtractor::new(&ExtractionConfig::default())
            .extract(&session, None, &CancelToken::new())
            .unwrap()
            .collect();

        assert_eq!(results.len(), 11);
        assert!(results[..10].iter().all(|r| r.is_ok()));
        assert!(matches!(
            results[10],
            Err(ExtractionError::PartialResult {
                domain: Domain::Photos,
                delivered: 10,
                ..
            })
        ));
        assert!(session.is_lost());
    }

    #[test]
    fn test_stream_matches_scan_order() {
        let mut data = MockDeviceData::default();
        data.add_file("/sdcard/Pictures/p.png", b"p".to_vec(), at(500));
        data.add_file("/sdcard/DCIM/Camera/a.jpg", b"a".to_vec(), at(100));
        data.add_file("/sdcard/DCIM/Camera/b.jpg", b"b".to_vec(), at(300));
        data.add_file("/sdcard/DCIM/Screenshots/s.png", b"s".to_vec(), at(200));
        let session = session_for(MockTransport::adb("ABC123", data), DeviceProfile::default());
        let extractor = PhotoExtractor::new(&ExtractionConfig::default());

        let scanned: Vec<String> = extractor
            .scan(&session, &CancelToken::new())
            .unwrap()
            .photos
            .into_iter()
            .map(|p| p.id)
            .collect();
        let streamed: Vec<String> = extractor
            .extract(&session, None, &CancelToken::new())
            .unwrap()
            .map(|r| r.unwrap().id)
            .collect();
        assert_eq!(streamed, scanned);
        assert_eq!(streamed.len(), 4);
    }

    #[test]
    fn test_missing_folder_is_a_warning() {
        let mut data = MockDeviceData::default();
        data.add_file("/sdcard/DCIM/Camera/a.jpg", b"a".to_vec(), at(100));
        let session = session_for(MockTransport::adb("ABC123", data), DeviceProfile::default());
        let scan = PhotoExtractor::new(&ExtractionConfig::default())
            .scan(&session, &CancelToken::new())
            .unwrap();
        assert_eq!(scan.photos.len(), 1);
        assert_eq!(scan.warnings.len(), 1);
        assert!(scan.warnings[0].record_ref.ends_with("Pictures"));
    }
}
