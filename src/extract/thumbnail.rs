//! Thumbnail generation and caching
//!
//! Thumbnails are derived from a photo's original bytes and keyed by
//! `(photo id, edge size)`. Generated JPEGs are kept in memory (bounded by
//! count and lifetime) and on disk under the configured cache directory, so
//! a thumbnail survives restarts as long as the photo id is unchanged.

use crate::core::cancel::CancelToken;
use crate::core::config::ThumbnailConfig;
use crate::core::error::{ExtractionError, Result};
use crate::extract::records::Photo;
use crate::session::Session;
use image::codecs::jpeg::JpegEncoder;
use log::{debug, trace};
use rayon::prelude::*;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

/// A generated thumbnail
#[derive(Debug, Clone)]
pub struct Thumbnail {
    pub photo_id: String,
    /// Requested edge length; the image fits inside a size x size box
    pub size: u32,
    /// JPEG bytes
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub mime_type: String,
    pub generated_at: Instant,
}

impl Thumbnail {
    pub fn is_fresh(&self, lifetime: Duration) -> bool {
        self.generated_at.elapsed() < lifetime
    }

    /// `data:` URL for embedding in HTML or JSON
    pub fn as_data_url(&self) -> String {
        use base64::{engine::general_purpose::STANDARD, Engine};
        format!("data:{};base64,{}", self.mime_type, STANDARD.encode(&self.data))
    }
}

type CacheKey = (String, u32);

struct CacheEntry {
    thumbnail: Thumbnail,
    last_accessed: Instant,
}

/// Cache statistics
#[derive(Debug, Clone, PartialEq)]
pub struct CacheStats {
    pub entries: usize,
    pub max_entries: usize,
    pub hits: u64,
    pub misses: u64,
}

pub struct ThumbnailCache {
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
    config: ThumbnailConfig,
    counters: RwLock<(u64, u64)>,
}

impl ThumbnailCache {
    pub fn new(config: ThumbnailConfig) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            config,
            counters: RwLock::new((0, 0)),
        }
    }

    fn lifetime(&self) -> Duration {
        Duration::from_secs(self.config.lifetime_secs)
    }

    /// Default edge length from the configuration
    pub fn default_size(&self) -> u32 {
        self.config.default_size
    }

    /// Location of the cached JPEG on disk
    pub fn disk_path(&self, photo_id: &str, size: u32) -> PathBuf {
        self.config.cache_dir.join(format!("{}_{}.jpg", photo_id, size))
    }

    /// In-memory lookup
    pub fn get(&self, photo_id: &str, size: u32) -> Option<Thumbnail> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let key = (photo_id.to_string(), size);

        if let Some(entry) = entries.get_mut(&key) {
            if entry.thumbnail.is_fresh(self.lifetime()) {
                entry.last_accessed = Instant::now();
                return Some(entry.thumbnail.clone());
            }
            entries.remove(&key);
        }
        None
    }

    pub fn put(&self, thumbnail: Thumbnail) {
        if self.config.max_entries == 0 {
            return;
        }
        let lifetime = self.lifetime();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.retain(|_, entry| entry.thumbnail.is_fresh(lifetime));
        if entries.len() >= self.config.max_entries {
            Self::evict_oldest(&mut entries);
        }
        entries.insert(
            (thumbnail.photo_id.clone(), thumbnail.size),
            CacheEntry {
                thumbnail,
                last_accessed: Instant::now(),
            },
        );
    }

    /// Drop the least recently used tenth of the entries
    fn evict_oldest(entries: &mut HashMap<CacheKey, CacheEntry>) {
        let to_remove = (entries.len() / 10).max(1);
        let mut items: Vec<(CacheKey, Instant)> = entries
            .iter()
            .map(|(k, v)| (k.clone(), v.last_accessed))
            .collect();
        items.sort_by(|a, b| a.1.cmp(&b.1));
        for (key, _) in items.into_iter().take(to_remove) {
            entries.remove(&key);
        }
    }

    pub fn clear(&self) {
        self.entries.write().unwrap_or_else(PoisonError::into_inner).clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let (hits, misses) = *self.counters.read().unwrap_or_else(PoisonError::into_inner);
        CacheStats {
            entries: self.len(),
            max_entries: self.config.max_entries,
            hits,
            misses,
        }
    }

    fn count(&self, hit: bool) {
        let mut counters = self.counters.write().unwrap_or_else(PoisonError::into_inner);
        if hit {
            counters.0 += 1;
        } else {
            counters.1 += 1;
        }
    }

    /// Thumbnail for `photo`, generated from the original on a miss
    pub fn thumbnail(&self, session: &Session, photo: &Photo, size: u32, cancel: &CancelToken) -> Result<Thumbnail> {
        let size = size.max(1);
        if let Some(cached) = self.get(&photo.id, size) {
            self.count(true);
            return Ok(cached);
        }

        let disk_path = self.disk_path(&photo.id, size);
        if disk_path.exists() {
            let data = fs::read(&disk_path)?;
            if let Ok(thumbnail) = self.load_cached(photo, size, data) {
                trace!("Thumbnail {} loaded from {}", photo.id, disk_path.display());
                self.count(true);
                self.put(thumbnail.clone());
                return Ok(thumbnail);
            }
            debug!("Discarding unreadable cached thumbnail {}", disk_path.display());
        }

        self.count(false);
        let original = self.fetch_original(session, photo, cancel)?;
        let thumbnail = self.generate(photo, size, &original)?;
        fs::write(&disk_path, &thumbnail.data)?;
        self.put(thumbnail.clone());
        Ok(thumbnail)
    }

    /// Thumbnails for many photos; decoding runs in parallel while transport
    /// reads queue on the session gate
    pub fn thumbnails(
        &self,
        session: &Session,
        photos: &[Photo],
        size: u32,
        cancel: &CancelToken,
    ) -> Vec<(String, Result<Thumbnail>)> {
        photos
            .par_iter()
            .map(|photo| (photo.id.clone(), self.thumbnail(session, photo, size, cancel)))
            .collect()
    }

    fn fetch_original(&self, session: &Session, photo: &Photo, cancel: &CancelToken) -> Result<Vec<u8>> {
        let originals = self.config.cache_dir.join("originals");
        fs::create_dir_all(&originals)?;
        let local = originals.join(format!("{}.{}", photo.id, photo.extension()));
        session.pull(&photo.remote_path, &local, cancel)?;
        let data = fs::read(&local)?;
        if let Err(e) = fs::remove_file(&local) {
            debug!("Could not remove {}: {}", local.display(), e);
        }
        Ok(data)
    }

    fn generate(&self, photo: &Photo, size: u32, original: &[u8]) -> Result<Thumbnail> {
        let failure = |message: String| ExtractionError::Thumbnail {
            photo_id: photo.id.clone(),
            message,
        };

        let image = image::load_from_memory(original).map_err(|e| failure(format!("decode: {}", e)))?;
        let resized = image.thumbnail(size, size).to_rgb8();

        let mut data = Vec::new();
        JpegEncoder::new_with_quality(&mut data, self.config.quality.clamp(1, 100))
            .encode_image(&resized)
            .map_err(|e| failure(format!("encode: {}", e)))?;

        debug!(
            "Thumbnail {} ({}x{} -> {}x{})",
            photo.id,
            image.width(),
            image.height(),
            resized.width(),
            resized.height()
        );
        Ok(Thumbnail {
            photo_id: photo.id.clone(),
            size,
            data,
            width: resized.width(),
            height: resized.height(),
            mime_type: "image/jpeg".to_string(),
            generated_at: Instant::now(),
        })
    }

    fn load_cached(&self, photo: &Photo, size: u32, data: Vec<u8>) -> Result<Thumbnail> {
        let decoded = image::load_from_memory(&data).map_err(|e| ExtractionError::Thumbnail {
            photo_id: photo.id.clone(),
            message: e.to_string(),
        })?;
        Ok(Thumbnail {
            photo_id: photo.id.clone(),
            size,
            width: decoded.width(),
            height: decoded.height(),
            data,
            mime_type: "image/jpeg".to_string(),
            generated_at: Instant::now(),
        })
    }
}
