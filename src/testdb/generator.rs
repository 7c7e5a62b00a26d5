//! Mock data generator for simulated devices
//!
//! Generates contacts, SMS threads and photo trees from a seed, so the same
//! seed always yields the same device. Photo payloads are real, decodable
//! images kept small to keep tests fast.

use crate::device::DeviceProfile;
use crate::testdb::mock_device::{MockDeviceData, SmsSeed};
use chrono::{DateTime, Duration, TimeZone, Utc};
use image::codecs::jpeg::JpegEncoder;
use image::{ImageBuffer, ImageFormat, ImageResult, Rgb};
use log::warn;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::io::Cursor;

/// Base timestamp for generated data (2024-01-01 00:00:00 UTC)
pub const BASE_TIMESTAMP: i64 = 1_704_067_200;

/// Edge length of generated photo payloads
const PHOTO_WIDTH: u32 = 48;
const PHOTO_HEIGHT: u32 = 32;

const FIRST_NAMES: &[&str] = &[
    "Ada", "Alan", "Grace", "Linus", "Margaret", "Dennis", "Barbara", "Ken", "Frances", "Edsger", "Radia", "Tim",
];
const LAST_NAMES: &[&str] = &[
    "Lovelace", "Turing", "Hopper", "Torvalds", "Hamilton", "Ritchie", "Liskov", "Thompson", "Allen", "Dijkstra",
    "Perlman", "Berners-Lee",
];
const GROUPS: &[&str] = &["Family", "Friends", "Work"];
const PHRASES: &[&str] = &[
    "Running late, be there in 10",
    "Did you see the game?",
    "Call me when you can",
    "Thanks!",
    "Meeting moved to 3pm, room B",
    "Happy birthday 🎉",
    "Can you pick up milk, eggs, and bread?",
    "ok",
];
const SHORT_CODES: &[&str] = &["BANK", "72975", "Verizon"];

/// Deterministic image bytes with a colour gradient
fn gradient(width: u32, height: u32, seed: u64) -> ImageBuffer<Rgb<u8>, Vec<u8>> {
    let tint = (seed % 251) as u8;
    ImageBuffer::from_fn(width.max(1), height.max(1), |x, y| {
        Rgb([
            (x * 255 / width.max(1)) as u8,
            (y * 255 / height.max(1)) as u8,
            tint,
        ])
    })
}

/// PNG of the given size
pub fn png_payload(width: u32, height: u32, seed: u64) -> ImageResult<Vec<u8>> {
    let mut out = Cursor::new(Vec::new());
    gradient(width, height, seed).write_to(&mut out, ImageFormat::Png)?;
    Ok(out.into_inner())
}

/// JPEG of the given size; JPEG caps each edge at 65535 pixels
pub fn jpeg_payload(width: u32, height: u32, seed: u64) -> ImageResult<Vec<u8>> {
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, 80).encode_image(&gradient(width, height, seed))?;
    Ok(out)
}

/// Builder for a generated device
pub struct MockDataGenerator {
    rng: StdRng,
    contacts: usize,
    sms: usize,
    photo_folders: Vec<(String, usize)>,
}

impl MockDataGenerator {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            contacts: 0,
            sms: 0,
            photo_folders: Vec::new(),
        }
    }

    pub fn contacts(mut self, count: usize) -> Self {
        self.contacts = count;
        self
    }

    pub fn sms(mut self, count: usize) -> Self {
        self.sms = count;
        self
    }

    /// `count` camera-style JPEGs in `folder` (relative to the storage root)
    pub fn photos(mut self, folder: &str, count: usize) -> Self {
        self.photo_folders.push((folder.trim_matches('/').to_string(), count));
        self
    }

    fn phone_number(&mut self) -> String {
        let exchange = self.rng.gen_range(200..1000);
        let line = self.rng.gen_range(0..10_000);
        match self.rng.gen_range(0..3) {
            0 => format!("(555) {}-{:04}", exchange, line),
            1 => format!("+1 555 {} {:04}", exchange, line),
            _ => format!("555{}{:04}", exchange, line),
        }
    }

    fn timestamp(&self, offset_secs: i64) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(BASE_TIMESTAMP + offset_secs, 0).single()
    }

    /// Generate the device content for `profile`
    pub fn build(mut self, profile: &DeviceProfile) -> MockDeviceData {
        let mut data = MockDeviceData::default();
        let root = profile.storage_root.trim_end_matches('/').to_string();
        for folder in profile.photo_folders() {
            data.add_dir(&folder);
        }

        for (index, title) in GROUPS.iter().enumerate() {
            data.add_group(profile, index as u64 + 1, title);
        }

        // provider order is not id order on real devices
        let mut ids: Vec<u64> = (1..=self.contacts as u64).collect();
        ids.shuffle(&mut self.rng);
        for id in ids {
            let first = *FIRST_NAMES.choose(&mut self.rng).unwrap_or(&"Ada");
            let last = *LAST_NAMES.choose(&mut self.rng).unwrap_or(&"Lovelace");
            let name = format!("{} {}", first, last);
            let phones: Vec<String> = (0..self.rng.gen_range(0..3)).map(|_| self.phone_number()).collect();
            let emails: Vec<String> = if self.rng.gen_bool(0.5) {
                vec![format!("{}.{}{}@Example.com", first, last, id)]
            } else {
                Vec::new()
            };
            let groups: Vec<u64> = (1..=GROUPS.len() as u64).filter(|_| self.rng.gen_bool(0.3)).collect();

            let phones: Vec<&str> = phones.iter().map(String::as_str).collect();
            let emails: Vec<&str> = emails.iter().map(String::as_str).collect();
            data.add_contact(profile, id, &name, &phones, &emails, &groups);
        }

        let peers: Vec<String> = (0..5)
            .map(|_| self.phone_number())
            .chain(SHORT_CODES.iter().map(|s| s.to_string()))
            .collect();
        let mut offset = 0i64;
        for id in 1..=self.sms as u64 {
            offset += self.rng.gen_range(30..7_200);
            let peer_index = self.rng.gen_range(0..peers.len());
            let outbound = self.rng.gen_bool(0.4);
            let mut body = PHRASES.choose(&mut self.rng).unwrap_or(&"ok").to_string();
            if self.rng.gen_bool(0.1) {
                body.push_str("\nsent from my phone");
            }
            let millis = (BASE_TIMESTAMP + offset) * 1000;
            data.add_sms(
                profile,
                SmsSeed {
                    id,
                    thread_id: Some(peer_index as u64 + 1),
                    address: peers[peer_index].clone(),
                    date: millis.to_string(),
                    message_type: if outbound { "2" } else { "1" }.to_string(),
                    status: "-1".to_string(),
                    read: outbound || self.rng.gen_bool(0.8),
                    body,
                },
            );
        }

        let folders = std::mem::take(&mut self.photo_folders);
        for (folder, count) in folders {
            data.add_dir(&format!("{}/{}", root, folder));
            let mut offset = 0i64;
            for index in 0..count {
                offset += self.rng.gen_range(60..86_400);
                let taken = self.timestamp(offset);
                let stamp = taken
                    .map(|t| t.format("%Y%m%d_%H%M%S").to_string())
                    .unwrap_or_else(|| format!("{:08}", index));
                let path = format!("{}/{}/IMG_{}.jpg", root, folder, stamp);
                match jpeg_payload(PHOTO_WIDTH, PHOTO_HEIGHT, index as u64) {
                    Ok(payload) => data.add_file(&path, payload, taken),
                    Err(e) => warn!("Skipping generated photo {}: {}", path, e),
                }
            }
        }

        // unrelated files the photo scan must ignore
        data.add_file(
            &format!("{}/Download/readme.txt", root),
            b"not a photo".to_vec(),
            self.timestamp(0),
        );
        data.add_file(
            &format!("{}/DCIM/.thumbnails/.nomedia", root),
            Vec::new(),
            self.timestamp(0),
        );
        data
    }
}

/// Offset helper for tests that need explicit timestamps
pub fn at_offset(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(BASE_TIMESTAMP, 0)
        .single()
        .unwrap_or_default()
        + Duration::seconds(seconds)
}
