//! Command handler implementations
//!
//! This module contains the implementation of all CLI commands.

use crate::cli::progress::{
    print_error, print_header, print_info, print_success, print_summary, print_warning, DownloadProgress,
    ExtractionProgress,
};
use crate::cli::{Args, Commands};
use crate::core::cancel::CancelToken;
use crate::core::config::{init_config, Config};
use crate::core::coordinator::{DomainFilters, ExtractionCoordinator, ExtractionEvent, ExtractionSummary};
use crate::core::error::ExtractionError;
use crate::device::{self, Capability, Device, DeviceDescriptor, DeviceProfile, ProfileStore, TransportBackend, TransportKind};
use crate::extract::{ContactFilter, ContactsExtractor, Domain, PhotoExtractor, SmsFilter, ThumbnailCache};
use crate::session::{DeviceSessionManager, HeartbeatMonitor, Session, SessionRegistry};
use crate::testdb::{MockBackend, MockDataGenerator, MockTransport};
use anyhow::{bail, Context, Result};
use dialoguer::Select;
use log::{debug, info, warn};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Run the appropriate command based on CLI arguments
pub fn run_command(args: &Args, config: &Config, shutdown_flag: Arc<AtomicBool>) -> Result<()> {
    let cancel = CancelToken::from_flag(shutdown_flag);

    match &args.command {
        Some(Commands::Config { path, reset }) => handle_config_command(*path, *reset),
        Some(Commands::GenerateConfig { output }) => generate_config_file(output.clone()),
        Some(Commands::ShowConfig) => show_config(config),
        Some(Commands::List) | None => list_devices(args, config),
        Some(Commands::Info) => device_info(args, config),
        Some(Commands::Permissions { request }) => permissions(args, config, *request, &cancel),
        Some(Commands::Extract { domains, json, keyword }) => {
            extract_records(args, config, domains, *json, keyword.clone(), cancel)
        }
        Some(Commands::Download { id, all, dest }) => download_photos(args, config, id, *all, dest, &cancel),
        Some(Commands::Thumbnail { id, size, dest }) => {
            make_thumbnail(args, config, id, *size, dest.as_deref(), &cancel)
        }
        Some(Commands::Groups) => list_groups(args, config, &cancel),
        Some(Commands::Simulate {
            seed,
            contacts,
            sms,
            photos,
            latency_ms,
            disconnect_after,
            json,
        }) => {
            let options = SimulateOptions {
                seed: *seed,
                contacts: *contacts,
                sms: *sms,
                photos: *photos,
                latency: Duration::from_millis(*latency_ms),
                disconnect_after: *disconnect_after,
                json: *json,
            };
            simulate(config, &options, cancel)
        }
    }
}

// ============================================================================
// Configuration commands
// ============================================================================

/// Show the config path, or (re)create the config file
pub fn handle_config_command(show_path: bool, reset: bool) -> Result<()> {
    if reset {
        let path = init_config(true)?;
        info!("Created fresh config file at: {}", path.display());
        return Ok(());
    }

    if show_path {
        let path = Config::get_active_config_path();
        println!("{}", path.display());
        if !path.exists() {
            info!("Config file would be created at: {}", path.display());
        }
        return Ok(());
    }

    let path = init_config(false)?;
    println!("{}", path.display());
    info!("Edit this file to change transport, session and extraction settings.");
    info!("Run 'android-extractor show-config' to verify your settings.");
    Ok(())
}

/// Generate a configuration file at the specified or default location
pub fn generate_config_file(output: Option<PathBuf>) -> Result<()> {
    let output_path = match output {
        Some(path) => {
            fs::write(&path, Config::generate_default_config())
                .with_context(|| format!("Failed to write {}", path.display()))?;
            path
        }
        None => init_config(false)?,
    };
    info!("Configuration file: {}", output_path.display());
    Ok(())
}

/// Print the effective configuration
pub fn show_config(config: &Config) -> Result<()> {
    let config_path = Config::get_active_config_path();
    println!("# Configuration file: {}", config_path.display());
    if !config_path.exists() {
        println!("# (Using default settings - no config file found)");
    }
    println!();
    print!("{}", toml::to_string_pretty(config)?);
    Ok(())
}

// ============================================================================
// Device commands
// ============================================================================

fn build_manager(args: &Args, config: &Config) -> Result<DeviceSessionManager> {
    let profiles = ProfileStore::load(&config.profiles.store_file)?;
    let backends = device::default_backends(&config.transport);
    let manager = DeviceSessionManager::new(
        backends,
        Arc::new(SessionRegistry::new()),
        profiles,
        config.session.retry_policy(),
    );
    Ok(manager
        .with_default_preference(args.transport.or(config.transport.preferred))
        .with_permission_requests(config.session.request_permissions))
}

fn describe(device: &Device) -> String {
    let transports: Vec<String> = device.available_transports.iter().map(|t| t.to_string()).collect();
    format!(
        "{} {} [{}] via {}",
        device.manufacturer,
        device.model,
        device.serial_id,
        if transports.is_empty() { "-".to_string() } else { transports.join("+") }
    )
}

/// Pick the device to work on: `--device`, the only one, or a prompt
fn select_device(devices: &[Device], requested: Option<&str>) -> Result<Device> {
    if let Some(requested) = requested {
        return devices
            .iter()
            .find(|d| d.serial_id == requested)
            .or_else(|| {
                let needle = requested.to_lowercase();
                devices.iter().find(|d| d.model.to_lowercase().contains(&needle))
            })
            .cloned()
            .ok_or_else(|| ExtractionError::DeviceNotFound(requested.to_string()).into());
    }

    match devices {
        [] => bail!("No Android devices found. Check the USB cable and that USB debugging or file transfer is enabled."),
        [only] => Ok(only.clone()),
        _ => {
            let labels: Vec<String> = devices.iter().map(describe).collect();
            let choice = Select::new()
                .with_prompt("Multiple devices detected, select one")
                .items(&labels)
                .default(0)
                .interact()?;
            Ok(devices[choice].clone())
        }
    }
}

/// A connected session plus what keeps it alive
struct ActiveSession {
    manager: DeviceSessionManager,
    session: Arc<Session>,
    monitor: HeartbeatMonitor,
}

impl ActiveSession {
    fn open(manager: DeviceSessionManager, args: &Args, config: &Config) -> Result<Self> {
        let devices = manager.discover()?;
        let device = select_device(&devices, args.device.as_deref())?;
        let connection = manager.connect(&device.serial_id, args.transport)?;
        if let Some(substitution) = &connection.substitution {
            warn!(
                "Using {} instead of {}: {}",
                substitution.actual, substitution.requested, substitution.reason
            );
        }
        let session = connection.session;
        info!(
            "Connected to {} ({}) over {}",
            session.model(),
            session.serial(),
            session.transport_kind()
        );
        let monitor = manager.monitor(&session, config.session.heartbeat_interval());
        Ok(Self {
            manager,
            session,
            monitor,
        })
    }

    fn close(self) {
        self.monitor.stop();
        self.manager.registry().shutdown();
    }
}

pub fn list_devices(args: &Args, config: &Config) -> Result<()> {
    let manager = build_manager(args, config)?;
    let devices = manager.discover()?;
    if devices.is_empty() {
        print_warning("No Android devices found.");
        return Ok(());
    }

    print_header(&format!("{} device(s)", devices.len()));
    for device in &devices {
        print_info(&describe(device));
        if let Some(version) = &device.android_version {
            println!("      Android {}", version);
        }
        for kind in &device.unauthorized_transports {
            println!("      {} refused this host; accept the prompt on the phone", kind);
        }
    }
    Ok(())
}

pub fn device_info(args: &Args, config: &Config) -> Result<()> {
    let active = ActiveSession::open(build_manager(args, config)?, args, config)?;
    let session = &active.session;
    let device = active.manager.device(session.serial());

    print_header(session.model());
    println!("  Serial:      {}", session.serial());
    if let Some(device) = &device {
        println!("  Maker:       {}", device.manufacturer);
        println!(
            "  Android:     {}",
            device.android_version.as_deref().unwrap_or("unknown")
        );
        let transports: Vec<String> = device.available_transports.iter().map(|t| t.to_string()).collect();
        println!("  Transports:  {}", transports.join(", "));
    }
    println!("  Active:      {}", session.transport_kind());
    println!("  Session:     #{} {}", session.id(), session.state());
    println!("  Profile:     {}", session.profile().name);
    println!();
    let permissions = session.permissions();
    for (capability, granted) in permissions.iter() {
        if *granted {
            print_success(&capability.to_string());
        } else {
            print_error(&format!("{} (denied)", capability));
        }
    }
    print_missing(&permissions.denied());

    active.close();
    Ok(())
}

fn print_missing(missing: &[Capability]) {
    if missing.is_empty() {
        return;
    }
    let names: Vec<String> = missing.iter().map(|c| c.to_string()).collect();
    println!();
    print_warning(&format!("Missing permissions: {}", names.join(", ")));
}

pub fn permissions(args: &Args, config: &Config, request: bool, cancel: &CancelToken) -> Result<()> {
    let active = ActiveSession::open(build_manager(args, config)?, args, config)?;
    let session = &active.session;

    let before = session.permissions().denied();
    let result = if request && !before.is_empty() {
        print_info(&format!("Requesting {} permission(s) from {}", before.len(), session.model()));
        active.manager.request_permissions(session, &before, cancel)
    } else {
        Ok(session.permissions())
    };
    let after = match result {
        Ok(state) => state,
        Err(e) => {
            active.close();
            return Err::<(), _>(e).context("permission request failed");
        }
    };

    for capability in before.iter().filter(|c| after.is_granted(**c)) {
        print_success(&format!("{} granted", capability));
    }
    let missing = after.denied();
    if missing.is_empty() {
        print_success("All permissions granted");
    } else {
        print_missing(&missing);
        if !request && session.transport_kind() == TransportKind::Adb {
            print_info("Run with --request to ask the device to grant them");
        }
    }

    active.close();
    Ok(())
}

// ============================================================================
// Extraction
// ============================================================================

fn extract_records(
    args: &Args,
    config: &Config,
    domains: &[Domain],
    json: bool,
    keyword: Option<String>,
    cancel: CancelToken,
) -> Result<()> {
    let domains = if domains.is_empty() { Domain::ALL.to_vec() } else { domains.to_vec() };
    let filters = DomainFilters {
        contacts: keyword.clone().map(|k| ContactFilter {
            keyword: Some(k),
            ..ContactFilter::default()
        }),
        sms: keyword.map(|k| SmsFilter {
            keyword: Some(k),
            ..SmsFilter::default()
        }),
        photos: None,
    };

    let active = ActiveSession::open(build_manager(args, config)?, args, config)?;
    let coordinator = ExtractionCoordinator::new(config.extraction.clone()).with_filters(filters);
    let result = run_extraction(&coordinator, &active.session, &domains, json, cancel);
    active.close();
    result.map(|_| ())
}

/// Run the coordinator, streaming records to stdout when `json` is set
fn run_extraction(
    coordinator: &ExtractionCoordinator,
    session: &Arc<Session>,
    domains: &[Domain],
    json: bool,
    cancel: CancelToken,
) -> Result<ExtractionSummary> {
    let started = Instant::now();
    let mut progress = if json {
        ExtractionProgress::hidden()
    } else {
        ExtractionProgress::new(domains)
    };

    let handle = coordinator.start(session, domains, cancel);
    let stdout = io::stdout();
    let mut out = stdout.lock();
    for event in handle.events().iter() {
        match event {
            ExtractionEvent::Record(record) => {
                progress.record(record.domain());
                if json {
                    let written = serde_json::to_writer(&mut out, &record)
                        .map_err(io::Error::from)
                        .and_then(|_| writeln!(out));
                    if let Err(e) = written {
                        debug!("stdout closed: {}", e);
                        handle.cancel();
                        break;
                    }
                }
            }
            ExtractionEvent::Finished { domain, records, failed } => {
                progress.finished(domain, records, failed);
                if failed {
                    progress.log(&format!("{} stopped early", domain));
                }
            }
        }
    }
    drop(out);

    let summary = handle.wait();
    progress.finish();
    if json {
        info!("{}", summary);
    } else {
        print_summary(&summary, started.elapsed());
    }
    for domain in summary.failed_domains() {
        warn!("{} extraction did not complete", domain);
    }
    Ok(summary)
}

fn download_photos(
    args: &Args,
    config: &Config,
    ids: &[String],
    all: bool,
    dest: &Path,
    cancel: &CancelToken,
) -> Result<()> {
    let active = ActiveSession::open(build_manager(args, config)?, args, config)?;
    let result = (|| -> Result<()> {
        let extractor = PhotoExtractor::new(&config.extraction);
        let scan = extractor.scan(&active.session, cancel)?;
        let photos: Vec<_> = if all {
            scan.photos
        } else {
            let wanted: Vec<_> = scan.photos.into_iter().filter(|p| ids.contains(&p.id)).collect();
            for id in ids {
                if !wanted.iter().any(|p| &p.id == id) {
                    print_warning(&format!("No photo with id {}", id));
                }
            }
            wanted
        };
        if photos.is_empty() {
            print_warning("Nothing to download.");
            return Ok(());
        }

        let mut progress = DownloadProgress::new(photos.len() as u64);
        let mut failed = 0usize;
        for photo in &photos {
            match extractor.download(&active.session, photo, dest, cancel) {
                Ok(path) => {
                    debug!("Saved {}", path.display());
                    progress.file_completed(&photo.file_name, photo.file_size);
                }
                Err(ExtractionError::Cancelled) => {
                    progress.log_warning("Download cancelled");
                    break;
                }
                Err(e) => {
                    failed += 1;
                    progress.log_warning(&format!("{}: {}", photo.file_name, e));
                    if active.session.is_lost() {
                        break;
                    }
                }
            }
        }
        progress.finish();
        if failed > 0 {
            print_warning(&format!("{} photo(s) failed to download", failed));
        }
        print_success(&format!("Photos saved to {}", dest.display()));
        Ok(())
    })();
    active.close();
    result
}

fn make_thumbnail(
    args: &Args,
    config: &Config,
    id: &str,
    size: Option<u32>,
    dest: Option<&Path>,
    cancel: &CancelToken,
) -> Result<()> {
    let active = ActiveSession::open(build_manager(args, config)?, args, config)?;
    let result = (|| -> Result<()> {
        let scan = PhotoExtractor::new(&config.extraction).scan(&active.session, cancel)?;
        let photo = scan
            .photos
            .iter()
            .find(|p| p.id == id)
            .with_context(|| format!("No photo with id {}", id))?;

        let cache = ThumbnailCache::new(config.thumbnails.clone());
        let size = size.unwrap_or_else(|| cache.default_size());
        let thumbnail = cache.thumbnail(&active.session, photo, size, cancel)?;
        match dest {
            Some(path) => {
                fs::write(path, &thumbnail.data).with_context(|| format!("Failed to write {}", path.display()))?;
                print_success(&format!(
                    "{}x{} thumbnail of {} written to {}",
                    thumbnail.width,
                    thumbnail.height,
                    photo.file_name,
                    path.display()
                ));
            }
            None => println!("{}", thumbnail.as_data_url()),
        }
        Ok(())
    })();
    active.close();
    result
}

fn list_groups(args: &Args, config: &Config, cancel: &CancelToken) -> Result<()> {
    let active = ActiveSession::open(build_manager(args, config)?, args, config)?;
    let groups = ContactsExtractor::new(&config.extraction).groups(&active.session, cancel);
    active.close();

    let groups = groups?;
    if groups.is_empty() {
        print_info("No contact groups on this device.");
    }
    for group in groups {
        println!("  {:>4}  {}", group.id, group.title);
    }
    Ok(())
}

// ============================================================================
// Simulation
// ============================================================================

struct SimulateOptions {
    seed: u64,
    contacts: usize,
    sms: usize,
    photos: usize,
    latency: Duration,
    disconnect_after: Option<usize>,
    json: bool,
}

/// Full discover/connect/extract cycle against a generated device
fn simulate(config: &Config, options: &SimulateOptions, cancel: CancelToken) -> Result<()> {
    let profile = DeviceProfile::default();
    let data = MockDataGenerator::new(options.seed)
        .contacts(options.contacts)
        .sms(options.sms)
        .photos("DCIM/Camera", options.photos)
        .build(&profile);

    let serial = format!("SIM{:05}", options.seed % 100_000);
    let transport = Arc::new(MockTransport::adb(&serial, data));
    transport.set_latency(options.latency);
    if let Some(rows) = options.disconnect_after {
        transport.disconnect_after_rows(rows);
    }
    let backend = MockBackend::new(TransportKind::Adb);
    backend.attach(
        DeviceDescriptor::new(&serial, "Simulated Pixel", "Google").with_android_version("14"),
        Arc::clone(&transport),
    );

    let backends: Vec<Arc<dyn TransportBackend>> = vec![Arc::new(backend)];
    let manager = DeviceSessionManager::new(
        backends,
        Arc::new(SessionRegistry::new()),
        ProfileStore::new(),
        config.session.retry_policy(),
    );
    manager.discover()?;
    let session = manager.connect(&serial, None)?.session;
    info!("Simulating {} (seed {})", serial, options.seed);

    let coordinator = ExtractionCoordinator::new(config.extraction.clone());
    let summary = run_extraction(&coordinator, &session, &Domain::ALL, options.json, cancel)?;
    if !options.json {
        print_info(&format!(
            "{} transport calls, session {}",
            transport.call_count(),
            session.state()
        ));
    }
    manager.registry().shutdown();

    if !summary.is_complete() && !summary.cancelled {
        bail!("simulated extraction did not complete: {}", summary);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn device(serial: &str, model: &str) -> Device {
        let mut device = Device::from_descriptor(&DeviceDescriptor::new(serial, model, "Google"), TransportKind::Adb);
        device.available_transports = BTreeSet::from([TransportKind::Adb]);
        device
    }

    #[test]
    fn test_select_device_by_serial_or_model() {
        let devices = vec![device("AAA", "Pixel 8"), device("BBB", "SM-S928B")];
        assert_eq!(select_device(&devices, Some("BBB")).unwrap().serial_id, "BBB");
        assert_eq!(select_device(&devices, Some("pixel")).unwrap().serial_id, "AAA");
        assert!(select_device(&devices, Some("nope")).is_err());
    }

    #[test]
    fn test_select_only_device() {
        let devices = vec![device("AAA", "Pixel 8")];
        assert_eq!(select_device(&devices, None).unwrap().serial_id, "AAA");
        assert!(select_device(&[], None).is_err());
    }

    #[test]
    fn test_describe() {
        assert_eq!(describe(&device("AAA", "Pixel 8")), "Google Pixel 8 [AAA] via ADB");
    }

    #[test]
    fn test_simulate_runs_to_completion() {
        let mut config = Config::default();
        config.session.backoff_base_ms = 1;
        config.session.backoff_max_ms = 1;
        let options = SimulateOptions {
            seed: 3,
            contacts: 10,
            sms: 20,
            photos: 5,
            latency: Duration::ZERO,
            disconnect_after: None,
            json: true,
        };
        simulate(&config, &options, CancelToken::new()).unwrap();
    }

    #[test]
    fn test_generate_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        generate_config_file(Some(path.clone())).unwrap();
        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.extraction.page_size, Config::default().extraction.page_size);
    }
}
