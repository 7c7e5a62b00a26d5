//! Progress display for CLI operations
//!
//! One spinner per extraction domain, a bar for photo downloads, and the
//! console helpers used by the command handlers. Spinners suspend while
//! log lines are printed so output stays readable.

use crate::core::coordinator::{DomainOutcome, ExtractionSummary};
use crate::extract::Domain;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::BTreeMap;
use std::io::Write;
use std::time::{Duration, Instant};

// ============================================================================
// Styles
// ============================================================================

fn spinner_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("{spinner:.cyan} {prefix:<9} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
        .tick_chars("⣾⣽⣻⢿⡿⣟⣯⣷ ")
}

fn download_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("  {spinner:.green} [{bar:40.cyan/dim}] {pos}/{len} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("━━╾─")
}

// ============================================================================
// Console output helpers
// ============================================================================

/// Print a header section with a box
pub fn print_header(title: &str) {
    let width = 60;
    println!();
    println!("╔{}╗", "═".repeat(width - 2));
    println!("║{:^w$}║", title, w = width - 2);
    println!("╚{}╝", "═".repeat(width - 2));
    println!();
}

pub fn print_success(msg: &str) {
    println!("  ✓ {}", msg);
}

pub fn print_info(msg: &str) {
    println!("  • {}", msg);
}

pub fn print_warning(msg: &str) {
    println!("  ⚠ {}", msg);
}

pub fn print_error(msg: &str) {
    println!("  ✗ {}", msg);
}

// ============================================================================
// Extraction progress
// ============================================================================

/// A spinner per running domain
pub struct ExtractionProgress {
    multi: MultiProgress,
    spinners: BTreeMap<Domain, ProgressBar>,
    counts: BTreeMap<Domain, usize>,
    start_time: Instant,
}

impl ExtractionProgress {
    pub fn new(domains: &[Domain]) -> Self {
        let multi = MultiProgress::new();
        let mut spinners = BTreeMap::new();
        for domain in domains {
            if spinners.contains_key(domain) {
                continue;
            }
            let spinner = multi.add(ProgressBar::new_spinner());
            spinner.set_style(spinner_style());
            spinner.set_prefix(domain.to_string());
            spinner.set_message("waiting for device...");
            spinner.enable_steady_tick(Duration::from_millis(100));
            spinners.insert(*domain, spinner);
        }
        Self {
            multi,
            spinners,
            counts: BTreeMap::new(),
            start_time: Instant::now(),
        }
    }

    /// Hidden progress for `--json`, where stdout carries the records
    pub fn hidden() -> Self {
        Self {
            multi: MultiProgress::with_draw_target(indicatif::ProgressDrawTarget::hidden()),
            spinners: BTreeMap::new(),
            counts: BTreeMap::new(),
            start_time: Instant::now(),
        }
    }

    pub fn record(&mut self, domain: Domain) {
        let count = self.counts.entry(domain).or_default();
        *count += 1;
        if let Some(spinner) = self.spinners.get(&domain) {
            if *count % 25 == 1 {
                spinner.set_message(format!("{} records", count));
            }
        }
    }

    pub fn finished(&self, domain: Domain, records: usize, failed: bool) {
        if let Some(spinner) = self.spinners.get(&domain) {
            let mark = if failed { "✗" } else { "✓" };
            spinner.finish_with_message(format!("{} {} records", mark, records));
        }
    }

    /// Print a line without tearing the spinners
    pub fn log(&self, msg: &str) {
        let _ = self.multi.println(format!("  {}", msg));
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn finish(&self) {
        for spinner in self.spinners.values() {
            if !spinner.is_finished() {
                spinner.finish_and_clear();
            }
        }
    }
}

/// Print the per-domain outcome table
pub fn print_summary(summary: &ExtractionSummary, elapsed: Duration) {
    println!();
    for (domain, outcome) in &summary.outcomes {
        print_outcome(*domain, outcome);
    }
    println!();
    print_info(&format!(
        "{} records, {} warnings in {}",
        summary.total_records(),
        summary.total_warnings(),
        format_duration(elapsed)
    ));
    if summary.cancelled {
        print_warning("Extraction was cancelled; the session can be reused.");
    }
}

fn print_outcome(domain: Domain, outcome: &DomainOutcome) {
    match &outcome.error {
        None => print_success(&format!(
            "{:<9} {} records, {} warnings",
            domain,
            outcome.records,
            outcome.warnings.len()
        )),
        Some(failure) => {
            print_error(&format!(
                "{:<9} stopped after {} records: {}",
                domain, failure.delivered, failure.message
            ));
            if failure.retryable {
                println!("      retry by running the command again once the device is reconnected");
            }
        }
    }
}

// ============================================================================
// Download progress
// ============================================================================

pub struct DownloadProgress {
    bar: ProgressBar,
    bytes: u64,
    start_time: Instant,
}

impl DownloadProgress {
    pub fn new(total: u64) -> Self {
        let bar = ProgressBar::new(total);
        bar.set_style(download_style());
        bar.enable_steady_tick(Duration::from_millis(100));
        Self {
            bar,
            bytes: 0,
            start_time: Instant::now(),
        }
    }

    pub fn file_completed(&mut self, file_name: &str, bytes: u64) {
        self.bytes += bytes;
        self.bar.inc(1);
        let elapsed = self.start_time.elapsed().as_secs_f64();
        let rate = if elapsed > 0.0 {
            self.bytes as f64 / elapsed
        } else {
            0.0
        };
        self.bar.set_message(format!("{} ({}/s)", file_name, format_bytes(rate as u64)));
    }

    pub fn log_warning(&self, msg: &str) {
        self.bar.suspend(|| println!("  ⚠ {}", msg));
    }

    pub fn finish(&self) {
        self.bar.finish_with_message(format!(
            "{} in {}",
            format_bytes(self.bytes),
            format_duration(self.start_time.elapsed())
        ));
    }
}

// ============================================================================
// Utility functions
// ============================================================================

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}

/// Format duration as human-readable string
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs >= 3600 {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{:.1}s", duration.as_secs_f64())
    }
}

// ============================================================================
// Dual writer for file + console logging
// ============================================================================

/// Tees log output to stderr and the log file
pub struct DualWriter {
    pub console: std::io::Stderr,
    pub file: std::fs::File,
}

impl Write for DualWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let _ = self.console.write(buf);
        self.file.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let _ = self.console.flush();
        self.file.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(500), "500 bytes");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(1048576), "1.00 MB");
        assert_eq!(format_bytes(1073741824), "1.00 GB");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(30)), "30.0s");
        assert_eq!(format_duration(Duration::from_secs(90)), "1m 30s");
        assert_eq!(format_duration(Duration::from_secs(3661)), "1h 1m");
    }

    #[test]
    fn test_hidden_progress_counts() {
        let mut progress = ExtractionProgress::hidden();
        progress.record(Domain::Sms);
        progress.record(Domain::Sms);
        progress.finished(Domain::Sms, 2, false);
        assert_eq!(progress.counts.get(&Domain::Sms), Some(&2));
    }

    #[test]
    fn test_dual_writer_writes_file() {
        let mut file = tempfile::tempfile().unwrap();
        {
            let mut writer = DualWriter {
                console: std::io::stderr(),
                file: file.try_clone().unwrap(),
            };
            writer.write_all(b"hello log\n").unwrap();
            writer.flush().unwrap();
        }
        use std::io::Seek;
        file.seek(std::io::SeekFrom::Start(0)).unwrap();
        let mut content = String::new();
        file.read_to_string(&mut content).unwrap();
        assert_eq!(content, "hello log\n");
    }
}
