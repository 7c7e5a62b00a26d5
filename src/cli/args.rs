//! Command-line argument definitions
//!
//! This module defines all CLI arguments and subcommands using clap.

use crate::device::TransportKind;
use crate::extract::Domain;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Extract contacts, SMS and photos from Android devices over ADB or MTP
#[derive(Parser, Debug)]
#[command(name = "android-extractor")]
#[command(version)]
#[command(about = "Extract contacts, SMS and photos from Android devices over USB (ADB/MTP)", long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Path to configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level: error, warn, info, debug, trace (overrides config)
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,

    /// Serial of the device to use (prompts when several are attached)
    #[arg(short, long, global = true)]
    pub device: Option<String>,

    /// Preferred transport: adb or mtp (overrides config)
    #[arg(short, long, global = true, value_parser = parse_transport)]
    pub transport: Option<TransportKind>,
}

fn parse_transport(value: &str) -> Result<TransportKind, String> {
    value.parse()
}

fn parse_domain(value: &str) -> Result<Domain, String> {
    value.parse()
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List attached Android devices
    List,

    /// Show device details, transports and granted permissions
    Info,

    /// Show missing permissions, or ask the device to grant them (ADB only)
    Permissions {
        /// Run `pm grant` for every missing permission
        #[arg(long)]
        request: bool,
    },

    /// Extract records from the device
    Extract {
        /// Domains to extract (comma-separated): contacts, sms, photos
        #[arg(long, value_delimiter = ',', value_parser = parse_domain)]
        domains: Vec<Domain>,

        /// Print records as JSON lines to stdout
        #[arg(long)]
        json: bool,

        /// Only contacts and messages matching this keyword
        #[arg(short, long)]
        keyword: Option<String>,
    },

    /// Download photos to a local directory
    Download {
        /// Photo id (from `extract --domains photos`)
        #[arg(long, required_unless_present = "all")]
        id: Vec<String>,

        /// Download every photo
        #[arg(long)]
        all: bool,

        /// Destination directory
        #[arg(long, default_value = ".")]
        dest: PathBuf,
    },

    /// Generate a thumbnail for a photo
    Thumbnail {
        /// Photo id
        #[arg(long)]
        id: String,

        /// Longest edge in pixels (defaults to the configured size)
        #[arg(long)]
        size: Option<u32>,

        /// Where to write the JPEG (prints a data URL when omitted)
        #[arg(long)]
        dest: Option<PathBuf>,
    },

    /// List contact groups
    Groups,

    /// Show or reset the configuration file
    ///
    /// The config file is stored at:
    /// - Windows: %APPDATA%\android_extraction_tool\config.toml
    /// - Linux/macOS: ~/.config/android_extraction_tool/config.toml
    Config {
        /// Show the config file path
        #[arg(long)]
        path: bool,

        /// Reset config to defaults (creates a fresh config file)
        #[arg(long)]
        reset: bool,
    },

    /// Generate a configuration file at a specific location
    GenerateConfig {
        /// Output path for the config file (defaults to standard location)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show current configuration
    ShowConfig,

    /// Run an extraction against a generated mock device
    ///
    /// Useful to try the tool, and to see how it behaves on a flaky link,
    /// without a phone attached.
    Simulate {
        /// Seed for the generated device content
        #[arg(long, default_value = "42")]
        seed: u64,

        #[arg(long, default_value = "100")]
        contacts: usize,

        #[arg(long, default_value = "500")]
        sms: usize,

        #[arg(long, default_value = "100")]
        photos: usize,

        /// Simulated latency per transport call, in milliseconds
        #[arg(long, default_value = "0")]
        latency_ms: u64,

        /// Drop the connection after this many provider rows
        #[arg(long)]
        disconnect_after: Option<usize>,

        /// Print records as JSON lines to stdout
        #[arg(long)]
        json: bool,
    },
}
