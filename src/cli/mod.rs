//! CLI module for the Android extraction tool
//!
//! This module contains all command-line interface related code including
//! argument parsing, command definitions, and command handlers.
//!
//! # Submodules
//!
//! - `args` - Command-line argument definitions using clap
//! - `commands` - Command handler implementations
//! - `progress` - Spinners, download bar and console output helpers

pub mod args;
pub mod commands;
pub mod progress;

pub use args::{Args, Commands};
pub use commands::run_command;
pub use progress::DualWriter;
