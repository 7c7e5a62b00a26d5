//! Core functionality module
//!
//! Configuration, the error taxonomy, cooperative cancellation and the
//! extraction coordinator.
//!
//! # Submodules
//!
//! - `cancel` - Cancellation token shared by extractors and the transport gate
//! - `config` - Configuration loading, saving, and management
//! - `coordinator` - Concurrent per-domain extraction against one session
//! - `error` - Error types and result aliases

pub mod cancel;
pub mod config;
pub mod coordinator;
pub mod error;
