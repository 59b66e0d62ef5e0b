//! # Revcache Common
//!
//! Logging configuration and small helpers shared by the revcache crates.
//!
//! ## Features
//!
//! - Subscriber setup with env filtering and pretty/compact/JSON output
//! - Wall-clock helpers for cache timestamps

use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub mod logging;

pub use logging::{init_logging, LogConfig, LogFormat};

/// Milliseconds since the Unix epoch.
///
/// A clock set before 1970 reads as zero rather than failing.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}
