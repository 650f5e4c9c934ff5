//! Sluice CLI Library
//!
//! Shared functionality for the sluice command-line tools.

pub mod config;
pub mod stats;

pub use config::{ConfigError, SenderConfig};
pub use stats::{
    display_compact_stats, display_counters, format_bytes, format_duration, format_rate,
    format_term_position,
};
