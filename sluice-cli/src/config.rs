//! Configuration file support for the sluice sender

use serde::{Deserialize, Serialize};
use sluice_protocol::config::{
    MAX_RETRANSMITS_DEFAULT, MTU_DEFAULT_LENGTH, TERM_DEFAULT_LENGTH,
};
use sluice_protocol::PublicationConfig;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Sender configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenderConfig {
    /// Input source (file path or "-" for stdin)
    #[serde(default = "default_input")]
    pub input: String,
    /// Local address to bind
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
    /// Receivers to send to
    pub destinations: Vec<SocketAddr>,
    #[serde(default = "default_session_id")]
    pub session_id: i32,
    #[serde(default = "default_stream_id")]
    pub stream_id: i32,
    #[serde(default)]
    pub initial_term_id: i32,
    /// Multicast TTL, unset for unicast
    pub ttl: Option<u32>,
    #[serde(default = "default_term_length")]
    pub term_length: usize,
    #[serde(default = "default_mtu")]
    pub mtu: usize,
    /// Publisher window in bytes, 0 for half a term
    #[serde(default)]
    pub term_window_length: usize,
    /// Size of each message read from the input
    #[serde(default = "default_message_length")]
    pub message_length: usize,
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_ms: u64,
    #[serde(default = "default_setup_timeout")]
    pub setup_timeout_ms: u64,
    #[serde(default = "default_linger")]
    pub linger_ms: u64,
    #[serde(default)]
    pub retransmit_delay_ms: u64,
    #[serde(default = "default_retransmit_linger")]
    pub retransmit_linger_ms: u64,
    #[serde(default = "default_max_retransmits")]
    pub max_retransmits: usize,
    /// How long the sender position may stall behind the producer before
    /// the log is unblocked
    #[serde(default = "default_unblock_timeout")]
    pub unblock_timeout_ms: u64,
    /// Statistics interval in seconds, 0 to disable
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,
}

fn default_input() -> String {
    "-".to_string()
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 0))
}

fn default_session_id() -> i32 {
    1
}

fn default_stream_id() -> i32 {
    10
}

fn default_term_length() -> usize {
    TERM_DEFAULT_LENGTH
}

fn default_mtu() -> usize {
    MTU_DEFAULT_LENGTH
}

fn default_message_length() -> usize {
    MTU_DEFAULT_LENGTH - 32
}

fn default_heartbeat_timeout() -> u64 {
    100
}

fn default_setup_timeout() -> u64 {
    100
}

fn default_linger() -> u64 {
    5_000
}

fn default_retransmit_linger() -> u64 {
    60
}

fn default_max_retransmits() -> usize {
    MAX_RETRANSMITS_DEFAULT
}

fn default_unblock_timeout() -> u64 {
    10_000
}

fn default_stats_interval() -> u64 {
    1
}

impl SenderConfig {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config: SenderConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Create example sender configuration
    pub fn example() -> Self {
        SenderConfig {
            input: default_input(),
            bind: default_bind(),
            destinations: vec![SocketAddr::from(([192, 168, 1, 10], 40123))],
            session_id: default_session_id(),
            stream_id: default_stream_id(),
            initial_term_id: 0,
            ttl: None,
            term_length: default_term_length(),
            mtu: default_mtu(),
            term_window_length: 0,
            message_length: default_message_length(),
            heartbeat_timeout_ms: default_heartbeat_timeout(),
            setup_timeout_ms: default_setup_timeout(),
            linger_ms: default_linger(),
            retransmit_delay_ms: 0,
            retransmit_linger_ms: default_retransmit_linger(),
            max_retransmits: default_max_retransmits(),
            unblock_timeout_ms: default_unblock_timeout(),
            stats_interval_secs: default_stats_interval(),
        }
    }

    /// Build and validate the publication settings.
    pub fn publication_config(&self) -> Result<PublicationConfig, ConfigError> {
        let config = PublicationConfig {
            term_length: self.term_length,
            mtu_length: self.mtu,
            term_window_length: self.term_window_length,
            heartbeat_timeout: Duration::from_millis(self.heartbeat_timeout_ms),
            setup_timeout: Duration::from_millis(self.setup_timeout_ms),
            linger: Duration::from_millis(self.linger_ms),
            retransmit_delay: Duration::from_millis(self.retransmit_delay_ms),
            retransmit_linger: Duration::from_millis(self.retransmit_linger_ms),
            max_retransmits: self.max_retransmits,
        };
        config.validate()?;

        if self.message_length == 0 || self.message_length > config.max_message_length() {
            return Err(ConfigError::Invalid(format!(
                "message length {} must be between 1 and {}",
                self.message_length,
                config.max_message_length()
            )));
        }
        if self.destinations.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one destination is required".to_string(),
            ));
        }
        Ok(config)
    }

    /// Get statistics interval as Duration
    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }

    pub fn unblock_timeout(&self) -> Duration {
        Duration::from_millis(self.unblock_timeout_ms)
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Invalid publication settings: {0}")]
    Publication(#[from] sluice_protocol::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
