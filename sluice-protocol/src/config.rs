//! Publication Configuration
//!
//! Driver-wide constants and the per-publication settings derived from them.

use crate::frame::DATA_HEADER_LENGTH;
use crate::log_buffer::{check_mtu_length, check_term_length, LogBufferError};
use std::time::Duration;
use thiserror::Error;

/// Smallest supported term length.
pub const TERM_MIN_LENGTH: usize = 64 * 1024;

/// Largest supported term length.
pub const TERM_MAX_LENGTH: usize = 1024 * 1024 * 1024;

/// Largest payload a single UDP datagram can carry.
pub const MAX_UDP_PAYLOAD_LENGTH: usize = 65504;

/// Default term length for new publications.
pub const TERM_DEFAULT_LENGTH: usize = 16 * 1024 * 1024;

/// Default MTU for new publications.
pub const MTU_DEFAULT_LENGTH: usize = 1408;

/// Largest message a publisher may offer, whatever the term length.
pub const MAX_MESSAGE_LENGTH_CAP: usize = 16 * 1024 * 1024;

/// Idle time after which a heartbeat is sent.
pub const PUBLICATION_HEARTBEAT_TIMEOUT: Duration = Duration::from_millis(100);

/// Interval between setup frames until a receiver is heard from.
pub const PUBLICATION_SETUP_TIMEOUT: Duration = Duration::from_millis(100);

/// Time a drained publication is kept for retransmission before cleanup.
pub const PUBLICATION_LINGER: Duration = Duration::from_secs(5);

/// Delay before answering a NAK.
pub const RETRANSMIT_UNICAST_DELAY_DEFAULT: Duration = Duration::ZERO;

/// Time a served NAK range is ignored for.
pub const RETRANSMIT_UNICAST_LINGER_DEFAULT: Duration = Duration::from_millis(60);

/// Concurrent retransmit actions per publication.
pub const MAX_RETRANSMITS_DEFAULT: usize = 16;

/// Capacity of the queue carrying NAKs from the receiver to the sender.
pub const NAK_QUEUE_CAPACITY: usize = 1024;

/// Configuration errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid log settings: {0}")]
    Log(#[from] LogBufferError),

    #[error("Term window {window} exceeds half the term length {term_length}")]
    WindowTooLarge { window: usize, term_length: usize },

    #[error("{0} must be non-zero")]
    ZeroDuration(&'static str),

    #[error("Retransmit action pool must hold at least one action")]
    NoRetransmitActions,
}

/// Settings for one network publication
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicationConfig {
    /// Length of each term, a power of two
    pub term_length: usize,
    /// Largest frame put on the wire, header included
    pub mtu_length: usize,
    /// Publisher window; zero selects half the term length
    pub term_window_length: usize,
    /// Idle time before a heartbeat
    pub heartbeat_timeout: Duration,
    /// Setup frame interval
    pub setup_timeout: Duration,
    /// Retention after drain
    pub linger: Duration,
    /// Delay before answering a NAK
    pub retransmit_delay: Duration,
    /// Time a served NAK range is ignored for
    pub retransmit_linger: Duration,
    /// Retransmit action pool size
    pub max_retransmits: usize,
}

impl Default for PublicationConfig {
    fn default() -> Self {
        PublicationConfig {
            term_length: TERM_DEFAULT_LENGTH,
            mtu_length: MTU_DEFAULT_LENGTH,
            term_window_length: 0,
            heartbeat_timeout: PUBLICATION_HEARTBEAT_TIMEOUT,
            setup_timeout: PUBLICATION_SETUP_TIMEOUT,
            linger: PUBLICATION_LINGER,
            retransmit_delay: RETRANSMIT_UNICAST_DELAY_DEFAULT,
            retransmit_linger: RETRANSMIT_UNICAST_LINGER_DEFAULT,
            max_retransmits: MAX_RETRANSMITS_DEFAULT,
        }
    }
}

impl PublicationConfig {
    /// Check the settings describe a usable publication.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_term_length(self.term_length)?;
        check_mtu_length(self.mtu_length)?;

        if self.term_window_length > self.term_length / 2 {
            return Err(ConfigError::WindowTooLarge {
                window: self.term_window_length,
                term_length: self.term_length,
            });
        }
        if self.heartbeat_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("heartbeat_timeout"));
        }
        if self.setup_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("setup_timeout"));
        }
        if self.max_retransmits == 0 {
            return Err(ConfigError::NoRetransmitActions);
        }
        Ok(())
    }

    /// Window publishers may run ahead of the sender.
    pub fn term_window(&self) -> usize {
        term_window_length(self.term_length, self.term_window_length)
    }

    /// Largest message publishers may offer.
    pub fn max_message_length(&self) -> usize {
        max_message_length(self.term_length)
    }

    /// Largest payload carried by one data frame.
    pub fn max_payload_length(&self) -> usize {
        self.mtu_length - DATA_HEADER_LENGTH
    }
}

/// Half the term, or the configured window when smaller.
pub fn term_window_length(term_length: usize, configured: usize) -> usize {
    let half = term_length / 2;
    if configured > 0 {
        configured.min(half)
    } else {
        half
    }
}

/// An eighth of the term, capped.
pub fn max_message_length(term_length: usize) -> usize {
    (term_length / 8).min(MAX_MESSAGE_LENGTH_CAP)
}

/// Nanoseconds in `duration`, saturating.
pub(crate) fn duration_nanos(duration: Duration) -> i64 {
    i64::try_from(duration.as_nanos()).unwrap_or(i64::MAX)
}
