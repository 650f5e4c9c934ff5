//! Positions and System Counters
//!
//! A [`Position`] is a stream position shared between actors. Each has a
//! single writer, except publisher limits which are only ever raised through
//! [`Position::propose_max_ordered`]. [`SystemCounters`] are event counts
//! written by the publication and read by monitoring.

use crossbeam::utils::CachePadded;
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

/// Shared stream position on its own cache line
#[derive(Clone)]
pub struct Position {
    id: i32,
    value: Arc<CachePadded<AtomicI64>>,
}

impl Position {
    pub fn new(id: i32, initial: i64) -> Self {
        Position {
            id,
            value: Arc::new(CachePadded::new(AtomicI64::new(initial))),
        }
    }

    #[inline]
    pub fn id(&self) -> i32 {
        self.id
    }

    /// Read from the writing thread.
    #[inline]
    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Read from any other thread.
    #[inline]
    pub fn get_volatile(&self) -> i64 {
        self.value.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_ordered(&self, value: i64) {
        self.value.store(value, Ordering::Release);
    }

    /// Raise the position to `proposed` if it is higher.
    ///
    /// Returns true if the position changed.
    #[inline]
    pub fn propose_max_ordered(&self, proposed: i64) -> bool {
        self.value.fetch_max(proposed, Ordering::AcqRel) < proposed
    }
}

impl fmt::Debug for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Position(id={}, value={})", self.id, self.get_volatile())
    }
}

/// Monotonic event counter
#[derive(Debug, Default)]
pub struct AtomicCounter(CachePadded<AtomicU64>);

impl AtomicCounter {
    #[inline]
    pub fn increment(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Release)
    }

    #[inline]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }
}

/// Counters reported by the sender side of the driver
#[derive(Debug, Default)]
pub struct SystemCounters {
    /// Heartbeat frames sent while idle
    pub heartbeats_sent: AtomicCounter,
    /// Accepted resend requests
    pub retransmits_sent: AtomicCounter,
    /// Transitions into being blocked by flow control
    pub sender_flow_control_limits: AtomicCounter,
    /// Data or retransmit sends the channel did not fully accept
    pub data_packet_short_sends: AtomicCounter,
    /// Setup frames the channel did not fully accept
    pub setup_message_short_sends: AtomicCounter,
    /// Status messages applied to a publication
    pub status_messages_received: AtomicCounter,
    /// NAKs received for a publication
    pub naks_received: AtomicCounter,
    /// NAKs dropped because the sender had not drained earlier ones
    pub naks_dropped: AtomicCounter,
}

impl SystemCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            heartbeats_sent: self.heartbeats_sent.get(),
            retransmits_sent: self.retransmits_sent.get(),
            sender_flow_control_limits: self.sender_flow_control_limits.get(),
            data_packet_short_sends: self.data_packet_short_sends.get(),
            setup_message_short_sends: self.setup_message_short_sends.get(),
            status_messages_received: self.status_messages_received.get(),
            naks_received: self.naks_received.get(),
            naks_dropped: self.naks_dropped.get(),
        }
    }
}

/// Point-in-time copy of [`SystemCounters`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CountersSnapshot {
    pub heartbeats_sent: u64,
    pub retransmits_sent: u64,
    pub sender_flow_control_limits: u64,
    pub data_packet_short_sends: u64,
    pub setup_message_short_sends: u64,
    pub status_messages_received: u64,
    pub naks_received: u64,
    pub naks_dropped: u64,
}
