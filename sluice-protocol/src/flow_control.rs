//! Sender Flow Control
//!
//! Turns receiver status messages into a ceiling on the sender position. The
//! strategy is chosen per channel and injected into the publication.

use crate::position::{compute_position, position_bits_to_shift};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};

/// Flow control strategy contract
///
/// `initialize` is called once, before the strategy is shared. The other
/// methods may be called concurrently by the receiver and sender.
pub trait FlowControl: Send + Sync {
    /// Bind the strategy to the stream's term layout.
    fn initialize(&mut self, initial_term_id: i32, term_length: i32);

    /// Apply a status message, returning the new sender position limit.
    fn on_status_message(
        &self,
        term_id: i32,
        term_offset: i32,
        receiver_window_length: i32,
        receiver: SocketAddr,
    ) -> i64;

    /// Limit to use while the sender is idle.
    fn on_idle(&self, now: i64) -> i64;
}

/// Limit set by the most advanced receiver
///
/// Used for unicast channels, and for multicast when the fastest receiver
/// should set the pace.
#[derive(Debug, Default)]
pub struct UnicastFlowControl {
    position_limit: AtomicI64,
    initial_term_id: i32,
    bits_to_shift: u32,
}

/// Multicast flow control that follows the fastest receiver.
pub type MaxMulticastFlowControl = UnicastFlowControl;

impl UnicastFlowControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn position_limit(&self) -> i64 {
        self.position_limit.load(Ordering::Acquire)
    }
}

impl FlowControl for UnicastFlowControl {
    fn initialize(&mut self, initial_term_id: i32, term_length: i32) {
        self.initial_term_id = initial_term_id;
        self.bits_to_shift = position_bits_to_shift(term_length);
    }

    fn on_status_message(
        &self,
        term_id: i32,
        term_offset: i32,
        receiver_window_length: i32,
        _receiver: SocketAddr,
    ) -> i64 {
        let position = compute_position(term_id, term_offset, self.bits_to_shift, self.initial_term_id);
        let proposed = position + receiver_window_length as i64;
        let previous = self.position_limit.fetch_max(proposed, Ordering::AcqRel);
        previous.max(proposed)
    }

    fn on_idle(&self, _now: i64) -> i64 {
        self.position_limit.load(Ordering::Acquire)
    }
}
