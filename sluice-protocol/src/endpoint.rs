//! Channel Endpoint Contract
//!
//! The transmit side of a channel as seen by a publication. Sends never
//! block: the return value is the number of bytes the channel accepted, and
//! anything short of the frame length is treated as a short send.

/// Non-blocking frame transmission for publications
pub trait ChannelEndpoint: Send + Sync {
    /// Send `frame` to every destination of the channel.
    ///
    /// Returns the number of bytes accepted, 0 if the send would block.
    fn send(&self, frame: &[u8]) -> usize;

    /// TTL advertised in setup frames for multicast channels.
    fn multicast_ttl(&self) -> i32 {
        0
    }

    /// Stop dispatching control frames for the given stream.
    fn remove_publication(&self, session_id: i32, stream_id: i32);
}
