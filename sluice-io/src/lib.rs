//! Sluice I/O
//!
//! UDP transport for publications and the idle strategies that pace the
//! sender, receiver and conductor duty cycles.

pub mod socket;
pub mod time;

pub use socket::{SocketError, UdpChannelEndpoint};
pub use time::{BackoffIdleStrategy, Timer};
