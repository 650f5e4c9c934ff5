//! Sluice - reliable UDP message streams
//!
//! High-level Rust API for the sender side of a sluice stream.

pub use sluice_io as io;
pub use sluice_protocol as protocol;

// Re-export commonly used types
pub use io::{BackoffIdleStrategy, UdpChannelEndpoint};
pub use protocol::{
    NetworkPublication, OfferError, PublicationConfig, PublicationHandle, PublicationParams,
    PublicationResources, Publisher,
};
