//! Sluice Protocol Core
//!
//! Sender side of a reliable UDP message stream: position arithmetic, wire
//! frames, the term log with its scanner, appender and unblocker, counters,
//! flow control and retransmit strategies, and the network publication that
//! ties them together.

pub mod atomic_buffer;
pub mod clock;
pub mod config;
pub mod counters;
pub mod endpoint;
pub mod flow_control;
pub mod frame;
pub mod log_buffer;
pub mod position;
pub mod publication;
pub mod retransmit;
pub mod term_appender;
pub mod term_scanner;
pub mod term_unblocker;

#[cfg(test)]
mod test_support;

pub use clock::{EpochClock, ManualClock, NanoClock, SystemEpochClock, SystemNanoClock};
pub use config::{ConfigError, PublicationConfig};
pub use counters::{AtomicCounter, CountersSnapshot, Position, SystemCounters};
pub use endpoint::ChannelEndpoint;
pub use flow_control::{FlowControl, MaxMulticastFlowControl, UnicastFlowControl};
pub use frame::{DataHeader, FrameError, FrameType, NakFrame, SetupHeader, StatusMessageFrame};
pub use log_buffer::{LogBufferError, LogBuffers};
pub use position::TermPosition;
pub use publication::{
    LifecycleHost, NakRequest, NetworkPublication, PublicationError, PublicationHandle,
    PublicationParams, PublicationResources,
};
pub use retransmit::{
    DefaultRetransmitHandler, DelayGenerator, RetransmitHandler, RetransmitSender,
    StaticDelayGenerator,
};
pub use term_appender::{OfferError, Publisher};
pub use term_scanner::{scan_for_availability, ScanOutcome};
