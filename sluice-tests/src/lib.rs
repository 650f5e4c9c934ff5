//! Shared fixtures for the sluice integration tests

use parking_lot::Mutex;
use sluice_protocol::frame::{FrameHeader, FrameType};
use sluice_protocol::{
    ChannelEndpoint, DataHeader, DefaultRetransmitHandler, LifecycleHost, ManualClock,
    NetworkPublication, OfferError, Position, PublicationConfig, PublicationError,
    PublicationHandle, PublicationParams, PublicationResources, SystemCounters, TermPosition,
    UnicastFlowControl,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub const TERM_LENGTH: usize = 64 * 1024;
pub const MTU: usize = 1408;
pub const SESSION_ID: i32 = 0x5eed;
pub const STREAM_ID: i32 = 1001;
pub const MS: i64 = 1_000_000;

/// Endpoint that keeps every frame it accepts
#[derive(Default)]
pub struct RecordingEndpoint {
    frames: Mutex<Vec<Vec<u8>>>,
    removed: Mutex<Vec<(i32, i32)>>,
    failures: AtomicUsize,
}

impl RecordingEndpoint {
    pub fn take_frames(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *self.frames.lock())
    }

    /// Accept nothing on the next `count` sends.
    pub fn fail_next_sends(&self, count: usize) {
        self.failures.store(count, Ordering::Release);
    }

    pub fn removed(&self) -> Vec<(i32, i32)> {
        self.removed.lock().clone()
    }
}

impl ChannelEndpoint for RecordingEndpoint {
    fn send(&self, frame: &[u8]) -> usize {
        if self
            .failures
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
        {
            return 0;
        }
        self.frames.lock().push(frame.to_vec());
        frame.len()
    }

    fn remove_publication(&self, session_id: i32, stream_id: i32) {
        self.removed.lock().push((session_id, stream_id));
    }
}

/// Host that records cleanups and can be told to fail them
#[derive(Default)]
pub struct RecordingHost {
    pub cleaned: Vec<(i32, i32)>,
    pub fail: bool,
}

impl LifecycleHost for RecordingHost {
    fn cleanup_publication(&mut self, publication: &PublicationHandle) -> Result<(), PublicationError> {
        self.cleaned
            .push((publication.session_id(), publication.stream_id()));
        if self.fail {
            return Err(PublicationError::ResourcesUnavailable {
                session_id: publication.session_id(),
                stream_id: publication.stream_id(),
                reason: "host refused".to_string(),
            });
        }
        Ok(())
    }
}

pub fn frame_type(frame: &[u8]) -> Option<FrameType> {
    FrameHeader::from_bytes(frame).ok().and_then(|h| h.frame_type())
}

/// Headers of the data frames in a sent datagram, which may batch several.
pub fn data_headers(datagram: &[u8]) -> Vec<DataHeader> {
    let mut headers = Vec::new();
    let mut offset = 0;
    while offset + 32 <= datagram.len() {
        let Ok(header) = DataHeader::from_bytes(&datagram[offset..]) else {
            break;
        };
        let length = header.frame_length.max(32) as usize;
        offset += (length + 31) & !31;
        headers.push(header);
    }
    headers
}

pub fn receiver_addr() -> SocketAddr {
    "127.0.0.1:40123".parse().unwrap()
}

/// A publication wired to recording collaborators
pub struct Harness {
    pub publication: NetworkPublication,
    pub handle: PublicationHandle,
    pub endpoint: Arc<RecordingEndpoint>,
    pub counters: Arc<SystemCounters>,
    pub clock: Arc<ManualClock>,
    pub term_position: TermPosition,
}

impl Harness {
    pub fn new(initial_term_id: i32) -> Self {
        Self::with_config(
            initial_term_id,
            PublicationConfig {
                term_length: TERM_LENGTH,
                mtu_length: MTU,
                ..Default::default()
            },
        )
    }

    pub fn with_config(initial_term_id: i32, config: PublicationConfig) -> Self {
        let endpoint = Arc::new(RecordingEndpoint::default());
        let counters = Arc::new(SystemCounters::new());
        let clock = Arc::new(ManualClock::new(0));
        let term_position = TermPosition::new(config.term_length as i32, initial_term_id);

        let resources = PublicationResources {
            endpoint: endpoint.clone(),
            flow_control: Box::new(UnicastFlowControl::new()),
            retransmit_handler: Box::new(DefaultRetransmitHandler::from_config(&config)),
            counters: counters.clone(),
            epoch_clock: clock.clone(),
            publisher_limit: Position::new(1, 0),
            sender_position: Position::new(2, 0),
        };
        let params = PublicationParams {
            session_id: SESSION_ID,
            stream_id: STREAM_ID,
            initial_term_id,
            config,
        };
        let publication = NetworkPublication::new(params, resources, 0).unwrap();
        let handle = publication.handle().clone();

        Harness {
            publication,
            handle,
            endpoint,
            counters,
            clock,
            term_position,
        }
    }

    /// Status message acknowledging everything sent, granting `window` more.
    pub fn acknowledge(&self, window: i32) {
        let position = self.handle.consumer_position();
        self.handle.on_status_message(
            self.term_position.term_id(position),
            self.term_position.term_offset(position),
            window,
            receiver_addr(),
        );
    }

    /// One conductor duty cycle.
    pub fn conduct(&self) {
        self.handle.update_publishers_limit();
        self.handle.clean_log_buffer();
    }

    /// Offer `message`, running the sender and conductor until it fits.
    pub fn offer_until_accepted(&mut self, message: &[u8], now: i64) -> i64 {
        let publisher = self.handle.publisher();
        for _ in 0..10_000 {
            match publisher.offer(message) {
                Ok(position) => return position,
                Err(OfferError::AdminAction) => self.conduct(),
                Err(OfferError::BackPressured) | Err(OfferError::NotConnected) => {
                    self.drain(now);
                    self.acknowledge(TERM_LENGTH as i32);
                    self.conduct();
                }
                Err(e) => panic!("unexpected offer failure: {}", e),
            }
        }
        panic!("offer never accepted");
    }

    /// Run the sender until it has nothing more to send.
    pub fn drain(&mut self, now: i64) -> usize {
        let mut total = 0;
        loop {
            let sent = self.publication.send(now);
            if sent == 0 {
                return total;
            }
            total += sent;
        }
    }
}
