use crate::clock::ManualClock;
use crate::config::PublicationConfig;
use crate::counters::{Position, SystemCounters};
use crate::endpoint::ChannelEndpoint;
use crate::flow_control::{FlowControl, UnicastFlowControl};
use crate::frame::{FrameHeader, FrameType};
use crate::publication::{
    LifecycleHost, NetworkPublication, PublicationError, PublicationHandle, PublicationParams,
    PublicationResources,
};
use crate::retransmit::DefaultRetransmitHandler;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub(crate) const TERM_LENGTH: usize = 64 * 1024;
pub(crate) const MTU: usize = 1408;
pub(crate) const SESSION_ID: i32 = 0x1234;
pub(crate) const STREAM_ID: i32 = 10;

type SendHook = Box<dyn FnMut(&[u8]) + Send>;

/// Endpoint that records every frame it accepts.
#[derive(Default)]
pub(crate) struct RecordingEndpoint {
    frames: Mutex<Vec<Vec<u8>>>,
    removed: Mutex<Vec<(i32, i32)>>,
    failures: AtomicUsize,
    on_send: Mutex<Option<SendHook>>,
}

impl RecordingEndpoint {
    pub(crate) fn take_frames(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *self.frames.lock())
    }

    /// Make the next `count` sends accept nothing.
    pub(crate) fn fail_next_sends(&self, count: usize) {
        self.failures.store(count, Ordering::Release);
    }

    pub(crate) fn removed(&self) -> Vec<(i32, i32)> {
        self.removed.lock().clone()
    }

    /// Run `hook` on every frame as it is sent.
    pub(crate) fn on_send(&self, hook: impl FnMut(&[u8]) + Send + 'static) {
        *self.on_send.lock() = Some(Box::new(hook));
    }
}

impl ChannelEndpoint for RecordingEndpoint {
    fn send(&self, frame: &[u8]) -> usize {
        let failing = self
            .failures
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if let Some(hook) = self.on_send.lock().as_mut() {
            hook(frame);
        }
        if failing {
            return 0;
        }
        self.frames.lock().push(frame.to_vec());
        frame.len()
    }

    fn remove_publication(&self, session_id: i32, stream_id: i32) {
        self.removed.lock().push((session_id, stream_id));
    }
}

pub(crate) fn frame_type(frame: &[u8]) -> Option<FrameType> {
    FrameHeader::from_bytes(frame).ok().and_then(|h| h.frame_type())
}

#[derive(Default)]
pub(crate) struct RecordingHost {
    pub(crate) cleaned: Vec<(i32, i32)>,
    pub(crate) fail: bool,
}

impl LifecycleHost for RecordingHost {
    fn cleanup_publication(&mut self, publication: &PublicationHandle) -> Result<(), PublicationError> {
        self.cleaned
            .push((publication.session_id(), publication.stream_id()));
        if self.fail {
            return Err(PublicationError::ResourcesUnavailable {
                session_id: publication.session_id(),
                stream_id: publication.stream_id(),
                reason: "counters exhausted".to_string(),
            });
        }
        Ok(())
    }
}

pub(crate) struct Fixture {
    pub(crate) publication: NetworkPublication,
    pub(crate) endpoint: Arc<RecordingEndpoint>,
    pub(crate) counters: Arc<SystemCounters>,
    pub(crate) clock: Arc<ManualClock>,
}

impl Fixture {
    pub(crate) fn new() -> Self {
        Self::with_initial_term_id(0)
    }

    pub(crate) fn with_initial_term_id(initial_term_id: i32) -> Self {
        Self::build(initial_term_id, Box::new(UnicastFlowControl::new()))
    }

    pub(crate) fn with_flow_control(flow_control: Box<dyn FlowControl>) -> Self {
        Self::build(0, flow_control)
    }

    fn build(initial_term_id: i32, flow_control: Box<dyn FlowControl>) -> Self {
        let config = PublicationConfig {
            term_length: TERM_LENGTH,
            mtu_length: MTU,
            ..Default::default()
        };
        let endpoint = Arc::new(RecordingEndpoint::default());
        let counters = Arc::new(SystemCounters::new());
        let clock = Arc::new(ManualClock::new(0));

        let resources = PublicationResources {
            endpoint: endpoint.clone(),
            flow_control,
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

        Fixture {
            publication,
            endpoint,
            counters,
            clock,
        }
    }

    pub(crate) fn handle(&self) -> PublicationHandle {
        self.publication.handle().clone()
    }

    /// Status message granting `window` from the start of the initial term.
    pub(crate) fn status_message(&self, term_offset: i32, window: i32) {
        let handle = self.publication.handle();
        handle.on_status_message(handle.initial_term_id(), term_offset, window, receiver());
    }

    /// Hear from a receiver and open the publisher limit.
    pub(crate) fn connect(&self) {
        self.status_message(0, TERM_LENGTH as i32);
        self.publication.handle().update_publishers_limit();
    }
}

pub(crate) fn receiver() -> SocketAddr {
    "127.0.0.1:40123".parse().unwrap()
}
