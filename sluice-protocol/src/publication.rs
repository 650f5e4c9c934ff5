//! Network Publication
//!
//! The sender side of one stream. Three actors work on a publication at once:
//!
//! - the sender owns [`NetworkPublication`] and drives [`NetworkPublication::send`]
//!   every duty cycle, which is the only place the sender position moves;
//! - the receiver delivers status messages and NAKs through a
//!   [`PublicationHandle`];
//! - the conductor manages reference counts, the publisher limit, term
//!   cleaning and end of life through the same handle.
//!
//! State shared between them is atomic with a single writer per field, grouped
//! by owning actor onto separate cache lines. The retransmit handler is
//! sender-owned; NAKs reach it through a bounded lock-free queue.

use crate::clock::EpochClock;
use crate::config::{duration_nanos, term_window_length, ConfigError, PublicationConfig, NAK_QUEUE_CAPACITY};
use crate::counters::{Position, SystemCounters};
use crate::endpoint::ChannelEndpoint;
use crate::flow_control::FlowControl;
use crate::frame::{
    HeartbeatFrameTemplate, SetupFrameTemplate, SetupHeader, DATA_HEADER_LENGTH, SETUP_HEADER_LENGTH,
};
use crate::log_buffer::{LogBufferError, LogBuffers, NEEDS_CLEANING};
use crate::position::TermPosition;
use crate::retransmit::{RetransmitHandler, RetransmitSender};
use crate::term_appender::Publisher;
use crate::term_scanner::{scan_for_availability, ScanOutcome};
use crate::term_unblocker::unblock_log;
use crossbeam::queue::ArrayQueue;
use crossbeam::utils::CachePadded;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Publication errors
#[derive(Error, Debug)]
pub enum PublicationError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Log allocation failed: {0}")]
    Log(#[from] LogBufferError),

    #[error("Resources for publication {session_id}:{stream_id} unavailable: {reason}")]
    ResourcesUnavailable {
        session_id: i32,
        stream_id: i32,
        reason: String,
    },
}

/// Owner of publication resources, asked to release them at end of life
pub trait LifecycleHost {
    /// Release the log and positions of a publication that reached end of life.
    ///
    /// A failure affects this publication only.
    fn cleanup_publication(&mut self, publication: &PublicationHandle) -> Result<(), PublicationError>;
}

/// Identity and settings of a new publication
#[derive(Debug, Clone)]
pub struct PublicationParams {
    pub session_id: i32,
    pub stream_id: i32,
    pub initial_term_id: i32,
    pub config: PublicationConfig,
}

/// Collaborators a publication is built from
pub struct PublicationResources {
    pub endpoint: Arc<dyn ChannelEndpoint>,
    pub flow_control: Box<dyn FlowControl>,
    pub retransmit_handler: Box<dyn RetransmitHandler>,
    pub counters: Arc<SystemCounters>,
    pub epoch_clock: Arc<dyn EpochClock>,
    pub publisher_limit: Position,
    pub sender_position: Position,
}

/// A NAK waiting for the sender
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NakRequest {
    pub term_id: i32,
    pub term_offset: i32,
    pub length: i32,
}

/// Written by the conductor
#[derive(Debug)]
struct ConductorFields {
    time_of_flush: AtomicI64,
    ref_count: AtomicI32,
    is_active: AtomicBool,
    reached_end_of_life: AtomicBool,
}

/// Written by the receiver
#[derive(Debug)]
struct ReceiverFields {
    sender_position_limit: AtomicI64,
    has_status_message_been_received: AtomicBool,
    should_send_setup_frame: AtomicBool,
}

struct PublicationShared {
    conductor: CachePadded<ConductorFields>,
    receiver: CachePadded<ReceiverFields>,
    session_id: i32,
    stream_id: i32,
    term_position: TermPosition,
    term_window_length: i64,
    linger_ns: i64,
    max_payload_length: usize,
    max_message_length: usize,
    log: Arc<LogBuffers>,
    endpoint: Arc<dyn ChannelEndpoint>,
    flow_control: Arc<dyn FlowControl>,
    counters: Arc<SystemCounters>,
    epoch_clock: Arc<dyn EpochClock>,
    sender_position: Position,
    publisher_limit: Position,
    naks: ArrayQueue<NakRequest>,
}

/// Receiver and conductor view of a publication
#[derive(Clone)]
pub struct PublicationHandle {
    shared: Arc<PublicationShared>,
}

impl PublicationHandle {
    pub fn session_id(&self) -> i32 {
        self.shared.session_id
    }

    pub fn stream_id(&self) -> i32 {
        self.shared.stream_id
    }

    pub fn initial_term_id(&self) -> i32 {
        self.shared.term_position.initial_term_id()
    }

    pub fn term_length(&self) -> i32 {
        self.shared.term_position.term_length()
    }

    pub fn term_window_length(&self) -> i64 {
        self.shared.term_window_length
    }

    /// Log backing this publication.
    pub fn log(&self) -> &Arc<LogBuffers> {
        &self.shared.log
    }

    /// Appender for local publishers writing to this stream.
    pub fn publisher(&self) -> Publisher {
        Publisher::new(
            self.shared.log.clone(),
            self.shared.publisher_limit.clone(),
            self.shared.max_payload_length,
            self.shared.max_message_length,
        )
    }

    // Receiver

    /// Apply a status message from a receiver.
    pub fn on_status_message(
        &self,
        term_id: i32,
        term_offset: i32,
        receiver_window_length: i32,
        source: SocketAddr,
    ) {
        let shared = &self.shared;
        let limit = shared
            .flow_control
            .on_status_message(term_id, term_offset, receiver_window_length, source);
        shared.receiver.sender_position_limit.store(limit, Ordering::Release);

        if !shared
            .receiver
            .has_status_message_been_received
            .swap(true, Ordering::AcqRel)
        {
            tracing::debug!(
                "First status message for {}:{} from {}, sender limit {}",
                shared.session_id,
                shared.stream_id,
                source,
                limit
            );
        }
        shared.receiver.should_send_setup_frame.store(false, Ordering::Release);

        shared
            .log
            .set_time_of_last_status_message(shared.epoch_clock.time_millis());
        shared.counters.status_messages_received.increment();
    }

    /// Queue a NAK for the sender's retransmit handler.
    pub fn on_nak(&self, term_id: i32, term_offset: i32, length: i32) {
        let shared = &self.shared;
        shared.counters.naks_received.increment();

        let request = NakRequest {
            term_id,
            term_offset,
            length,
        };
        if shared.naks.push(request).is_err() {
            shared.counters.naks_dropped.increment();
            tracing::trace!("NAK queue full, dropped NAK for term {} offset {}", term_id, term_offset);
        }
    }

    /// Ask the sender to resume sending setup frames.
    pub fn trigger_send_setup_frame(&self) {
        self.shared
            .receiver
            .should_send_setup_frame
            .store(true, Ordering::Release);
    }

    pub fn has_status_message_been_received(&self) -> bool {
        self.shared
            .receiver
            .has_status_message_been_received
            .load(Ordering::Acquire)
    }

    pub fn sender_position_limit(&self) -> i64 {
        self.shared.receiver.sender_position_limit.load(Ordering::Acquire)
    }

    // Conductor

    /// Raise the publisher limit to the sender position plus the term window.
    ///
    /// The limit stays at 0 until a status message has been received. Returns
    /// true if the limit moved.
    pub fn update_publishers_limit(&self) -> bool {
        let shared = &self.shared;
        let candidate = if self.has_status_message_been_received() {
            shared.sender_position.get_volatile() + shared.term_window_length
        } else {
            0
        };
        shared.publisher_limit.propose_max_ordered(candidate)
    }

    pub fn inc_ref(&self) -> i32 {
        self.shared.conductor.ref_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Drop a publisher registration. The last one removes the publication
    /// from its channel endpoint.
    pub fn dec_ref(&self) -> i32 {
        let shared = &self.shared;
        let previous = shared
            .conductor
            .ref_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                (count > 0).then(|| count - 1)
            });

        match previous {
            Ok(1) => {
                shared
                    .endpoint
                    .remove_publication(shared.session_id, shared.stream_id);
                tracing::debug!(
                    "Publication {}:{} unreferenced",
                    shared.session_id,
                    shared.stream_id
                );
                0
            }
            Ok(previous) => previous - 1,
            Err(_) => {
                tracing::warn!(
                    "Publication {}:{} released more times than referenced",
                    shared.session_id,
                    shared.stream_id
                );
                0
            }
        }
    }

    pub fn ref_count(&self) -> i32 {
        self.shared.conductor.ref_count.load(Ordering::Acquire)
    }

    /// Advance the lifecycle: once unreferenced and flushed the publication
    /// goes inactive, and after lingering it reaches end of life and is
    /// handed to `host` for cleanup.
    pub fn on_time_event(&self, time: i64, host: &mut dyn LifecycleHost) {
        let shared = &self.shared;
        if !self.is_unreferenced_and_flushed(time) {
            return;
        }
        if time <= shared.conductor.time_of_flush.load(Ordering::Acquire) + shared.linger_ns {
            return;
        }
        if shared
            .conductor
            .reached_end_of_life
            .swap(true, Ordering::AcqRel)
        {
            return;
        }

        tracing::info!(
            "Publication {}:{} reached end of life",
            shared.session_id,
            shared.stream_id
        );
        if let Err(e) = host.cleanup_publication(self) {
            tracing::error!(
                "Cleanup of publication {}:{} failed: {}",
                shared.session_id,
                shared.stream_id,
                e
            );
        }
    }

    fn is_unreferenced_and_flushed(&self, now: i64) -> bool {
        let shared = &self.shared;
        if self.ref_count() != 0 {
            return false;
        }

        let sender_position = shared.sender_position.get_volatile();
        let is_flushed = sender_position >= shared.log.producer_position();

        if is_flushed && shared.conductor.is_active.swap(false, Ordering::AcqRel) {
            shared.conductor.time_of_flush.store(now, Ordering::Release);
            tracing::debug!(
                "Publication {}:{} flushed at position {}",
                shared.session_id,
                shared.stream_id,
                sender_position
            );
        }
        is_flushed
    }

    /// Zero every partition flagged for cleaning. Returns the work done.
    pub fn clean_log_buffer(&self) -> usize {
        let mut work_count = 0;
        for partition in self.shared.log.partitions() {
            if partition.status() == NEEDS_CLEANING {
                partition.clean();
                work_count = 1;
            }
        }
        work_count
    }

    /// Pad over a frame left uncommitted at the consumer position.
    pub fn unblock_at_consumer_position(&self) -> bool {
        unblock_log(&self.shared.log, self.consumer_position())
    }

    // Observability

    pub fn producer_position(&self) -> i64 {
        self.shared.log.producer_position()
    }

    pub fn consumer_position(&self) -> i64 {
        self.shared.sender_position.get_volatile()
    }

    pub fn sender_position(&self) -> &Position {
        &self.shared.sender_position
    }

    pub fn publisher_limit(&self) -> &Position {
        &self.shared.publisher_limit
    }

    /// Time the publication was flushed after going unreferenced.
    pub fn time_of_last_state_change(&self) -> i64 {
        self.shared.conductor.time_of_flush.load(Ordering::Acquire)
    }

    pub fn is_active(&self) -> bool {
        self.shared.conductor.is_active.load(Ordering::Acquire)
    }

    pub fn has_reached_end_of_life(&self) -> bool {
        self.shared
            .conductor
            .reached_end_of_life
            .load(Ordering::Acquire)
    }

    pub fn counters(&self) -> &Arc<SystemCounters> {
        &self.shared.counters
    }

    fn should_send_setup_frame(&self) -> bool {
        self.shared
            .receiver
            .should_send_setup_frame
            .load(Ordering::Acquire)
    }

    fn clear_send_setup_frame(&self) {
        let _ = self.shared.receiver.should_send_setup_frame.compare_exchange(
            true,
            false,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}

impl fmt::Debug for PublicationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublicationHandle")
            .field("session_id", &self.session_id())
            .field("stream_id", &self.stream_id())
            .field("ref_count", &self.ref_count())
            .field("consumer_position", &self.consumer_position())
            .finish()
    }
}

/// The parts of the sender that transmit term contents
struct FrameSender {
    log: Arc<LogBuffers>,
    endpoint: Arc<dyn ChannelEndpoint>,
    counters: Arc<SystemCounters>,
    term_position: TermPosition,
    mtu_length: usize,
    sender_position: Position,
}

impl RetransmitSender for FrameSender {
    fn resend(&mut self, term_id: i32, term_offset: i32, length: i32) {
        let active_term_id = self.term_position.term_id(self.sender_position.get());
        if term_id != active_term_id && term_id != active_term_id.wrapping_sub(1) {
            tracing::trace!("Ignoring resend for term {} while in term {}", term_id, active_term_id);
            return;
        }
        if term_offset < 0 || term_offset >= self.term_position.term_length() {
            return;
        }

        let index = self.term_position.partition_index_by_term(term_id);
        let term = self.log.partition(index).term_buffer();

        let mut offset = term_offset as usize;
        let mut remaining = length as i64;
        loop {
            let outcome = scan_for_availability(term, offset, self.mtu_length);
            if outcome.is_empty() {
                break;
            }

            if self.endpoint.send(term.slice(offset, outcome.available)) != outcome.available {
                self.counters.data_packet_short_sends.increment();
                break;
            }

            offset += outcome.total();
            remaining -= outcome.total() as i64;
            if remaining <= 0 {
                break;
            }
        }

        self.counters.retransmits_sent.increment();
    }
}

/// Sender-owned side of a publication
pub struct NetworkPublication {
    handle: PublicationHandle,
    frame_sender: FrameSender,
    retransmit_handler: Box<dyn RetransmitHandler>,
    setup_frame: SetupFrameTemplate,
    heartbeat_frame: HeartbeatFrameTemplate,
    heartbeat_timeout_ns: i64,
    setup_timeout_ns: i64,
    time_of_last_send_or_heartbeat: i64,
    time_of_last_setup: i64,
    track_sender_limits: bool,
}

impl NetworkPublication {
    /// Create a publication and allocate its log.
    ///
    /// `now` seeds the setup and heartbeat timers so that the first
    /// [`send`](Self::send) emits a setup frame.
    pub fn new(
        params: PublicationParams,
        resources: PublicationResources,
        now: i64,
    ) -> Result<Self, PublicationError> {
        let PublicationParams {
            session_id,
            stream_id,
            initial_term_id,
            config,
        } = params;
        config.validate()?;

        let log = Arc::new(LogBuffers::new(
            config.term_length,
            config.mtu_length,
            initial_term_id,
            session_id,
            stream_id,
        )?);
        let term_length = log.term_length();
        let term_position = TermPosition::new(term_length, initial_term_id);

        let mut flow_control = resources.flow_control;
        flow_control.initialize(initial_term_id, term_length);
        let flow_control: Arc<dyn FlowControl> = Arc::from(flow_control);

        let setup_frame = SetupFrameTemplate::new(&SetupHeader {
            term_offset: 0,
            session_id,
            stream_id,
            initial_term_id,
            active_term_id: initial_term_id,
            term_length,
            mtu_length: config.mtu_length as i32,
            ttl: resources.endpoint.multicast_ttl(),
        });
        let heartbeat_frame = HeartbeatFrameTemplate::new(session_id, stream_id);

        let heartbeat_timeout_ns = duration_nanos(config.heartbeat_timeout);
        let setup_timeout_ns = duration_nanos(config.setup_timeout);

        let shared = Arc::new(PublicationShared {
            conductor: CachePadded::new(ConductorFields {
                time_of_flush: AtomicI64::new(0),
                ref_count: AtomicI32::new(0),
                is_active: AtomicBool::new(true),
                reached_end_of_life: AtomicBool::new(false),
            }),
            receiver: CachePadded::new(ReceiverFields {
                sender_position_limit: AtomicI64::new(0),
                has_status_message_been_received: AtomicBool::new(false),
                should_send_setup_frame: AtomicBool::new(true),
            }),
            session_id,
            stream_id,
            term_position,
            term_window_length: term_window_length(config.term_length, config.term_window_length) as i64,
            linger_ns: duration_nanos(config.linger),
            max_payload_length: config.max_payload_length(),
            max_message_length: config.max_message_length(),
            log: log.clone(),
            endpoint: resources.endpoint.clone(),
            flow_control,
            counters: resources.counters.clone(),
            epoch_clock: resources.epoch_clock,
            sender_position: resources.sender_position.clone(),
            publisher_limit: resources.publisher_limit,
            naks: ArrayQueue::new(NAK_QUEUE_CAPACITY),
        });

        tracing::info!(
            "Created publication session={} stream={} initial_term_id={} term_length={} mtu={}",
            session_id,
            stream_id,
            initial_term_id,
            term_length,
            config.mtu_length
        );

        Ok(NetworkPublication {
            handle: PublicationHandle { shared },
            frame_sender: FrameSender {
                log,
                endpoint: resources.endpoint,
                counters: resources.counters,
                term_position,
                mtu_length: config.mtu_length,
                sender_position: resources.sender_position,
            },
            retransmit_handler: resources.retransmit_handler,
            setup_frame,
            heartbeat_frame,
            heartbeat_timeout_ns,
            setup_timeout_ns,
            time_of_last_send_or_heartbeat: now - heartbeat_timeout_ns - 1,
            time_of_last_setup: now - setup_timeout_ns - 1,
            track_sender_limits: true,
        })
    }

    /// Shared view for the receiver and conductor.
    pub fn handle(&self) -> &PublicationHandle {
        &self.handle
    }

    pub fn session_id(&self) -> i32 {
        self.handle.session_id()
    }

    pub fn stream_id(&self) -> i32 {
        self.handle.stream_id()
    }

    /// Run one duty cycle: setup frame, data, heartbeat, then retransmits.
    ///
    /// Returns the number of bytes of data sent.
    pub fn send(&mut self, now: i64) -> usize {
        let sender_position = self.frame_sender.sender_position.get();
        let term_position = self.frame_sender.term_position;
        let active_term_id = term_position.term_id(sender_position);
        let term_offset = term_position.term_offset(sender_position);

        if self.handle.should_send_setup_frame() {
            self.setup_message_check(now, active_term_id, term_offset);
        }

        let bytes_sent = self.send_data(now, sender_position, term_offset);

        if bytes_sent == 0 {
            self.heartbeat_message_check(now, active_term_id, term_offset);
            let limit = self.handle.shared.flow_control.on_idle(now);
            self.handle
                .shared
                .receiver
                .sender_position_limit
                .store(limit, Ordering::Release);
        }

        while let Some(nak) = self.handle.shared.naks.pop() {
            self.retransmit_handler.on_nak(
                nak.term_id,
                nak.term_offset,
                nak.length,
                now,
                &mut self.frame_sender,
            );
        }
        self.retransmit_handler
            .process_timeouts(now, &mut self.frame_sender);

        bytes_sent
    }

    /// Resend a NAKed range straight away, bypassing the retransmit handler.
    pub fn resend(&mut self, term_id: i32, term_offset: i32, length: i32) {
        self.frame_sender.resend(term_id, term_offset, length);
    }

    fn send_data(&mut self, now: i64, sender_position: i64, term_offset: i32) -> usize {
        let sender = &self.frame_sender;
        let available_window = self.handle.sender_position_limit() - sender_position;

        if available_window <= 0 {
            if self.track_sender_limits {
                self.track_sender_limits = false;
                sender.counters.sender_flow_control_limits.increment();
            }
            return 0;
        }

        let scan_limit = available_window.min(sender.mtu_length as i64) as usize;
        let index = sender.term_position.partition_index(sender_position);
        let term = sender.log.partition(index).term_buffer();
        let offset = term_offset as usize;

        let mut outcome = scan_for_availability(term, offset, scan_limit);
        if outcome.total() as i64 > available_window {
            // A padding frame is only skipped once the whole of it is inside the window
            outcome = ScanOutcome {
                available: outcome.available - DATA_HEADER_LENGTH,
                padding: 0,
            };
        }
        if outcome.is_empty() {
            return 0;
        }

        if sender.endpoint.send(term.slice(offset, outcome.available)) != outcome.available {
            sender.counters.data_packet_short_sends.increment();
            return 0;
        }

        self.time_of_last_send_or_heartbeat = now;
        self.track_sender_limits = true;
        sender
            .sender_position
            .set_ordered(sender_position + outcome.total() as i64);
        tracing::trace!(
            "Sent {} bytes at position {}, padding {}",
            outcome.available,
            sender_position,
            outcome.padding
        );

        outcome.available
    }

    fn setup_message_check(&mut self, now: i64, active_term_id: i32, term_offset: i32) {
        if now <= self.time_of_last_setup + self.setup_timeout_ns {
            return;
        }

        // Cleared before sending so that a request arriving mid-send survives
        if self.handle.has_status_message_been_received() {
            self.handle.clear_send_setup_frame();
        }

        let frame = self.setup_frame.patch(active_term_id, term_offset);
        if self.frame_sender.endpoint.send(frame) != SETUP_HEADER_LENGTH {
            self.frame_sender.counters.setup_message_short_sends.increment();
        }

        self.time_of_last_setup = now;
        self.time_of_last_send_or_heartbeat = now;
    }

    fn heartbeat_message_check(&mut self, now: i64, active_term_id: i32, term_offset: i32) {
        if now <= self.time_of_last_send_or_heartbeat + self.heartbeat_timeout_ns {
            return;
        }

        let frame = self.heartbeat_frame.patch(active_term_id, term_offset);
        if self.frame_sender.endpoint.send(frame) != DATA_HEADER_LENGTH {
            self.frame_sender.counters.data_packet_short_sends.increment();
        }

        self.frame_sender.counters.heartbeats_sent.increment();
        self.time_of_last_send_or_heartbeat = now;
    }
}

impl fmt::Debug for NetworkPublication {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkPublication")
            .field("handle", &self.handle)
            .field("time_of_last_setup", &self.time_of_last_setup)
            .field("track_sender_limits", &self.track_sender_limits)
            .finish()
    }
}
