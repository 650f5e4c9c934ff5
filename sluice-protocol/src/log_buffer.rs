//! Term Log
//!
//! A publication's log is a fixed set of [`PARTITION_COUNT`] terms used as a
//! circular buffer. Each partition carries a raw tail counter
//! (`term_id << 32 | term_offset`) advanced by publishers, and a cleaning
//! status raised when the partition is due to be reused. Log-wide metadata
//! holds the active partition index, the initial term id, the MTU, the time of
//! the last status message and the default frame header used for padding.
//!
//! Hot fields written by different parties sit on separate cache lines.

use crate::atomic_buffer::AtomicBuffer;
use crate::config::{MAX_UDP_PAYLOAD_LENGTH, TERM_MAX_LENGTH, TERM_MIN_LENGTH};
use crate::frame::{
    DataHeader, FrameType, BEGIN_AND_END_FLAGS, DATA_HEADER_LENGTH,
    FRAME_ALIGNMENT, FRAME_LENGTH_FIELD_OFFSET, TERM_ID_FIELD_OFFSET, TERM_OFFSET_FIELD_OFFSET,
    TYPE_FIELD_OFFSET, VERSION_FIELD_OFFSET,
};
use crate::position::{
    compute_position, next_partition_index, position_bits_to_shift, PARTITION_COUNT,
};
use bytes::BytesMut;
use crossbeam::utils::CachePadded;
use std::sync::atomic::{AtomicI32, AtomicI64, AtomicUsize, Ordering};
use thiserror::Error;

/// Partition status: ready for use.
pub const CLEAN: i32 = 0;

/// Partition status: fully consumed and due to be zeroed before reuse.
pub const NEEDS_CLEANING: i32 = 1;

/// Log construction errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum LogBufferError {
    #[error("Term length {0} is not a power of two between {min} and {max}", min = TERM_MIN_LENGTH, max = TERM_MAX_LENGTH)]
    InvalidTermLength(usize),

    #[error("MTU {0} must be a multiple of {align} between {min} and {max}", align = FRAME_ALIGNMENT, min = DATA_HEADER_LENGTH, max = MAX_UDP_PAYLOAD_LENGTH)]
    InvalidMtuLength(usize),
}

/// Check a term length is a power of two within the supported range.
pub fn check_term_length(term_length: usize) -> Result<(), LogBufferError> {
    if !(TERM_MIN_LENGTH..=TERM_MAX_LENGTH).contains(&term_length) || !term_length.is_power_of_two()
    {
        return Err(LogBufferError::InvalidTermLength(term_length));
    }
    Ok(())
}

/// Check an MTU is frame aligned and fits a UDP payload.
pub fn check_mtu_length(mtu_length: usize) -> Result<(), LogBufferError> {
    if mtu_length <= DATA_HEADER_LENGTH
        || mtu_length > MAX_UDP_PAYLOAD_LENGTH
        || mtu_length % FRAME_ALIGNMENT != 0
    {
        return Err(LogBufferError::InvalidMtuLength(mtu_length));
    }
    Ok(())
}

/// Term id packed in the upper half of a raw tail.
#[inline]
pub fn tail_term_id(raw_tail: i64) -> i32 {
    (raw_tail >> 32) as i32
}

/// Term offset packed in a raw tail, clamped to the term length since claims
/// may run past the end of the term.
#[inline]
pub fn tail_term_offset(raw_tail: i64, term_length: i32) -> i32 {
    let offset = raw_tail & 0xFFFF_FFFF;
    offset.min(term_length as i64) as i32
}

/// Raw tail value for the start of `term_id`.
#[inline]
pub fn pack_tail(term_id: i32, term_offset: i32) -> i64 {
    ((term_id as i64) << 32) | (term_offset as u32 as i64)
}

/// One term and its metadata.
pub struct TermPartition {
    term: AtomicBuffer,
    raw_tail: CachePadded<AtomicI64>,
    status: CachePadded<AtomicI32>,
}

impl TermPartition {
    fn new(term_length: usize) -> Self {
        TermPartition {
            term: AtomicBuffer::new(term_length),
            raw_tail: CachePadded::new(AtomicI64::new(0)),
            status: CachePadded::new(AtomicI32::new(CLEAN)),
        }
    }

    #[inline]
    pub fn term_buffer(&self) -> &AtomicBuffer {
        &self.term
    }

    #[inline]
    pub fn raw_tail_volatile(&self) -> i64 {
        self.raw_tail.load(Ordering::Acquire)
    }

    /// Claim `length` bytes, returning the raw tail before the claim.
    #[inline]
    pub fn get_and_add_raw_tail(&self, length: i32) -> i64 {
        self.raw_tail.fetch_add(length as i64, Ordering::AcqRel)
    }

    #[inline]
    pub fn set_raw_tail_ordered(&self, raw_tail: i64) {
        self.raw_tail.store(raw_tail, Ordering::Release);
    }

    #[inline]
    pub fn compare_and_set_raw_tail(&self, expected: i64, update: i64) -> bool {
        self.raw_tail
            .compare_exchange(expected, update, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Tail offset as last observed by publishers, clamped to the term.
    #[inline]
    pub fn tail_offset_volatile(&self) -> i32 {
        tail_term_offset(self.raw_tail_volatile(), self.term.capacity() as i32)
    }

    #[inline]
    pub fn status(&self) -> i32 {
        self.status.load(Ordering::Acquire)
    }

    #[inline]
    pub fn status_ordered(&self, status: i32) {
        self.status.store(status, Ordering::Release);
    }

    /// Zero the term and mark it clean.
    pub fn clean(&self) {
        self.term.set_memory(0, self.term.capacity(), 0);
        self.status_ordered(CLEAN);
    }
}

/// Log-wide metadata.
struct LogMetaData {
    active_partition_index: CachePadded<AtomicUsize>,
    time_of_last_status_message: CachePadded<AtomicI64>,
    initial_term_id: i32,
    mtu_length: i32,
    default_frame_header: [u8; DATA_HEADER_LENGTH],
}

/// The partitions and metadata backing one publication.
pub struct LogBuffers {
    term_length: i32,
    partitions: [TermPartition; PARTITION_COUNT],
    meta: LogMetaData,
}

impl LogBuffers {
    /// Allocate a log for one stream.
    pub fn new(
        term_length: usize,
        mtu_length: usize,
        initial_term_id: i32,
        session_id: i32,
        stream_id: i32,
    ) -> Result<Self, LogBufferError> {
        check_term_length(term_length)?;
        check_mtu_length(mtu_length)?;

        let mut header = BytesMut::with_capacity(DATA_HEADER_LENGTH);
        DataHeader {
            frame_length: 0,
            flags: BEGIN_AND_END_FLAGS,
            frame_type: FrameType::Data,
            term_offset: 0,
            session_id,
            stream_id,
            term_id: initial_term_id,
            reserved_value: 0,
        }
        .to_bytes(&mut header);
        let mut default_frame_header = [0u8; DATA_HEADER_LENGTH];
        default_frame_header.copy_from_slice(&header);

        let partitions = [
            TermPartition::new(term_length),
            TermPartition::new(term_length),
            TermPartition::new(term_length),
        ];
        // Unused partitions start with term ids that can never be rotated into.
        for (i, partition) in partitions.iter().enumerate() {
            let term_id = if i == 0 {
                initial_term_id
            } else {
                initial_term_id
                    .wrapping_add(i as i32)
                    .wrapping_sub(PARTITION_COUNT as i32)
            };
            partition.set_raw_tail_ordered(pack_tail(term_id, 0));
        }

        tracing::debug!(
            "Allocated log: session={} stream={} term_length={} mtu={} initial_term_id={}",
            session_id,
            stream_id,
            term_length,
            mtu_length,
            initial_term_id
        );

        Ok(LogBuffers {
            term_length: term_length as i32,
            partitions,
            meta: LogMetaData {
                active_partition_index: CachePadded::new(AtomicUsize::new(0)),
                time_of_last_status_message: CachePadded::new(AtomicI64::new(0)),
                initial_term_id,
                mtu_length: mtu_length as i32,
                default_frame_header,
            },
        })
    }

    #[inline]
    pub fn term_length(&self) -> i32 {
        self.term_length
    }

    #[inline]
    pub fn initial_term_id(&self) -> i32 {
        self.meta.initial_term_id
    }

    #[inline]
    pub fn mtu_length(&self) -> i32 {
        self.meta.mtu_length
    }

    #[inline]
    pub fn partitions(&self) -> &[TermPartition] {
        &self.partitions
    }

    #[inline]
    pub fn partition(&self, index: usize) -> &TermPartition {
        &self.partitions[index]
    }

    #[inline]
    pub fn active_partition_index(&self) -> usize {
        self.meta.active_partition_index.load(Ordering::Acquire)
    }

    pub fn time_of_last_status_message(&self) -> i64 {
        self.meta.time_of_last_status_message.load(Ordering::Acquire)
    }

    pub fn set_time_of_last_status_message(&self, time_ms: i64) {
        self.meta
            .time_of_last_status_message
            .store(time_ms, Ordering::Release);
    }

    /// Header template with this stream's session and stream ids.
    pub fn default_frame_header(&self) -> &[u8; DATA_HEADER_LENGTH] {
        &self.meta.default_frame_header
    }

    /// Current end of the data appended by publishers.
    pub fn producer_position(&self) -> i64 {
        let raw_tail = self.partitions[self.active_partition_index()].raw_tail_volatile();
        compute_position(
            tail_term_id(raw_tail),
            tail_term_offset(raw_tail, self.term_length),
            position_bits_to_shift(self.term_length),
            self.meta.initial_term_id,
        )
    }

    /// Move publishers on from the term identified by `term_id`.
    ///
    /// The next partition starts the following term and becomes active; the
    /// partition after it, which held the oldest term, is flagged for cleaning.
    /// Returns false if another publisher already rotated past `term_id`, or
    /// if the next partition has not been cleaned yet.
    pub fn rotate_log(&self, term_id: i32) -> bool {
        let current_index = self.active_partition_index();
        let current_term_id = tail_term_id(self.partitions[current_index].raw_tail_volatile());
        if current_term_id != term_id {
            return false;
        }

        let next_index = next_partition_index(current_index);
        let next = &self.partitions[next_index];
        if next.status() != CLEAN {
            tracing::debug!("Partition {} not yet cleaned, deferring rotation", next_index);
            return false;
        }

        let next_term_id = term_id.wrapping_add(1);
        let next_raw_tail = next.raw_tail_volatile();
        if tail_term_id(next_raw_tail) != next_term_id {
            next.compare_and_set_raw_tail(next_raw_tail, pack_tail(next_term_id, 0));
        }

        self.partitions[next_partition_index(next_index)].status_ordered(NEEDS_CLEANING);

        let rotated = self
            .meta
            .active_partition_index
            .compare_exchange(current_index, next_index, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();

        if rotated {
            tracing::trace!("Rotated log to term {} in partition {}", next_term_id, next_index);
        }
        rotated
    }

    /// Write a padding frame of `length` bytes at `offset`.
    ///
    /// The frame length is published last with an ordered store.
    pub fn write_padding_frame(&self, term: &AtomicBuffer, offset: usize, term_id: i32, length: i32) {
        self.write_frame_header(term, offset, term_id, -length);
        term.put_u16(TYPE_FIELD_OFFSET + offset, FrameType::Padding.as_u16());
        term.put_i32_ordered(FRAME_LENGTH_FIELD_OFFSET + offset, length);
    }

    /// Copy the default header to `offset` with the given term id and a
    /// provisional frame length.
    pub(crate) fn write_frame_header(
        &self,
        term: &AtomicBuffer,
        offset: usize,
        term_id: i32,
        provisional_length: i32,
    ) {
        term.put_i32_ordered(FRAME_LENGTH_FIELD_OFFSET + offset, provisional_length);
        term.put_bytes(
            offset + VERSION_FIELD_OFFSET,
            &self.meta.default_frame_header[VERSION_FIELD_OFFSET..],
        );
        term.put_i32(offset + TERM_OFFSET_FIELD_OFFSET, offset as i32);
        term.put_i32(offset + TERM_ID_FIELD_OFFSET, term_id);
    }
}
