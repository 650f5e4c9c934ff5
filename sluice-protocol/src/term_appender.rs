//! Publisher-Side Appender
//!
//! Publishers claim space in the active term with an atomic add on its raw
//! tail, then write one or more frames into the claimed region. Each frame is
//! written with a negative length first and committed by an ordered store of
//! the positive length, which is what the sender's scanner waits for.
//!
//! A claim that runs past the end of the term trips it: the publisher that
//! tripped pads out the rest of the term and the log is rotated.

use crate::atomic_buffer::AtomicBuffer;
use crate::counters::Position;
use crate::frame::{
    BEGIN_FLAG, DATA_HEADER_LENGTH, END_FLAG, FLAGS_FIELD_OFFSET, FRAME_ALIGNMENT,
    FRAME_LENGTH_FIELD_OFFSET,
};
use crate::log_buffer::{tail_term_id, LogBuffers, TermPartition};
use crate::position::{align, TermPosition};
use std::sync::Arc;
use thiserror::Error;

/// Reasons an offer did not append the message
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferError {
    #[error("No receiver has been heard from yet")]
    NotConnected,

    #[error("Publication is back pressured by flow control")]
    BackPressured,

    #[error("Log rotated, retry the offer")]
    AdminAction,

    #[error("Message of {length} bytes exceeds the maximum of {max}")]
    MaxMessageLengthExceeded { length: usize, max: usize },
}

enum AppendOutcome {
    /// Frames written; term offset after the last one
    Appended(i64),
    /// The claim reached or passed the end of the term
    EndOfTerm,
}

/// Appends messages to a publication's log
#[derive(Clone)]
pub struct Publisher {
    log: Arc<LogBuffers>,
    publisher_limit: Position,
    term_position: TermPosition,
    max_payload_length: usize,
    max_message_length: usize,
}

impl Publisher {
    pub fn new(
        log: Arc<LogBuffers>,
        publisher_limit: Position,
        max_payload_length: usize,
        max_message_length: usize,
    ) -> Self {
        let term_position = TermPosition::new(log.term_length(), log.initial_term_id());
        Publisher {
            log,
            publisher_limit,
            term_position,
            max_payload_length,
            max_message_length,
        }
    }

    pub fn max_payload_length(&self) -> usize {
        self.max_payload_length
    }

    pub fn max_message_length(&self) -> usize {
        self.max_message_length
    }

    /// Current limit on the stream position publishers may append up to.
    pub fn position_limit(&self) -> i64 {
        self.publisher_limit.get_volatile()
    }

    /// Append `message`, fragmenting it if it exceeds one frame.
    ///
    /// Returns the stream position after the message.
    pub fn offer(&self, message: &[u8]) -> Result<i64, OfferError> {
        if message.len() > self.max_message_length {
            return Err(OfferError::MaxMessageLengthExceeded {
                length: message.len(),
                max: self.max_message_length,
            });
        }

        let limit = self.publisher_limit.get_volatile();
        let partition = self.log.partition(self.log.active_partition_index());
        let raw_tail = partition.raw_tail_volatile();
        let term_offset = (raw_tail & 0xFFFF_FFFF).min(self.log.term_length() as i64);
        let position = self.term_position.position(tail_term_id(raw_tail), 0) + term_offset;

        if position >= limit {
            return Err(if limit == 0 {
                OfferError::NotConnected
            } else {
                OfferError::BackPressured
            });
        }

        let (term_id, outcome) = if message.len() <= self.max_payload_length {
            self.append_unfragmented(partition, message)
        } else {
            self.append_fragmented(partition, message)
        };

        match outcome {
            AppendOutcome::Appended(resulting_offset) => {
                Ok(self.term_position.position(term_id, 0) + resulting_offset)
            }
            AppendOutcome::EndOfTerm => {
                self.log.rotate_log(term_id);
                Err(OfferError::AdminAction)
            }
        }
    }

    fn append_unfragmented(&self, partition: &TermPartition, message: &[u8]) -> (i32, AppendOutcome) {
        let frame_length = message.len() + DATA_HEADER_LENGTH;
        let aligned_length = align(frame_length, FRAME_ALIGNMENT);

        let raw_tail = partition.get_and_add_raw_tail(aligned_length as i32);
        let term_id = tail_term_id(raw_tail);
        let term_offset = raw_tail & 0xFFFF_FFFF;
        let resulting_offset = term_offset + aligned_length as i64;
        let term = partition.term_buffer();

        if resulting_offset > self.log.term_length() as i64 {
            return (term_id, self.handle_end_of_term(term, term_offset, term_id));
        }

        let offset = term_offset as usize;
        self.log.write_frame_header(term, offset, term_id, -(frame_length as i32));
        term.put_bytes(offset + DATA_HEADER_LENGTH, message);
        term.put_i32_ordered(offset + FRAME_LENGTH_FIELD_OFFSET, frame_length as i32);

        (term_id, AppendOutcome::Appended(resulting_offset))
    }

    fn append_fragmented(&self, partition: &TermPartition, message: &[u8]) -> (i32, AppendOutcome) {
        let full_frames = message.len() / self.max_payload_length;
        let remainder = message.len() % self.max_payload_length;
        let last_frame_length = if remainder > 0 {
            align(remainder + DATA_HEADER_LENGTH, FRAME_ALIGNMENT)
        } else {
            0
        };
        let required_length =
            full_frames * align(self.max_payload_length + DATA_HEADER_LENGTH, FRAME_ALIGNMENT)
                + last_frame_length;

        let raw_tail = partition.get_and_add_raw_tail(required_length as i32);
        let term_id = tail_term_id(raw_tail);
        let term_offset = raw_tail & 0xFFFF_FFFF;
        let resulting_offset = term_offset + required_length as i64;
        let term = partition.term_buffer();

        if resulting_offset > self.log.term_length() as i64 {
            return (term_id, self.handle_end_of_term(term, term_offset, term_id));
        }

        let mut flags = BEGIN_FLAG;
        let mut offset = term_offset as usize;
        for chunk in message.chunks(self.max_payload_length) {
            let frame_length = chunk.len() + DATA_HEADER_LENGTH;
            let last = offset + align(frame_length, FRAME_ALIGNMENT) == resulting_offset as usize;
            if last {
                flags |= END_FLAG;
            }

            self.log.write_frame_header(term, offset, term_id, -(frame_length as i32));
            term.put_bytes(offset + DATA_HEADER_LENGTH, chunk);
            term.put_u8(offset + FLAGS_FIELD_OFFSET, flags);
            term.put_i32_ordered(offset + FRAME_LENGTH_FIELD_OFFSET, frame_length as i32);

            flags = 0;
            offset += align(frame_length, FRAME_ALIGNMENT);
        }

        (term_id, AppendOutcome::Appended(resulting_offset))
    }

    fn handle_end_of_term(&self, term: &AtomicBuffer, term_offset: i64, term_id: i32) -> AppendOutcome {
        let term_length = self.log.term_length() as i64;
        if term_offset < term_length {
            let padding_length = (term_length - term_offset) as i32;
            self.log
                .write_padding_frame(term, term_offset as usize, term_id, padding_length);
        }
        AppendOutcome::EndOfTerm
    }
}
