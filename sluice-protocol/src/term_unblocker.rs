//! Term Unblocker
//!
//! A publisher that dies between claiming space and committing its frame
//! leaves a hole the sender can never scan past. Unblocking turns the hole
//! into a padding frame so the stream can move on. Only ever done after the
//! consumer position has been stuck for a long time.

use crate::atomic_buffer::AtomicBuffer;
use crate::frame::FRAME_ALIGNMENT;
use crate::log_buffer::{tail_term_id, tail_term_offset, LogBuffers};
use crate::position::TermPosition;

/// Outcome of an unblock attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnblockStatus {
    /// Nothing to unblock
    NoAction,
    /// Hole replaced with padding
    Unblocked,
    /// Hole ran to the end of the term, which is now padded out
    UnblockedToEnd,
}

/// Unblock a term at `blocked_offset`, looking no further than `tail_offset`.
pub fn unblock(
    log: &LogBuffers,
    term: &AtomicBuffer,
    blocked_offset: usize,
    tail_offset: usize,
    term_id: i32,
) -> UnblockStatus {
    let frame_length = term.get_i32_volatile(blocked_offset);

    if frame_length < 0 {
        log.write_padding_frame(term, blocked_offset, term_id, -frame_length);
        return UnblockStatus::Unblocked;
    }
    if frame_length > 0 {
        return UnblockStatus::NoAction;
    }

    let mut current_offset = blocked_offset + FRAME_ALIGNMENT;
    while current_offset < tail_offset {
        if term.get_i32_volatile(current_offset) != 0 {
            if is_zeroed_back_to(term, current_offset, blocked_offset) {
                let length = (current_offset - blocked_offset) as i32;
                log.write_padding_frame(term, blocked_offset, term_id, length);
                return UnblockStatus::Unblocked;
            }
            return UnblockStatus::NoAction;
        }
        current_offset += FRAME_ALIGNMENT;
    }

    if current_offset >= term.capacity() && term.get_i32_volatile(blocked_offset) == 0 {
        let length = (term.capacity() - blocked_offset) as i32;
        log.write_padding_frame(term, blocked_offset, term_id, length);
        return UnblockStatus::UnblockedToEnd;
    }

    UnblockStatus::NoAction
}

fn is_zeroed_back_to(term: &AtomicBuffer, end_offset: usize, blocked_offset: usize) -> bool {
    (blocked_offset..end_offset)
        .step_by(FRAME_ALIGNMENT)
        .all(|offset| term.get_i32_volatile(offset) == 0)
}

/// Unblock the log at the stream position the consumer is stuck at.
///
/// Returns true if the log was unblocked.
pub fn unblock_log(log: &LogBuffers, blocked_position: i64) -> bool {
    let term_position = TermPosition::new(log.term_length(), log.initial_term_id());
    let blocked_term_id = term_position.term_id(blocked_position);
    let blocked_offset = term_position.term_offset(blocked_position) as usize;
    let partition = log.partition(term_position.partition_index(blocked_position));

    let raw_tail = partition.raw_tail_volatile();
    if tail_term_id(raw_tail) != blocked_term_id {
        return false;
    }
    let tail_offset = tail_term_offset(raw_tail, log.term_length()) as usize;
    if blocked_offset >= tail_offset {
        return false;
    }

    match unblock(log, partition.term_buffer(), blocked_offset, tail_offset, blocked_term_id) {
        UnblockStatus::UnblockedToEnd => {
            log.rotate_log(blocked_term_id);
            tracing::warn!("Unblocked log to end of term {} from offset {}", blocked_term_id, blocked_offset);
            true
        }
        UnblockStatus::Unblocked => {
            tracing::warn!("Unblocked log in term {} at offset {}", blocked_term_id, blocked_offset);
            true
        }
        UnblockStatus::NoAction => false,
    }
}
