//! Term Scanner
//!
//! Finds the run of committed frames available to send from an offset in a
//! term. Frames are never split; a padding frame ends the run and its body is
//! reported separately so the caller can skip it without sending it.

use crate::atomic_buffer::AtomicBuffer;
use crate::frame::{FrameType, DATA_HEADER_LENGTH, FRAME_ALIGNMENT, TYPE_FIELD_OFFSET};
use crate::position::align;

/// Result of a scan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScanOutcome {
    /// Bytes of complete frames ready to send, padding header included
    pub available: usize,
    /// Bytes of padding body following the available run
    pub padding: usize,
}

impl ScanOutcome {
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.available == 0
    }

    /// Distance the scanned cursor moves once `available` has been sent.
    #[inline]
    pub fn total(&self) -> usize {
        self.available + self.padding
    }
}

/// Scan committed frames starting at `offset`, up to `max_length` bytes.
pub fn scan_for_availability(term: &AtomicBuffer, offset: usize, max_length: usize) -> ScanOutcome {
    let max_available = max_length.min(term.capacity().saturating_sub(offset));
    let mut available = 0;
    let mut padding = 0;

    while available < max_available {
        let frame_offset = offset + available;
        let frame_length = term.get_i32_volatile(frame_offset);
        if frame_length <= 0 {
            break;
        }

        let mut aligned_length = align(frame_length as usize, FRAME_ALIGNMENT);
        if term.get_u16(frame_offset + TYPE_FIELD_OFFSET) == FrameType::Padding.as_u16() {
            padding = aligned_length - DATA_HEADER_LENGTH;
            aligned_length = DATA_HEADER_LENGTH;
        }

        available += aligned_length;

        if available > max_available {
            available -= aligned_length;
            padding = 0;
            break;
        }

        if padding != 0 {
            break;
        }
    }

    ScanOutcome { available, padding }
}
