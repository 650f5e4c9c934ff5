//! Stream Position Arithmetic
//!
//! A stream position is a monotonic 64-bit byte offset into an unbounded
//! logical stream. With a power-of-two term length it decomposes into a term
//! id (which increases without bound, starting at the initial term id) and an
//! offset inside that term. The physical partition backing a term is the term
//! count modulo [`PARTITION_COUNT`].

use std::fmt;

/// Number of term partitions in a log.
pub const PARTITION_COUNT: usize = 3;

/// Number of bits to shift a position right to get the term count.
#[inline]
pub fn position_bits_to_shift(term_length: i32) -> u32 {
    term_length.trailing_zeros()
}

/// Term id of the term containing `position`.
#[inline]
pub fn compute_term_id_from_position(position: i64, bits_to_shift: u32, initial_term_id: i32) -> i32 {
    ((position >> bits_to_shift) as i32).wrapping_add(initial_term_id)
}

/// Offset of `position` within its term.
#[inline]
pub fn compute_term_offset_from_position(position: i64, bits_to_shift: u32) -> i32 {
    let mask = (1_i64 << bits_to_shift) - 1;
    (position & mask) as i32
}

/// Position of `term_offset` in the term identified by `term_id`.
#[inline]
pub fn compute_position(term_id: i32, term_offset: i32, bits_to_shift: u32, initial_term_id: i32) -> i64 {
    let term_count = term_id.wrapping_sub(initial_term_id) as i64;
    (term_count << bits_to_shift) + term_offset as i64
}

/// Position at which the term identified by `term_id` begins.
#[inline]
pub fn compute_term_begin_position(term_id: i32, bits_to_shift: u32, initial_term_id: i32) -> i64 {
    compute_position(term_id, 0, bits_to_shift, initial_term_id)
}

/// Partition index holding `position`.
#[inline]
pub fn index_by_position(position: i64, bits_to_shift: u32) -> usize {
    ((position >> bits_to_shift) as u64 % PARTITION_COUNT as u64) as usize
}

/// Partition index holding the term identified by `term_id`.
#[inline]
pub fn index_by_term(initial_term_id: i32, term_id: i32) -> usize {
    (term_id.wrapping_sub(initial_term_id) as i64).rem_euclid(PARTITION_COUNT as i64) as usize
}

/// Partition that follows `index` in rotation order.
#[inline]
pub fn next_partition_index(index: usize) -> usize {
    (index + 1) % PARTITION_COUNT
}

/// Round `value` up to the next multiple of `alignment` (a power of two).
#[inline]
pub fn align(value: usize, alignment: usize) -> usize {
    (value + (alignment - 1)) & !(alignment - 1)
}

/// Position arithmetic bound to one stream's term length and initial term id.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct TermPosition {
    bits_to_shift: u32,
    term_length_mask: i64,
    initial_term_id: i32,
}

impl TermPosition {
    /// Create a calculator for a power-of-two `term_length`.
    pub fn new(term_length: i32, initial_term_id: i32) -> Self {
        debug_assert!(term_length > 0 && (term_length & (term_length - 1)) == 0);
        TermPosition {
            bits_to_shift: position_bits_to_shift(term_length),
            term_length_mask: term_length as i64 - 1,
            initial_term_id,
        }
    }

    #[inline]
    pub fn bits_to_shift(&self) -> u32 {
        self.bits_to_shift
    }

    #[inline]
    pub fn initial_term_id(&self) -> i32 {
        self.initial_term_id
    }

    #[inline]
    pub fn term_length(&self) -> i32 {
        (self.term_length_mask + 1) as i32
    }

    #[inline]
    pub fn term_id(&self, position: i64) -> i32 {
        compute_term_id_from_position(position, self.bits_to_shift, self.initial_term_id)
    }

    #[inline]
    pub fn term_offset(&self, position: i64) -> i32 {
        (position & self.term_length_mask) as i32
    }

    #[inline]
    pub fn partition_index(&self, position: i64) -> usize {
        index_by_position(position, self.bits_to_shift)
    }

    #[inline]
    pub fn partition_index_by_term(&self, term_id: i32) -> usize {
        index_by_term(self.initial_term_id, term_id)
    }

    #[inline]
    pub fn position(&self, term_id: i32, term_offset: i32) -> i64 {
        compute_position(term_id, term_offset, self.bits_to_shift, self.initial_term_id)
    }
}

impl fmt::Debug for TermPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TermPosition(term_length={}, initial_term_id={})",
            self.term_length(),
            self.initial_term_id
        )
    }
}
