//! Shared byte buffer with atomic access to aligned words
//!
//! Term contents are written by publishers and read by the sender at the same
//! time, in disjoint regions. The hand-off for each frame is the frame length
//! word: writers publish it with an ordered (release) store after the frame
//! body is in place, readers load it with acquire semantics before touching
//! the body. Everything else is plain little-endian access.
//!
//! The backing storage is a slice of `AtomicU64`, which gives 8-byte alignment
//! and interior mutability for the whole region.

use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};

pub struct AtomicBuffer {
    words: Box<[AtomicU64]>,
    capacity: usize,
}

impl AtomicBuffer {
    /// Allocate a zeroed buffer. `capacity` must be a multiple of 8.
    pub fn new(capacity: usize) -> Self {
        assert_eq!(capacity % 8, 0, "capacity {} is not a multiple of 8", capacity);
        let words = (0..capacity / 8).map(|_| AtomicU64::new(0)).collect();
        AtomicBuffer { words, capacity }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    fn ptr(&self) -> *mut u8 {
        self.words.as_ptr() as *mut u8
    }

    #[inline]
    fn bounds_check(&self, offset: usize, length: usize) {
        assert!(
            offset <= self.capacity && length <= self.capacity - offset,
            "access [{}, {}) out of bounds for capacity {}",
            offset,
            offset + length,
            self.capacity
        );
    }

    #[inline]
    fn atomic_i32(&self, offset: usize) -> &AtomicI32 {
        self.bounds_check(offset, 4);
        assert_eq!(offset % 4, 0, "unaligned atomic access at {}", offset);
        // SAFETY: in bounds, 4-byte aligned, and the storage is made of atomics
        // so shared mutation through this reference is permitted.
        unsafe { &*(self.ptr().add(offset) as *const AtomicI32) }
    }

    /// Load an i32 with acquire semantics.
    #[inline]
    pub fn get_i32_volatile(&self, offset: usize) -> i32 {
        i32::from_le(self.atomic_i32(offset).load(Ordering::Acquire))
    }

    /// Store an i32 with release semantics.
    #[inline]
    pub fn put_i32_ordered(&self, offset: usize, value: i32) {
        self.atomic_i32(offset).store(value.to_le(), Ordering::Release);
    }

    pub fn get_i32(&self, offset: usize) -> i32 {
        let mut bytes = [0u8; 4];
        self.get_bytes(offset, &mut bytes);
        i32::from_le_bytes(bytes)
    }

    pub fn put_i32(&self, offset: usize, value: i32) {
        self.put_bytes(offset, &value.to_le_bytes());
    }

    pub fn get_u16(&self, offset: usize) -> u16 {
        let mut bytes = [0u8; 2];
        self.get_bytes(offset, &mut bytes);
        u16::from_le_bytes(bytes)
    }

    pub fn put_u16(&self, offset: usize, value: u16) {
        self.put_bytes(offset, &value.to_le_bytes());
    }

    pub fn get_u8(&self, offset: usize) -> u8 {
        let mut bytes = [0u8; 1];
        self.get_bytes(offset, &mut bytes);
        bytes[0]
    }

    pub fn put_u8(&self, offset: usize, value: u8) {
        self.put_bytes(offset, &[value]);
    }

    pub fn put_bytes(&self, offset: usize, src: &[u8]) {
        self.bounds_check(offset, src.len());
        // SAFETY: bounds checked; the destination is interior-mutable storage
        // owned by this buffer and cannot overlap `src`.
        unsafe { ptr::copy_nonoverlapping(src.as_ptr(), self.ptr().add(offset), src.len()) }
    }

    pub fn get_bytes(&self, offset: usize, dst: &mut [u8]) {
        self.bounds_check(offset, dst.len());
        // SAFETY: bounds checked; `dst` is an exclusive borrow outside this buffer.
        unsafe { ptr::copy_nonoverlapping(self.ptr().add(offset), dst.as_mut_ptr(), dst.len()) }
    }

    /// Borrow a committed region for transmission.
    ///
    /// Callers only borrow regions whose frames have been committed and which
    /// no writer touches again until the term is cleaned.
    pub fn slice(&self, offset: usize, length: usize) -> &[u8] {
        self.bounds_check(offset, length);
        // SAFETY: bounds checked; see the method contract for aliasing.
        unsafe { std::slice::from_raw_parts(self.ptr().add(offset), length) }
    }

    pub fn set_memory(&self, offset: usize, length: usize, value: u8) {
        self.bounds_check(offset, length);
        // SAFETY: bounds checked, interior-mutable storage.
        unsafe { ptr::write_bytes(self.ptr().add(offset), value, length) }
    }
}

impl fmt::Debug for AtomicBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AtomicBuffer(capacity={})", self.capacity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_is_zeroed() {
        let buffer = AtomicBuffer::new(64);
        assert_eq!(buffer.capacity(), 64);
        assert!(buffer.slice(0, 64).iter().all(|&b| b == 0));
    }

    #[test]
    fn test_ordered_roundtrip() {
        let buffer = AtomicBuffer::new(64);
        buffer.put_i32_ordered(32, -1408);
        assert_eq!(buffer.get_i32_volatile(32), -1408);
        assert_eq!(buffer.get_i32(32), -1408);
        assert_eq!(buffer.slice(32, 4), &(-1408_i32).to_le_bytes());
    }

    #[test]
    fn test_plain_access() {
        let buffer = AtomicBuffer::new(16);
        buffer.put_u16(6, 0x0105);
        buffer.put_u8(5, 0xC0);
        assert_eq!(buffer.get_u16(6), 0x0105);
        assert_eq!(buffer.get_u8(5), 0xC0);

        buffer.set_memory(0, 16, 0);
        assert_eq!(buffer.get_u16(6), 0);
    }

    #[test]
    #[should_panic]
    fn test_out_of_bounds() {
        let buffer = AtomicBuffer::new(16);
        buffer.put_bytes(12, &[0u8; 8]);
    }

    #[test]
    #[should_panic]
    fn test_unaligned_atomic() {
        let buffer = AtomicBuffer::new(16);
        buffer.get_i32_volatile(2);
    }
}
