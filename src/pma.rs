//! Packet memory allocator
//!
//! A bump allocator. Buffers are never freed individually; the driver resets
//! the allocator whenever it reconfigures all endpoints.

use crate::BTABLE_SIZE;

/// Packet memory allocator
pub struct Allocator {
    next: usize,
    capacity: usize,
}

impl Allocator {
    /// Create an allocator for `capacity` bytes of packet memory
    ///
    /// The descriptor table is already reserved.
    pub const fn new(capacity: usize) -> Self {
        Allocator {
            next: BTABLE_SIZE,
            capacity,
        }
    }

    /// Release every buffer, keeping the descriptor table
    pub fn reset(&mut self) {
        self.next = BTABLE_SIZE;
    }

    /// Allocates a buffer of `size` bytes, returning its packet memory address
    ///
    /// The buffer is rounded up to an even size, so every buffer starts on a
    /// halfword boundary. A zero-sized buffer doesn't consume any memory.
    ///
    /// # Panics
    ///
    /// Panics if the packet memory is exhausted.
    pub fn allocate(&mut self, size: u16) -> u16 {
        let addr = self.next;
        let next = addr + ((size as usize + 1) & !1);
        assert!(
            next <= self.capacity,
            "packet memory exhausted ({} of {} bytes)",
            next,
            self.capacity
        );
        self.next = next;
        addr as u16
    }

    /// Returns the next address that would be allocated
    pub fn next(&self) -> usize {
        self.next
    }
}

#[cfg(test)]
mod test {
    use super::Allocator;
    use crate::BTABLE_SIZE;

    #[test]
    fn first_buffer_follows_descriptor_table() {
        let mut alloc = Allocator::new(512);
        assert_eq!(alloc.allocate(64), BTABLE_SIZE as u16);
        assert_eq!(alloc.allocate(64), BTABLE_SIZE as u16 + 64);
        assert_eq!(alloc.next(), BTABLE_SIZE + 128);
    }

    #[test]
    fn odd_sizes_round_up() {
        let mut alloc = Allocator::new(512);
        let a = alloc.allocate(7);
        let b = alloc.allocate(1);
        let c = alloc.allocate(0);
        let d = alloc.allocate(3);
        assert_eq!(b - a, 8);
        assert_eq!(c - b, 2);
        assert_eq!(d, c);
        for addr in [a, b, c, d] {
            assert_eq!(addr % 2, 0);
        }
    }

    #[test]
    fn allocate_entire_memory() {
        let mut alloc = Allocator::new(BTABLE_SIZE + 64);
        alloc.allocate(64);
        assert_eq!(alloc.next(), BTABLE_SIZE + 64);
        alloc.allocate(0);
    }

    #[test]
    #[should_panic]
    fn exhausted() {
        let mut alloc = Allocator::new(BTABLE_SIZE + 64);
        alloc.allocate(63);
        alloc.allocate(1);
    }

    #[test]
    fn reset_restarts_after_descriptor_table() {
        let mut alloc = Allocator::new(512);
        alloc.allocate(200);
        alloc.reset();
        assert_eq!(alloc.allocate(8), BTABLE_SIZE as u16);
    }
}
