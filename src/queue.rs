//! Circular byte queues
//!
//! A [`Queue`] is a ring buffer shared between an application thread and the
//! USB interrupt. The interrupt moves whole packets into or out of the ring,
//! then updates the byte counter and wakes any waiting threads.
//!
//! An *input* queue carries OUT data to the application; its counter is the
//! number of bytes ready to [`get()`](Queue::get). An *output* queue carries
//! IN data to the host; its counter is the free space available to
//! [`put()`](Queue::put).

use core::cell::Cell;
use cortex_m::interrupt::CriticalSection;

/// Threads that wait on a queue
///
/// The driver calls [`wake_all()`](WaitList::wake_all) from interrupt context
/// each time it moves a packet through the queue. Implementations must not
/// block.
pub trait WaitList: Sync {
    /// Release every thread waiting on the queue
    fn wake_all(&self);
}

/// A wait list for queues that nobody waits on
#[derive(Clone, Copy, Debug, Default)]
pub struct NoWaiters;

impl WaitList for NoWaiters {
    fn wake_all(&self) {}
}

/// A circular byte queue
///
/// The queue borrows its storage. The application side ([`get()`](Queue::get),
/// [`put()`](Queue::put), [`read()`](Queue::read), [`write()`](Queue::write))
/// requires a critical section, so that it never runs concurrently with the
/// USB interrupt.
pub struct Queue<'a> {
    buffer: &'a [Cell<u8>],
    rdptr: Cell<usize>,
    wrptr: Cell<usize>,
    counter: Cell<usize>,
    waiting: &'a dyn WaitList,
}

impl<'a> Queue<'a> {
    /// Create an input queue, for data received from the host
    ///
    /// The queue starts empty.
    pub fn input(buffer: &'a mut [u8], waiting: &'a dyn WaitList) -> Self {
        Self::with_counter(buffer, 0, waiting)
    }

    /// Create an output queue, for data sent to the host
    ///
    /// The queue starts empty, so its whole capacity is free.
    pub fn output(buffer: &'a mut [u8], waiting: &'a dyn WaitList) -> Self {
        let free = buffer.len();
        Self::with_counter(buffer, free, waiting)
    }

    fn with_counter(buffer: &'a mut [u8], counter: usize, waiting: &'a dyn WaitList) -> Self {
        Queue {
            buffer: Cell::from_mut(buffer).as_slice_of_cells(),
            rdptr: Cell::new(0),
            wrptr: Cell::new(0),
            counter: Cell::new(counter),
            waiting,
        }
    }

    /// Returns the queue's capacity, in bytes
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Returns the queue's byte counter
    ///
    /// For an input queue, this is the number of bytes ready to read. For
    /// an output queue, it's the free space.
    ///
    /// The USB interrupt updates the counter, so reading it takes a critical
    /// section, like every other application-side access.
    ///
    /// ```compile_fail
    /// use pma_usbd::{NoWaiters, Queue};
    ///
    /// let mut storage = [0; 4];
    /// let queue = Queue::input(&mut storage, &NoWaiters);
    /// let ready = queue.counter();
    /// ```
    pub fn counter(&self, _: &CriticalSection) -> usize {
        self.counter.get()
    }

    /// Dequeue one byte from an input queue
    ///
    /// Returns `None` if the queue is empty.
    pub fn get(&self, _: &CriticalSection) -> Option<u8> {
        let counter = self.counter.get();
        if counter == 0 {
            return None;
        }
        self.counter.set(counter - 1);
        Some(self.pop())
    }

    /// Enqueue one byte into an output queue
    ///
    /// Returns the byte if the queue is full.
    pub fn put(&self, _: &CriticalSection, byte: u8) -> Result<(), u8> {
        let counter = self.counter.get();
        if counter == 0 {
            return Err(byte);
        }
        self.counter.set(counter - 1);
        self.push(byte);
        Ok(())
    }

    /// Dequeue as many bytes as possible into `buffer`
    ///
    /// Returns the number of bytes read.
    pub fn read(&self, cs: &CriticalSection, buffer: &mut [u8]) -> usize {
        let mut read = 0;
        for slot in buffer.iter_mut() {
            match self.get(cs) {
                Some(byte) => *slot = byte,
                None => break,
            }
            read += 1;
        }
        read
    }

    /// Enqueue as many bytes of `data` as possible
    ///
    /// Returns the number of bytes written.
    pub fn write(&self, cs: &CriticalSection, data: &[u8]) -> usize {
        data.iter()
            .take_while(|byte| self.put(cs, **byte).is_ok())
            .count()
    }

    /// Store a byte at the write cursor, and advance it
    ///
    /// The counter isn't changed; see [`commit()`](Self::commit).
    pub(crate) fn push(&self, byte: u8) {
        let wrptr = self.wrptr.get();
        self.buffer[wrptr].set(byte);
        self.wrptr.set(self.advance(wrptr));
    }

    /// Load the byte at the read cursor, and advance it
    pub(crate) fn pop(&self) -> u8 {
        let rdptr = self.rdptr.get();
        let byte = self.buffer[rdptr].get();
        self.rdptr.set(self.advance(rdptr));
        byte
    }

    /// Account for `n` bytes moved by the interrupt, and wake waiters
    ///
    /// Call this with the USB interrupt masked.
    pub(crate) fn commit(&self, n: usize) {
        let counter = self.counter.get() + n;
        debug_assert!(counter <= self.buffer.len());
        self.counter.set(counter);
        self.waiting.wake_all();
    }

    /// Returns the number of bytes the interrupt may push before the ring is full
    pub(crate) fn free_for_interrupt(&self) -> usize {
        self.buffer.len() - self.counter.get()
    }

    fn advance(&self, ptr: usize) -> usize {
        let next = ptr + 1;
        if next >= self.buffer.len() {
            0
        } else {
            next
        }
    }
}

// Safety: the driver only touches the queue from the USB interrupt, or with
// that interrupt masked. Every application-side method that reads or writes
// the cursors or the counter requires a critical section, so neither side
// can preempt the other. Only `capacity()` goes without, and the buffer
// length never changes.
unsafe impl Sync for Queue<'_> {}

#[cfg(test)]
pub(crate) mod tests {
    use super::{NoWaiters, Queue, WaitList};
    use core::sync::atomic::{AtomicUsize, Ordering};
    use cortex_m::interrupt::CriticalSection;

    #[derive(Default)]
    pub struct Counting {
        pub wakes: AtomicUsize,
    }

    impl WaitList for Counting {
        fn wake_all(&self) {
            self.wakes.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn cs() -> CriticalSection {
        // Safety: host tests are single threaded, with no interrupts.
        unsafe { CriticalSection::new() }
    }

    #[test]
    fn input_queue_starts_empty() {
        let mut storage = [0; 4];
        let queue = Queue::input(&mut storage, &NoWaiters);
        let cs = cs();
        assert_eq!(queue.counter(&cs), 0);
        assert_eq!(queue.get(&cs), None);
    }

    #[test]
    fn output_queue_starts_free() {
        let mut storage = [0; 4];
        let queue = Queue::output(&mut storage, &NoWaiters);
        let cs = cs();
        assert_eq!(queue.counter(&cs), 4);
        assert_eq!(queue.write(&cs, &[1, 2, 3, 4, 5]), 4);
        assert_eq!(queue.put(&cs, 6), Err(6));
    }

    #[test]
    fn cursors_wrap() {
        let mut storage = [0; 3];
        let waiting = Counting::default();
        let queue = Queue::input(&mut storage, &waiting);
        let cs = cs();

        for round in 0..4u8 {
            queue.push(round);
            queue.push(round + 10);
            queue.commit(2);
            assert_eq!(queue.get(&cs), Some(round));
            assert_eq!(queue.get(&cs), Some(round + 10));
            assert_eq!(queue.get(&cs), None);
        }
        assert_eq!(waiting.wakes.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn read_drains_available_bytes() {
        let mut storage = [0; 8];
        let queue = Queue::input(&mut storage, &NoWaiters);
        for byte in [7, 8, 9] {
            queue.push(byte);
        }
        queue.commit(3);
        assert_eq!(queue.free_for_interrupt(), 5);

        let mut buffer = [0; 5];
        assert_eq!(queue.read(&cs(), &mut buffer), 3);
        assert_eq!(&buffer[..3], &[7, 8, 9]);
        assert_eq!(queue.free_for_interrupt(), 8);
    }
}
