//! Transfer state
//!
//! An endpoint tracks at most one IN and one OUT transaction. A control
//! endpoint tracks at most one transaction, in either direction; preparing
//! a new data or status stage replaces the previous one.

use crate::queue::Queue;
use crate::{packet, Peripheral};

/// Where an IN transaction gets its data
pub enum Source<'a> {
    /// Transmit the first `size` bytes of this buffer
    Buffer(&'a [u8]),
    /// Transmit `size` bytes dequeued from this output queue
    Queue(&'a Queue<'a>),
}

/// Where an OUT transaction puts its data
pub enum Destination<'a> {
    /// Receive into this buffer, from its start
    Buffer(&'a mut [u8]),
    /// Receive into this input queue
    Queue(&'a Queue<'a>),
}

/// An IN transaction
pub struct InState<'a> {
    /// Total bytes to transmit
    size: usize,
    /// Bytes transmitted so far
    count: usize,
    complete: bool,
    source: Source<'a>,
}

impl<'a> InState<'a> {
    /// # Panics
    ///
    /// Panics if `source` is a buffer with fewer than `size` bytes.
    pub fn new(source: Source<'a>, size: usize) -> Self {
        if let Source::Buffer(buffer) = &source {
            assert!(
                size <= buffer.len(),
                "IN transfer of {} bytes from a {} byte buffer",
                size,
                buffer.len()
            );
        }
        InState {
            size,
            count: 0,
            complete: false,
            source,
        }
    }

    /// Returns the number of bytes transmitted so far
    pub fn count(&self) -> usize {
        self.count
    }

    /// Returns `true` once the last packet was transmitted
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Account for a transmitted packet, returning the bytes left to send
    ///
    /// The transaction is complete when nothing is left.
    pub fn advance(&mut self, transmitted: usize) -> usize {
        debug_assert!(!self.complete);
        self.count += transmitted;
        let remaining = self.size.saturating_sub(self.count);
        self.complete = remaining == 0;
        remaining
    }

    /// Copy the next `n` bytes of the transaction into packet memory at `addr`
    pub fn load<P: Peripheral>(&self, usb: &P, addr: u16, n: usize) {
        match &self.source {
            Source::Buffer(buffer) => {
                packet::write_from_buffer(usb, addr, &buffer[self.count..self.count + n])
            }
            Source::Queue(queue) => packet::write_from_queue(usb, addr, queue, n),
        }
    }
}

/// An OUT transaction
pub struct OutState<'a> {
    /// Bytes still expected
    size: usize,
    /// Bytes received so far
    count: usize,
    /// Packets still expected
    packets: usize,
    complete: bool,
    destination: Destination<'a>,
}

impl<'a> OutState<'a> {
    /// Expect `size` bytes in packets of up to `max_packet` bytes
    ///
    /// A zero-length transaction still expects one (empty) packet.
    ///
    /// # Panics
    ///
    /// Panics if `destination` is a buffer with fewer than `size` bytes.
    pub fn new(destination: Destination<'a>, size: usize, max_packet: u16) -> Self {
        if let Destination::Buffer(buffer) = &destination {
            assert!(
                size <= buffer.len(),
                "OUT transfer of {} bytes into a {} byte buffer",
                size,
                buffer.len()
            );
        }
        let packets = if size == 0 || max_packet == 0 {
            1
        } else {
            (size + max_packet as usize - 1) / max_packet as usize
        };
        OutState {
            size,
            count: 0,
            packets,
            complete: false,
            destination,
        }
    }

    /// Returns the number of bytes received so far
    pub fn count(&self) -> usize {
        self.count
    }

    /// Returns the number of packets still expected
    pub fn packets(&self) -> usize {
        self.packets
    }

    /// Returns `true` once the transaction received its last packet
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Mark the transaction complete
    ///
    /// Received data stays available until the destination is taken back.
    pub fn finish(&mut self) {
        self.complete = true;
    }

    /// Copy a received packet of `n` bytes from packet memory at `addr`
    ///
    /// Bytes that don't fit into a buffer destination are dropped.
    pub fn store<P: Peripheral>(&mut self, usb: &P, addr: u16, n: usize) {
        match &mut self.destination {
            Destination::Buffer(buffer) => {
                let start = self.count.min(buffer.len());
                let end = (self.count + n).min(buffer.len());
                packet::read_to_buffer(usb, addr, &mut buffer[start..end]);
            }
            Destination::Queue(queue) => packet::read_to_queue(usb, addr, queue, n),
        }
        self.count += n;
        self.size = self.size.saturating_sub(n);
        self.packets = self.packets.saturating_sub(1);
    }

    /// Returns the buffer destination
    pub fn into_buffer(self) -> Option<&'a mut [u8]> {
        match self.destination {
            Destination::Buffer(buffer) => Some(buffer),
            Destination::Queue(_) => None,
        }
    }
}

/// The active stage of a control transfer
pub enum Stage<'a> {
    In(InState<'a>),
    Out(OutState<'a>),
}

/// An endpoint's transactions
pub enum Transactions<'a> {
    /// Control endpoints have one transaction, in either direction
    Control(Option<Stage<'a>>),
    /// Other endpoints may have one transaction in each direction
    Data {
        tx: Option<InState<'a>>,
        rx: Option<OutState<'a>>,
    },
}

impl<'a> Transactions<'a> {
    pub fn new(control: bool) -> Self {
        if control {
            Transactions::Control(None)
        } else {
            Transactions::Data { tx: None, rx: None }
        }
    }

    pub fn begin_in(&mut self, state: InState<'a>) {
        match self {
            Transactions::Control(stage) => *stage = Some(Stage::In(state)),
            Transactions::Data { tx, .. } => *tx = Some(state),
        }
    }

    pub fn begin_out(&mut self, state: OutState<'a>) {
        match self {
            Transactions::Control(stage) => *stage = Some(Stage::Out(state)),
            Transactions::Data { rx, .. } => *rx = Some(state),
        }
    }

    pub fn in_state(&self) -> Option<&InState<'a>> {
        match self {
            Transactions::Control(Some(Stage::In(state))) => Some(state),
            Transactions::Data { tx, .. } => tx.as_ref(),
            _ => None,
        }
    }

    pub fn in_state_mut(&mut self) -> Option<&mut InState<'a>> {
        match self {
            Transactions::Control(Some(Stage::In(state))) => Some(state),
            Transactions::Data { tx, .. } => tx.as_mut(),
            _ => None,
        }
    }

    pub fn out_state(&self) -> Option<&OutState<'a>> {
        match self {
            Transactions::Control(Some(Stage::Out(state))) => Some(state),
            Transactions::Data { rx, .. } => rx.as_ref(),
            _ => None,
        }
    }

    pub fn out_state_mut(&mut self) -> Option<&mut OutState<'a>> {
        match self {
            Transactions::Control(Some(Stage::Out(state))) => Some(state),
            Transactions::Data { rx, .. } => rx.as_mut(),
            _ => None,
        }
    }

    pub fn take_out(&mut self) -> Option<OutState<'a>> {
        match self {
            Transactions::Control(stage) => match stage.take() {
                Some(Stage::Out(state)) => Some(state),
                other => {
                    *stage = other;
                    None
                }
            },
            Transactions::Data { rx, .. } => rx.take(),
        }
    }
}
