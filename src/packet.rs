//! Packet copy routines
//!
//! Packet memory is accessed 16 bits at a time, while application data is a
//! byte stream. Each halfword carries two bytes, low byte first.

use crate::queue::Queue;
use crate::Peripheral;

/// Copy `buffer.len()` bytes from packet memory at `addr` into `buffer`
pub fn read_to_buffer<P: Peripheral>(usb: &P, addr: u16, buffer: &mut [u8]) {
    debug_assert!(addr & 1 == 0);
    let mut addr = addr;
    for pair in buffer.chunks_mut(2) {
        let [lo, hi] = usb.read_pma(addr).to_le_bytes();
        pair[0] = lo;
        if let Some(byte) = pair.get_mut(1) {
            *byte = hi;
        }
        addr += 2;
    }
}

/// Copy `n` bytes from packet memory at `addr` into an input queue
///
/// Once the bytes are in the ring, the queue's counter grows by `n` and its
/// waiters wake, all inside the peripheral's critical section.
pub fn read_to_queue<P: Peripheral>(usb: &P, addr: u16, queue: &Queue<'_>, n: usize) {
    debug_assert!(addr & 1 == 0);
    debug_assert!(n <= queue.free_for_interrupt(), "input queue overrun");
    let mut addr = addr;
    for _ in 0..n / 2 {
        let [lo, hi] = usb.read_pma(addr).to_le_bytes();
        queue.push(lo);
        queue.push(hi);
        addr += 2;
    }
    if n & 1 != 0 {
        queue.push(usb.read_pma(addr) as u8);
    }
    usb.critical_section(|| queue.commit(n));
}

/// Copy `data` into packet memory at `addr`
///
/// If `data` has an odd length, the last halfword's high byte is zero.
pub fn write_from_buffer<P: Peripheral>(usb: &P, addr: u16, data: &[u8]) {
    debug_assert!(addr & 1 == 0);
    let mut addr = addr;
    for pair in data.chunks(2) {
        let hi = pair.get(1).copied().unwrap_or(0);
        usb.write_pma(addr, u16::from_le_bytes([pair[0], hi]));
        addr += 2;
    }
}

/// Copy `n` bytes from an output queue into packet memory at `addr`
///
/// Once the bytes leave the ring, the queue's free space grows by `n` and
/// its waiters wake, all inside the peripheral's critical section.
pub fn write_from_queue<P: Peripheral>(usb: &P, addr: u16, queue: &Queue<'_>, n: usize) {
    debug_assert!(addr & 1 == 0);
    debug_assert!(n <= queue.free_for_interrupt(), "output queue underrun");
    let mut addr = addr;
    for _ in 0..n / 2 {
        let lo = queue.pop();
        let hi = queue.pop();
        usb.write_pma(addr, u16::from_le_bytes([lo, hi]));
        addr += 2;
    }
    if n & 1 != 0 {
        usb.write_pma(addr, queue.pop() as u16);
    }
    usb.critical_section(|| queue.commit(n));
}

/// Read the 8-byte setup packet from packet memory at `addr`
pub fn read_setup<P: Peripheral>(usb: &P, addr: u16) -> [u8; 8] {
    let mut setup = [0; 8];
    read_to_buffer(usb, addr, &mut setup);
    setup
}
