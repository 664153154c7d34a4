//! Endpoint descriptor table
//!
//! The table lives at the start of packet memory. Each endpoint owns four
//! halfwords: TX address, TX count, RX address, RX count. Isochronous
//! endpoints double buffer, and re-use the fields of the *other* direction
//! for their second buffer. That's why an isochronous endpoint can only move
//! data in one direction.

#![allow(non_snake_case, non_upper_case_globals)]

use crate::Peripheral;

/// Packet memory address of the descriptor table
///
/// Keep this in sync with the `BTABLE` register.
pub const BTABLE_ADDR: u16 = 0;

/// One of the two halves of a double buffer
///
/// Only isochronous endpoints use `One`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Half {
    Zero,
    One,
}

impl Half {
    /// The half that is *not* selected by the data toggle bit `dtog`
    ///
    /// The data toggle tracks the half that the peripheral uses next. The
    /// packet that just completed is in the other half.
    pub const fn completed(dtog: bool) -> Self {
        if dtog {
            Half::Zero
        } else {
            Half::One
        }
    }
    /// The half that's selected by the data toggle bit `dtog`
    pub const fn next(dtog: bool) -> Self {
        if dtog {
            Half::One
        } else {
            Half::Zero
        }
    }
}

/// Byte offsets of the fields within a descriptor
///
/// The second halves alias the opposite direction's first half.
mod offset {
    use super::Half;

    pub const fn tx_addr(half: Half) -> u16 {
        match half {
            Half::Zero => 0,
            Half::One => 4,
        }
    }
    pub const fn tx_count(half: Half) -> u16 {
        match half {
            Half::Zero => 2,
            Half::One => 6,
        }
    }
    pub const fn rx_addr(half: Half) -> u16 {
        match half {
            Half::Zero => 4,
            Half::One => 0,
        }
    }
    pub const fn rx_count(half: Half) -> u16 {
        match half {
            Half::Zero => 6,
            Half::One => 2,
        }
    }
}

/// RX count field
pub mod COUNT_RX {
    pub mod COUNT {
        pub const offset: u32 = 0;
        pub const mask: u32 = 0x3FF << offset;
    }
    pub mod NUM_BLOCK {
        pub const offset: u32 = 10;
        pub const mask: u32 = 0x1F << offset;
    }
    pub mod BL_SIZE {
        pub const offset: u32 = 15;
        pub const mask: u32 = 1 << offset;
    }
}

/// TX count field
pub mod COUNT_TX {
    pub mod COUNT {
        pub const offset: u32 = 0;
        pub const mask: u32 = 0x3FF << offset;
    }
}

/// Largest receive buffer that the block encoding can describe
pub const MAX_RX_SIZE: u16 = 1023;

/// Encode the RX buffer size for the RX count field
///
/// Up to 62 bytes are described in 2-byte blocks. Larger buffers are
/// described in 32-byte blocks, with the block-size flag set; in that mode,
/// `NUM_BLOCK` counts blocks beyond the first.
pub const fn rx_blocks(size: u16) -> u16 {
    if size == 0 {
        0
    } else if size > 62 {
        let blocks = ((size - 1) | 0x1F) / 32;
        (blocks << NUM_BLOCK_OFFSET) | BL_SIZE_MASK
    } else {
        let blocks = (((size - 1) | 1) + 1) / 2;
        blocks << NUM_BLOCK_OFFSET
    }
}

/// Decode the RX buffer capacity, in bytes, from the RX count field
pub const fn rx_capacity(count: u16) -> u16 {
    let blocks = (count & NUM_BLOCK_MASK) >> NUM_BLOCK_OFFSET;
    if count & BL_SIZE_MASK != 0 {
        (blocks + 1) * 32
    } else {
        blocks * 2
    }
}

const NUM_BLOCK_OFFSET: u16 = COUNT_RX::NUM_BLOCK::offset as u16;
const NUM_BLOCK_MASK: u16 = COUNT_RX::NUM_BLOCK::mask as u16;
const BL_SIZE_MASK: u16 = COUNT_RX::BL_SIZE::mask as u16;
const COUNT_MASK: u16 = COUNT_RX::COUNT::mask as u16;

/// An endpoint's descriptor, in a peripheral's packet memory
pub struct Descriptor<'a, P> {
    usb: &'a P,
    base: u16,
}

impl<'a, P: Peripheral> Descriptor<'a, P> {
    /// Access the descriptor for endpoint `ep`
    pub fn new(usb: &'a P, ep: usize) -> Self {
        debug_assert!(ep < crate::ENDPOINT_COUNT);
        Descriptor {
            usb,
            base: BTABLE_ADDR + (ep as u16) * 8,
        }
    }

    fn read(&self, offset: u16) -> u16 {
        self.usb.read_pma(self.base + offset)
    }
    fn write(&self, offset: u16, value: u16) {
        self.usb.write_pma(self.base + offset, value)
    }

    pub fn tx_addr(&self, half: Half) -> u16 {
        self.read(offset::tx_addr(half))
    }
    pub fn set_tx_addr(&self, half: Half, addr: u16) {
        self.write(offset::tx_addr(half), addr)
    }
    /// Returns the number of bytes to transmit, or that were transmitted
    pub fn tx_count(&self, half: Half) -> u16 {
        self.read(offset::tx_count(half)) & COUNT_MASK
    }
    pub fn set_tx_count(&self, half: Half, count: u16) {
        self.write(offset::tx_count(half), count)
    }
    pub fn rx_addr(&self, half: Half) -> u16 {
        self.read(offset::rx_addr(half))
    }
    pub fn set_rx_addr(&self, half: Half, addr: u16) {
        self.write(offset::rx_addr(half), addr)
    }
    /// Returns the number of bytes received into this half
    pub fn rx_count(&self, half: Half) -> u16 {
        self.read(offset::rx_count(half)) & COUNT_MASK
    }
    /// Returns the raw RX count field, including the block encoding
    pub fn rx_count_field(&self, half: Half) -> u16 {
        self.read(offset::rx_count(half))
    }
    /// Write the raw RX count field
    ///
    /// Software writes the block encoding; the peripheral writes the count.
    pub fn set_rx_count_field(&self, half: Half, field: u16) {
        self.write(offset::rx_count(half), field)
    }
}
