//! A USB full-speed device driver for peripherals with a packet memory area
//!
//! `pma-usbd` drives the small USB device peripheral found on many
//! microcontrollers: a per-endpoint register file, plus a dual-port packet
//! memory area (PMA) that holds an endpoint descriptor table and every
//! endpoint's packet buffers. There's no DMA and no FIFO; software copies
//! each packet in and out of the PMA, 16 bits at a time.
//!
//! The driver turns peripheral interrupts into byte-accurate transfers between
//! the PMA and your buffers or circular [`Queue`]s. It enforces the endpoint
//! state machine (DISABLED / STALL / NAK / VALID), splits transfers into
//! packets, and notifies your USB stack through the [`Handler`] trait when
//! a setup packet arrives or a transaction finishes.
//!
//! # Usage
//!
//! 1. Implement [`Peripheral`] for your part, or use [`Mmio`](mmio::Mmio)
//!    with the register block and PMA addresses from your reference manual.
//! 2. Create a [`Driver`], then [`start()`](Driver::start) it.
//! 3. Call [`Driver::isr()`] from the USB interrupt, passing your [`Handler`].
//!
//! Use [`BusAdapter`] if you need to share the driver between thread and
//! interrupt contexts. Use the [`Simulator`](sim::Simulator) to test your
//! USB stack on a host without hardware.
//!
//! # Logging
//!
//! Enable the `defmt-03` feature to log bus events and transfers with
//! `defmt` 0.3. Only enable it when you're sure that your logger isn't
//! using this USB peripheral!

#![no_std]

#[cfg(feature = "defmt-03")]
extern crate defmt_03 as defmt;

#[macro_use]
mod log;

mod btable;
mod bus;
mod driver;
mod endpoint;
mod packet;
mod pma;
mod queue;
mod ral;
mod state;

pub mod mmio;
pub mod sim;

pub use bus::BusAdapter;
pub use driver::{Config, DeviceState, Driver, Handler};
pub use endpoint::{Directions, EndpointConfig, EndpointStatus};
pub use queue::{NoWaiters, Queue, WaitList};
pub use ral::Register;
pub use state::{Destination, Source};

/// Endpoint 0, plus seven more
pub const ENDPOINT_COUNT: usize = 8;

/// Bytes at the start of packet memory reserved for the descriptor table
///
/// Eight bytes per endpoint: TX address and count, RX address and count.
pub const BTABLE_SIZE: usize = ENDPOINT_COUNT * 8;

/// Register and packet memory access for one USB peripheral
///
/// The driver touches hardware only through this trait. [`Mmio`](mmio::Mmio)
/// implements it over the real memory-mapped peripheral;
/// [`Simulator`](sim::Simulator) implements it in software.
///
/// Implementations must reproduce the peripheral's register write
/// semantics. Specifically,
///
/// - `EPR` status and data toggle bits toggle when written with 1.
/// - `EPR` transfer-complete bits, and `ISTR` event bits, clear when
///   written with 0, and are unaffected when written with 1.
///
/// # Example
///
/// A bus-wide adapter that forwards to a pair of register and memory
/// accessors.
///
/// ```
/// use pma_usbd::{Peripheral, Register};
///
/// struct Loopback {
///     registers: core::cell::Cell<[u32; 13]>,
/// }
///
/// impl Peripheral for Loopback {
///     const PMA_SIZE: usize = 512;
///     fn read_register(&self, register: Register) -> u32 {
///         self.registers.get()[register.index()]
///     }
///     fn write_register(&self, register: Register, value: u32) {
///         let mut registers = self.registers.get();
///         registers[register.index()] = value;
///         self.registers.set(registers);
///     }
///     fn read_pma(&self, _: u16) -> u16 { 0 }
///     fn write_pma(&self, _: u16, _: u16) {}
///     fn critical_section<R>(&self, f: impl FnOnce() -> R) -> R { f() }
/// }
/// ```
pub trait Peripheral {
    /// Total packet memory, in bytes
    const PMA_SIZE: usize;

    /// Read a peripheral register
    fn read_register(&self, register: Register) -> u32;
    /// Write a peripheral register
    fn write_register(&self, register: Register, value: u32);

    /// Read the halfword at the USB-local packet memory address `addr`
    ///
    /// `addr` is a byte address, and it's always even.
    fn read_pma(&self, addr: u16) -> u16;
    /// Write the halfword at the USB-local packet memory address `addr`
    ///
    /// `addr` is a byte address, and it's always even.
    fn write_pma(&self, addr: u16, value: u16);

    /// Run `f` with the USB interrupt masked
    ///
    /// The driver uses this around queue bookkeeping that's shared with
    /// thread context. It may be called from the USB interrupt itself.
    fn critical_section<R>(&self, f: impl FnOnce() -> R) -> R;
}
