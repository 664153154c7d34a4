//! A software-simulated USB peripheral
//!
//! The [`Simulator`] reproduces the peripheral's register write semantics
//! and packet memory, and lets a test play the part of the host. Use it to
//! exercise a USB stack, or the driver itself, without hardware.
//!
//! ```
//! use pma_usbd::{sim::Simulator, Config, Driver, Handler};
//!
//! #[derive(Default)]
//! struct Stack {
//!     setups: usize,
//! }
//!
//! impl<'a> Handler<'a, Simulator> for Stack {
//!     fn setup(&mut self, _: &mut Driver<'a, Simulator>, _: usize) {
//!         self.setups += 1;
//!     }
//! }
//!
//! let mut driver = Driver::new(Simulator::new(), Config::default());
//! let mut stack = Stack::default();
//! driver.start();
//!
//! assert!(driver.peripheral().host_setup(0, [0x80, 0x06, 0, 1, 0, 0, 18, 0]));
//! driver.isr(&mut stack);
//! assert_eq!(stack.setups, 1);
//! ```

use crate::btable::{self, Descriptor, Half};
use crate::packet;
use crate::ral::usb::{CNTR, DADDR, EPR, FNR, ISTR};
use crate::{Peripheral, Register, ENDPOINT_COUNT};
use core::cell::Cell;

/// The simulator's packet memory size, in bytes
pub const PMA_SIZE: usize = 1024;

/// An endpoint direction's status, as seen by the host
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stat {
    Disabled,
    Stall,
    Nak,
    Valid,
}

impl Stat {
    fn from_bits(bits: u32) -> Self {
        match bits & 0b11 {
            EPR::STAT_TX::RW::DISABLED => Stat::Disabled,
            EPR::STAT_TX::RW::STALL => Stat::Stall,
            EPR::STAT_TX::RW::NAK => Stat::Nak,
            _ => Stat::Valid,
        }
    }
}

/// Bits that toggle when written with 1. `SETUP` is read-only.
const TOGGLE: u32 = EPR::TOGGLE_MASK & !EPR::SETUP::mask;
/// Bits that take the written value
const PLAIN: u32 = EPR::EA::mask | EPR::EP_TYPE::mask | EPR::EP_KIND::mask;

/// A simulated USB peripheral
pub struct Simulator {
    registers: [Cell<u32>; Register::COUNT],
    pma: [Cell<u16>; PMA_SIZE / 2],
    critical_sections: Cell<usize>,
}

impl Default for Simulator {
    fn default() -> Self {
        Self::new()
    }
}

impl Simulator {
    /// Create a simulated peripheral, with all registers and packet memory zeroed
    pub fn new() -> Self {
        Simulator {
            registers: core::array::from_fn(|_| Cell::new(0)),
            pma: core::array::from_fn(|_| Cell::new(0)),
            critical_sections: Cell::new(0),
        }
    }

    fn reg(&self, register: Register) -> &Cell<u32> {
        &self.registers[register.index()]
    }

    fn epr(&self, ep: usize) -> u32 {
        self.reg(Register::Epr(ep)).get()
    }

    /// Update an endpoint register the way the peripheral does, ignoring write
    /// semantics.
    fn update_epr(&self, ep: usize, f: impl FnOnce(u32) -> u32) {
        let epr = self.reg(Register::Epr(ep));
        epr.set(f(epr.get()));
    }

    fn raise(&self, events: u32) {
        let istr = self.reg(Register::Istr);
        istr.set(istr.get() | events);
    }

    fn computed_istr(&self) -> u32 {
        let mut istr = self.reg(Register::Istr).get() & ISTR::EVENT_MASK;
        let pending = (0..ENDPOINT_COUNT).find(|ep| self.epr(*ep) & EPR::CTR_MASK != 0);
        if let Some(ep) = pending {
            istr |= ISTR::CTR::mask | ((ep as u32) << ISTR::EP_ID::offset);
            if self.epr(ep) & EPR::CTR_RX::mask != 0 {
                istr |= ISTR::DIR::mask;
            }
        }
        istr
    }

    fn is_iso(&self, ep: usize) -> bool {
        (self.epr(ep) & EPR::EP_TYPE::mask) >> EPR::EP_TYPE::offset == EPR::EP_TYPE::RW::ISO
    }

    fn set_line_idle(&self, idle: bool) {
        let fnr = self.reg(Register::Fnr);
        if idle {
            fnr.set(fnr.get() | FNR::RXDP::mask);
        } else {
            fnr.set(fnr.get() & !FNR::RXDP::mask);
        }
    }

    /// Returns the number of critical sections that the driver entered
    pub fn critical_sections(&self) -> usize {
        self.critical_sections.get()
    }

    /// Returns the status of endpoint `ep`'s IN direction
    pub fn stat_tx(&self, ep: usize) -> Stat {
        Stat::from_bits((self.epr(ep) & EPR::STAT_TX::mask) >> EPR::STAT_TX::offset)
    }

    /// Returns the status of endpoint `ep`'s OUT direction
    pub fn stat_rx(&self, ep: usize) -> Stat {
        Stat::from_bits((self.epr(ep) & EPR::STAT_RX::mask) >> EPR::STAT_RX::offset)
    }

    /// Returns the device address, if the function is enabled
    pub fn address(&self) -> Option<u8> {
        let daddr = self.reg(Register::Daddr).get();
        (daddr & DADDR::EF::mask != 0).then_some((daddr & DADDR::ADD::mask) as u8)
    }

    /// Returns `true` if the peripheral is in suspend mode
    pub fn is_suspended(&self) -> bool {
        self.reg(Register::Cntr).get() & CNTR::FSUSP::mask != 0
    }

    /// Returns `true` if the peripheral requested low-power mode
    pub fn is_low_power(&self) -> bool {
        self.reg(Register::Cntr).get() & CNTR::LP_MODE::mask != 0
    }

    /// Returns `true` if the peripheral is held in reset, or powered down
    pub fn is_powered_down(&self) -> bool {
        self.reg(Register::Cntr).get() & (CNTR::FRES::mask | CNTR::PDWN::mask) != 0
    }

    /// The host resets the bus
    ///
    /// Like the peripheral, this clears all endpoint registers and the
    /// device address.
    pub fn host_reset(&self) {
        for ep in 0..ENDPOINT_COUNT {
            self.reg(Register::Epr(ep)).set(0);
        }
        self.reg(Register::Daddr).set(0);
        self.set_line_idle(false);
        self.raise(ISTR::RESET::mask);
    }

    /// The host suspends the bus
    pub fn host_suspend(&self) {
        self.set_line_idle(true);
        self.raise(ISTR::SUSP::mask);
    }

    /// The host resumes the bus
    pub fn host_wakeup(&self) {
        self.set_line_idle(false);
        self.wakeup_event();
    }

    /// Line noise triggers a wakeup, but the bus is still idle
    pub fn host_spurious_wakeup(&self) {
        self.set_line_idle(true);
        self.wakeup_event();
    }

    fn wakeup_event(&self) {
        let cntr = self.reg(Register::Cntr);
        cntr.set(cntr.get() & !CNTR::LP_MODE::mask);
        self.raise(ISTR::WKUP::mask);
    }

    /// The host sends a start-of-frame
    pub fn host_sof(&self) {
        let fnr = self.reg(Register::Fnr);
        let frame = (fnr.get() + 1) & FNR::FN::mask;
        fnr.set((fnr.get() & !FNR::FN::mask) | frame);
        self.raise(ISTR::SOF::mask);
    }

    /// The host sends a setup packet to control endpoint `ep`
    ///
    /// Returns `false` if the endpoint isn't an enabled control endpoint.
    /// Otherwise, the peripheral stores the packet, and NAKs both directions
    /// until software re-arms them.
    pub fn host_setup(&self, ep: usize, setup: [u8; 8]) -> bool {
        let epr = self.epr(ep);
        let control = (epr & EPR::EP_TYPE::mask) >> EPR::EP_TYPE::offset
            == EPR::EP_TYPE::RW::CONTROL;
        if !control || self.stat_rx(ep) == Stat::Disabled {
            return false;
        }

        let desc = Descriptor::new(self, ep);
        packet::write_from_buffer(self, desc.rx_addr(Half::Zero), &setup);
        let field = desc.rx_count_field(Half::Zero);
        desc.set_rx_count_field(Half::Zero, (field & !COUNT_MASK) | 8);

        self.update_epr(ep, |epr| {
            let epr = with_stat(epr, EPR::STAT_RX::mask, EPR::STAT_RX::offset, EPR::STAT_RX::RW::NAK);
            let epr = with_stat(epr, EPR::STAT_TX::mask, EPR::STAT_TX::offset, EPR::STAT_TX::RW::NAK);
            epr | EPR::DTOG_RX::mask | EPR::CTR_RX::mask | EPR::SETUP::mask
        });
        true
    }

    /// The host sends an OUT data packet to endpoint `ep`
    ///
    /// Returns `false` if the endpoint didn't accept the packet. Isochronous
    /// endpoints receive into the buffer half selected by their data toggle.
    /// Other endpoints NAK further packets until software re-arms them.
    ///
    /// # Panics
    ///
    /// Panics if `data` exceeds the endpoint's receive buffer.
    pub fn host_out(&self, ep: usize, data: &[u8]) -> bool {
        if self.stat_rx(ep) != Stat::Valid {
            return false;
        }
        let iso = self.is_iso(ep);
        let half = if iso {
            Half::next(self.epr(ep) & EPR::DTOG_RX::mask != 0)
        } else {
            Half::Zero
        };

        let desc = Descriptor::new(self, ep);
        let field = desc.rx_count_field(half);
        assert!(
            data.len() <= btable::rx_capacity(field) as usize,
            "EP{} OUT packet of {} bytes overruns the receive buffer",
            ep,
            data.len()
        );
        packet::write_from_buffer(self, desc.rx_addr(half), data);
        desc.set_rx_count_field(half, (field & !COUNT_MASK) | data.len() as u16);

        self.update_epr(ep, |epr| {
            let mut epr = epr ^ EPR::DTOG_RX::mask;
            if !iso {
                epr = with_stat(epr, EPR::STAT_RX::mask, EPR::STAT_RX::offset, EPR::STAT_RX::RW::NAK);
            }
            (epr | EPR::CTR_RX::mask) & !EPR::SETUP::mask
        });
        true
    }

    /// The host requests an IN data packet from endpoint `ep`
    ///
    /// Returns `None` if the endpoint didn't transmit. Otherwise, copies the
    /// packet into `buffer`, and returns its size. Isochronous endpoints
    /// transmit from the buffer half selected by their data toggle. Other
    /// endpoints NAK further requests until software re-arms them.
    ///
    /// # Panics
    ///
    /// Panics if the packet doesn't fit in `buffer`.
    pub fn host_in(&self, ep: usize, buffer: &mut [u8]) -> Option<usize> {
        if self.stat_tx(ep) != Stat::Valid {
            return None;
        }
        let iso = self.is_iso(ep);
        let half = if iso {
            Half::next(self.epr(ep) & EPR::DTOG_TX::mask != 0)
        } else {
            Half::Zero
        };

        let desc = Descriptor::new(self, ep);
        let count = desc.tx_count(half) as usize;
        packet::read_to_buffer(self, desc.tx_addr(half), &mut buffer[..count]);

        self.update_epr(ep, |epr| {
            let mut epr = epr ^ EPR::DTOG_TX::mask;
            if !iso {
                epr = with_stat(epr, EPR::STAT_TX::mask, EPR::STAT_TX::offset, EPR::STAT_TX::RW::NAK);
            }
            epr | EPR::CTR_TX::mask
        });
        Some(count)
    }
}

const COUNT_MASK: u16 = btable::COUNT_RX::COUNT::mask as u16;

fn with_stat(epr: u32, mask: u32, offset: u32, stat: u32) -> u32 {
    (epr & !mask) | (stat << offset)
}

impl Peripheral for Simulator {
    const PMA_SIZE: usize = PMA_SIZE;

    fn read_register(&self, register: Register) -> u32 {
        match register {
            Register::Istr => self.computed_istr(),
            _ => self.reg(register).get(),
        }
    }

    fn write_register(&self, register: Register, value: u32) {
        let reg = self.reg(register);
        let old = reg.get();
        match register {
            Register::Epr(_) => reg.set(
                ((old ^ value) & TOGGLE)
                    | (old & value & EPR::CTR_MASK)
                    | (old & EPR::SETUP::mask)
                    | (value & PLAIN),
            ),
            Register::Istr => reg.set(old & value & ISTR::EVENT_MASK),
            Register::Fnr => {}
            _ => reg.set(value & 0xFFFF),
        }
    }

    fn read_pma(&self, addr: u16) -> u16 {
        debug_assert!(addr & 1 == 0, "unaligned PMA address {}", addr);
        self.pma[addr as usize / 2].get()
    }

    fn write_pma(&self, addr: u16, value: u16) {
        debug_assert!(addr & 1 == 0, "unaligned PMA address {}", addr);
        self.pma[addr as usize / 2].set(value)
    }

    fn critical_section<R>(&self, f: impl FnOnce() -> R) -> R {
        self.critical_sections.set(self.critical_sections.get() + 1);
        f()
    }
}
