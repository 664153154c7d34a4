//! Register definitions that conform to the RAL's register API
//!
//! The peripheral's registers are reached through a [`Peripheral`], not
//! through a raw pointer. This module adapts that interface so that the
//! `ral-registers` macros work anyway: a [`Reg`] handle forwards `read()`
//! and `write()` to the peripheral, and the `usb` module describes the
//! register fields.

#![allow(non_snake_case, non_upper_case_globals)]

use crate::{Peripheral, ENDPOINT_COUNT};

pub use ral_registers::{modify_reg, read_reg, write_reg};

/// A USB peripheral register
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Register {
    /// Endpoint `n` control and status register
    Epr(usize),
    /// Control register
    Cntr,
    /// Interrupt status register
    Istr,
    /// Frame number register
    Fnr,
    /// Device address register
    Daddr,
    /// Descriptor table address register
    Btable,
}

impl Register {
    /// The number of distinct registers
    pub const COUNT: usize = ENDPOINT_COUNT + 5;

    /// Returns a dense index for this register, less than [`Register::COUNT`]
    ///
    /// # Panics
    ///
    /// Panics if this is an `Epr` beyond the last endpoint.
    pub const fn index(self) -> usize {
        match self {
            Register::Epr(n) => {
                assert!(n < ENDPOINT_COUNT);
                n
            }
            Register::Cntr => ENDPOINT_COUNT,
            Register::Istr => ENDPOINT_COUNT + 1,
            Register::Fnr => ENDPOINT_COUNT + 2,
            Register::Daddr => ENDPOINT_COUNT + 3,
            Register::Btable => ENDPOINT_COUNT + 4,
        }
    }

    /// Returns the byte offset of this register from the register block base
    pub const fn offset(self) -> usize {
        match self {
            Register::Epr(n) => n * 4,
            Register::Cntr => 0x40,
            Register::Istr => 0x44,
            Register::Fnr => 0x48,
            Register::Daddr => 0x4C,
            Register::Btable => 0x50,
        }
    }
}

/// A register handle, bound to a peripheral
pub struct Reg<'a, P> {
    usb: &'a P,
    register: Register,
}

impl<P: Peripheral> Reg<'_, P> {
    #[inline(always)]
    pub fn read(&self) -> u32 {
        self.usb.read_register(self.register)
    }
    #[inline(always)]
    pub fn write(&self, value: u32) {
        self.usb.write_register(self.register, value)
    }
}

/// The global registers of a USB peripheral
pub struct Instance<'a, P> {
    pub CNTR: Reg<'a, P>,
    pub ISTR: Reg<'a, P>,
    pub FNR: Reg<'a, P>,
    pub DADDR: Reg<'a, P>,
    pub BTABLE: Reg<'a, P>,
}

/// Acquire the global registers of `usb`
pub fn instance<P>(usb: &P) -> Instance<'_, P> {
    Instance {
        CNTR: Reg {
            usb,
            register: Register::Cntr,
        },
        ISTR: Reg {
            usb,
            register: Register::Istr,
        },
        FNR: Reg {
            usb,
            register: Register::Fnr,
        },
        DADDR: Reg {
            usb,
            register: Register::Daddr,
        },
        BTABLE: Reg {
            usb,
            register: Register::Btable,
        },
    }
}

/// The RAL API requires us to treat all endpoint registers as unique.
/// We can make it a little easier with this type, and [`endpoint`].
pub struct Endpoint<'a, P> {
    pub EPR: Reg<'a, P>,
}

/// Acquire the control and status register for endpoint `ep`
pub fn endpoint<P>(usb: &P, ep: usize) -> Endpoint<'_, P> {
    debug_assert!(ep < ENDPOINT_COUNT, "EPR{} doesn't exist", ep);
    Endpoint {
        EPR: Reg {
            usb,
            register: Register::Epr(ep),
        },
    }
}

/// Declares single-bit or multi-bit fields without enumerated values
macro_rules! fields {
    ($($field:ident: $offset:expr, $width:expr;)+) => {
        $(
            pub mod $field {
                pub const offset: u32 = $offset;
                pub const mask: u32 = ((1 << $width) - 1) << offset;
                pub mod RW {}
                pub mod R {}
                pub mod W {}
            }
        )+
    };
}

pub mod usb {
    /// Endpoint register
    pub mod EPR {
        fields! {
            EA: 0, 4;
            DTOG_TX: 6, 1;
            CTR_TX: 7, 1;
            EP_KIND: 8, 1;
            SETUP: 11, 1;
            DTOG_RX: 14, 1;
            CTR_RX: 15, 1;
        }
        pub mod STAT_TX {
            pub const offset: u32 = 4;
            pub const mask: u32 = 0b11 << offset;
            pub mod RW {
                pub const DISABLED: u32 = 0b00;
                pub const STALL: u32 = 0b01;
                pub const NAK: u32 = 0b10;
                pub const VALID: u32 = 0b11;
            }
            pub mod R {}
            pub mod W {}
        }
        pub mod EP_TYPE {
            pub const offset: u32 = 9;
            pub const mask: u32 = 0b11 << offset;
            pub mod RW {
                pub const BULK: u32 = 0b00;
                pub const CONTROL: u32 = 0b01;
                pub const ISO: u32 = 0b10;
                pub const INTERRUPT: u32 = 0b11;
            }
            pub mod R {}
            pub mod W {}
        }
        pub mod STAT_RX {
            pub const offset: u32 = 12;
            pub const mask: u32 = 0b11 << offset;
            #[allow(unused_imports)]
            pub use super::STAT_TX::{R, RW, W};
        }

        /// Bits that toggle when written with 1
        pub const TOGGLE_MASK: u32 =
            STAT_TX::mask | DTOG_TX::mask | STAT_RX::mask | DTOG_RX::mask | SETUP::mask;
        /// Bits that clear when written with 0
        pub const CTR_MASK: u32 = CTR_TX::mask | CTR_RX::mask;
    }

    /// Control register
    pub mod CNTR {
        fields! {
            FRES: 0, 1;
            PDWN: 1, 1;
            LP_MODE: 2, 1;
            FSUSP: 3, 1;
            RESUME: 4, 1;
            ESOFM: 8, 1;
            SOFM: 9, 1;
            RESETM: 10, 1;
            SUSPM: 11, 1;
            WKUPM: 12, 1;
            ERRM: 13, 1;
            PMAOVRM: 14, 1;
            CTRM: 15, 1;
        }
    }

    /// Interrupt status register
    pub mod ISTR {
        fields! {
            EP_ID: 0, 4;
            DIR: 4, 1;
            ESOF: 8, 1;
            SOF: 9, 1;
            RESET: 10, 1;
            SUSP: 11, 1;
            WKUP: 12, 1;
            ERR: 13, 1;
            PMAOVR: 14, 1;
            CTR: 15, 1;
        }

        /// Event bits that clear when written with 0
        pub const EVENT_MASK: u32 = ESOF::mask
            | SOF::mask
            | RESET::mask
            | SUSP::mask
            | WKUP::mask
            | ERR::mask
            | PMAOVR::mask;
    }

    /// Frame number register
    pub mod FNR {
        fields! {
            FN: 0, 11;
            LSOF: 11, 2;
            LCK: 13, 1;
            RXDM: 14, 1;
            RXDP: 15, 1;
        }
    }

    /// Device address register
    pub mod DADDR {
        fields! {
            ADD: 0, 7;
            EF: 7, 1;
        }
    }

    /// Descriptor table address register
    pub mod BTABLE {
        fields! {
            BTABLE: 3, 13;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Register, ENDPOINT_COUNT};

    #[test]
    fn dense_indices() {
        let mut seen = [false; Register::COUNT];
        let registers = (0..ENDPOINT_COUNT).map(Register::Epr).chain([
            Register::Cntr,
            Register::Istr,
            Register::Fnr,
            Register::Daddr,
            Register::Btable,
        ]);
        for register in registers {
            assert!(!seen[register.index()]);
            seen[register.index()] = true;
        }
        assert!(seen.iter().all(|seen| *seen));
    }

    #[test]
    fn offsets() {
        assert_eq!(Register::Epr(0).offset(), 0);
        assert_eq!(Register::Epr(7).offset(), 0x1C);
        assert_eq!(Register::Cntr.offset(), 0x40);
        assert_eq!(Register::Btable.offset(), 0x50);
    }

    #[test]
    fn toggle_and_ctr_masks() {
        use super::usb::EPR;
        assert_eq!(EPR::TOGGLE_MASK, 0x7870);
        assert_eq!(EPR::CTR_MASK, 0x8080);
        assert_eq!(super::usb::ISTR::EVENT_MASK, 0x7F00);
    }
}
