//! Memory-mapped USB peripheral
//!
//! [`Mmio`] is the [`Peripheral`] for real hardware. You supply the
//! addresses of the register block and the packet memory, and describe how
//! the CPU sees packet memory.

use crate::{Peripheral, Register, ENDPOINT_COUNT};
use core::ptr::NonNull;
use ral_registers::RWRegister;

/// How the CPU addresses packet memory
///
/// Packet memory is always 16 bits wide from the USB peripheral's point of
/// view. Some parts place each halfword in its own 32-bit word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PmaAccess {
    /// Halfwords are packed; USB address `n` is CPU offset `n`.
    Halfword,
    /// Each halfword occupies a 32-bit word; USB address `n` is CPU offset `2n`.
    Word,
}

/// The USB register block
#[repr(C)]
#[allow(non_snake_case)]
struct RegisterBlock {
    EPR: [RWRegister<u32>; ENDPOINT_COUNT],
    _reserved: [u32; 8],
    CNTR: RWRegister<u32>,
    ISTR: RWRegister<u32>,
    FNR: RWRegister<u32>,
    DADDR: RWRegister<u32>,
    BTABLE: RWRegister<u32>,
}

const _: [(); 1] = [(); (core::mem::size_of::<RegisterBlock>() == 0x54) as usize];

/// A memory-mapped USB peripheral with `SIZE` bytes of packet memory
pub struct Mmio<const SIZE: usize> {
    registers: NonNull<RegisterBlock>,
    pma: NonNull<u8>,
    access: PmaAccess,
}

impl<const SIZE: usize> Mmio<SIZE> {
    /// Create a peripheral from its register block and packet memory addresses
    ///
    /// # Safety
    ///
    /// `registers` must point to the USB register block, and `pma` must point to
    /// the start of the packet memory. Both must be valid for the lifetime of the
    /// returned object. Caller must ensure that no one else is using the USB
    /// peripheral, or its packet memory, for anything else.
    ///
    /// # Example
    ///
    /// The USB peripheral of an STM32F103, with 512 bytes of packet memory.
    ///
    /// ```no_run
    /// use pma_usbd::mmio::{Mmio, PmaAccess};
    ///
    /// let usb: Mmio<512> = unsafe {
    ///     Mmio::new(0x4000_5C00 as *mut (), 0x4000_6000 as *mut (), PmaAccess::Word)
    /// };
    /// ```
    pub unsafe fn new(registers: *mut (), pma: *mut (), access: PmaAccess) -> Self {
        Mmio {
            registers: NonNull::new(registers.cast()).expect("null USB register block"),
            pma: NonNull::new(pma.cast()).expect("null packet memory"),
            access,
        }
    }

    fn registers(&self) -> &RegisterBlock {
        // Safety: pointer validity is upheld by the constructor's caller.
        unsafe { self.registers.as_ref() }
    }

    fn register(&self, register: Register) -> &RWRegister<u32> {
        let block = self.registers();
        match register {
            Register::Epr(n) => &block.EPR[n],
            Register::Cntr => &block.CNTR,
            Register::Istr => &block.ISTR,
            Register::Fnr => &block.FNR,
            Register::Daddr => &block.DADDR,
            Register::Btable => &block.BTABLE,
        }
    }

    fn halfword(&self, addr: u16) -> *mut u16 {
        debug_assert!(addr & 1 == 0, "unaligned PMA address {}", addr);
        debug_assert!((addr as usize) < SIZE, "PMA address {} out of range", addr);
        let offset = match self.access {
            PmaAccess::Halfword => addr as usize,
            PmaAccess::Word => addr as usize * 2,
        };
        // Safety: offset is within the packet memory; see the debug assertions,
        // and the allocator's capacity checks.
        unsafe { self.pma.as_ptr().add(offset).cast() }
    }
}

impl<const SIZE: usize> Peripheral for Mmio<SIZE> {
    const PMA_SIZE: usize = SIZE;

    fn read_register(&self, register: Register) -> u32 {
        self.register(register).read()
    }
    fn write_register(&self, register: Register, value: u32) {
        self.register(register).write(value)
    }
    fn read_pma(&self, addr: u16) -> u16 {
        // Safety: see halfword().
        unsafe { self.halfword(addr).read_volatile() }
    }
    fn write_pma(&self, addr: u16, value: u16) {
        // Safety: see halfword().
        unsafe { self.halfword(addr).write_volatile(value) }
    }
    fn critical_section<R>(&self, f: impl FnOnce() -> R) -> R {
        cortex_m::interrupt::free(|_| f())
    }
}

unsafe impl<const SIZE: usize> Send for Mmio<SIZE> {}

#[cfg(test)]
mod tests {
    use super::{Mmio, PmaAccess};
    use crate::{Peripheral, Register};

    #[repr(C, align(4))]
    struct Fake {
        registers: [u32; 21],
        pma: [u16; 128],
    }

    #[test]
    fn register_offsets() {
        let mut fake = Fake {
            registers: [0; 21],
            pma: [0; 128],
        };
        let usb: Mmio<64> = unsafe {
            Mmio::new(
                fake.registers.as_mut_ptr().cast(),
                fake.pma.as_mut_ptr().cast(),
                PmaAccess::Halfword,
            )
        };
        usb.write_register(Register::Epr(3), 0x1234);
        usb.write_register(Register::Daddr, 0x85);
        assert_eq!(usb.read_register(Register::Epr(3)), 0x1234);
        assert_eq!(fake.registers[3], 0x1234);
        assert_eq!(fake.registers[0x4C / 4], 0x85);
    }

    #[test]
    fn word_access_scheme() {
        let mut fake = Fake {
            registers: [0; 21],
            pma: [0; 128],
        };
        let usb: Mmio<64> = unsafe {
            Mmio::new(
                fake.registers.as_mut_ptr().cast(),
                fake.pma.as_mut_ptr().cast(),
                PmaAccess::Word,
            )
        };
        usb.write_pma(0, 0xAAAA);
        usb.write_pma(2, 0xBBBB);
        assert_eq!(usb.read_pma(2), 0xBBBB);
        assert_eq!(&fake.pma[..4], &[0xAAAA, 0, 0xBBBB, 0]);
    }

    #[test]
    fn halfword_access_scheme() {
        let mut fake = Fake {
            registers: [0; 21],
            pma: [0; 128],
        };
        let usb: Mmio<64> = unsafe {
            Mmio::new(
                fake.registers.as_mut_ptr().cast(),
                fake.pma.as_mut_ptr().cast(),
                PmaAccess::Halfword,
            )
        };
        usb.write_pma(0, 0xAAAA);
        usb.write_pma(2, 0xBBBB);
        assert_eq!(&fake.pma[..2], &[0xAAAA, 0xBBBB]);
    }
}
