//! Endpoint configuration and status
//!
//! The endpoint register (EPR) mixes three kinds of bits. Status and data
//! toggle bits flip when written with 1; transfer-complete bits clear when
//! written with 0; everything else takes the written value. The helpers at
//! the bottom of this module compose writes that only change what they mean
//! to change.

use crate::btable::{self, Descriptor, Half};
use crate::pma::Allocator;
use crate::ral::{self, usb::EPR};
use crate::state::{InState, OutState, Source, Transactions};
use crate::Peripheral;
use usb_device::endpoint::EndpointType;

bitflags::bitflags! {
    /// The directions an endpoint moves data in
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Directions : u8 {
        /// Device to host
        const IN = 1 << 0;
        /// Host to device
        const OUT = 1 << 1;
    }
}

/// An endpoint's configuration
///
/// Build a configuration with [`new()`](Self::new), then add the
/// directions you need.
///
/// ```
/// use pma_usbd::{Directions, EndpointConfig};
/// use usb_device::endpoint::EndpointType;
///
/// const BULK: EndpointConfig = EndpointConfig::new(EndpointType::Bulk)
///     .with_in(64)
///     .with_out(64);
///
/// assert_eq!(BULK.directions, Directions::IN | Directions::OUT);
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EndpointConfig {
    /// Transfer type
    pub ep_type: EndpointType,
    /// Maximum IN packet size, in bytes
    pub in_maxsize: u16,
    /// Maximum OUT packet size, in bytes
    pub out_maxsize: u16,
    /// Directions with a completion callback
    pub directions: Directions,
    /// Number of back-to-back setup packets the endpoint may receive
    ///
    /// This is a hint for USB stacks that size their own setup buffers. The
    /// driver doesn't use it: the peripheral stores each setup packet in the
    /// endpoint's OUT buffer, and the driver keeps only the latest one.
    pub setup_packets: u8,
}

impl EndpointConfig {
    /// Endpoint 0's configuration
    pub const CONTROL: EndpointConfig = EndpointConfig::new(EndpointType::Control)
        .with_in(64)
        .with_out(64)
        .with_setup_packets(1);

    /// A configuration with no directions
    pub const fn new(ep_type: EndpointType) -> Self {
        EndpointConfig {
            ep_type,
            in_maxsize: 0,
            out_maxsize: 0,
            directions: Directions::empty(),
            setup_packets: 0,
        }
    }

    /// Enable the IN direction, with the maximum packet size
    pub const fn with_in(mut self, maxsize: u16) -> Self {
        self.in_maxsize = maxsize;
        self.directions = self.directions.union(Directions::IN);
        self
    }

    /// Enable the OUT direction, with the maximum packet size
    pub const fn with_out(mut self, maxsize: u16) -> Self {
        self.out_maxsize = maxsize;
        self.directions = self.directions.union(Directions::OUT);
        self
    }

    /// Set the number of setup packets
    pub const fn with_setup_packets(mut self, setup_packets: u8) -> Self {
        self.setup_packets = setup_packets;
        self
    }

    fn type_bits(&self) -> u32 {
        match self.ep_type {
            EndpointType::Isochronous { .. } => EPR::EP_TYPE::RW::ISO,
            EndpointType::Bulk => EPR::EP_TYPE::RW::BULK,
            EndpointType::Interrupt => EPR::EP_TYPE::RW::INTERRUPT,
            EndpointType::Control => EPR::EP_TYPE::RW::CONTROL,
        }
    }

    pub(crate) fn is_iso(&self) -> bool {
        matches!(self.ep_type, EndpointType::Isochronous { .. })
    }
}

/// An endpoint direction's status
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum EndpointStatus {
    /// The direction is disabled
    Disabled,
    /// The direction responds with STALL
    Stalled,
    /// The direction is waiting for, or moving, data
    Active,
}

impl EndpointStatus {
    fn from_stat(stat: u32) -> Self {
        match stat {
            EPR::STAT_TX::RW::DISABLED => EndpointStatus::Disabled,
            EPR::STAT_TX::RW::STALL => EndpointStatus::Stalled,
            _ => EndpointStatus::Active,
        }
    }
}

/// A configured endpoint, and its transactions
pub struct Endpoint<'a> {
    index: usize,
    config: EndpointConfig,
    pub transactions: Transactions<'a>,
}

impl<'a> Endpoint<'a> {
    pub fn new(index: usize, config: EndpointConfig) -> Self {
        Endpoint {
            index,
            config,
            transactions: Transactions::new(config.ep_type == EndpointType::Control),
        }
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    /// Allocate packet memory, and program the endpoint register
    ///
    /// # Panics
    ///
    /// Panics if the endpoint is isochronous in both directions, if the OUT
    /// packet size can't be described, or if packet memory is exhausted.
    pub fn initialize<P: Peripheral>(&self, usb: &P, allocator: &mut Allocator) {
        let config = &self.config;
        let iso = config.is_iso();
        assert!(
            !(iso && config.directions.contains(Directions::IN | Directions::OUT)),
            "isochronous EP{} can't move data in both directions",
            self.index
        );
        assert!(
            config.out_maxsize <= btable::MAX_RX_SIZE,
            "EP{} OUT packet size {} is too large",
            self.index,
            config.out_maxsize
        );

        let mut epr = config.type_bits() << EPR::EP_TYPE::offset;

        let desc = Descriptor::new(usb, self.index);
        desc.set_tx_count(Half::Zero, 0);
        desc.set_rx_count_field(Half::Zero, btable::rx_blocks(config.out_maxsize));
        desc.set_tx_addr(Half::Zero, allocator.allocate(config.in_maxsize));
        desc.set_rx_addr(Half::Zero, allocator.allocate(config.out_maxsize));

        if iso {
            // Both halves share one buffer. Only the counts alternate.
            if config.directions.contains(Directions::IN) {
                epr |= EPR::STAT_TX::RW::VALID << EPR::STAT_TX::offset;
                desc.set_tx_count(Half::One, desc.tx_count(Half::Zero));
                desc.set_tx_addr(Half::One, desc.tx_addr(Half::Zero));
            }
            if config.directions.contains(Directions::OUT) {
                epr |= EPR::STAT_RX::RW::VALID << EPR::STAT_RX::offset;
                desc.set_rx_count_field(Half::One, desc.rx_count_field(Half::Zero));
                desc.set_rx_addr(Half::One, desc.rx_addr(Half::Zero));
            }
        } else {
            if config.directions.contains(Directions::IN) {
                epr |= EPR::STAT_TX::RW::NAK << EPR::STAT_TX::offset;
            }
            if config.directions.contains(Directions::OUT) {
                epr |= EPR::STAT_RX::RW::NAK << EPR::STAT_RX::offset;
            }
        }

        debug!(
            "CONFIGURE EP{} TYPE {} IN {} OUT {}",
            self.index,
            config.type_bits(),
            config.in_maxsize,
            config.out_maxsize
        );

        set(usb, self.index, epr | self.index as u32);
        toggle(usb, self.index, epr);
    }

    /// Start an IN transaction, loading its first packet
    pub fn prepare_transmit<P: Peripheral>(&mut self, usb: &P, source: Source<'a>, size: usize) {
        let state = InState::new(source, size);
        let n = size.min(self.config.in_maxsize as usize);
        let epr = read(usb, self.index);
        arm_transmit(usb, self.index, self.config.is_iso(), epr, n);
        state.load(usb, Descriptor::new(usb, self.index).tx_addr(Half::Zero), n);
        self.transactions.begin_in(state);
    }

    /// Handle a transmit-complete event
    ///
    /// `epr` is the endpoint register, sampled before the event was cleared.
    /// Returns `true` when the transaction is complete, or `false` if the next
    /// packet is armed. An event for a transaction that already completed is
    /// ignored, and returns `false`.
    pub fn transmit_complete<P: Peripheral>(&mut self, usb: &P, epr: u32) -> bool {
        let index = self.index;
        let iso = self.config.is_iso();
        let in_maxsize = self.config.in_maxsize as usize;
        let desc = Descriptor::new(usb, index);

        let half = if iso {
            Half::completed(epr & EPR::DTOG_TX::mask != 0)
        } else {
            Half::Zero
        };
        let transmitted = desc.tx_count(half) as usize;

        let Some(state) = self.transactions.in_state_mut() else {
            warn!("EP{} IN without a transaction", index);
            return true;
        };
        if state.is_complete() {
            warn!("EP{} IN after its transaction completed", index);
            return false;
        }

        let remaining = state.advance(transmitted);
        if remaining == 0 {
            return true;
        }

        let n = remaining.min(in_maxsize);
        trace!("EP{} IN next {}", index, n);
        arm_transmit(usb, index, iso, epr, n);
        state.load(usb, desc.tx_addr(Half::Zero), n);
        usb.critical_section(|| set_stat_tx(usb, index, EPR::STAT_TX::RW::VALID));
        false
    }

    /// Start an OUT transaction
    pub fn prepare_receive(&mut self, state: OutState<'a>) {
        self.transactions.begin_out(state);
    }

    /// Handle a receive-complete event for a data packet
    ///
    /// `epr` is the endpoint register, sampled before the event was cleared.
    /// Returns `true` when the transaction is complete, or `false` if the
    /// endpoint is re-armed for the next packet. A packet for a transaction
    /// that already completed is dropped, and returns `false`.
    pub fn receive_complete<P: Peripheral>(&mut self, usb: &P, epr: u32) -> bool {
        let index = self.index;
        let out_maxsize = self.config.out_maxsize as usize;
        let desc = Descriptor::new(usb, index);

        let half = if self.config.is_iso() {
            Half::completed(epr & EPR::DTOG_RX::mask != 0)
        } else {
            Half::Zero
        };
        let n = desc.rx_count(half) as usize;
        debug_assert!(n <= out_maxsize, "EP{} received {} bytes", index, n);
        let n = n.min(out_maxsize);

        let Some(state) = self.transactions.out_state_mut() else {
            warn!("EP{} OUT without a transaction", index);
            return true;
        };
        if state.is_complete() {
            warn!("EP{} OUT after its transaction completed", index);
            return false;
        }

        state.store(usb, desc.rx_addr(Half::Zero), n);
        trace!("EP{} OUT {} remaining {}", index, n, state.packets());

        if n < out_maxsize || state.packets() == 0 {
            state.finish();
            true
        } else {
            set_stat_rx(usb, index, EPR::STAT_RX::RW::VALID);
            false
        }
    }
}

/// Write the transmit count for the next IN packet
///
/// Isochronous endpoints transmit from the half selected by the data toggle.
fn arm_transmit<P: Peripheral>(usb: &P, ep: usize, iso: bool, epr: u32, n: usize) {
    let desc = Descriptor::new(usb, ep);
    desc.set_tx_count(Half::Zero, n as u16);
    if iso && epr & EPR::DTOG_TX::mask != 0 {
        desc.set_tx_count(Half::One, n as u16);
    }
}

/// Read the endpoint register
pub fn read<P: Peripheral>(usb: &P, ep: usize) -> u32 {
    ral::read_reg!(ral::usb, &ral::endpoint(usb, ep), EPR)
}

/// Write the non-toggling fields, leaving status, toggles and events alone
pub fn set<P: Peripheral>(usb: &P, ep: usize, value: u32) {
    ral::write_reg!(
        ral::usb,
        &ral::endpoint(usb, ep),
        EPR,
        (value & !EPR::TOGGLE_MASK) | EPR::CTR_MASK
    );
}

/// Drive the status and toggle fields to the values in `value`
pub fn toggle<P: Peripheral>(usb: &P, ep: usize, value: u32) {
    ral::modify_reg!(ral::usb, &ral::endpoint(usb, ep), EPR, |epr| {
        (epr ^ (value & EPR::TOGGLE_MASK)) | EPR::CTR_MASK
    });
}

/// Set the IN status, leaving everything else alone
pub fn set_stat_tx<P: Peripheral>(usb: &P, ep: usize, stat: u32) {
    ral::modify_reg!(ral::usb, &ral::endpoint(usb, ep), EPR, |epr| {
        ((epr & !(EPR::TOGGLE_MASK & !EPR::STAT_TX::mask)) ^ (stat << EPR::STAT_TX::offset))
            | EPR::CTR_MASK
    });
}

/// Set the OUT status, leaving everything else alone
pub fn set_stat_rx<P: Peripheral>(usb: &P, ep: usize, stat: u32) {
    ral::modify_reg!(ral::usb, &ral::endpoint(usb, ep), EPR, |epr| {
        ((epr & !(EPR::TOGGLE_MASK & !EPR::STAT_RX::mask)) ^ (stat << EPR::STAT_RX::offset))
            | EPR::CTR_MASK
    });
}

/// Clear the transmit-complete event
pub fn clear_ctr_tx<P: Peripheral>(usb: &P, ep: usize) {
    ral::modify_reg!(ral::usb, &ral::endpoint(usb, ep), EPR, |epr| {
        (epr & !EPR::TOGGLE_MASK & !EPR::CTR_TX::mask) | EPR::CTR_RX::mask
    });
}

/// Clear the receive-complete event
pub fn clear_ctr_rx<P: Peripheral>(usb: &P, ep: usize) {
    ral::modify_reg!(ral::usb, &ral::endpoint(usb, ep), EPR, |epr| {
        (epr & !EPR::TOGGLE_MASK & !EPR::CTR_RX::mask) | EPR::CTR_TX::mask
    });
}

/// Disable both directions, reset the toggles, and clear the configuration
pub fn disable<P: Peripheral>(usb: &P, ep: usize) {
    toggle(usb, ep, 0);
    ral::write_reg!(ral::usb, &ral::endpoint(usb, ep), EPR, 0);
}

/// Returns the IN status
pub fn status_in<P: Peripheral>(usb: &P, ep: usize) -> EndpointStatus {
    EndpointStatus::from_stat(ral::read_reg!(ral::usb, &ral::endpoint(usb, ep), EPR, STAT_TX))
}

/// Returns the OUT status
pub fn status_out<P: Peripheral>(usb: &P, ep: usize) -> EndpointStatus {
    EndpointStatus::from_stat(ral::read_reg!(ral::usb, &ral::endpoint(usb, ep), EPR, STAT_RX))
}

/// Returns `true` if the IN direction is VALID
pub fn is_valid_in<P: Peripheral>(usb: &P, ep: usize) -> bool {
    ral::read_reg!(ral::usb, &ral::endpoint(usb, ep), EPR, STAT_TX == VALID)
}

/// Returns `true` if the OUT direction is VALID
pub fn is_valid_out<P: Peripheral>(usb: &P, ep: usize) -> bool {
    ral::read_reg!(ral::usb, &ral::endpoint(usb, ep), EPR, STAT_RX == VALID)
}
