//! USB driver
//!
//! The [`Driver`] owns a [`Peripheral`] and everything the peripheral needs
//! at runtime: the packet memory allocator, endpoint configurations, and the
//! state of each endpoint's transactions. Your USB stack drives it through
//! its public methods, and it reports back through a [`Handler`].

use crate::btable::{Descriptor, Half};
use crate::endpoint::{self, Endpoint, EndpointConfig, EndpointStatus};
use crate::pma::Allocator;
use crate::ral::{
    self,
    usb::{EPR, ISTR},
};
use crate::state::{Destination, OutState, Source};
use crate::{btable, packet, Peripheral, ENDPOINT_COUNT};

/// Driver configuration
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Config {
    /// Request the peripheral's low-power mode when the bus suspends
    ///
    /// The driver re-requests low-power mode if a wakeup turns out to be
    /// line noise.
    pub low_power_on_suspend: bool,
    /// Enable start-of-frame notifications
    ///
    /// SOF arrives every millisecond. Leave this off unless you need it.
    pub sof: bool,
}

/// The USB device state, as far as the driver knows it
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum DeviceState {
    /// The peripheral is powered down
    Stopped,
    /// The peripheral is running, with the default address
    Ready,
    /// The bus is suspended
    Suspended,
    /// The host assigned an address
    Active,
}

/// Notifications from the driver
///
/// The driver calls these from [`Driver::isr`], in interrupt context. None
/// of them may block. Each receives the driver, so that you can read the
/// setup packet, prepare the next transaction, or change an endpoint's
/// status from inside the notification.
///
/// All methods do nothing by default.
pub trait Handler<'a, P: Peripheral> {
    /// The host reset the bus
    ///
    /// By the time this is called, the driver is back in its
    /// [`Ready`](DeviceState::Ready) state, and endpoint 0 is the only
    /// configured endpoint.
    fn bus_reset(&mut self, _: &mut Driver<'a, P>) {}
    /// The host suspended the bus
    fn suspend(&mut self, _: &mut Driver<'a, P>) {}
    /// The host resumed the bus
    fn wakeup(&mut self, _: &mut Driver<'a, P>) {}
    /// A start-of-frame arrived
    ///
    /// Only called if [`Config::sof`] is set.
    fn start_of_frame(&mut self, _: &mut Driver<'a, P>) {}
    /// Control endpoint `ep` received a setup packet
    ///
    /// Use [`Driver::read_setup`] to get the packet.
    fn setup(&mut self, _: &mut Driver<'a, P>, _ep: usize) {}
    /// The IN transaction on endpoint `ep` is complete
    fn in_complete(&mut self, _: &mut Driver<'a, P>, _ep: usize) {}
    /// The OUT transaction on endpoint `ep` is complete
    fn out_complete(&mut self, _: &mut Driver<'a, P>, _ep: usize) {}
}

/// A USB device driver
///
/// `'a` is the lifetime of the buffers and queues that you lend to the
/// driver for transactions.
pub struct Driver<'a, P> {
    usb: P,
    config: Config,
    state: DeviceState,
    saved_state: DeviceState,
    address: u8,
    allocator: Allocator,
    endpoints: [Option<Endpoint<'a>>; ENDPOINT_COUNT],
    transmitting: u16,
    receiving: u16,
    setup: [u8; 8],
}

impl<'a, P: Peripheral> Driver<'a, P> {
    /// Create a driver for the USB peripheral
    ///
    /// The driver doesn't touch the peripheral until you [`start()`](Self::start)
    /// it.
    pub fn new(usb: P, config: Config) -> Self {
        Driver {
            usb,
            config,
            state: DeviceState::Stopped,
            saved_state: DeviceState::Stopped,
            address: 0,
            allocator: Allocator::new(P::PMA_SIZE),
            endpoints: core::array::from_fn(|_| None),
            transmitting: 0,
            receiving: 0,
            setup: [0; 8],
        }
    }

    /// Returns the peripheral
    pub fn peripheral(&self) -> &P {
        &self.usb
    }

    /// Returns the driver's configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the device state
    pub fn state(&self) -> DeviceState {
        self.state
    }

    /// Returns the device address
    pub fn address(&self) -> u8 {
        self.address
    }

    /// Power up the peripheral, and reset the device
    ///
    /// Does nothing if the driver is already started.
    pub fn start(&mut self) {
        if self.state != DeviceState::Stopped {
            return;
        }
        let regs = ral::instance(&self.usb);
        ral::write_reg!(ral::usb, &regs, CNTR, FRES: 1);
        ral::write_reg!(ral::usb, &regs, CNTR, 0);
        debug!("START");
        self.reset();
    }

    /// Power down the peripheral
    ///
    /// All endpoint configurations are lost.
    pub fn stop(&mut self) {
        ral::write_reg!(ral::usb, &ral::instance(&self.usb), CNTR, PDWN: 1, FRES: 1);
        self.state = DeviceState::Stopped;
        self.saved_state = DeviceState::Stopped;
        self.endpoints.iter_mut().for_each(|ep| *ep = None);
        self.transmitting = 0;
        self.receiving = 0;
        debug!("STOP");
    }

    /// Reset the device
    ///
    /// Clears the address, every endpoint configuration, and every
    /// transaction. Then, re-enables the peripheral interrupts, and configures
    /// endpoint 0 as a control endpoint.
    ///
    /// The driver calls this when the host resets the bus.
    pub fn reset(&mut self) {
        self.state = DeviceState::Ready;
        self.saved_state = DeviceState::Ready;
        self.address = 0;
        self.transmitting = 0;
        self.receiving = 0;
        self.endpoints.iter_mut().for_each(|ep| *ep = None);

        let regs = ral::instance(&self.usb);
        ral::write_reg!(ral::usb, &regs, BTABLE, btable::BTABLE_ADDR as u32);
        ral::write_reg!(ral::usb, &regs, ISTR, 0);
        ral::write_reg!(ral::usb, &regs, DADDR, EF: 1);
        ral::write_reg!(
            ral::usb,
            &regs,
            CNTR,
            RESETM: 1,
            SUSPM: 1,
            WKUPM: 1,
            CTRM: 1,
            SOFM: self.config.sof as u32
        );

        self.allocator.reset();
        let ep0 = Endpoint::new(0, EndpointConfig::CONTROL);
        ep0.initialize(&self.usb, &mut self.allocator);
        self.endpoints[0] = Some(ep0);
    }

    /// Set the device address
    pub fn set_address(&mut self, address: u8) {
        ral::write_reg!(ral::usb, &ral::instance(&self.usb), DADDR, ADD: address as u32, EF: 1);
        self.address = address;
        self.state = if address != 0 {
            DeviceState::Active
        } else {
            DeviceState::Ready
        };
        debug!("ADDRESS {}", address);
    }

    /// Configure endpoint `ep`
    ///
    /// Allocates the endpoint's packet memory, and leaves each enabled
    /// direction NAKing. Isochronous endpoints start VALID.
    ///
    /// # Panics
    ///
    /// Panics if `ep` doesn't exist, if packet memory is exhausted, or if the
    /// configuration is invalid; see [`EndpointConfig`].
    pub fn configure_endpoint(&mut self, ep: usize, config: EndpointConfig) {
        assert!(ep < ENDPOINT_COUNT, "EP{} doesn't exist", ep);
        let endpoint = Endpoint::new(ep, config);
        endpoint.initialize(&self.usb, &mut self.allocator);
        self.endpoints[ep] = Some(endpoint);
        self.transmitting &= !(1 << ep);
        self.receiving &= !(1 << ep);
    }

    /// Disable every endpoint except endpoint 0, and release their packet memory
    pub fn disable_endpoints(&mut self) {
        self.allocator.reset();
        // Endpoint 0 was the first allocation, and it keeps its buffers.
        if let Some(ep0) = &self.endpoints[0] {
            self.allocator.allocate(ep0.config().in_maxsize);
            self.allocator.allocate(ep0.config().out_maxsize);
        }
        for ep in 1..ENDPOINT_COUNT {
            endpoint::disable(&self.usb, ep);
            self.endpoints[ep] = None;
        }
        self.transmitting &= 1;
        self.receiving &= 1;
        debug!("DISABLE ENDPOINTS");
    }

    /// Returns the status of endpoint `ep`'s IN direction
    pub fn status_in(&self, ep: usize) -> EndpointStatus {
        endpoint::status_in(&self.usb, ep)
    }

    /// Returns the status of endpoint `ep`'s OUT direction
    pub fn status_out(&self, ep: usize) -> EndpointStatus {
        endpoint::status_out(&self.usb, ep)
    }

    /// Copy the setup packet received by control endpoint `ep`
    ///
    /// Only meaningful inside [`Handler::setup`]. The endpoint's status is
    /// unchanged.
    pub fn read_setup(&self, ep: usize, buffer: &mut [u8; 8]) {
        let addr = Descriptor::new(&self.usb, ep).rx_addr(Half::Zero);
        *buffer = packet::read_setup(&self.usb, addr);
    }

    /// Returns the last setup packet received on endpoint 0
    pub fn setup_packet(&self) -> &[u8; 8] {
        &self.setup
    }

    /// Prepare an OUT transaction of `size` bytes on endpoint `ep`
    ///
    /// The transaction completes after `size` bytes, or after a short packet.
    /// Use [`start_out()`](Self::start_out) to let the host send the
    /// first packet.
    ///
    /// # Panics
    ///
    /// Panics if the endpoint isn't configured, or if `destination` is a
    /// buffer smaller than `size`.
    pub fn prepare_receive(&mut self, ep: usize, destination: Destination<'a>, size: usize) {
        let endpoint = configured(&mut self.endpoints, ep);
        let state = OutState::new(destination, size, endpoint.config().out_maxsize);
        trace!("EP{} PREPARE OUT {} PACKETS {}", ep, size, state.packets());
        endpoint.prepare_receive(state);
        self.receiving |= 1 << ep;
    }

    /// Prepare an IN transaction of `size` bytes on endpoint `ep`
    ///
    /// Loads the first packet. Use [`start_in()`](Self::start_in) to let the
    /// host take it. A `size` of zero prepares a zero-length packet.
    ///
    /// # Panics
    ///
    /// Panics if the endpoint isn't configured, or if `source` is a
    /// buffer smaller than `size`.
    pub fn prepare_transmit(&mut self, ep: usize, source: Source<'a>, size: usize) {
        let endpoint = configured(&mut self.endpoints, ep);
        trace!("EP{} PREPARE IN {}", ep, size);
        endpoint.prepare_transmit(&self.usb, source, size);
        self.transmitting |= 1 << ep;
    }

    /// Let the host take the next IN packet
    pub fn start_in(&mut self, ep: usize) {
        endpoint::set_stat_tx(&self.usb, ep, EPR::STAT_TX::RW::VALID);
    }

    /// Let the host send the next OUT packet
    pub fn start_out(&mut self, ep: usize) {
        endpoint::set_stat_rx(&self.usb, ep, EPR::STAT_RX::RW::VALID);
    }

    /// STALL endpoint `ep`'s IN direction
    pub fn stall_in(&mut self, ep: usize) {
        endpoint::set_stat_tx(&self.usb, ep, EPR::STAT_TX::RW::STALL);
    }

    /// STALL endpoint `ep`'s OUT direction
    pub fn stall_out(&mut self, ep: usize) {
        endpoint::set_stat_rx(&self.usb, ep, EPR::STAT_RX::RW::STALL);
    }

    /// NAK endpoint `ep`'s IN direction, unless a packet is in flight
    pub fn clear_in(&mut self, ep: usize) {
        if !endpoint::is_valid_in(&self.usb, ep) {
            endpoint::set_stat_tx(&self.usb, ep, EPR::STAT_TX::RW::NAK);
        }
    }

    /// NAK endpoint `ep`'s OUT direction, unless a packet is in flight
    pub fn clear_out(&mut self, ep: usize) {
        if !endpoint::is_valid_out(&self.usb, ep) {
            endpoint::set_stat_rx(&self.usb, ep, EPR::STAT_RX::RW::NAK);
        }
    }

    /// Returns `true` if endpoint `ep` has an IN transaction in progress
    pub fn is_transmitting(&self, ep: usize) -> bool {
        self.transmitting & (1 << ep) != 0
    }

    /// Returns `true` if endpoint `ep` has an OUT transaction in progress
    pub fn is_receiving(&self, ep: usize) -> bool {
        self.receiving & (1 << ep) != 0
    }

    /// Returns the bytes transmitted by endpoint `ep`'s last IN transaction
    pub fn transmitted(&self, ep: usize) -> Option<usize> {
        self.endpoints
            .get(ep)?
            .as_ref()?
            .transactions
            .in_state()
            .map(|state| state.count())
    }

    /// Returns the bytes received by endpoint `ep`'s last OUT transaction
    pub fn received(&self, ep: usize) -> Option<usize> {
        self.endpoints
            .get(ep)?
            .as_ref()?
            .transactions
            .out_state()
            .map(|state| state.count())
    }

    /// Take back the buffer lent to endpoint `ep`'s last OUT transaction
    ///
    /// This ends the transaction; check [`received()`](Self::received) first.
    /// Returns `None` if there's no transaction, or if it used a queue.
    pub fn take_receive_buffer(&mut self, ep: usize) -> Option<&'a mut [u8]> {
        let endpoint = self.endpoints.get_mut(ep)?.as_mut()?;
        let state = endpoint.transactions.take_out()?;
        self.receiving &= !(1 << ep);
        state.into_buffer()
    }

    /// Handle USB interrupts
    ///
    /// Call this from the USB interrupt handler. It handles every pending
    /// bus event, then every completed endpoint transaction, notifying
    /// `handler` along the way.
    pub fn isr<H: Handler<'a, P>>(&mut self, handler: &mut H) {
        let mut istr = self.istr();

        if istr & ISTR::RESET::mask != 0 {
            debug!("RESET");
            self.reset();
            self.clear_events(ISTR::RESET::mask);
            handler.bus_reset(self);
        }

        if istr & ISTR::SUSP::mask != 0 {
            let regs = ral::instance(&self.usb);
            ral::modify_reg!(ral::usb, &regs, CNTR, FSUSP: 1);
            if self.config.low_power_on_suspend {
                ral::modify_reg!(ral::usb, &regs, CNTR, LP_MODE: 1);
            }
            self.clear_events(ISTR::SUSP::mask);
            debug!("SUSPEND");
            if self.state != DeviceState::Suspended {
                self.saved_state = self.state;
                self.state = DeviceState::Suspended;
            }
            handler.suspend(self);
        }

        if istr & ISTR::WKUP::mask != 0 {
            let regs = ral::instance(&self.usb);
            let resume = ral::read_reg!(ral::usb, &regs, FNR, RXDP == 0);
            if !resume && self.config.low_power_on_suspend {
                ral::modify_reg!(ral::usb, &regs, CNTR, LP_MODE: 1);
            }
            self.clear_events(ISTR::WKUP::mask);
            if resume {
                ral::modify_reg!(ral::usb, &ral::instance(&self.usb), CNTR, FSUSP: 0);
                debug!("WAKEUP");
                if self.state == DeviceState::Suspended {
                    self.state = self.saved_state;
                }
                trace!("STATE {}", self.state);
                handler.wakeup(self);
            } else {
                debug!("SPURIOUS WAKEUP");
            }
        }

        if istr & ISTR::SOF::mask != 0 {
            self.clear_events(ISTR::SOF::mask);
            if self.config.sof {
                handler.start_of_frame(self);
            }
        }

        while istr & ISTR::CTR::mask != 0 {
            let ep = ((istr & ISTR::EP_ID::mask) >> ISTR::EP_ID::offset) as usize;
            let epr = endpoint::read(&self.usb, ep);

            if epr & EPR::CTR_TX::mask != 0 {
                endpoint::clear_ctr_tx(&self.usb, ep);
                if self.transmit_complete(ep, epr) {
                    self.transmitting &= !(1 << ep);
                    trace!("EP{} IN COMPLETE", ep);
                    handler.in_complete(self, ep);
                }
            }

            if epr & EPR::CTR_RX::mask != 0 {
                endpoint::clear_ctr_rx(&self.usb, ep);
                if epr & EPR::SETUP::mask != 0 {
                    if ep == 0 {
                        let addr = Descriptor::new(&self.usb, 0).rx_addr(Half::Zero);
                        self.setup = packet::read_setup(&self.usb, addr);
                    }
                    debug!("EP{} SETUP", ep);
                    handler.setup(self, ep);
                } else if self.receive_complete(ep, epr) {
                    self.receiving &= !(1 << ep);
                    trace!("EP{} OUT COMPLETE", ep);
                    handler.out_complete(self, ep);
                }
            }

            istr = self.istr();
        }
    }

    fn istr(&self) -> u32 {
        ral::read_reg!(ral::usb, &ral::instance(&self.usb), ISTR)
    }

    /// Clear the ISTR events in `mask`, leaving the others pending
    fn clear_events(&self, mask: u32) {
        ral::write_reg!(ral::usb, &ral::instance(&self.usb), ISTR, !mask);
    }

    fn transmit_complete(&mut self, ep: usize, epr: u32) -> bool {
        match self.endpoints[ep].as_mut() {
            Some(endpoint) => endpoint.transmit_complete(&self.usb, epr),
            None => {
                warn!("EP{} IN isn't configured", ep);
                false
            }
        }
    }

    fn receive_complete(&mut self, ep: usize, epr: u32) -> bool {
        match self.endpoints[ep].as_mut() {
            Some(endpoint) => endpoint.receive_complete(&self.usb, epr),
            None => {
                warn!("EP{} OUT isn't configured", ep);
                false
            }
        }
    }
}

fn configured<'e, 'a>(
    endpoints: &'e mut [Option<Endpoint<'a>>; ENDPOINT_COUNT],
    ep: usize,
) -> &'e mut Endpoint<'a> {
    match endpoints.get_mut(ep).and_then(Option::as_mut) {
        Some(endpoint) => endpoint,
        None => panic!("EP{} isn't configured", ep),
    }
}

#[cfg(test)]
mod tests {
    use super::{Config, DeviceState, Driver, Handler};
    use crate::endpoint::{EndpointConfig, EndpointStatus};
    use crate::queue::{
        tests::{cs, Counting},
        Queue,
    };
    use crate::sim::{Simulator, Stat};
    use crate::state::{Destination, Source};
    use crate::{Peripheral, BTABLE_SIZE};
    use core::sync::atomic::Ordering;
    use usb_device::endpoint::{EndpointType, IsochronousSynchronizationType, IsochronousUsageType};

    const ISO: EndpointType = EndpointType::Isochronous {
        synchronization: IsochronousSynchronizationType::NoSynchronization,
        usage: IsochronousUsageType::Data,
    };

    const BULK: EndpointConfig = EndpointConfig::new(EndpointType::Bulk)
        .with_in(64)
        .with_out(64);

    #[derive(Default)]
    struct Events {
        resets: usize,
        suspends: usize,
        wakeups: usize,
        frames: usize,
        setups: [usize; 8],
        in_complete: [usize; 8],
        out_complete: [usize; 8],
    }

    impl<'a, P: Peripheral> Handler<'a, P> for Events {
        fn bus_reset(&mut self, _: &mut Driver<'a, P>) {
            self.resets += 1;
        }
        fn suspend(&mut self, _: &mut Driver<'a, P>) {
            self.suspends += 1;
        }
        fn wakeup(&mut self, _: &mut Driver<'a, P>) {
            self.wakeups += 1;
        }
        fn start_of_frame(&mut self, _: &mut Driver<'a, P>) {
            self.frames += 1;
        }
        fn setup(&mut self, _: &mut Driver<'a, P>, ep: usize) {
            self.setups[ep] += 1;
        }
        fn in_complete(&mut self, _: &mut Driver<'a, P>, ep: usize) {
            self.in_complete[ep] += 1;
        }
        fn out_complete(&mut self, _: &mut Driver<'a, P>, ep: usize) {
            self.out_complete[ep] += 1;
        }
    }

    fn started<'a>(config: Config) -> Driver<'a, Simulator> {
        let mut driver = Driver::new(Simulator::new(), config);
        driver.start();
        driver
    }

    fn pattern(len: usize) -> [u8; 256] {
        let mut data = [0; 256];
        for (idx, byte) in data.iter_mut().take(len).enumerate() {
            *byte = (idx as u8).wrapping_mul(7).wrapping_add(3);
        }
        data
    }

    #[test]
    fn start_configures_endpoint_zero() {
        let driver = started(Config::default());
        let usb = driver.peripheral();
        assert_eq!(driver.state(), DeviceState::Ready);
        assert!(!usb.is_powered_down());
        assert_eq!(usb.address(), Some(0));
        assert_eq!(usb.stat_tx(0), Stat::Nak);
        assert_eq!(usb.stat_rx(0), Stat::Nak);
        for ep in 1..8 {
            assert_eq!(driver.status_in(ep), EndpointStatus::Disabled);
            assert_eq!(driver.status_out(ep), EndpointStatus::Disabled);
        }
    }

    #[test]
    fn stop_then_start() {
        let mut driver = started(Config::default());
        driver.configure_endpoint(1, BULK);
        driver.stop();
        assert_eq!(driver.state(), DeviceState::Stopped);
        assert!(driver.peripheral().is_powered_down());

        driver.start();
        assert_eq!(driver.state(), DeviceState::Ready);
        assert!(!driver.peripheral().is_powered_down());
        assert_eq!(driver.received(1), None);
    }

    #[test]
    fn setup_packet_is_latched() {
        let mut driver = started(Config::default());
        let mut events = Events::default();
        let setup = [0x00, 0x05, 0x12, 0x00, 0x00, 0x00, 0x00, 0x00];

        assert!(driver.peripheral().host_setup(0, setup));
        driver.isr(&mut events);

        assert_eq!(events.setups[0], 1);
        assert_eq!(driver.setup_packet(), &setup);
        let mut copy = [0; 8];
        driver.read_setup(0, &mut copy);
        assert_eq!(copy, setup);
        assert_eq!(driver.peripheral().stat_rx(0), Stat::Nak);
    }

    static DEVICE_DESCRIPTOR: [u8; 18] = [
        18, 1, 0x00, 0x02, 0, 0, 0, 64, 0x09, 0x12, 0x01, 0x00, 0x00, 0x01, 1, 2, 0, 1,
    ];

    /// Answers GET_DESCRIPTOR(DEVICE), and acknowledges SET_ADDRESS
    #[derive(Default)]
    struct Responder {
        done: usize,
    }

    impl<'a> Handler<'a, Simulator> for Responder {
        fn setup(&mut self, driver: &mut Driver<'a, Simulator>, ep: usize) {
            let mut setup = [0; 8];
            driver.read_setup(ep, &mut setup);
            match (setup[0], setup[1]) {
                (0x80, 0x06) => {
                    let len = (u16::from_le_bytes([setup[6], setup[7]]) as usize)
                        .min(DEVICE_DESCRIPTOR.len());
                    driver.prepare_transmit(ep, Source::Buffer(&DEVICE_DESCRIPTOR), len);
                    driver.start_in(ep);
                }
                (0x00, 0x05) => {
                    driver.prepare_transmit(ep, Source::Buffer(&[]), 0);
                    driver.start_in(ep);
                }
                _ => {
                    driver.stall_in(ep);
                    driver.stall_out(ep);
                }
            }
        }
        fn in_complete(&mut self, driver: &mut Driver<'a, Simulator>, ep: usize) {
            let setup = *driver.setup_packet();
            if setup[1] == 0x05 {
                driver.set_address(setup[2]);
            }
            self.done += 1;
            assert!(!driver.is_transmitting(ep));
        }
    }

    #[test]
    fn control_transfers_from_the_handler() {
        let mut driver = started(Config::default());
        let mut responder = Responder::default();
        let mut packet = [0; 64];

        let get_descriptor = [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x40, 0x00];
        assert!(driver.peripheral().host_setup(0, get_descriptor));
        driver.isr(&mut responder);
        assert!(driver.is_transmitting(0));

        assert_eq!(driver.peripheral().host_in(0, &mut packet), Some(18));
        assert_eq!(&packet[..18], &DEVICE_DESCRIPTOR);
        driver.isr(&mut responder);
        assert_eq!(responder.done, 1);
        assert_eq!(driver.transmitted(0), Some(18));

        let set_address = [0x00, 0x05, 0x2A, 0x00, 0x00, 0x00, 0x00, 0x00];
        assert!(driver.peripheral().host_setup(0, set_address));
        driver.isr(&mut responder);
        assert_eq!(driver.peripheral().host_in(0, &mut packet), Some(0));
        driver.isr(&mut responder);
        assert_eq!(responder.done, 2);
        assert_eq!(driver.address(), 0x2A);
        assert_eq!(driver.state(), DeviceState::Active);
        assert_eq!(driver.peripheral().address(), Some(0x2A));

        assert!(driver.peripheral().host_setup(0, [0x80, 0x00, 0, 0, 0, 0, 2, 0]));
        driver.isr(&mut responder);
        assert_eq!(driver.peripheral().stat_tx(0), Stat::Stall);
        assert_eq!(driver.peripheral().stat_rx(0), Stat::Stall);
    }

    #[test]
    fn bulk_out_completes_after_short_packet() {
        let data = pattern(130);
        let mut storage = [0u8; 130];
        let mut driver = started(Config::default());
        let mut events = Events::default();
        driver.configure_endpoint(1, BULK);

        driver.prepare_receive(1, Destination::Buffer(&mut storage), 130);
        assert!(driver.is_receiving(1));
        driver.start_out(1);

        for chunk in data[..130].chunks(64) {
            assert_eq!(events.out_complete[1], 0);
            assert!(driver.peripheral().host_out(1, chunk));
            driver.isr(&mut events);
        }

        assert_eq!(events.out_complete[1], 1);
        assert!(!driver.is_receiving(1));
        assert_eq!(driver.received(1), Some(130));
        assert_eq!(driver.peripheral().stat_rx(1), Stat::Nak);
        let received = driver.take_receive_buffer(1).unwrap();
        assert_eq!(received, &data[..130]);
    }

    #[test]
    fn bulk_out_completes_on_packet_count() {
        let data = pattern(128);
        let mut storage = [0u8; 128];
        let mut driver = started(Config::default());
        let mut events = Events::default();
        driver.configure_endpoint(1, BULK);

        driver.prepare_receive(1, Destination::Buffer(&mut storage), 128);
        driver.start_out(1);
        for chunk in data[..128].chunks(64) {
            assert!(driver.peripheral().host_out(1, chunk));
            driver.isr(&mut events);
        }

        assert_eq!(events.out_complete[1], 1);
        assert_eq!(driver.received(1), Some(128));
        assert_eq!(driver.peripheral().stat_rx(1), Stat::Nak);
        assert!(!driver.peripheral().host_out(1, &data[..64]));
        assert_eq!(driver.take_receive_buffer(1).unwrap(), &data[..128]);
    }

    #[test]
    fn zero_length_out_still_completes() {
        let mut storage = [0u8; 8];
        let mut driver = started(Config::default());
        let mut events = Events::default();
        driver.configure_endpoint(1, BULK);

        driver.prepare_receive(1, Destination::Buffer(&mut storage), 0);
        driver.start_out(1);
        assert!(driver.peripheral().host_out(1, &[]));
        driver.isr(&mut events);

        assert_eq!(events.out_complete[1], 1);
        assert!(!driver.is_receiving(1));
        assert_eq!(driver.received(1), Some(0));
    }

    #[test]
    fn bulk_out_stops_early_on_short_packet() {
        let mut storage = [0u8; 128];
        let mut driver = started(Config::default());
        let mut events = Events::default();
        driver.configure_endpoint(2, BULK);

        driver.prepare_receive(2, Destination::Buffer(&mut storage), 128);
        driver.start_out(2);
        assert!(driver.peripheral().host_out(2, &[9; 10]));
        driver.isr(&mut events);

        assert_eq!(events.out_complete[2], 1);
        assert_eq!(driver.received(2), Some(10));
    }

    #[test]
    fn bulk_in_splits_into_packets() {
        let data = pattern(150);
        let mut driver = started(Config::default());
        let mut events = Events::default();
        driver.configure_endpoint(1, BULK);

        driver.prepare_transmit(1, Source::Buffer(&data[..150]), 150);
        driver.start_in(1);

        let mut received = [0u8; 150];
        let mut offset = 0;
        for expected in [64, 64, 22] {
            assert_eq!(events.in_complete[1], 0);
            let mut packet = [0; 64];
            let n = driver.peripheral().host_in(1, &mut packet).unwrap();
            assert_eq!(n, expected);
            received[offset..offset + n].copy_from_slice(&packet[..n]);
            offset += n;
            driver.isr(&mut events);
        }

        assert_eq!(events.in_complete[1], 1);
        assert_eq!(&received[..], &data[..150]);
        assert_eq!(driver.transmitted(1), Some(150));
        assert_eq!(driver.peripheral().stat_tx(1), Stat::Nak);
    }

    #[test]
    fn exact_multiple_needs_no_extra_packet() {
        let data = pattern(128);
        let mut driver = started(Config::default());
        let mut events = Events::default();
        driver.configure_endpoint(1, BULK);

        driver.prepare_transmit(1, Source::Buffer(&data[..128]), 128);
        driver.start_in(1);
        let mut packet = [0; 64];
        for _ in 0..2 {
            assert_eq!(driver.peripheral().host_in(1, &mut packet), Some(64));
            driver.isr(&mut events);
        }
        assert_eq!(events.in_complete[1], 1);
        assert_eq!(driver.peripheral().host_in(1, &mut packet), None);
    }

    #[test]
    fn zero_length_packet() {
        let mut driver = started(Config::default());
        let mut events = Events::default();
        driver.configure_endpoint(3, EndpointConfig::new(EndpointType::Interrupt).with_in(8));

        driver.prepare_transmit(3, Source::Buffer(&[]), 0);
        driver.start_in(3);
        let mut packet = [0xFF; 8];
        assert_eq!(driver.peripheral().host_in(3, &mut packet), Some(0));
        driver.isr(&mut events);
        assert_eq!(events.in_complete[3], 1);
        assert_eq!(driver.transmitted(3), Some(0));
    }

    #[test]
    fn restarted_in_without_prepare_completes_once() {
        let data = pattern(10);
        let mut driver = started(Config::default());
        let mut events = Events::default();
        driver.configure_endpoint(1, BULK);

        driver.prepare_transmit(1, Source::Buffer(&data[..10]), 10);
        driver.start_in(1);
        let mut packet = [0; 64];
        assert_eq!(driver.peripheral().host_in(1, &mut packet), Some(10));
        driver.isr(&mut events);

        driver.start_in(1);
        assert_eq!(driver.peripheral().host_in(1, &mut packet), Some(10));
        driver.isr(&mut events);

        assert_eq!(events.in_complete[1], 1);
        assert_eq!(driver.transmitted(1), Some(10));
        assert!(!driver.is_transmitting(1));
    }

    #[test]
    fn isochronous_in_frames_after_completion_are_ignored() {
        let data = pattern(10);
        let mut driver = started(Config::default());
        let mut events = Events::default();
        driver.configure_endpoint(5, EndpointConfig::new(ISO).with_in(16));

        driver.prepare_transmit(5, Source::Buffer(&data[..10]), 10);
        let mut packet = [0; 16];
        assert_eq!(driver.peripheral().host_in(5, &mut packet), Some(10));
        driver.isr(&mut events);
        for _ in 0..3 {
            assert!(driver.peripheral().host_in(5, &mut packet).is_some());
            driver.isr(&mut events);
        }

        assert_eq!(events.in_complete[5], 1);
        assert_eq!(driver.transmitted(5), Some(10));
    }

    #[test]
    fn isochronous_out_drops_packets_without_a_transaction() {
        let mut storage = [0u8; 64];
        let mut driver = started(Config::default());
        let mut events = Events::default();
        driver.configure_endpoint(4, EndpointConfig::new(ISO).with_out(64));

        driver.prepare_receive(4, Destination::Buffer(&mut storage), 64);
        assert!(driver.peripheral().host_out(4, &[1; 10]));
        driver.isr(&mut events);
        assert!(driver.peripheral().host_out(4, &[2; 20]));
        driver.isr(&mut events);

        assert_eq!(events.out_complete[4], 1);
        assert_eq!(driver.received(4), Some(10));
        let buffer = driver.take_receive_buffer(4).unwrap();
        assert!(buffer[..10].iter().all(|byte| *byte == 1));
        assert!(buffer[10..].iter().all(|byte| *byte == 0));
    }

    #[test]
    fn isochronous_out_alternates_halves() {
        let mut storage = [0u8; 64];
        let mut driver = started(Config::default());
        let mut events = Events::default();
        driver.configure_endpoint(4, EndpointConfig::new(ISO).with_out(64));
        assert_eq!(driver.peripheral().stat_rx(4), Stat::Valid);

        let mut buffer: &mut [u8] = &mut storage;
        for (round, n) in [10usize, 20, 5].into_iter().enumerate() {
            driver.prepare_receive(4, Destination::Buffer(buffer), 64);
            let data = [round as u8 + 1; 64];
            assert!(driver.peripheral().host_out(4, &data[..n]));
            driver.isr(&mut events);

            assert_eq!(events.out_complete[4], round + 1);
            assert_eq!(driver.received(4), Some(n));
            assert_eq!(driver.peripheral().stat_rx(4), Stat::Valid);
            buffer = driver.take_receive_buffer(4).unwrap();
            assert!(buffer[..n].iter().all(|byte| *byte == round as u8 + 1));
        }
    }

    #[test]
    fn isochronous_in_multi_packet() {
        let data = pattern(40);
        let mut driver = started(Config::default());
        let mut events = Events::default();
        driver.configure_endpoint(5, EndpointConfig::new(ISO).with_in(16));

        driver.prepare_transmit(5, Source::Buffer(&data[..40]), 40);
        let mut received = [0u8; 40];
        let mut offset = 0;
        for expected in [16, 16, 8] {
            let mut packet = [0; 16];
            let n = driver.peripheral().host_in(5, &mut packet).unwrap();
            assert_eq!(n, expected);
            received[offset..offset + n].copy_from_slice(&packet[..n]);
            offset += n;
            driver.isr(&mut events);
        }
        assert_eq!(events.in_complete[5], 1);
        assert_eq!(&received[..], &data[..40]);
        assert_eq!(driver.peripheral().stat_tx(5), Stat::Valid);
    }

    #[test]
    fn clear_never_interrupts_a_valid_direction() {
        let mut driver = started(Config::default());
        driver.configure_endpoint(1, BULK);

        driver.start_in(1);
        driver.clear_in(1);
        assert_eq!(driver.peripheral().stat_tx(1), Stat::Valid);

        driver.stall_out(1);
        driver.clear_out(1);
        assert_eq!(driver.peripheral().stat_rx(1), Stat::Nak);
        driver.clear_out(1);
        assert_eq!(driver.peripheral().stat_rx(1), Stat::Nak);
        assert_eq!(driver.peripheral().stat_tx(1), Stat::Valid);
    }

    #[test]
    fn suspend_and_wakeup() {
        let mut driver = started(Config {
            low_power_on_suspend: true,
            ..Config::default()
        });
        let mut events = Events::default();
        driver.set_address(7);

        driver.peripheral().host_suspend();
        driver.isr(&mut events);
        assert_eq!(events.suspends, 1);
        assert_eq!(driver.state(), DeviceState::Suspended);
        assert!(driver.peripheral().is_suspended());
        assert!(driver.peripheral().is_low_power());

        driver.peripheral().host_spurious_wakeup();
        driver.isr(&mut events);
        assert_eq!(events.wakeups, 0);
        assert_eq!(driver.state(), DeviceState::Suspended);
        assert!(driver.peripheral().is_low_power());

        driver.peripheral().host_wakeup();
        driver.isr(&mut events);
        assert_eq!(events.wakeups, 1);
        assert_eq!(driver.state(), DeviceState::Active);
        assert!(!driver.peripheral().is_suspended());
    }

    #[test]
    fn suspend_without_low_power() {
        let mut driver = started(Config::default());
        let mut events = Events::default();
        driver.peripheral().host_suspend();
        driver.isr(&mut events);
        assert!(driver.peripheral().is_suspended());
        assert!(!driver.peripheral().is_low_power());
        driver.peripheral().host_wakeup();
        driver.isr(&mut events);
        assert_eq!(driver.state(), DeviceState::Ready);
    }

    #[test]
    fn start_of_frame_is_opt_in() {
        let mut events = Events::default();
        let mut quiet = started(Config::default());
        quiet.peripheral().host_sof();
        quiet.isr(&mut events);
        assert_eq!(events.frames, 0);

        let mut loud = started(Config {
            sof: true,
            ..Config::default()
        });
        loud.peripheral().host_sof();
        loud.isr(&mut events);
        loud.peripheral().host_sof();
        loud.isr(&mut events);
        assert_eq!(events.frames, 2);
    }

    #[test]
    fn bus_reset_forgets_the_configuration() {
        let mut storage = [0u8; 64];
        let mut driver = started(Config::default());
        let mut events = Events::default();
        driver.set_address(12);
        driver.configure_endpoint(1, BULK);
        driver.prepare_receive(1, Destination::Buffer(&mut storage), 64);

        driver.peripheral().host_reset();
        driver.isr(&mut events);

        assert_eq!(events.resets, 1);
        assert_eq!(driver.state(), DeviceState::Ready);
        assert_eq!(driver.address(), 0);
        assert_eq!(driver.peripheral().address(), Some(0));
        assert!(!driver.is_receiving(1));
        assert_eq!(driver.received(1), None);
        assert_eq!(driver.status_out(1), EndpointStatus::Disabled);
        assert_eq!(driver.peripheral().stat_rx(0), Stat::Nak);
    }

    #[test]
    fn disable_endpoints_keeps_endpoint_zero() {
        let mut driver = started(Config::default());
        let mut events = Events::default();
        driver.configure_endpoint(1, BULK);
        driver.configure_endpoint(2, BULK);
        driver.start_out(1);

        driver.disable_endpoints();
        assert_eq!(driver.status_out(1), EndpointStatus::Disabled);
        assert_eq!(driver.status_in(2), EndpointStatus::Disabled);
        assert_eq!(driver.peripheral().stat_rx(0), Stat::Nak);

        driver.configure_endpoint(3, BULK);
        let desc = crate::btable::Descriptor::new(driver.peripheral(), 3);
        assert_eq!(
            desc.tx_addr(crate::btable::Half::Zero),
            BTABLE_SIZE as u16 + 128
        );

        assert!(driver.peripheral().host_setup(0, [0x80, 0x06, 0, 1, 0, 0, 8, 0]));
        driver.isr(&mut events);
        assert_eq!(events.setups[0], 1);
    }

    #[test]
    fn queue_out_wakes_waiters() {
        let waiting = Counting::default();
        let mut storage = [0u8; 100];
        let queue = Queue::input(&mut storage, &waiting);
        let mut driver = started(Config::default());
        let mut events = Events::default();
        driver.configure_endpoint(1, EndpointConfig::new(EndpointType::Bulk).with_out(32));

        driver.prepare_receive(1, Destination::Queue(&queue), 40);
        driver.start_out(1);
        assert!(driver.peripheral().host_out(1, &[1; 32]));
        driver.isr(&mut events);
        assert_eq!(events.out_complete[1], 0);
        assert!(driver.peripheral().host_out(1, &[2; 8]));
        driver.isr(&mut events);

        let cs = cs();
        assert_eq!(events.out_complete[1], 1);
        assert_eq!(queue.counter(&cs), 40);
        assert_eq!(waiting.wakes.load(Ordering::Relaxed), 2);
        assert_eq!(driver.take_receive_buffer(1), None);

        let mut read = [0; 40];
        assert_eq!(queue.read(&cs, &mut read), 40);
        assert!(read[..32].iter().all(|byte| *byte == 1));
        assert!(read[32..].iter().all(|byte| *byte == 2));
    }

    #[test]
    fn queue_in_frees_space() {
        let waiting = Counting::default();
        let mut storage = [0u8; 16];
        let queue = Queue::output(&mut storage, &waiting);
        let cs = cs();
        assert_eq!(queue.write(&cs, b"hello, usb host!"), 16);

        let mut driver = started(Config::default());
        let mut events = Events::default();
        driver.configure_endpoint(2, EndpointConfig::new(EndpointType::Interrupt).with_in(8));
        driver.prepare_transmit(2, Source::Queue(&queue), 16);
        driver.start_in(2);
        assert_eq!(queue.counter(&cs), 8);

        let mut packet = [0; 8];
        assert_eq!(driver.peripheral().host_in(2, &mut packet), Some(8));
        assert_eq!(&packet, b"hello, u");
        driver.isr(&mut events);
        assert_eq!(driver.peripheral().host_in(2, &mut packet), Some(8));
        assert_eq!(&packet, b"sb host!");
        driver.isr(&mut events);

        assert_eq!(events.in_complete[2], 1);
        assert_eq!(queue.counter(&cs), 16);
        assert_eq!(waiting.wakes.load(Ordering::Relaxed), 2);
    }

    #[test]
    #[should_panic]
    fn transmit_on_unconfigured_endpoint() {
        let mut driver = started(Config::default());
        driver.prepare_transmit(6, Source::Buffer(&[1, 2, 3]), 3);
    }

    #[test]
    #[should_panic]
    fn packet_memory_overflow() {
        let mut driver = started(Config::default());
        for ep in 1..8 {
            driver.configure_endpoint(ep, BULK);
        }
    }
}
