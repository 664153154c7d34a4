//! Sharing the driver between thread and interrupt contexts

use crate::{Driver, Handler, Peripheral};
use core::cell::RefCell;
use cortex_m::interrupt::{self, Mutex};

/// A [`Driver`] that's safe to share with the USB interrupt
///
/// Store the adapter in a `static`, configure the driver from thread context
/// with [`with_driver()`](BusAdapter::with_driver), and call
/// [`on_interrupt()`](BusAdapter::on_interrupt) from the USB interrupt
/// handler. Each access masks interrupts for its duration.
pub struct BusAdapter<'a, P> {
    driver: Mutex<RefCell<Driver<'a, P>>>,
}

impl<'a, P: Peripheral> BusAdapter<'a, P> {
    /// Wrap a driver
    ///
    /// Make sure you've started the driver before the USB interrupt can
    /// observe it.
    pub fn new(driver: Driver<'a, P>) -> Self {
        BusAdapter {
            driver: Mutex::new(RefCell::new(driver)),
        }
    }

    /// Interrupt-safe, mutable access to the driver
    ///
    /// # Panics
    ///
    /// Panics if called from within `func`.
    pub fn with_driver<R>(&self, func: impl FnOnce(&mut Driver<'a, P>) -> R) -> R {
        interrupt::free(|cs| {
            let driver = self.driver.borrow(cs);
            let mut driver = driver.borrow_mut();
            func(&mut driver)
        })
    }

    /// Handle the USB interrupt
    ///
    /// Forwards to [`Driver::isr`]. `handler` runs with interrupts masked.
    pub fn on_interrupt<H: Handler<'a, P>>(&self, handler: &mut H) {
        self.with_driver(|driver| driver.isr(handler));
    }
}

#[cfg(test)]
mod tests {
    use super::BusAdapter;
    use crate::sim::Simulator;

    fn assert_sync<T: Sync>() {}

    #[test]
    fn adapter_can_be_static() {
        assert_sync::<BusAdapter<'static, Simulator>>();
    }
}
