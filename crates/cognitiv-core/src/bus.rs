//! I2C bus ownership, probing and stuck-bus recovery
//!
//! A peripheral that is reset in the middle of a read can keep SDA pulled low
//! forever, which wedges every later transaction. [`BusManager::recover`]
//! clocks SCL by hand until the device lets go, then leaves a STOP on the
//! wire and hands the pins back to the I2C peripheral.

use embassy_time::Delay;
use embedded_hal::delay::DelayNs;
use embedded_hal::digital::PinState;
use embedded_hal_async::i2c::I2c;
use heapless::Vec;
use log::{debug, info, warn};
use thiserror_no_std::Error;

/// Clock pulses issued before giving up on a stuck SDA line.
pub const RECOVERY_PULSES: u8 = 9;

/// Half period of the hand-driven recovery clock.
const RECOVERY_HALF_PERIOD_US: u32 = 10;

/// First and last 7-bit addresses probed by [`BusManager::scan_bus`].
/// 0x00-0x02 and 0x78-0x7F are reserved addresses.
pub const SCAN_FIRST_ADDRESS: u8 = 0x03;
pub const SCAN_LAST_ADDRESS: u8 = 0x77;

/// Upper bound on devices reported by a scan.
pub const MAX_SCAN_RESULTS: usize = 16;

/// Raw control over the two bus lines while the I2C peripheral is detached.
pub trait BusLines {
    /// Drive SCL as a push-pull output (idle high) and make SDA a pulled-up input.
    fn configure_for_recovery(&mut self);

    fn set_scl(&mut self, state: PinState);

    /// Drive SDA as an output at `state`.
    fn drive_sda(&mut self, state: PinState);

    /// Return SDA to a pulled-up input.
    fn release_sda(&mut self);

    fn sda_is_high(&mut self) -> bool;
}

/// The board's I2C bus on its fixed pin assignment.
pub trait BusPort {
    type Bus: I2c;
    type Lines: BusLines;

    /// Route the pins to the I2C peripheral and configure it. Calling this on
    /// an already attached bus reconfigures it.
    fn attach(&mut self);

    /// Disconnect the peripheral from the pins and expose them directly.
    fn detach(&mut self) -> &mut Self::Lines;

    fn bus(&mut self) -> &mut Self::Bus;
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusError {
    #[error("SDA still held low after {pulses} clock pulses")]
    StuckLow { pulses: u8 },
}

/// Returns a human-readable name for addresses the node knows about.
pub fn known_device(address: u8) -> Option<&'static str> {
    match address {
        crate::sensors::scd41::SCD41_ADDRESS => Some("SCD41 CO2 sensor"),
        _ => None,
    }
}

pub struct BusManager<P> {
    port: P,
    initialized: bool,
}

impl<P: BusPort> BusManager<P> {
    pub const fn new(port: P) -> Self {
        Self {
            port,
            initialized: false,
        }
    }

    /// Configure the bus on its fixed pins.
    pub fn init(&mut self) {
        self.port.attach();
        if !self.initialized {
            info!("I2C bus initialized");
        }
        self.initialized = true;
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Clock a stuck bus free.
    ///
    /// Returns the number of pulses it took for SDA to read high. The
    /// synthetic STOP and the re-initialization happen on every path, so the
    /// bus is idle afterwards even when this returns an error.
    pub fn recover(&mut self) -> Result<u8, BusError> {
        warn!("Attempting I2C bus recovery");

        let mut delay = Delay;
        let lines = self.port.detach();
        lines.configure_for_recovery();

        let mut released_after = None;
        for pulse in 1..=RECOVERY_PULSES {
            lines.set_scl(PinState::Low);
            delay.delay_us(RECOVERY_HALF_PERIOD_US);
            lines.set_scl(PinState::High);
            delay.delay_us(RECOVERY_HALF_PERIOD_US);

            if lines.sda_is_high() {
                released_after = Some(pulse);
                break;
            }
        }

        // STOP: SDA rises while SCL is high.
        lines.set_scl(PinState::Low);
        delay.delay_us(RECOVERY_HALF_PERIOD_US);
        lines.drive_sda(PinState::Low);
        delay.delay_us(RECOVERY_HALF_PERIOD_US);
        lines.set_scl(PinState::High);
        delay.delay_us(RECOVERY_HALF_PERIOD_US);
        lines.drive_sda(PinState::High);
        delay.delay_us(RECOVERY_HALF_PERIOD_US);
        lines.release_sda();

        self.init();

        match released_after {
            Some(pulses) => {
                info!("I2C bus recovered after {} clock pulses", pulses);
                Ok(pulses)
            }
            None => {
                warn!("I2C bus recovery failed, SDA stuck low");
                Err(BusError::StuckLow {
                    pulses: RECOVERY_PULSES,
                })
            }
        }
    }

    /// Zero-length write probe; true if the address is acknowledged.
    pub async fn device_present(&mut self, address: u8) -> bool {
        self.port.bus().write(address, &[]).await.is_ok()
    }

    /// Probe every non-reserved address and return the ones that answer.
    ///
    /// Yields to the executor after each probe so the task watchdog keeps
    /// getting fed during the sweep.
    pub async fn scan_bus(&mut self) -> Vec<u8, MAX_SCAN_RESULTS> {
        info!(
            "Scanning I2C bus 0x{:02X}..=0x{:02X}",
            SCAN_FIRST_ADDRESS, SCAN_LAST_ADDRESS
        );
        let mut found = Vec::new();

        for address in SCAN_FIRST_ADDRESS..=SCAN_LAST_ADDRESS {
            if self.device_present(address).await {
                match known_device(address) {
                    Some(name) => info!("  0x{:02X}: {}", address, name),
                    None => info!("  0x{:02X}: unknown device", address),
                }
                if found.push(address).is_err() {
                    debug!("Scan result list full, not recording 0x{:02X}", address);
                }
            }
            embassy_futures::yield_now().await;
        }

        info!("I2C scan complete, {} device(s) found", found.len());
        found
    }

    pub fn i2c(&mut self) -> &mut P::Bus {
        self.port.bus()
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{LineEvent, SimBusPort};
    use embassy_futures::block_on;

    #[test]
    fn test_recover_after_k_pulses() {
        for k in 1..RECOVERY_PULSES {
            let mut bus = BusManager::new(SimBusPort::stuck_for(k));
            bus.init();

            assert_eq!(bus.recover(), Ok(k));
            assert_eq!(bus.port().lines().pulses(), k);
            assert!(bus.port().lines().bus_idle());
            assert!(bus.port().is_attached());
        }
    }

    #[test]
    fn test_recover_stuck_bus_still_emits_stop() {
        let mut bus = BusManager::new(SimBusPort::stuck_forever());
        bus.init();
        let attaches_before = bus.port().attach_count();

        assert_eq!(
            bus.recover(),
            Err(BusError::StuckLow {
                pulses: RECOVERY_PULSES
            })
        );

        let lines = bus.port().lines();
        assert_eq!(lines.pulses(), RECOVERY_PULSES);
        assert!(lines.ends_with(&[
            LineEvent::Scl(PinState::Low),
            LineEvent::Sda(PinState::Low),
            LineEvent::Scl(PinState::High),
            LineEvent::Sda(PinState::High),
            LineEvent::SdaReleased,
        ]));
        assert_eq!(bus.port().attach_count(), attaches_before + 1);
    }

    #[test]
    fn test_scan_finds_sensor() {
        let mut bus = BusManager::new(SimBusPort::healthy());
        bus.init();

        let found = block_on(bus.scan_bus());
        assert_eq!(found.as_slice(), &[crate::sensors::scd41::SCD41_ADDRESS]);
        assert!(block_on(bus.device_present(0x62)));
        assert!(!block_on(bus.device_present(0x3C)));
    }

    #[test]
    fn test_scan_yields_after_every_probe() {
        use core::future::Future;
        use core::pin::pin;
        use core::task::{Context, Poll, Waker};

        let mut bus = BusManager::new(SimBusPort::healthy());
        bus.init();

        let mut scan = pin!(bus.scan_bus());
        let mut cx = Context::from_waker(Waker::noop());
        let mut yields = 0usize;
        let found = loop {
            match scan.as_mut().poll(&mut cx) {
                Poll::Ready(found) => break found,
                Poll::Pending => yields += 1,
            }
        };

        let probes = usize::from(SCAN_LAST_ADDRESS - SCAN_FIRST_ADDRESS) + 1;
        assert_eq!(yields, probes);
        assert_eq!(found.len(), 1);
    }
}
