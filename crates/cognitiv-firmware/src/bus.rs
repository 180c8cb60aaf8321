//! I2C bus on GPIO12 (SDA) / GPIO11 (SCL) with raw line access for recovery
//!
//! Recovery needs the two pins back from the I2C peripheral while the driver
//! still owns them. [`RawBusLines`] works below the driver: it rewrites the
//! IO_MUX and GPIO matrix registers directly, the same way the pins are
//! handed back to the peripheral when [`EspBusPort::attach`] builds a fresh
//! driver.

use core::ptr::{read_volatile, write_volatile};

use cognitiv_core::{BusLines, BusPort};
use embedded_hal::digital::PinState;
use embedded_hal::i2c::{Error as _, ErrorKind, ErrorType, Operation};
use esp_hal::Async;
use esp_hal::i2c::master::{Config as I2cConfig, Error as I2cError, I2c};
use esp_hal::peripherals::{GPIO11, GPIO12, I2C0};
use esp_hal::time::Rate;
use log::{debug, error};

use crate::{PIN_SCL, PIN_SDA};

// GPIO output/enable set and clear registers, low bank (GPIO 0-31)
const GPIO_OUT_W1TS_REG: u32 = 0x6000_4008;
const GPIO_OUT_W1TC_REG: u32 = 0x6000_400C;
const GPIO_ENABLE_W1TS_REG: u32 = 0x6000_4020;
const GPIO_ENABLE_W1TC_REG: u32 = 0x6000_4024;
const GPIO_IN_REG: u32 = 0x6000_403C;

// High bank (GPIO 32-48)
const GPIO_OUT1_W1TS_REG: u32 = 0x6000_4014;
const GPIO_OUT1_W1TC_REG: u32 = 0x6000_4018;
const GPIO_ENABLE1_W1TS_REG: u32 = 0x6000_4030;
const GPIO_ENABLE1_W1TC_REG: u32 = 0x6000_4034;
const GPIO_IN1_REG: u32 = 0x6000_4040;

/// GPIO_FUNCn_OUT_SEL_CFG_REG for GPIO0; one word per pin.
const GPIO_FUNC0_OUT_SEL_CFG_REG: u32 = 0x6000_4554;
/// Plain GPIO output, enable taken from GPIO_ENABLE_REG.
const OUT_SEL_SIMPLE_GPIO: u32 = 0x100 | (1 << 10);

/// IO_MUX_GPIO0_REG; one word per pin.
const IO_MUX_GPIO0_REG: u32 = 0x6000_9004;
const IO_MUX_MCU_SEL_MASK: u32 = 0b111 << 12;
const IO_MUX_MCU_SEL_GPIO: u32 = 1 << 12;
const IO_MUX_FUN_WPD: u32 = 1 << 7;
const IO_MUX_FUN_WPU: u32 = 1 << 8;
const IO_MUX_FUN_IE: u32 = 1 << 9;

const BUS_FREQUENCY_KHZ: u32 = 100;

/// Register-level handle on one pad, independent of any driver that owns it.
struct RawPin<const PIN: u8>;

impl<const PIN: u8> RawPin<PIN> {
    /// Output set, output clear, enable set, enable clear, input, bit mask.
    #[inline]
    const fn registers(&self) -> (u32, u32, u32, u32, u32, u32) {
        if PIN < 32 {
            (
                GPIO_OUT_W1TS_REG,
                GPIO_OUT_W1TC_REG,
                GPIO_ENABLE_W1TS_REG,
                GPIO_ENABLE_W1TC_REG,
                GPIO_IN_REG,
                1u32 << PIN,
            )
        } else {
            (
                GPIO_OUT1_W1TS_REG,
                GPIO_OUT1_W1TC_REG,
                GPIO_ENABLE1_W1TS_REG,
                GPIO_ENABLE1_W1TC_REG,
                GPIO_IN1_REG,
                1u32 << (PIN - 32),
            )
        }
    }

    /// Take the pad away from the I2C peripheral: GPIO function, input
    /// buffer on, pull-up on, output driven from the GPIO registers.
    fn claim(&self) {
        let io_mux = (IO_MUX_GPIO0_REG + 4 * PIN as u32) as *mut u32;
        let out_sel = (GPIO_FUNC0_OUT_SEL_CFG_REG + 4 * PIN as u32) as *mut u32;
        critical_section::with(|_| unsafe {
            let mut value = read_volatile(io_mux);
            value &= !(IO_MUX_MCU_SEL_MASK | IO_MUX_FUN_WPD);
            value |= IO_MUX_MCU_SEL_GPIO | IO_MUX_FUN_IE | IO_MUX_FUN_WPU;
            write_volatile(io_mux, value);
            write_volatile(out_sel, OUT_SEL_SIMPLE_GPIO);
        });
    }

    fn set_as_input(&self) {
        let (_, _, _, enable_clr, _, bit) = self.registers();
        critical_section::with(|_| unsafe {
            write_volatile(enable_clr as *mut u32, bit);
        });
    }

    fn set_as_output(&self) {
        let (_, _, enable_set, _, _, bit) = self.registers();
        critical_section::with(|_| unsafe {
            write_volatile(enable_set as *mut u32, bit);
        });
    }

    fn set_level(&self, state: PinState) {
        let (out_set, out_clr, _, _, _, bit) = self.registers();
        let reg = match state {
            PinState::High => out_set,
            PinState::Low => out_clr,
        };
        critical_section::with(|_| unsafe {
            write_volatile(reg as *mut u32, bit);
        });
    }

    fn is_high(&self) -> bool {
        let (_, _, _, _, input, bit) = self.registers();
        unsafe { read_volatile(input as *const u32) & bit != 0 }
    }
}

/// SCL and SDA as plain GPIOs while the I2C driver is detached.
pub struct RawBusLines {
    scl: RawPin<PIN_SCL>,
    sda: RawPin<PIN_SDA>,
}

impl BusLines for RawBusLines {
    fn configure_for_recovery(&mut self) {
        self.scl.claim();
        self.scl.set_level(PinState::High);
        self.scl.set_as_output();

        self.sda.claim();
        self.sda.set_as_input();
    }

    fn set_scl(&mut self, state: PinState) {
        self.scl.set_level(state);
    }

    fn drive_sda(&mut self, state: PinState) {
        self.sda.set_level(state);
        self.sda.set_as_output();
    }

    fn release_sda(&mut self) {
        self.sda.set_as_input();
    }

    fn sda_is_high(&mut self) -> bool {
        self.sda.is_high()
    }
}

#[derive(Debug)]
pub enum PortError {
    /// No driver is attached to the pins.
    Detached,
    I2c(I2cError),
}

impl embedded_hal::i2c::Error for PortError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Detached => ErrorKind::Bus,
            Self::I2c(e) => e.kind(),
        }
    }
}

/// The async I2C driver, or nothing while the lines are in raw mode.
pub struct PortBus {
    driver: Option<I2c<'static, Async>>,
}

impl ErrorType for PortBus {
    type Error = PortError;
}

impl embedded_hal_async::i2c::I2c for PortBus {
    async fn transaction(
        &mut self,
        address: u8,
        operations: &mut [Operation<'_>],
    ) -> Result<(), Self::Error> {
        let driver = self.driver.as_mut().ok_or(PortError::Detached)?;
        embedded_hal_async::i2c::I2c::transaction(driver, address, operations)
            .await
            .map_err(PortError::I2c)
    }
}

pub struct EspBusPort {
    bus: PortBus,
    lines: RawBusLines,
}

impl EspBusPort {
    /// Takes the peripheral and both pins so nothing else can use them. The
    /// driver itself is built by [`BusPort::attach`].
    pub fn new(_i2c: I2C0<'static>, _sda: GPIO12<'static>, _scl: GPIO11<'static>) -> Self {
        Self {
            bus: PortBus { driver: None },
            lines: RawBusLines {
                scl: RawPin,
                sda: RawPin,
            },
        }
    }
}

impl BusPort for EspBusPort {
    type Bus = PortBus;
    type Lines = RawBusLines;

    fn attach(&mut self) {
        // Release the old driver before its peripheral is taken again.
        self.bus.driver = None;

        // SAFETY: `new` took ownership of these three peripherals and the
        // previous driver built from them was dropped above.
        let (i2c0, sda, scl) = unsafe { (I2C0::steal(), GPIO12::steal(), GPIO11::steal()) };

        let config = I2cConfig::default().with_frequency(Rate::from_khz(BUS_FREQUENCY_KHZ));
        match I2c::new(i2c0, config) {
            Ok(driver) => {
                self.bus.driver = Some(driver.with_sda(sda).with_scl(scl).into_async());
                debug!(
                    "I2C0 attached SDA=GPIO{} SCL=GPIO{} at {} kHz",
                    PIN_SDA, PIN_SCL, BUS_FREQUENCY_KHZ
                );
            }
            Err(e) => error!("I2C0 configuration rejected: {:?}", e),
        }
    }

    fn detach(&mut self) -> &mut RawBusLines {
        self.bus.driver = None;
        &mut self.lines
    }

    fn bus(&mut self) -> &mut PortBus {
        &mut self.bus
    }
}
