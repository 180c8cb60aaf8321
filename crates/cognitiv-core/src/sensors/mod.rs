//! Environmental acquisition
//!
//! One validated SCD41 reading per wake, taken in single-shot mode so the
//! sensor draws nothing between wakes, plus a battery voltage sample.

pub mod scd41;

use embassy_time::{Duration, Instant, Timer};
use log::{error, info, warn};
use thiserror_no_std::Error;

use crate::bus::{BusManager, BusPort};
use crate::config::{BatteryConfig, SensorConfig};
use scd41::{RawMeasurement, SCD41_ADDRESS, SCD41Sensor};

pub use scd41::crc8;

/// Battery voltages outside this band are logged as suspicious.
const EXPECTED_BATTERY_VOLTS: core::ops::RangeInclusive<f32> = 2.5..=5.5;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorError {
    #[error("{sensor} did not acknowledge address 0x{address:02X}")]
    NotPresent { sensor: &'static str, address: u8 },
    #[error("{sensor} failed to {operation}: {details}")]
    ReadFailed {
        sensor: &'static str,
        operation: &'static str,
        details: &'static str,
    },
    #[error("{sensor} returned a corrupt word while trying to {operation}")]
    Crc {
        sensor: &'static str,
        operation: &'static str,
    },
    #[error("{sensor} timed out while waiting to {operation}")]
    Timeout {
        sensor: &'static str,
        operation: &'static str,
    },
}

/// Analog input wired to the battery through a resistor divider.
pub trait BatteryAdc {
    fn read_raw(&mut self) -> u16;
}

/// One wake's worth of sensor data.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SensorReading {
    pub temperature: f32,
    pub humidity: f32,
    pub co2: u16,
    pub voltage: f32,
    /// Set only when every quantity is inside its rated range.
    pub valid: bool,
}

impl SensorReading {
    pub fn is_valid(&self) -> bool {
        self.valid
    }
}

/// Range check of a decoded measurement against the configured bounds.
pub fn within_bounds(config: &SensorConfig, co2: u16, temperature: f32, humidity: f32) -> bool {
    let co2_ok = (config.co2_min_ppm..=config.co2_max_ppm).contains(&co2);
    let temperature_ok =
        (config.temperature_min_c..=config.temperature_max_c).contains(&temperature);
    let humidity_ok = (config.humidity_min_pct..=config.humidity_max_pct).contains(&humidity);
    co2_ok && temperature_ok && humidity_ok
}

/// Scale a raw ADC sample to battery volts.
pub fn battery_volts(config: &BatteryConfig, raw: u16) -> f32 {
    raw as f32 / config.adc_full_scale as f32 * config.adc_reference_volts * config.divider_ratio
}

pub struct SensorManager<P, A> {
    bus: BusManager<P>,
    adc: A,
    config: SensorConfig,
    battery: BatteryConfig,
    reading: SensorReading,
}

impl<P: BusPort, A: BatteryAdc> SensorManager<P, A> {
    pub fn new(bus: BusManager<P>, adc: A, config: SensorConfig, battery: BatteryConfig) -> Self {
        Self {
            bus,
            adc,
            config,
            battery,
            reading: SensorReading::default(),
        }
    }

    /// Put the SCD41 into single-shot operation.
    ///
    /// A sensor left in periodic mode by an earlier firmware keeps measuring
    /// (and drawing current) between wakes, so periodic measurement is stopped
    /// explicitly. The sensor ignores commands for 500 ms after that.
    pub async fn init(&mut self) -> Result<(), SensorError> {
        if !self.bus.is_initialized() {
            self.bus.init();
        }

        if !self.bus.device_present(SCD41_ADDRESS).await {
            error!("SCD41 not found at 0x{:02X}", SCD41_ADDRESS);
            return Err(SensorError::NotPresent {
                sensor: "SCD41",
                address: SCD41_ADDRESS,
            });
        }

        SCD41Sensor::new(self.bus.i2c())
            .stop_periodic_measurement()
            .await?;
        Timer::after_millis(self.config.settle_delay_ms).await;

        info!("SCD41 initialized in single-shot mode");
        Ok(())
    }

    /// Acquire one reading.
    ///
    /// Errors only on bus, CRC or data-ready timeout faults. A reading that
    /// arrived intact but is out of range is returned with `valid == false`.
    pub async fn measure(&mut self) -> Result<SensorReading, SensorError> {
        self.reading = SensorReading::default();

        for n in 1..=self.config.warmup_reads {
            info!("SCD41 warm-up read {}/{}", n, self.config.warmup_reads);
            if let Err(e) = self.warmup_read().await {
                warn!("SCD41 warm-up read {} discarded: {}", n, e);
            }
        }

        let raw = self.acquire().await?;
        let temperature = raw.temperature_c();
        let humidity = raw.humidity_pct();

        self.reading.co2 = raw.co2_ppm;
        self.reading.temperature = temperature;
        self.reading.humidity = humidity;
        self.reading.valid = within_bounds(&self.config, raw.co2_ppm, temperature, humidity);

        if self.reading.valid {
            info!(
                "SCD41: CO2 {} ppm, {} C, {} %RH",
                raw.co2_ppm, temperature, humidity
            );
        } else {
            warn!(
                "SCD41 reading out of range: CO2 {} ppm, {} C, {} %RH",
                raw.co2_ppm, temperature, humidity
            );
        }

        Ok(self.reading)
    }

    async fn warmup_read(&mut self) -> Result<RawMeasurement, SensorError> {
        let mut sensor = SCD41Sensor::new(self.bus.i2c());
        sensor.measure_single_shot().await?;
        Timer::after_millis(self.config.warmup_delay_ms).await;
        sensor.read_measurement().await
    }

    async fn acquire(&mut self) -> Result<RawMeasurement, SensorError> {
        let timeout = Duration::from_millis(self.config.data_ready_timeout_ms);
        let poll = Duration::from_millis(self.config.data_ready_poll_ms);

        let mut sensor = SCD41Sensor::new(self.bus.i2c());
        sensor.measure_single_shot().await?;

        let deadline = Instant::now() + timeout;
        while !sensor.data_ready().await? {
            if Instant::now() >= deadline {
                error!(
                    "SCD41 data not ready after {} ms",
                    self.config.data_ready_timeout_ms
                );
                return Err(SensorError::Timeout {
                    sensor: "SCD41",
                    operation: "wait for data ready status",
                });
            }
            Timer::after(poll).await;
        }

        sensor.read_measurement().await
    }

    /// Sample the battery divider. Never fails; the value is diagnostic.
    pub fn read_battery_voltage(&mut self) -> f32 {
        let raw = self.adc.read_raw();
        let volts = battery_volts(&self.battery, raw);
        if !EXPECTED_BATTERY_VOLTS.contains(&volts) {
            warn!("Battery voltage {} V outside expected range (raw {})", volts, raw);
        } else {
            info!("Battery voltage {} V", volts);
        }
        self.reading.voltage = volts;
        volts
    }

    pub fn is_valid(&self) -> bool {
        self.reading.valid
    }

    pub fn reading(&self) -> &SensorReading {
        &self.reading
    }

    pub fn bus(&self) -> &BusManager<P> {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut BusManager<P> {
        &mut self.bus
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimAdc, SimBusPort, SimScd41};
    use embassy_futures::block_on;

    fn fast_config() -> SensorConfig {
        SensorConfig {
            warmup_reads: 0,
            warmup_delay_ms: 0,
            settle_delay_ms: 500,
            data_ready_timeout_ms: 300,
            data_ready_poll_ms: 50,
            ..SensorConfig::default()
        }
    }

    fn manager(scd41: SimScd41) -> SensorManager<SimBusPort, SimAdc> {
        let bus = BusManager::new(SimBusPort::with_sensor(scd41));
        SensorManager::new(bus, SimAdc::new(2048), fast_config(), BatteryConfig::default())
    }

    #[test]
    fn test_init_stops_periodic_mode() {
        let mut sensors = manager(SimScd41::periodic(812, 21.0, 40.0));
        let started = std::time::Instant::now();

        block_on(sensors.init()).unwrap();

        assert!(started.elapsed() >= std::time::Duration::from_millis(500));
        assert!(!sensors.bus().port().sensor().is_periodic());
    }

    #[test]
    fn test_init_fails_without_sensor() {
        let bus = BusManager::new(SimBusPort::empty());
        let mut sensors =
            SensorManager::new(bus, SimAdc::new(0), fast_config(), BatteryConfig::default());

        assert_eq!(
            block_on(sensors.init()),
            Err(SensorError::NotPresent {
                sensor: "SCD41",
                address: 0x62
            })
        );
    }

    #[test]
    fn test_measure_valid_reading() {
        let mut sensors = manager(SimScd41::new(812, 21.345, 40.1));
        block_on(sensors.init()).unwrap();

        let reading = block_on(sensors.measure()).unwrap();
        assert!(reading.is_valid());
        assert!(sensors.is_valid());
        assert_eq!(reading.co2, 812);
        assert!((reading.temperature - 21.345).abs() < 0.01);
        assert!((reading.humidity - 40.1).abs() < 0.01);
    }

    #[test]
    fn test_out_of_range_reading_is_not_an_error() {
        let mut sensors = manager(SimScd41::new(6000, 21.0, 40.0));
        block_on(sensors.init()).unwrap();

        let reading = block_on(sensors.measure()).unwrap();
        assert_eq!(reading.co2, 6000);
        assert!(!reading.is_valid());
    }

    #[test]
    fn test_data_ready_timeout_is_bounded() {
        let mut sensors = manager(SimScd41::never_ready());
        block_on(sensors.init()).unwrap();

        let started = std::time::Instant::now();
        let result = block_on(sensors.measure());
        let elapsed = started.elapsed();

        assert!(matches!(result, Err(SensorError::Timeout { .. })));
        assert!(!sensors.is_valid());
        assert!(elapsed >= std::time::Duration::from_millis(300));
        // timeout + one poll interval, with slack for the host scheduler
        assert!(elapsed < std::time::Duration::from_millis(300 + 50 + 150));
    }

    #[test]
    fn test_corrupt_word_is_reported() {
        let mut sensors = manager(SimScd41::new(812, 21.0, 40.0).with_corrupt_crc());
        block_on(sensors.init()).unwrap();

        assert!(matches!(
            block_on(sensors.measure()),
            Err(SensorError::Crc { .. })
        ));
        assert!(!sensors.is_valid());
    }

    #[test]
    fn test_validity_bounds_are_inclusive() {
        let config = SensorConfig::default();
        assert!(within_bounds(&config, 400, -10.0, 0.0));
        assert!(within_bounds(&config, 5000, 50.0, 100.0));
        assert!(!within_bounds(&config, 399, 20.0, 50.0));
        assert!(!within_bounds(&config, 800, 50.5, 50.0));
        assert!(!within_bounds(&config, 800, 20.0, -0.1));
    }

    #[test]
    fn test_battery_scaling() {
        let mut sensors = manager(SimScd41::new(812, 21.0, 40.0));
        let volts = sensors.read_battery_voltage();
        let expected = 2048.0 / 4096.0 * 3.1 * 2.0;
        assert!((volts - expected).abs() < 1e-4);
        assert_eq!(sensors.reading().voltage, volts);
    }
}
