use crc::{CRC_8_NRSC_5, Crc};
use embassy_time::Timer;
use embedded_hal_async::i2c::{Error as _, I2c};
use log::{debug, error};

use super::SensorError;

/// Fixed 7-bit address of the SCD41.
pub const SCD41_ADDRESS: u8 = 0x62;

const SENSOR_NAME: &str = "SCD41";

pub const CMD_STOP_PERIODIC_MEASUREMENT: u16 = 0x3F86;
pub const CMD_MEASURE_SINGLE_SHOT: u16 = 0x219D;
pub const CMD_GET_DATA_READY_STATUS: u16 = 0xE4B8;
pub const CMD_READ_MEASUREMENT: u16 = 0xEC05;

/// Lower 11 bits of the data-ready word are non-zero once a sample is waiting.
const DATA_READY_MASK: u16 = 0x07FF;

/// Time the sensor needs between a read command and the response.
const COMMAND_EXECUTION_MS: u64 = 1;

/// Sensirion CRC-8: polynomial 0x31, init 0xFF, no reflection.
const CRC8: Crc<u8> = Crc::<u8>::new(&CRC_8_NRSC_5);

pub fn crc8(data: &[u8]) -> u8 {
    CRC8.checksum(data)
}

/// Raw measurement words as delivered by read_measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawMeasurement {
    pub co2_ppm: u16,
    pub temperature_ticks: u16,
    pub humidity_ticks: u16,
}

impl RawMeasurement {
    pub fn temperature_c(&self) -> f32 {
        -45.0 + 175.0 * self.temperature_ticks as f32 / 65535.0
    }

    pub fn humidity_pct(&self) -> f32 {
        100.0 * self.humidity_ticks as f32 / 65535.0
    }
}

/// SCD41 command set over an async I2C handle.
///
/// Built on demand around whatever I2C handle the caller currently holds;
/// the sensor itself keeps no state on the host side.
pub struct SCD41Sensor<I> {
    i2c: I,
}

impl<I: I2c> SCD41Sensor<I> {
    pub fn new(i2c: I) -> Self {
        Self { i2c }
    }

    async fn send(&mut self, command: u16, operation: &'static str) -> Result<(), SensorError> {
        self.i2c
            .write(SCD41_ADDRESS, &command.to_be_bytes())
            .await
            .map_err(|e| {
                error!("SCD41 {} failed: {:?}", operation, e.kind());
                SensorError::ReadFailed {
                    sensor: SENSOR_NAME,
                    operation,
                    details: "I2C write not acknowledged",
                }
            })
    }

    /// Issue `command`, then read and CRC-check `N` words.
    async fn read_words<const N: usize, const B: usize>(
        &mut self,
        command: u16,
        operation: &'static str,
    ) -> Result<[u16; N], SensorError> {
        self.send(command, operation).await?;
        Timer::after_millis(COMMAND_EXECUTION_MS).await;

        let mut buf = [0u8; B];
        self.i2c.read(SCD41_ADDRESS, &mut buf).await.map_err(|e| {
            error!("SCD41 {} read failed: {:?}", operation, e.kind());
            SensorError::ReadFailed {
                sensor: SENSOR_NAME,
                operation,
                details: "I2C read failed",
            }
        })?;

        let mut words = [0u16; N];
        for (word, chunk) in words.iter_mut().zip(buf.chunks_exact(3)) {
            if crc8(&chunk[..2]) != chunk[2] {
                error!("SCD41 CRC mismatch during {}", operation);
                return Err(SensorError::Crc {
                    sensor: SENSOR_NAME,
                    operation,
                });
            }
            *word = u16::from_be_bytes([chunk[0], chunk[1]]);
        }
        Ok(words)
    }

    pub async fn stop_periodic_measurement(&mut self) -> Result<(), SensorError> {
        self.send(CMD_STOP_PERIODIC_MEASUREMENT, "stop periodic measurement")
            .await
    }

    pub async fn measure_single_shot(&mut self) -> Result<(), SensorError> {
        self.send(CMD_MEASURE_SINGLE_SHOT, "trigger single shot measurement")
            .await
    }

    pub async fn data_ready(&mut self) -> Result<bool, SensorError> {
        let [status] = self
            .read_words::<1, 3>(CMD_GET_DATA_READY_STATUS, "check data ready status")
            .await?;
        debug!("SCD41 data ready status 0x{:04X}", status);
        Ok(status & DATA_READY_MASK != 0)
    }

    pub async fn read_measurement(&mut self) -> Result<RawMeasurement, SensorError> {
        let [co2_ppm, temperature_ticks, humidity_ticks] = self
            .read_words::<3, 9>(CMD_READ_MEASUREMENT, "read measurement")
            .await?;
        Ok(RawMeasurement {
            co2_ppm,
            temperature_ticks,
            humidity_ticks,
        })
    }
}
