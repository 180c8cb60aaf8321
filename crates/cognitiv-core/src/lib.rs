//! Hardware-independent core library for cognitiv
//!
//! This crate contains all platform-agnostic logic for the cognitiv CO2 sensor
//! node: I2C bus ownership and recovery, SCD41 single-shot acquisition, WiFi /
//! time-sync / MQTT sequencing, the deep-sleep scheduler with its retained
//! state, and the wake-cycle orchestration that ties them together.
//!
//! Hardware is reached only through the traits in each module, so the crate is
//! `#![no_std]` on the ESP32-S3 and builds on desktop hosts for the simulator
//! and tests.

#![cfg_attr(not(any(test, feature = "std")), no_std)]

pub mod app_state;
pub mod bus;
pub mod config;
pub mod network;
pub mod power;
pub mod sensors;

#[cfg(any(test, feature = "sim"))]
pub mod sim;

pub use app_state::{CycleError, SleepPlan, SleepReason, WakeCycle, WakePhase};
pub use bus::{BusError, BusLines, BusManager, BusPort};
pub use config::NodeConfig;
pub use network::{ConnectionState, MqttTransport, NetworkError, NetworkManager, TimeSource, WifiRadio};
pub use power::{PersistentScheduleState, PowerManager, RetainedStore, SleepController};
pub use sensors::{BatteryAdc, SensorError, SensorManager, SensorReading};
