//! ESP32-S3 adapters for the cognitiv sensor node
//!
//! Each module implements one of the hardware seams defined in
//! `cognitiv-core` on top of esp-hal, esp-radio and embassy-net. The binary in
//! `bin/main.rs` wires them together and runs one wake cycle per boot.

#![no_std]

extern crate alloc;

pub mod battery;
pub mod bus;
pub mod clock;
pub mod radio;
pub mod retained;
pub mod settings;
pub mod sleep;
pub mod transport;

/// I2C data line.
pub const PIN_SDA: u8 = 12;
/// I2C clock line.
pub const PIN_SCL: u8 = 11;
