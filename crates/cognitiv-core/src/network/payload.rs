//! Fixed-schema JSON payload
//!
//! Written straight into a stack buffer. Key order never changes:
//! `{"timestamp":..,"mac_address":"..","temperature":..,"humidity":..,"co2":..,"voltage":..}`

use core::fmt::{self, Write};

use heapless::String;

use super::identity::MacAddress;

pub const PAYLOAD_CAPACITY: usize = 256;

pub type Payload = String<PAYLOAD_CAPACITY>;

/// A value printed with exactly two decimals, halves rounded away from zero.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Hundredths(pub f32);

impl Hundredths {
    /// Value scaled by 100 and rounded. Non-finite input maps to zero.
    pub fn scaled(&self) -> i64 {
        if !self.0.is_finite() {
            return 0;
        }
        // core has no f32::round
        let scaled = self.0 * 100.0;
        if scaled >= 0.0 {
            (scaled + 0.5) as i64
        } else {
            (scaled - 0.5) as i64
        }
    }
}

impl fmt::Display for Hundredths {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scaled = self.scaled();
        let sign = if scaled < 0 { "-" } else { "" };
        let magnitude = scaled.unsigned_abs();
        write!(f, "{}{}.{:02}", sign, magnitude / 100, magnitude % 100)
    }
}

pub fn build_payload(
    timestamp: u64,
    mac: &MacAddress,
    temperature: f32,
    humidity: f32,
    co2: u16,
    voltage: f32,
) -> Result<Payload, fmt::Error> {
    let mut payload = Payload::new();
    write!(
        payload,
        "{{\"timestamp\":{},\"mac_address\":\"{}\",\"temperature\":{},\"humidity\":{},\"co2\":{},\"voltage\":{}}}",
        timestamp,
        mac,
        Hundredths(temperature),
        Hundredths(humidity),
        co2,
        Hundredths(voltage),
    )?;
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(value: f32) -> String<16> {
        let mut s = String::new();
        write!(s, "{}", Hundredths(value)).unwrap();
        s
    }

    #[test]
    fn test_two_decimal_rounding() {
        assert_eq!(render(21.345).as_str(), "21.35");
        assert_eq!(render(40.1).as_str(), "40.10");
        assert_eq!(render(3.78).as_str(), "3.78");
        assert_eq!(render(0.0).as_str(), "0.00");
        assert_eq!(render(-0.05).as_str(), "-0.05");
        assert_eq!(render(-9.999).as_str(), "-10.00");
        assert_eq!(render(f32::NAN).as_str(), "0.00");
    }

    #[test]
    fn test_payload_shape_and_reparse() {
        let mac = MacAddress([0xA4, 0xCF, 0x12, 0x34, 0x56, 0x78]);
        let payload = build_payload(1_718_000_000, &mac, 21.345, 40.1, 812, 3.78).unwrap();

        assert_eq!(
            payload.as_str(),
            "{\"timestamp\":1718000000,\"mac_address\":\"A4:CF:12:34:56:78\",\
             \"temperature\":21.35,\"humidity\":40.10,\"co2\":812,\"voltage\":3.78}"
        );

        let parsed: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(parsed["timestamp"], 1_718_000_000u64);
        assert_eq!(parsed["mac_address"], "A4:CF:12:34:56:78");
        assert_eq!(parsed["temperature"].as_f64(), Some(21.35));
        assert_eq!(parsed["humidity"].as_f64(), Some(40.1));
        assert_eq!(parsed["co2"], 812);
        assert_eq!(parsed["voltage"].as_f64(), Some(3.78));
    }
}
