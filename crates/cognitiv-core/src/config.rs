//! Node configuration
//!
//! Everything here is fixed at provisioning time. The firmware fills the
//! credential fields from its build environment and keeps the remaining
//! defaults; the simulator may load a whole [`NodeConfig`] from JSON.

use serde::{Deserialize, Serialize};

/// Default seconds between measurement wakes.
pub const DEFAULT_MEASUREMENT_INTERVAL_SECS: u32 = 300;

/// Longest single deep sleep the RTC timer is trusted for.
pub const DEFAULT_MAX_SLEEP_SECS: u32 = 3 * 60 * 60;

/// Length of one chained quiet-hours sleep segment.
pub const DEFAULT_SLEEP_CHUNK_SECS: u32 = 2 * 60 * 60;

/// Wall-clock readings at or below this are treated as "clock never set"
/// (2023-11-14 22:13:20 UTC).
pub const TIME_SANITY_FLOOR: u64 = 1_700_000_000;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default)]
#[serde(bound(deserialize = "'de: 'a"))]
pub struct NodeConfig<'a> {
    pub wifi: WifiConfig<'a>,
    pub mqtt: MqttConfig<'a>,
    pub time: TimeConfig<'a>,
    pub quiet_hours: QuietHours,
    pub sensor: SensorConfig,
    pub battery: BatteryConfig,
    pub power: PowerConfig,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
pub struct WifiConfig<'a> {
    pub ssid: &'a str,
    pub password: &'a str,
    pub connect_timeout_ms: u64,
    pub poll_interval_ms: u64,
    /// Budget for closing the broker session and for stopping the radio.
    pub shutdown_timeout_ms: u64,
}

impl Default for WifiConfig<'_> {
    fn default() -> Self {
        Self {
            ssid: "",
            password: "",
            connect_timeout_ms: 15_000,
            poll_interval_ms: 100,
            shutdown_timeout_ms: 2_000,
        }
    }
}

/// How the broker certificate is checked during the TLS handshake.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(bound(deserialize = "'de: 'a"))]
pub enum TlsMode<'a> {
    /// Encrypt without validating the broker certificate (bring-up only).
    Insecure,
    /// Validate the broker against this PEM-encoded CA certificate.
    CaCertificate(&'a str),
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
#[serde(bound(deserialize = "'de: 'a"))]
pub struct MqttConfig<'a> {
    pub broker_host: &'a str,
    pub broker_port: u16,
    pub username: &'a str,
    pub password: &'a str,
    pub topic: &'a str,
    pub tls: TlsMode<'a>,
    pub keep_alive_secs: u16,
    /// Packet buffer handed to the MQTT client.
    pub buffer_size: usize,
    pub connect_timeout_ms: u64,
    pub max_connect_attempts: u8,
    pub retry_backoff_ms: u64,
    /// Whole connect+publish sequences attempted per wake.
    pub publish_attempts: u8,
}

impl Default for MqttConfig<'_> {
    fn default() -> Self {
        Self {
            broker_host: "",
            broker_port: 8883,
            username: "",
            password: "",
            topic: "cognitiv/readings",
            tls: TlsMode::Insecure,
            keep_alive_secs: 60,
            buffer_size: 512,
            connect_timeout_ms: 10_000,
            max_connect_attempts: 5,
            retry_backoff_ms: 500,
            publish_attempts: 2,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
#[serde(bound(deserialize = "'de: 'a"))]
pub struct TimeConfig<'a> {
    pub ntp_servers: [&'a str; 2],
    pub utc_offset_secs: i32,
    pub dst_offset_secs: i32,
    pub sync_timeout_ms: u64,
    pub poll_interval_ms: u64,
}

impl TimeConfig<'_> {
    /// Offset added to UTC to obtain local wall-clock time.
    pub const fn local_offset_secs(&self) -> i64 {
        self.utc_offset_secs as i64 + self.dst_offset_secs as i64
    }
}

impl Default for TimeConfig<'_> {
    fn default() -> Self {
        Self {
            ntp_servers: ["pool.ntp.org", "time.google.com"],
            utc_offset_secs: 0,
            dst_offset_secs: 0,
            sync_timeout_ms: 10_000,
            poll_interval_ms: 200,
        }
    }
}

/// Daily window in which the node stays asleep.
///
/// The start minute is inside the window and the wake minute is not. A window
/// whose start is later than its wake time wraps past midnight.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuietHours {
    pub enabled: bool,
    pub start_hour: u8,
    pub start_minute: u8,
    pub wake_hour: u8,
    pub wake_minute: u8,
}

impl Default for QuietHours {
    fn default() -> Self {
        Self {
            enabled: true,
            start_hour: 16,
            start_minute: 0,
            wake_hour: 7,
            wake_minute: 55,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct SensorConfig {
    pub co2_min_ppm: u16,
    pub co2_max_ppm: u16,
    pub temperature_min_c: f32,
    pub temperature_max_c: f32,
    pub humidity_min_pct: f32,
    pub humidity_max_pct: f32,
    /// Discarded acquisitions before the production one.
    pub warmup_reads: u8,
    pub warmup_delay_ms: u64,
    /// Pause after stop-periodic-measurement before the sensor accepts commands.
    pub settle_delay_ms: u64,
    pub data_ready_timeout_ms: u64,
    pub data_ready_poll_ms: u64,
    /// Sweep the bus once at boot and log what answers.
    pub scan_on_boot: bool,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            co2_min_ppm: 400,
            co2_max_ppm: 5000,
            temperature_min_c: -10.0,
            temperature_max_c: 50.0,
            humidity_min_pct: 0.0,
            humidity_max_pct: 100.0,
            warmup_reads: 1,
            warmup_delay_ms: 5000,
            settle_delay_ms: 500,
            data_ready_timeout_ms: 10_000,
            data_ready_poll_ms: 100,
            scan_on_boot: false,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct BatteryConfig {
    /// Input voltage over ADC-pin voltage.
    pub divider_ratio: f32,
    pub adc_full_scale: u16,
    pub adc_reference_volts: f32,
}

impl Default for BatteryConfig {
    fn default() -> Self {
        Self {
            divider_ratio: 2.0,
            adc_full_scale: 4096,
            adc_reference_volts: 3.1,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowerConfig {
    pub measurement_interval_secs: u32,
    pub max_sleep_secs: u32,
    pub sleep_chunk_secs: u32,
}

impl Default for PowerConfig {
    fn default() -> Self {
        Self {
            measurement_interval_secs: DEFAULT_MEASUREMENT_INTERVAL_SECS,
            max_sleep_secs: DEFAULT_MAX_SLEEP_SECS,
            sleep_chunk_secs: DEFAULT_SLEEP_CHUNK_SECS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_deployment() {
        let config = NodeConfig::default();
        assert_eq!(config.quiet_hours.start_hour, 16);
        assert_eq!(config.quiet_hours.wake_minute, 55);
        assert_eq!(config.mqtt.buffer_size, 512);
        assert_eq!(config.sensor.co2_min_ppm, 400);
        assert!(config.power.sleep_chunk_secs <= config.power.max_sleep_secs);
    }

    #[test]
    fn test_config_from_json() {
        let json = r#"{
            "wifi": {"ssid": "lab", "password": "secret", "connect_timeout_ms": 5000, "poll_interval_ms": 100,
                     "shutdown_timeout_ms": 1500},
            "mqtt": {"broker_host": "broker.local", "broker_port": 8883, "username": "node",
                     "password": "pw", "topic": "lab/co2", "tls": {"CaCertificate": "PEM"},
                     "keep_alive_secs": 30, "buffer_size": 512, "connect_timeout_ms": 1000,
                     "max_connect_attempts": 3, "retry_backoff_ms": 100, "publish_attempts": 1},
            "time": {"ntp_servers": ["a.example", "b.example"], "utc_offset_secs": 3600,
                     "dst_offset_secs": 3600, "sync_timeout_ms": 1000, "poll_interval_ms": 200},
            "quiet_hours": {"enabled": false, "start_hour": 22, "start_minute": 0,
                            "wake_hour": 6, "wake_minute": 30},
            "sensor": {"co2_min_ppm": 400, "co2_max_ppm": 5000, "temperature_min_c": -10.0,
                       "temperature_max_c": 50.0, "humidity_min_pct": 0.0, "humidity_max_pct": 100.0,
                       "warmup_reads": 0, "warmup_delay_ms": 0, "settle_delay_ms": 500,
                       "data_ready_timeout_ms": 1000, "data_ready_poll_ms": 100, "scan_on_boot": true},
            "battery": {"divider_ratio": 4.2, "adc_full_scale": 1024, "adc_reference_volts": 1.0},
            "power": {"measurement_interval_secs": 60, "max_sleep_secs": 10800, "sleep_chunk_secs": 7200}
        }"#;

        let config: NodeConfig<'_> = serde_json::from_str(json).unwrap();
        assert_eq!(config.wifi.ssid, "lab");
        assert_eq!(config.wifi.shutdown_timeout_ms, 1500);
        assert_eq!(config.mqtt.tls, TlsMode::CaCertificate("PEM"));
        assert_eq!(config.time.local_offset_secs(), 7200);
        assert!(!config.quiet_hours.enabled);
        assert_eq!(config.power.measurement_interval_secs, 60);
    }
}
