//! Deployment settings baked in at build time.
//!
//! `build.rs` reads `.env` and exports every key; everything not listed there
//! keeps the defaults from `cognitiv_core::config`.

use core::fmt::Display;
use core::str::FromStr;

use cognitiv_core::NodeConfig;
use cognitiv_core::config::TlsMode;
use log::warn;

const BROKER_CA_PEM: &str = include_str!(concat!(env!("OUT_DIR"), "/broker_ca.pem"));

pub fn node_config() -> NodeConfig<'static> {
    let mut config = NodeConfig::default();

    config.wifi.ssid = env!("COGNITIV_WIFI_SSID");
    config.wifi.password = env!("COGNITIV_WIFI_PASSWORD");

    config.mqtt.broker_host = env!("COGNITIV_MQTT_HOST");
    config.mqtt.broker_port = parse_or(
        "COGNITIV_MQTT_PORT",
        env!("COGNITIV_MQTT_PORT"),
        config.mqtt.broker_port,
    );
    config.mqtt.username = env!("COGNITIV_MQTT_USERNAME");
    config.mqtt.password = env!("COGNITIV_MQTT_PASSWORD");
    config.mqtt.topic = env!("COGNITIV_MQTT_TOPIC");
    if !BROKER_CA_PEM.trim().is_empty() {
        config.mqtt.tls = TlsMode::CaCertificate(BROKER_CA_PEM);
    }

    config.time.utc_offset_secs = parse_or(
        "COGNITIV_UTC_OFFSET_SECS",
        env!("COGNITIV_UTC_OFFSET_SECS"),
        config.time.utc_offset_secs,
    );
    config.time.dst_offset_secs = parse_or(
        "COGNITIV_DST_OFFSET_SECS",
        env!("COGNITIV_DST_OFFSET_SECS"),
        config.time.dst_offset_secs,
    );

    if config.mqtt.tls == TlsMode::Insecure {
        warn!("No broker CA configured, TLS will not verify the broker");
    }
    if config.wifi.ssid.is_empty() {
        warn!("No WiFi SSID configured, the node will only measure");
    }

    config
}

fn parse_or<T>(key: &str, raw: &str, default: T) -> T
where
    T: FromStr + Display + Copy,
{
    match raw.trim().parse() {
        Ok(value) => value,
        Err(_) => {
            warn!("{} = {:?} is not valid, using {}", key, raw, default);
            default
        }
    }
}
