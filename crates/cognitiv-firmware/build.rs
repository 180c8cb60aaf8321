//! Bake deployment settings from `.env` into the firmware image.
//!
//! Every key is exported as a compile-time environment variable so the
//! firmware can read it with `env!`. Missing keys fall back to an empty string
//! (or a sane default for non-secret values) so a checkout without `.env`
//! still builds.

const KEYS: &[(&str, &str)] = &[
    ("COGNITIV_WIFI_SSID", ""),
    ("COGNITIV_WIFI_PASSWORD", ""),
    ("COGNITIV_MQTT_HOST", ""),
    ("COGNITIV_MQTT_PORT", "8883"),
    ("COGNITIV_MQTT_USERNAME", ""),
    ("COGNITIV_MQTT_PASSWORD", ""),
    ("COGNITIV_MQTT_TOPIC", "cognitiv/readings"),
    ("COGNITIV_UTC_OFFSET_SECS", "0"),
    ("COGNITIV_DST_OFFSET_SECS", "0"),
];

fn main() {
    // Search the crate directory first, then the workspace root.
    match dotenvy::dotenv() {
        Ok(path) => println!("cargo:rerun-if-changed={}", path.display()),
        Err(_) => println!("cargo:warning=no .env found, deployment settings are empty"),
    }

    for (key, default) in KEYS {
        println!("cargo:rerun-if-env-changed={key}");
        let value = std::env::var(key).unwrap_or_else(|_| (*default).to_string());
        println!("cargo:rustc-env={key}={value}");
    }

    // The broker CA is multi-line PEM, so it is copied into OUT_DIR and
    // picked up with include_str!. Empty means insecure TLS.
    println!("cargo:rerun-if-env-changed=COGNITIV_MQTT_CA_FILE");
    let ca = match std::env::var("COGNITIV_MQTT_CA_FILE") {
        Ok(path) if !path.is_empty() => {
            println!("cargo:rerun-if-changed={path}");
            std::fs::read_to_string(&path)
                .unwrap_or_else(|e| panic!("reading COGNITIV_MQTT_CA_FILE {path}: {e}"))
        }
        _ => String::new(),
    };
    let out_dir = std::env::var("OUT_DIR").expect("OUT_DIR is set by cargo");
    std::fs::write(std::path::Path::new(&out_dir).join("broker_ca.pem"), ca)
        .expect("writing broker_ca.pem");

    println!("cargo:rustc-link-arg=-Tlinkall.x");
}
