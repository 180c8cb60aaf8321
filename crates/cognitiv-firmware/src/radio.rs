use cognitiv_core::network::MacAddress;
use cognitiv_core::{NetworkError, WifiRadio};
use embassy_net::Stack;
use esp_radio::wifi::{ClientConfig, ModeConfig, WifiController};
use log::{debug, warn};

/// Station-mode WiFi through esp-radio with embassy-net's DHCP client on top.
///
/// Credentials are applied with `set_config` on every boot and never written
/// to flash.
pub struct EspWifiRadio {
    controller: WifiController<'static>,
    stack: Stack<'static>,
    mac: MacAddress,
}

impl EspWifiRadio {
    pub fn new(controller: WifiController<'static>, stack: Stack<'static>, mac: [u8; 6]) -> Self {
        Self {
            controller,
            stack,
            mac: MacAddress(mac),
        }
    }
}

impl WifiRadio for EspWifiRadio {
    fn mac_address(&self) -> MacAddress {
        self.mac
    }

    async fn begin(&mut self, ssid: &str, password: &str) -> Result<(), NetworkError> {
        let client = ClientConfig::default()
            .with_ssid(ssid.into())
            .with_password(password.into());
        self.controller
            .set_config(&ModeConfig::Client(client))
            .map_err(|e| {
                warn!("WiFi mode config failed: {:?}", e);
                NetworkError::Radio("station config rejected")
            })?;

        if !self.controller.is_started().unwrap_or(false) {
            self.controller.start_async().await.map_err(|e| {
                warn!("WiFi start failed: {:?}", e);
                NetworkError::Radio("radio did not start")
            })?;
            debug!("WiFi radio started");
        }

        self.controller.connect().map_err(|e| {
            warn!("WiFi connect request failed: {:?}", e);
            NetworkError::Radio("connect request rejected")
        })
    }

    fn is_connected(&mut self) -> bool {
        matches!(self.controller.is_connected(), Ok(true))
            && self.stack.is_link_up()
            && self.stack.config_v4().is_some()
    }

    fn rssi(&mut self) -> Option<i8> {
        self.controller
            .rssi()
            .ok()
            .and_then(|rssi| i8::try_from(rssi).ok())
    }

    async fn power_down(&mut self) {
        if matches!(self.controller.is_connected(), Ok(true)) {
            if let Err(e) = self.controller.disconnect_async().await {
                debug!("WiFi disconnect: {:?}", e);
            }
        }
        if self.controller.is_started().unwrap_or(false) {
            if let Err(e) = self.controller.stop_async().await {
                warn!("WiFi stop failed: {:?}", e);
            }
        }
    }
}
