//! WiFi association, time synchronization and the MQTT publish channel
//!
//! Every wait in here is bounded: association and time sync poll against a
//! deadline, and the broker connection is retried a fixed number of times
//! inside a wall-clock budget. Nothing retries a publish; the wake cycle
//! decides whether to run the whole connect-publish sequence again.

pub mod certificate;
pub mod identity;
pub mod payload;

use embassy_time::{Duration, Instant, Timer, with_timeout};
use log::{error, info, warn};
use thiserror_no_std::Error;

use crate::config::{MqttConfig, NodeConfig, TIME_SANITY_FLOOR, TimeConfig, TlsMode, WifiConfig};
pub use certificate::{CertificateError, pem_to_der};
pub use identity::{ClientId, MacAddress};
pub use payload::{Hundredths, Payload, build_payload};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    Connecting,
    Connected,
    #[default]
    Disconnected,
    /// The last attempt ran out of time.
    Error,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkError {
    #[error("radio error: {0}")]
    Radio(&'static str),
    #[error("WiFi not associated after {timeout_ms} ms")]
    WifiTimeout { timeout_ms: u64 },
    #[error("not connected")]
    NotConnected,
    #[error("time sync exchange failed: {0}")]
    TimeSync(&'static str),
    #[error("clock not set within {timeout_ms} ms")]
    TimeSyncTimeout { timeout_ms: u64 },
    #[error("transport error: {0}")]
    Transport(&'static str),
    #[error("MQTT broker unreachable after {attempts} attempt(s)")]
    MqttConnect { attempts: u8 },
    #[error("publish failed: {0}")]
    Publish(&'static str),
    #[error("payload does not fit the publish buffer")]
    Payload,
}

/// Station-mode WiFi radio with an IP stack on top.
pub trait WifiRadio {
    fn mac_address(&self) -> MacAddress;

    /// Start associating with `ssid`. Must not write the radio's persistent
    /// configuration storage.
    fn begin(
        &mut self,
        ssid: &str,
        password: &str,
    ) -> impl Future<Output = Result<(), NetworkError>>;

    /// Associated and holding a DHCP lease.
    fn is_connected(&mut self) -> bool;

    fn rssi(&mut self) -> Option<i8>;

    /// Disconnect and put the radio in its lowest-power state.
    fn power_down(&mut self) -> impl Future<Output = ()>;
}

/// Wall clock that can be corrected over the network.
pub trait TimeSource {
    /// Seconds since the Unix epoch as currently kept by the device.
    fn now_unix(&self) -> u64;

    /// One request/response exchange with `server`. On success the device
    /// clock has been set.
    fn exchange(&mut self, server: &str) -> impl Future<Output = Result<(), NetworkError>>;
}

/// Encrypted MQTT session to the configured broker. Broker address and TLS
/// settings are fixed when the transport is built.
pub trait MqttTransport {
    fn connect(
        &mut self,
        client_id: &str,
        username: &str,
        password: &str,
    ) -> impl Future<Output = Result<(), NetworkError>>;

    fn is_connected(&self) -> bool;

    /// QoS 0 publish. Returns once the transport has accepted the packet.
    fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
    ) -> impl Future<Output = Result<(), NetworkError>>;

    fn disconnect(&mut self) -> impl Future<Output = ()>;
}

pub struct NetworkManager<'a, W, C, T> {
    radio: W,
    clock: C,
    transport: T,
    wifi: WifiConfig<'a>,
    mqtt: MqttConfig<'a>,
    time: TimeConfig<'a>,
    wifi_state: ConnectionState,
    mqtt_state: ConnectionState,
    time_synced: bool,
}

impl<'a, W, C, T> NetworkManager<'a, W, C, T>
where
    W: WifiRadio,
    C: TimeSource,
    T: MqttTransport,
{
    pub fn new(radio: W, clock: C, transport: T, config: &NodeConfig<'a>) -> Self {
        Self {
            radio,
            clock,
            transport,
            wifi: config.wifi,
            mqtt: config.mqtt,
            time: config.time,
            wifi_state: ConnectionState::Disconnected,
            mqtt_state: ConnectionState::Disconnected,
            time_synced: false,
        }
    }

    pub async fn connect_wifi(&mut self) -> Result<(), NetworkError> {
        if self.radio.is_connected() {
            self.wifi_state = ConnectionState::Connected;
            return Ok(());
        }

        self.wifi_state = ConnectionState::Connecting;
        info!("Connecting to WiFi network '{}'", self.wifi.ssid);

        let timeout_ms = self.wifi.connect_timeout_ms;
        let started = Instant::now();
        let deadline = started + Duration::from_millis(timeout_ms);

        let begin = self.radio.begin(self.wifi.ssid, self.wifi.password);
        match with_timeout(Duration::from_millis(timeout_ms), begin).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!("WiFi association could not start: {}", e);
                self.wifi_state = ConnectionState::Error;
                return Err(e);
            }
            Err(_) => {
                error!("WiFi radio did not start within {} ms", timeout_ms);
                self.wifi_state = ConnectionState::Error;
                return Err(NetworkError::WifiTimeout { timeout_ms });
            }
        }

        loop {
            if self.radio.is_connected() {
                self.wifi_state = ConnectionState::Connected;
                info!(
                    "WiFi connected in {} ms (RSSI {:?} dBm)",
                    started.elapsed().as_millis(),
                    self.radio.rssi()
                );
                return Ok(());
            }
            if Instant::now() >= deadline {
                error!("WiFi connection timed out after {} ms", timeout_ms);
                self.wifi_state = ConnectionState::Error;
                return Err(NetworkError::WifiTimeout { timeout_ms });
            }
            Timer::after_millis(self.wifi.poll_interval_ms).await;
        }
    }

    /// Close the broker session and power the radio down. Safe to call in
    /// any state.
    ///
    /// Each step gets `shutdown_timeout_ms`; a step that runs out of time is
    /// abandoned so the caller can still go to sleep.
    pub async fn shutdown_wifi(&mut self) {
        let budget = Duration::from_millis(self.wifi.shutdown_timeout_ms);

        if self.transport.is_connected() {
            match with_timeout(budget, self.transport.disconnect()).await {
                Ok(()) => info!("MQTT session closed"),
                Err(_) => warn!(
                    "MQTT disconnect abandoned after {} ms",
                    self.wifi.shutdown_timeout_ms
                ),
            }
        }
        self.mqtt_state = ConnectionState::Disconnected;

        match with_timeout(budget, self.radio.power_down()).await {
            Ok(()) => info!("WiFi radio powered down"),
            Err(_) => warn!(
                "WiFi radio stop abandoned after {} ms",
                self.wifi.shutdown_timeout_ms
            ),
        }
        self.wifi_state = ConnectionState::Disconnected;
    }

    /// Set the device clock from the network.
    ///
    /// Servers are tried in turn; between exchanges the clock is polled until
    /// a successful exchange has left it past [`TIME_SANITY_FLOOR`]. Returns
    /// the synchronized time.
    pub async fn sync_ntp(&mut self) -> Result<u64, NetworkError> {
        if self.wifi_state != ConnectionState::Connected {
            warn!("Time sync skipped, WiFi not connected");
            return Err(NetworkError::NotConnected);
        }

        self.time_synced = false;
        let timeout_ms = self.time.sync_timeout_ms;
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        let servers = self.time.ntp_servers;
        let mut exchanged = false;
        let mut attempt = 0usize;

        loop {
            if exchanged {
                let now = self.clock.now_unix();
                if now > TIME_SANITY_FLOOR {
                    info!("Time synchronized: {}", now);
                    self.time_synced = true;
                    return Ok(now);
                }
                warn!("Clock still implausible after sync ({})", now);
                exchanged = false;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining == Duration::from_ticks(0) {
                error!("Time sync timed out after {} ms", timeout_ms);
                return Err(NetworkError::TimeSyncTimeout { timeout_ms });
            }

            let server = servers[attempt % servers.len()];
            attempt += 1;
            info!("Requesting time from {}", server);
            match with_timeout(remaining, self.clock.exchange(server)).await {
                Ok(Ok(())) => {
                    exchanged = true;
                    continue;
                }
                Ok(Err(e)) => warn!("Time request to {} failed: {}", server, e),
                Err(_) => warn!("Time request to {} timed out", server),
            }
            Timer::after_millis(self.time.poll_interval_ms).await;
        }
    }

    /// Open the MQTT session, retrying within the attempt and time budget.
    pub async fn connect_mqtt(&mut self) -> Result<(), NetworkError> {
        if self.wifi_state != ConnectionState::Connected {
            warn!("MQTT connect skipped, WiFi not connected");
            return Err(NetworkError::NotConnected);
        }
        if self.transport.is_connected() {
            self.mqtt_state = ConnectionState::Connected;
            return Ok(());
        }

        let client_id = self
            .radio
            .mac_address()
            .client_id()
            .map_err(|_| NetworkError::Transport("client id does not fit"))?;

        let tls = match self.mqtt.tls {
            TlsMode::Insecure => "insecure",
            TlsMode::CaCertificate(_) => "CA verified",
        };
        info!(
            "Connecting to MQTT broker {}:{} as {} (TLS {})",
            self.mqtt.broker_host, self.mqtt.broker_port, client_id, tls
        );
        self.mqtt_state = ConnectionState::Connecting;

        let deadline = Instant::now() + Duration::from_millis(self.mqtt.connect_timeout_ms);
        let backoff = Duration::from_millis(self.mqtt.retry_backoff_ms);
        let mut attempts: u8 = 0;

        loop {
            attempts += 1;
            let remaining = deadline.saturating_duration_since(Instant::now());
            let connect = self
                .transport
                .connect(&client_id, self.mqtt.username, self.mqtt.password);

            match with_timeout(remaining, connect).await {
                Ok(Ok(())) => {
                    info!("MQTT connected after {} attempt(s)", attempts);
                    self.mqtt_state = ConnectionState::Connected;
                    return Ok(());
                }
                Ok(Err(e)) => warn!("MQTT connect attempt {} failed: {}", attempts, e),
                Err(_) => warn!("MQTT connect attempt {} timed out", attempts),
            }

            if attempts >= self.mqtt.max_connect_attempts || Instant::now() + backoff >= deadline
            {
                error!("MQTT connection failed after {} attempt(s)", attempts);
                self.mqtt_state = ConnectionState::Error;
                return Err(NetworkError::MqttConnect { attempts });
            }
            Timer::after(backoff).await;
        }
    }

    /// Publish one reading on the configured topic. Not retried.
    pub async fn publish(
        &mut self,
        co2: u16,
        temperature: f32,
        humidity: f32,
        voltage: f32,
    ) -> Result<(), NetworkError> {
        if !self.transport.is_connected() {
            warn!("Publish skipped, MQTT not connected");
            return Err(NetworkError::NotConnected);
        }

        let timestamp = self.clock.now_unix();
        let mac = self.radio.mac_address();
        let payload = build_payload(timestamp, &mac, temperature, humidity, co2, voltage)
            .map_err(|_| NetworkError::Payload)?;
        if payload.len() > self.mqtt.buffer_size {
            error!(
                "Payload of {} bytes exceeds MQTT buffer of {}",
                payload.len(),
                self.mqtt.buffer_size
            );
            return Err(NetworkError::Payload);
        }

        info!("Publishing to '{}': {}", self.mqtt.topic, payload.as_str());
        match self
            .transport
            .publish(self.mqtt.topic, payload.as_bytes())
            .await
        {
            Ok(()) => {
                info!("Publish acknowledged");
                Ok(())
            }
            Err(e) => {
                error!("Publish failed: {}", e);
                if !self.transport.is_connected() {
                    self.mqtt_state = ConnectionState::Disconnected;
                }
                Err(e)
            }
        }
    }

    /// Signal strength of the current association.
    pub fn rssi(&mut self) -> Option<i8> {
        if self.wifi_state == ConnectionState::Connected {
            self.radio.rssi()
        } else {
            None
        }
    }

    /// Network time, once [`Self::sync_ntp`] has succeeded this wake.
    pub fn timestamp(&self) -> Option<u64> {
        self.time_synced.then(|| self.clock.now_unix())
    }

    /// Device clock regardless of whether it was synchronized this wake.
    pub fn local_time(&self) -> u64 {
        self.clock.now_unix()
    }

    pub fn time_synced(&self) -> bool {
        self.time_synced
    }

    pub fn wifi_state(&self) -> ConnectionState {
        self.wifi_state
    }

    pub fn mqtt_state(&self) -> ConnectionState {
        self.mqtt_state
    }

    pub fn mac_address(&self) -> MacAddress {
        self.radio.mac_address()
    }

    pub fn radio(&self) -> &W {
        &self.radio
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimBroker, SimClock, SimRadio, World};
    use embassy_futures::block_on;

    fn config() -> NodeConfig<'static> {
        let mut config = NodeConfig::default();
        config.wifi.ssid = "lab";
        config.wifi.connect_timeout_ms = 300;
        config.wifi.poll_interval_ms = 20;
        config.wifi.shutdown_timeout_ms = 100;
        config.time.sync_timeout_ms = 600;
        config.time.poll_interval_ms = 20;
        config.mqtt.connect_timeout_ms = 500;
        config.mqtt.retry_backoff_ms = 20;
        config.mqtt.max_connect_attempts = 3;
        config
    }

    type Manager<'w> = NetworkManager<'static, SimRadio<'w>, SimClock<'w>, SimBroker<'w>>;

    fn manager(world: &World) -> Manager<'_> {
        NetworkManager::new(
            SimRadio::new(world),
            SimClock::new(world),
            SimBroker::new(world),
            &config(),
        )
    }

    #[test]
    fn test_wifi_connects_after_polling() {
        let world = World::new(1_718_000_000);
        world.wifi_polls_until_associated.set(3);
        let mut network = manager(&world);

        assert_eq!(block_on(network.connect_wifi()), Ok(()));
        assert_eq!(network.wifi_state(), ConnectionState::Connected);
        assert_eq!(network.rssi(), Some(-61));
    }

    #[test]
    fn test_wifi_timeout() {
        let world = World::new(1_718_000_000);
        world.wifi_available.set(false);
        let mut network = manager(&world);

        let started = std::time::Instant::now();
        assert_eq!(
            block_on(network.connect_wifi()),
            Err(NetworkError::WifiTimeout { timeout_ms: 300 })
        );
        assert!(started.elapsed() < std::time::Duration::from_millis(300 + 20 + 150));
        assert_eq!(network.wifi_state(), ConnectionState::Error);
        assert_eq!(network.rssi(), None);
    }

    #[test]
    fn test_wifi_start_that_never_returns_times_out() {
        let world = World::new(1_718_000_000);
        world.radio_hangs.set(true);
        let mut network = manager(&world);

        let started = std::time::Instant::now();
        assert_eq!(
            block_on(network.connect_wifi()),
            Err(NetworkError::WifiTimeout { timeout_ms: 300 })
        );
        assert!(started.elapsed() < std::time::Duration::from_millis(300 + 150));
        assert_eq!(network.wifi_state(), ConnectionState::Error);
    }

    #[test]
    fn test_time_sync_corrects_clock() {
        let world = World::new(1_718_000_000);
        world.rtc.set(0);
        world.ntp_failures_before_success.set(1);
        let mut network = manager(&world);

        block_on(network.connect_wifi()).unwrap();
        assert_eq!(network.timestamp(), None);

        let synced = block_on(network.sync_ntp()).unwrap();
        assert_eq!(synced, 1_718_000_000);
        assert_eq!(network.timestamp(), Some(1_718_000_000));
        assert_eq!(world.ntp_requests.get(), 2);
    }

    #[test]
    fn test_time_sync_requires_fresh_exchange() {
        let world = World::new(1_718_000_000);
        world.ntp_reachable.set(false);
        let mut network = manager(&world);

        block_on(network.connect_wifi()).unwrap();
        // The drifting local clock is already past the floor, but was not
        // confirmed by the network this wake.
        assert_eq!(
            block_on(network.sync_ntp()),
            Err(NetworkError::TimeSyncTimeout { timeout_ms: 600 })
        );
        assert!(!network.time_synced());
    }

    #[test]
    fn test_mqtt_retries_then_connects() {
        let world = World::new(1_718_000_000);
        world.broker_refusals.set(2);
        let mut network = manager(&world);

        block_on(network.connect_wifi()).unwrap();
        assert_eq!(block_on(network.connect_mqtt()), Ok(()));
        assert_eq!(network.mqtt_state(), ConnectionState::Connected);
        assert_eq!(world.broker_connects.get(), 3);
        assert_eq!(
            world.last_client_id.borrow().as_str(),
            "cognitiv_A4CF12345678"
        );
    }

    #[test]
    fn test_mqtt_gives_up_after_max_attempts() {
        let world = World::new(1_718_000_000);
        world.broker_refusals.set(u32::MAX);
        let mut network = manager(&world);

        block_on(network.connect_wifi()).unwrap();
        assert_eq!(
            block_on(network.connect_mqtt()),
            Err(NetworkError::MqttConnect { attempts: 3 })
        );
        assert_eq!(network.mqtt_state(), ConnectionState::Error);
    }

    #[test]
    fn test_mqtt_connect_bounded_by_wall_clock() {
        let world = World::new(1_718_000_000);
        world.broker_hangs.set(true);
        let mut config = config();
        config.mqtt.max_connect_attempts = 50;
        let mut network = NetworkManager::new(
            SimRadio::new(&world),
            SimClock::new(&world),
            SimBroker::new(&world),
            &config,
        );

        block_on(network.connect_wifi()).unwrap();
        let started = std::time::Instant::now();
        assert_eq!(
            block_on(network.connect_mqtt()),
            Err(NetworkError::MqttConnect { attempts: 1 })
        );
        assert!(started.elapsed() < std::time::Duration::from_millis(500 + 150));
        assert_eq!(network.mqtt_state(), ConnectionState::Error);
    }

    #[test]
    fn test_publish_writes_payload() {
        let world = World::new(1_718_000_000);
        let mut network = manager(&world);

        block_on(network.connect_wifi()).unwrap();
        block_on(network.sync_ntp()).unwrap();
        block_on(network.connect_mqtt()).unwrap();
        block_on(network.publish(812, 21.345, 40.1, 3.78)).unwrap();

        let published = world.published.borrow();
        assert_eq!(published.len(), 1);
        let (topic, body) = &published[0];
        assert_eq!(topic, "cognitiv/readings");
        let parsed: serde_json::Value = serde_json::from_str(body).unwrap();
        assert_eq!(parsed["temperature"].as_f64(), Some(21.35));
        assert_eq!(parsed["timestamp"], 1_718_000_000u64);
    }

    #[test]
    fn test_publish_requires_session() {
        let world = World::new(1_718_000_000);
        let mut network = manager(&world);

        assert_eq!(
            block_on(network.publish(812, 21.0, 40.0, 3.7)),
            Err(NetworkError::NotConnected)
        );
        assert!(world.published.borrow().is_empty());
    }

    #[test]
    fn test_shutdown_closes_everything() {
        let world = World::new(1_718_000_000);
        let mut network = manager(&world);

        block_on(network.connect_wifi()).unwrap();
        block_on(network.connect_mqtt()).unwrap();
        block_on(network.shutdown_wifi());

        assert!(!world.broker_session.get());
        assert!(world.radio_powered_down.get());
        assert_eq!(network.wifi_state(), ConnectionState::Disconnected);
        assert_eq!(network.mqtt_state(), ConnectionState::Disconnected);

        // idempotent
        block_on(network.shutdown_wifi());
    }

    #[test]
    fn test_shutdown_gives_up_on_hung_radio() {
        let world = World::new(1_718_000_000);
        let mut network = manager(&world);

        block_on(network.connect_wifi()).unwrap();
        block_on(network.connect_mqtt()).unwrap();
        world.radio_hangs.set(true);

        let started = std::time::Instant::now();
        block_on(network.shutdown_wifi());

        assert!(started.elapsed() < std::time::Duration::from_millis(100 + 150));
        assert!(!world.broker_session.get());
        assert!(!world.radio_powered_down.get());
        assert_eq!(network.wifi_state(), ConnectionState::Disconnected);
    }
}
