//! MQTT v5 over TLS 1.3 over embassy-net TCP
//!
//! One broker session at a time. The session owns the TCP socket, the TLS
//! connection and the MQTT client, all built on the static buffers in
//! [`buffers`]; dropping it closes the connection and frees the buffers for
//! the next `connect`.
//!
//! With [`TlsMode::CaCertificate`] the broker chain is checked against the
//! configured CA and the broker host name. The device has no trusted time
//! before the handshake, so certificate validity dates are not checked.

pub mod buffers;
pub mod socket;

use alloc::vec;

use cognitiv_core::config::{MqttConfig, TlsMode};
use cognitiv_core::network::pem_to_der;
use cognitiv_core::{MqttTransport, NetworkError};
use embassy_net::dns::DnsQueryType;
use embassy_net::{IpEndpoint, Stack};
use embassy_time::{Duration, with_timeout};
use embedded_tls::pki::CertVerifier;
use embedded_tls::{
    Aes128GcmSha256, Certificate, CryptoProvider, NoClock, NoVerify, TlsConfig, TlsConnection,
    TlsContext, TlsVerifier,
};
use esp_hal::rng::Rng;
use log::{debug, error, info, warn};
use rust_mqtt::Bytes;
use rust_mqtt::buffer::BumpBuffer;
use rust_mqtt::client::Client;
use rust_mqtt::client::options::{ConnectOptions, PublicationOptions, TopicReference};
use rust_mqtt::config::{KeepAlive, SessionExpiryInterval};
use rust_mqtt::types::{MqttBinary, MqttString, QoS, TopicName};

use buffers::session_buffers;
use socket::AsyncTcpSocket;

const PUBLISH_TIMEOUT_MS: u64 = 5000;

/// Largest CA certificate accepted from configuration, in DER bytes.
const CA_DER_MAX: usize = 2048;

/// Largest broker certificate the verifier will hold.
const SERVER_CERT_MAX: usize = 4096;

type TlsStream = TlsConnection<'static, AsyncTcpSocket<'static>, Aes128GcmSha256>;
type Session = Client<'static, TlsStream, BumpBuffer<'static>, 1, 1, 1, 0>;

/// The hardware RNG behind the `rand_core` traits the TLS handshake uses.
///
/// The ESP32-S3 RNG mixes in radio noise, which is running whenever a broker
/// session is opened.
pub struct HwRng(Rng);

impl Default for HwRng {
    fn default() -> Self {
        Self(Rng::new())
    }
}

impl rand_core::RngCore for HwRng {
    fn next_u32(&mut self) -> u32 {
        self.0.random()
    }

    fn next_u64(&mut self) -> u64 {
        (u64::from(self.0.random()) << 32) | u64::from(self.0.random())
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        for chunk in dest.chunks_mut(4) {
            let word = self.0.random().to_le_bytes();
            chunk.copy_from_slice(&word[..chunk.len()]);
        }
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

impl rand_core::CryptoRng for HwRng {}

struct Provider<'a, R, V> {
    rng: &'a mut R,
    verifier: V,
}

impl<R, V> CryptoProvider for Provider<'_, R, V>
where
    R: rand_core::CryptoRngCore,
    V: TlsVerifier<Aes128GcmSha256>,
{
    type CipherSuite = Aes128GcmSha256;
    type Signature = &'static [u8];

    fn rng(&mut self) -> impl rand_core::CryptoRngCore {
        &mut *self.rng
    }

    fn verifier(
        &mut self,
    ) -> Result<&mut impl TlsVerifier<Self::CipherSuite>, embedded_tls::TlsError> {
        Ok(&mut self.verifier)
    }
}

pub struct EspMqttTransport {
    stack: Stack<'static>,
    rng: HwRng,
    host: &'static str,
    port: u16,
    tls: TlsMode<'static>,
    /// DER form of the configured CA, when it decoded.
    ca_der: Option<&'static [u8]>,
    keep_alive_secs: u16,
    session: Option<Session>,
}

/// Decode the configured CA once per boot. The DER bytes live until reset.
fn decode_ca(pem: &str) -> Option<&'static [u8]> {
    let mut der = vec![0u8; CA_DER_MAX];
    match pem_to_der(pem, &mut der) {
        Ok(bytes) => {
            let len = bytes.len();
            der.truncate(len);
            info!("Broker CA certificate loaded ({} bytes DER)", len);
            Some(der.leak())
        }
        Err(e) => {
            error!("Broker CA certificate unusable: {}", e);
            None
        }
    }
}

impl EspMqttTransport {
    pub fn new(stack: Stack<'static>, rng: HwRng, config: &MqttConfig<'static>) -> Self {
        Self {
            stack,
            rng,
            host: config.broker_host,
            port: config.broker_port,
            tls: config.tls,
            ca_der: match config.tls {
                TlsMode::Insecure => None,
                TlsMode::CaCertificate(pem) => decode_ca(pem),
            },
            keep_alive_secs: config.keep_alive_secs,
            session: None,
        }
    }

    async fn resolve(&self) -> Result<IpEndpoint, NetworkError> {
        let address = self
            .stack
            .dns_query(self.host, DnsQueryType::A)
            .await
            .map_err(|e| {
                warn!("DNS query for {} failed: {:?}", self.host, e);
                NetworkError::Transport("broker name not resolved")
            })?
            .first()
            .copied()
            .ok_or(NetworkError::Transport("broker name has no address"))?;
        Ok(IpEndpoint::new(address, self.port))
    }
}

impl MqttTransport for EspMqttTransport {
    async fn connect(
        &mut self,
        client_id: &str,
        username: &str,
        password: &str,
    ) -> Result<(), NetworkError> {
        // Frees the static buffers held by any earlier session.
        self.session = None;

        let ca = match self.tls {
            TlsMode::Insecure => None,
            TlsMode::CaCertificate(_) => Some(
                self.ca_der
                    .ok_or(NetworkError::Transport("CA certificate unusable"))?,
            ),
        };

        let endpoint = self.resolve().await?;
        debug!("Broker {} resolved to {}", self.host, endpoint);

        // SAFETY: the previous session was dropped above and each connect
        // attempt builds at most one session from these buffers.
        let buffers = unsafe { session_buffers() };

        let mut socket = AsyncTcpSocket::new(self.stack, buffers.tcp_rx, buffers.tcp_tx);
        socket
            .connect(endpoint)
            .await
            .map_err(|_| NetworkError::Transport("TCP connect refused"))?;
        debug!("TCP connected to {}", endpoint);

        let tls_config = TlsConfig::new().with_server_name(self.host);
        let mut tls: TlsStream = TlsConnection::new(socket, buffers.tls_read, buffers.tls_write);
        let opened = match ca {
            None => {
                let provider = Provider {
                    rng: &mut self.rng,
                    verifier: NoVerify,
                };
                tls.open(TlsContext::new(&tls_config, provider)).await
            }
            Some(der) => {
                let verifier = CertVerifier::<Aes128GcmSha256, NoClock, SERVER_CERT_MAX>::new(
                    Certificate::X509(der),
                );
                let provider = Provider {
                    rng: &mut self.rng,
                    verifier,
                };
                tls.open(TlsContext::new(&tls_config, provider)).await
            }
        };
        opened.map_err(|e| {
            warn!("TLS handshake failed: {:?}", e);
            NetworkError::Transport("TLS handshake failed")
        })?;
        debug!("TLS session established");

        let options = ConnectOptions {
            session_expiry_interval: SessionExpiryInterval::EndOnDisconnect,
            clean_start: true,
            keep_alive: if self.keep_alive_secs == 0 {
                KeepAlive::Infinite
            } else {
                KeepAlive::Seconds(self.keep_alive_secs)
            },
            will: None,
            user_name: if username.is_empty() {
                None
            } else {
                Some(
                    MqttString::new(username.into())
                        .map_err(|_| NetworkError::Transport("user name too long"))?,
                )
            },
            password: if password.is_empty() {
                None
            } else {
                Some(
                    MqttBinary::new(Bytes::from(password.as_bytes()))
                        .map_err(|_| NetworkError::Transport("password too long"))?,
                )
            },
        };
        let id = MqttString::new(client_id.into())
            .map_err(|_| NetworkError::Transport("client id rejected"))?;

        let mut client: Session = Client::new(buffers.mqtt);
        client.connect(tls, &options, Some(id)).await.map_err(|e| {
            warn!("MQTT CONNECT refused: {:?}", e);
            NetworkError::Transport("broker refused the session")
        })?;

        info!("MQTT session open to {}", endpoint);
        self.session = Some(client);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    async fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), NetworkError> {
        let client = self.session.as_mut().ok_or(NetworkError::NotConnected)?;

        let name = MqttString::new(topic.into())
            .map_err(|_| NetworkError::Publish("topic too long"))?;
        // SAFETY: topics come from configuration and carry no wildcards.
        let topic = unsafe { TopicName::new_unchecked(name) };
        let options = PublicationOptions {
            retain: false,
            message_expiry_interval: None,
            topic: TopicReference::Name(topic),
            qos: QoS::AtMostOnce,
        };

        let outcome = with_timeout(
            Duration::from_millis(PUBLISH_TIMEOUT_MS),
            client.publish(&options, Bytes::from(payload)),
        )
        .await;

        match outcome {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => {
                warn!("MQTT publish error: {:?}", e);
                self.session = None;
                Err(NetworkError::Publish("session failed"))
            }
            Err(_) => {
                self.session = None;
                Err(NetworkError::Publish("timed out"))
            }
        }
    }

    async fn disconnect(&mut self) {
        if self.session.take().is_some() {
            debug!("MQTT session dropped");
        }
    }
}
