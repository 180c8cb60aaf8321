//! RTC wall clock corrected by SNTP
//!
//! The RTC timer keeps counting through deep sleep, so once a boot has set it
//! every later wake reads a usable (if drifting) time without the network.

use core::cell::RefCell;

use cognitiv_core::{NetworkError, TimeSource};
use embassy_futures::select::{Either, select};
use embassy_net::dns::DnsQueryType;
use embassy_net::udp::{PacketMetadata, UdpSocket};
use embassy_net::{IpEndpoint, Stack};
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_time::{Duration, Instant, Timer};
use esp_hal::rtc_cntl::Rtc;
use log::{debug, info, warn};

/// The RTC, shared between the clock and the deep-sleep controller.
pub type SharedRtc = Mutex<CriticalSectionRawMutex, RefCell<Rtc<'static>>>;

const SNTP_PORT: u16 = 123;
const SNTP_PACKET_LEN: usize = 48;
const SNTP_TIMEOUT_MS: u64 = 3000;
/// Strata above this are too far from a reference clock to trust.
const MAX_STRATUM: u8 = 3;
/// Seconds from 1900-01-01 (NTP era 0) to 1970-01-01.
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

pub struct EspClock {
    rtc: &'static SharedRtc,
    stack: Stack<'static>,
}

impl EspClock {
    pub fn new(rtc: &'static SharedRtc, stack: Stack<'static>) -> Self {
        Self { rtc, stack }
    }

    fn now_us(&self) -> u64 {
        self.rtc.lock(|rtc| rtc.borrow().current_time_us())
    }

    fn set_now_us(&self, us: u64) {
        self.rtc.lock(|rtc| rtc.borrow().set_current_time_us(us));
    }

    /// One SNTP request/response. Returns Unix time in microseconds at the
    /// moment the response arrived.
    async fn request(&self, server: &str) -> Result<u64, NetworkError> {
        let server_ip = self
            .stack
            .dns_query(server, DnsQueryType::A)
            .await
            .map_err(|_| NetworkError::TimeSync("DNS lookup failed"))?
            .first()
            .copied()
            .ok_or(NetworkError::TimeSync("DNS returned no address"))?;
        let endpoint = IpEndpoint::new(server_ip, SNTP_PORT);
        debug!("{} resolved to {}", server, endpoint);

        let mut rx_meta = [PacketMetadata::EMPTY; 2];
        let mut rx_buffer = [0u8; 64];
        let mut tx_meta = [PacketMetadata::EMPTY; 2];
        let mut tx_buffer = [0u8; 64];
        let mut socket = UdpSocket::new(
            self.stack,
            &mut rx_meta,
            &mut rx_buffer,
            &mut tx_meta,
            &mut tx_buffer,
        );
        socket
            .bind(0)
            .map_err(|_| NetworkError::TimeSync("UDP bind failed"))?;

        let mut packet = [0u8; SNTP_PACKET_LEN];
        packet[0] = 0x1B; // LI 0, version 3, client mode

        let sent_at = Instant::now();
        socket
            .send_to(&packet, endpoint)
            .await
            .map_err(|_| NetworkError::TimeSync("request not sent"))?;

        let mut response = [0u8; SNTP_PACKET_LEN];
        let (len, from) = match select(
            Timer::after(Duration::from_millis(SNTP_TIMEOUT_MS)),
            socket.recv_from(&mut response),
        )
        .await
        {
            Either::First(_) => return Err(NetworkError::TimeSync("no response")),
            Either::Second(result) => {
                result.map_err(|_| NetworkError::TimeSync("receive failed"))?
            }
        };
        let round_trip = sent_at.elapsed();

        if len < SNTP_PACKET_LEN || from.endpoint.addr != server_ip {
            return Err(NetworkError::TimeSync("malformed response"));
        }

        let stratum = response[1];
        if stratum == 0 || stratum > MAX_STRATUM {
            warn!("{} answered with stratum {}", server, stratum);
            return Err(NetworkError::TimeSync("untrusted stratum"));
        }

        let seconds = u32::from_be_bytes([response[40], response[41], response[42], response[43]]);
        let fraction = u32::from_be_bytes([response[44], response[45], response[46], response[47]]);
        let unix_secs = u64::from(seconds)
            .checked_sub(NTP_UNIX_OFFSET)
            .ok_or(NetworkError::TimeSync("timestamp before 1970"))?;
        let micros = (u64::from(fraction) * 1_000_000) >> 32;

        // The server stamped the reply half a round trip ago.
        let correction = (round_trip.as_micros() / 2).min(1_000_000);
        Ok(unix_secs * 1_000_000 + micros + correction)
    }
}

impl TimeSource for EspClock {
    fn now_unix(&self) -> u64 {
        self.now_us() / 1_000_000
    }

    async fn exchange(&mut self, server: &str) -> Result<(), NetworkError> {
        let now_us = self.request(server).await?;
        let before = self.now_unix();
        self.set_now_us(now_us);
        info!(
            "Clock set from {}: {} (was {})",
            server,
            now_us / 1_000_000,
            before
        );
        Ok(())
    }
}
