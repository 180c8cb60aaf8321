//! Static buffers for one broker session
//!
//! A TLS 1.3 record is up to 16 KiB of plaintext plus header and tag, so the
//! read side needs a little more than 16 KiB. Everything lives in `.bss` and
//! is handed out as `'static` borrows to the session that owns it.

use core::ptr::addr_of_mut;

use rust_mqtt::buffer::BumpBuffer;

pub const TCP_RX_LEN: usize = 4096;
pub const TCP_TX_LEN: usize = 4096;
pub const TLS_READ_LEN: usize = 18 * 1024;
pub const TLS_WRITE_LEN: usize = 16 * 1024;
pub const MQTT_LEN: usize = 2048;

static mut TCP_RX: [u8; TCP_RX_LEN] = [0; TCP_RX_LEN];
static mut TCP_TX: [u8; TCP_TX_LEN] = [0; TCP_TX_LEN];
static mut TLS_READ: [u8; TLS_READ_LEN] = [0; TLS_READ_LEN];
static mut TLS_WRITE: [u8; TLS_WRITE_LEN] = [0; TLS_WRITE_LEN];
static mut MQTT: [u8; MQTT_LEN] = [0; MQTT_LEN];
static mut BUMP: Option<BumpBuffer<'static>> = None;

pub struct SessionBuffers {
    pub tcp_rx: &'static mut [u8],
    pub tcp_tx: &'static mut [u8],
    pub tls_read: &'static mut [u8],
    pub tls_write: &'static mut [u8],
    pub mqtt: &'static mut BumpBuffer<'static>,
}

/// Borrow every session buffer.
///
/// # Safety
/// The session built from the previous call must have been dropped; nothing
/// else may hold a borrow of these statics.
pub unsafe fn session_buffers() -> SessionBuffers {
    unsafe {
        let bump = (*addr_of_mut!(BUMP)).insert(BumpBuffer::new(&mut (*addr_of_mut!(MQTT))[..]));
        SessionBuffers {
            tcp_rx: &mut (*addr_of_mut!(TCP_RX))[..],
            tcp_tx: &mut (*addr_of_mut!(TCP_TX))[..],
            tls_read: &mut (*addr_of_mut!(TLS_READ))[..],
            tls_write: &mut (*addr_of_mut!(TLS_WRITE))[..],
            mqtt: bump,
        }
    }
}
