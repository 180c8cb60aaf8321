//! Simulated hardware for host builds
//!
//! A [`World`] holds everything that outlives a boot of the node: true time,
//! the device clock, retained memory, the access point, the time server and
//! the broker. Each boot builds fresh adapters that borrow the world, so a
//! deep sleep loses exactly what it loses on the device.

use std::cell::{Cell, RefCell};

use embedded_hal::digital::PinState;
use embedded_hal::i2c::{ErrorKind, ErrorType, NoAcknowledgeSource, Operation};
use embedded_hal_async::i2c::I2c;
use log::debug;

use crate::app_state::WakeCycle;
use crate::bus::{BusLines, BusManager, BusPort};
use crate::config::NodeConfig;
use crate::network::{MacAddress, MqttTransport, NetworkError, NetworkManager, TimeSource, WifiRadio};
use crate::power::{PersistentScheduleState, PowerManager, RetainedStore, STATE_WORDS, SleepController};
use crate::sensors::scd41::{
    CMD_GET_DATA_READY_STATUS, CMD_MEASURE_SINGLE_SHOT, CMD_READ_MEASUREMENT,
    CMD_STOP_PERIODIC_MEASUREMENT, SCD41_ADDRESS,
};
use crate::sensors::{BatteryAdc, SensorManager, crc8};

pub const SIM_MAC: MacAddress = MacAddress([0xA4, 0xCF, 0x12, 0x34, 0x56, 0x78]);
pub const SIM_RSSI: i8 = -61;

/// Offset of a freshly booted device clock from true time.
const RTC_BOOT_ERROR_SECS: u64 = 42;

// ---------------------------------------------------------------------------
// Bus lines
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineEvent {
    Scl(PinState),
    Sda(PinState),
    SdaReleased,
}

/// SCL/SDA as seen from the pins, with a slave that may hold SDA low.
#[derive(Debug, Default)]
pub struct SimLines {
    events: Vec<LineEvent>,
    scl_low: bool,
    sda_driven: Option<PinState>,
    /// Pulses the slave still needs before it lets go; `None` never lets go.
    stuck_for: Option<u8>,
    pulses: u8,
}

impl SimLines {
    fn stuck(stuck_for: Option<u8>) -> Self {
        Self {
            stuck_for,
            ..Self::default()
        }
    }

    pub fn sda_stuck(&self) -> bool {
        self.stuck_for != Some(0)
    }

    /// Clock pulses issued with SDA released.
    pub fn pulses(&self) -> u8 {
        self.pulses
    }

    pub fn events(&self) -> &[LineEvent] {
        &self.events
    }

    pub fn ends_with(&self, tail: &[LineEvent]) -> bool {
        self.events.ends_with(tail)
    }

    /// SCL high, SDA released and not held by the slave.
    pub fn bus_idle(&self) -> bool {
        !self.scl_low && self.sda_driven.is_none() && !self.sda_stuck()
    }
}

impl BusLines for SimLines {
    fn configure_for_recovery(&mut self) {
        self.scl_low = false;
        self.sda_driven = None;
    }

    fn set_scl(&mut self, state: PinState) {
        self.events.push(LineEvent::Scl(state));
        let rising = self.scl_low && state == PinState::High;
        self.scl_low = state == PinState::Low;

        if rising && self.sda_driven.is_none() {
            self.pulses = self.pulses.saturating_add(1);
            if let Some(n) = self.stuck_for.as_mut() {
                *n = n.saturating_sub(1);
            }
        }
    }

    fn drive_sda(&mut self, state: PinState) {
        self.events.push(LineEvent::Sda(state));
        self.sda_driven = Some(state);
    }

    fn release_sda(&mut self) {
        self.events.push(LineEvent::SdaReleased);
        self.sda_driven = None;
    }

    fn sda_is_high(&mut self) -> bool {
        !self.sda_stuck()
    }
}

// ---------------------------------------------------------------------------
// SCD41
// ---------------------------------------------------------------------------

/// Behavioural model of the SCD41 command interface.
#[derive(Debug, Clone)]
pub struct SimScd41 {
    co2: u16,
    temperature_ticks: u16,
    humidity_ticks: u16,
    periodic: bool,
    never_ready: bool,
    corrupt_crc: bool,
    measuring: bool,
    single_shots: u32,
}

impl SimScd41 {
    pub fn new(co2: u16, temperature: f32, humidity: f32) -> Self {
        Self {
            co2,
            temperature_ticks: scale_to_ticks((temperature + 45.0) / 175.0),
            humidity_ticks: scale_to_ticks(humidity / 100.0),
            periodic: false,
            never_ready: false,
            corrupt_crc: false,
            measuring: false,
            single_shots: 0,
        }
    }

    /// A sensor left in periodic mode by earlier firmware.
    pub fn periodic(co2: u16, temperature: f32, humidity: f32) -> Self {
        Self {
            periodic: true,
            ..Self::new(co2, temperature, humidity)
        }
    }

    /// Accepts commands but never reports data ready.
    pub fn never_ready() -> Self {
        Self {
            never_ready: true,
            ..Self::default()
        }
    }

    pub fn with_corrupt_crc(mut self) -> Self {
        self.corrupt_crc = true;
        self
    }

    pub fn set_measurement(&mut self, co2: u16, temperature: f32, humidity: f32) {
        let fresh = Self::new(co2, temperature, humidity);
        self.co2 = fresh.co2;
        self.temperature_ticks = fresh.temperature_ticks;
        self.humidity_ticks = fresh.humidity_ticks;
    }

    pub fn is_periodic(&self) -> bool {
        self.periodic
    }

    pub fn single_shots(&self) -> u32 {
        self.single_shots
    }

    fn command(&mut self, command: u16, response: &mut Vec<u8>) -> Result<(), ErrorKind> {
        response.clear();
        match command {
            CMD_STOP_PERIODIC_MEASUREMENT => {
                self.periodic = false;
                self.measuring = false;
            }
            CMD_MEASURE_SINGLE_SHOT if self.periodic => {
                return Err(ErrorKind::NoAcknowledge(NoAcknowledgeSource::Data));
            }
            CMD_MEASURE_SINGLE_SHOT => {
                self.measuring = true;
                self.single_shots += 1;
            }
            CMD_GET_DATA_READY_STATUS => {
                let status = if self.measuring && !self.never_ready {
                    0x8006
                } else {
                    0x8000
                };
                push_word(response, status, false);
            }
            CMD_READ_MEASUREMENT => {
                self.measuring = false;
                for word in [self.co2, self.temperature_ticks, self.humidity_ticks] {
                    push_word(response, word, self.corrupt_crc);
                }
            }
            other => {
                debug!("SimScd41: unknown command 0x{:04X}", other);
                return Err(ErrorKind::NoAcknowledge(NoAcknowledgeSource::Data));
            }
        }
        Ok(())
    }
}

impl Default for SimScd41 {
    fn default() -> Self {
        Self::new(812, 21.0, 40.0)
    }
}

fn scale_to_ticks(fraction: f32) -> u16 {
    (fraction * 65535.0).round().clamp(0.0, 65535.0) as u16
}

fn push_word(buf: &mut Vec<u8>, word: u16, corrupt: bool) {
    let bytes = word.to_be_bytes();
    let crc = crc8(&bytes);
    buf.extend_from_slice(&bytes);
    buf.push(if corrupt { !crc } else { crc });
}

// ---------------------------------------------------------------------------
// I2C port
// ---------------------------------------------------------------------------

/// I2C peripheral with at most one device (the SCD41) on the bus.
#[derive(Debug)]
pub struct SimI2c {
    sensor: SimScd41,
    present: bool,
    attached: bool,
    wedged: bool,
    response: Vec<u8>,
}

impl ErrorType for SimI2c {
    type Error = ErrorKind;
}

impl I2c for SimI2c {
    async fn transaction(
        &mut self,
        address: u8,
        operations: &mut [Operation<'_>],
    ) -> Result<(), Self::Error> {
        if !self.attached || self.wedged {
            return Err(ErrorKind::Bus);
        }
        if address != SCD41_ADDRESS || !self.present {
            return Err(ErrorKind::NoAcknowledge(NoAcknowledgeSource::Address));
        }

        for operation in operations {
            match operation {
                Operation::Write(bytes) => match *bytes {
                    [] => {}
                    [hi, lo] => self
                        .sensor
                        .command(u16::from_be_bytes([*hi, *lo]), &mut self.response)?,
                    _ => return Err(ErrorKind::NoAcknowledge(NoAcknowledgeSource::Data)),
                },
                Operation::Read(buf) => {
                    if self.response.len() < buf.len() {
                        return Err(ErrorKind::Other);
                    }
                    buf.copy_from_slice(&self.response[..buf.len()]);
                    self.response.clear();
                }
            }
        }
        Ok(())
    }
}

/// The board bus: I2C peripheral plus the raw lines it is detached to.
#[derive(Debug)]
pub struct SimBusPort {
    i2c: SimI2c,
    lines: SimLines,
    attach_count: u32,
}

impl SimBusPort {
    pub fn with_sensor(sensor: SimScd41) -> Self {
        Self {
            i2c: SimI2c {
                sensor,
                present: true,
                attached: false,
                wedged: false,
                response: Vec::new(),
            },
            lines: SimLines::stuck(Some(0)),
            attach_count: 0,
        }
    }

    pub fn healthy() -> Self {
        Self::with_sensor(SimScd41::default())
    }

    /// Nothing answers on the bus.
    pub fn empty() -> Self {
        let mut port = Self::healthy();
        port.i2c.present = false;
        port
    }

    /// The sensor holds SDA low until it has seen `pulses` clock pulses.
    pub fn wedged_for(mut self, pulses: u8) -> Self {
        self.lines = SimLines::stuck(Some(pulses));
        self
    }

    pub fn stuck_for(pulses: u8) -> Self {
        Self::healthy().wedged_for(pulses)
    }

    pub fn stuck_forever() -> Self {
        let mut port = Self::healthy();
        port.lines = SimLines::stuck(None);
        port
    }

    pub fn lines(&self) -> &SimLines {
        &self.lines
    }

    pub fn sensor(&self) -> &SimScd41 {
        &self.i2c.sensor
    }

    pub fn is_attached(&self) -> bool {
        self.i2c.attached
    }

    pub fn attach_count(&self) -> u32 {
        self.attach_count
    }
}

impl BusPort for SimBusPort {
    type Bus = SimI2c;
    type Lines = SimLines;

    fn attach(&mut self) {
        self.attach_count += 1;
        self.i2c.attached = true;
        self.i2c.wedged = self.lines.sda_stuck();
        self.i2c.response.clear();
    }

    fn detach(&mut self) -> &mut SimLines {
        self.i2c.attached = false;
        &mut self.lines
    }

    fn bus(&mut self) -> &mut SimI2c {
        &mut self.i2c
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SimAdc {
    raw: u16,
}

impl SimAdc {
    pub fn new(raw: u16) -> Self {
        Self { raw }
    }
}

impl BatteryAdc for SimAdc {
    fn read_raw(&mut self) -> u16 {
        self.raw
    }
}

// ---------------------------------------------------------------------------
// World
// ---------------------------------------------------------------------------

/// State that persists across simulated boots.
pub struct World {
    /// Real Unix time.
    pub true_time: Cell<u64>,
    /// Device clock; survives deep sleep but only counts the sleep timer.
    pub rtc: Cell<u64>,
    /// Fractional error of the sleep timer: a requested sleep of `n` seconds
    /// really takes `n * (1 + drift)`.
    pub drift: Cell<f64>,
    pub battery_raw: Cell<u16>,

    pub wifi_available: Cell<bool>,
    pub wifi_polls_until_associated: Cell<u32>,
    pub associated: Cell<bool>,
    pub radio_powered_down: Cell<bool>,
    /// Radio start and stop never complete.
    pub radio_hangs: Cell<bool>,

    pub ntp_reachable: Cell<bool>,
    pub ntp_failures_before_success: Cell<u32>,
    pub ntp_requests: Cell<u32>,

    pub broker_refusals: Cell<u32>,
    /// The broker accepts TCP but never answers the handshake.
    pub broker_hangs: Cell<bool>,
    pub broker_connects: Cell<u32>,
    pub broker_session: Cell<bool>,
    pub last_client_id: RefCell<String>,
    pub published: RefCell<Vec<(String, String)>>,

    pub retained: Cell<[u32; STATE_WORDS]>,
    pub retained_writes: Cell<u32>,

    pub slept: RefCell<Vec<u32>>,
    /// Whether the radio was off when the last sleep began.
    pub radio_down_at_sleep: Cell<Option<bool>>,
}

impl World {
    pub fn new(true_time: u64) -> Self {
        Self {
            true_time: Cell::new(true_time),
            rtc: Cell::new(true_time + RTC_BOOT_ERROR_SECS),
            drift: Cell::new(0.0),
            battery_raw: Cell::new(2400),
            wifi_available: Cell::new(true),
            wifi_polls_until_associated: Cell::new(0),
            associated: Cell::new(false),
            radio_powered_down: Cell::new(true),
            radio_hangs: Cell::new(false),
            ntp_reachable: Cell::new(true),
            ntp_failures_before_success: Cell::new(0),
            ntp_requests: Cell::new(0),
            broker_refusals: Cell::new(0),
            broker_hangs: Cell::new(false),
            broker_connects: Cell::new(0),
            broker_session: Cell::new(false),
            last_client_id: RefCell::new(String::new()),
            published: RefCell::new(Vec::new()),
            retained: Cell::new([0; STATE_WORDS]),
            retained_writes: Cell::new(0),
            slept: RefCell::new(Vec::new()),
            radio_down_at_sleep: Cell::new(None),
        }
    }

    pub fn stored_state(&self) -> PersistentScheduleState {
        PersistentScheduleState::from_words(self.retained.get())
    }

    /// Seed retained memory as if an earlier boot had written it.
    pub fn store_state(&self, state: PersistentScheduleState) {
        self.retained.set(state.to_words());
    }

    /// Let a deep sleep of `seconds` (by the device timer) pass.
    pub fn advance_sleep(&self, seconds: u32) {
        let elapsed = (seconds as f64 * (1.0 + self.drift.get())).round() as u64;
        self.true_time.set(self.true_time.get() + elapsed);
        self.rtc.set(self.rtc.get() + seconds as u64);
        // the node reboots on wake
        self.associated.set(false);
        self.broker_session.set(false);
    }

    /// Build the managers for one boot of the node.
    pub fn boot<'w, 'a>(&'w self, config: &NodeConfig<'a>, port: SimBusPort) -> SimWakeCycle<'w, 'a> {
        let sensors = SensorManager::new(
            BusManager::new(port),
            SimAdc::new(self.battery_raw.get()),
            config.sensor,
            config.battery,
        );
        let network = NetworkManager::new(
            SimRadio::new(self),
            SimClock::new(self),
            SimBroker::new(self),
            config,
        );
        let power = PowerManager::new(
            SimRetained::new(self),
            SimSleeper::new(self),
            config.power,
            config.quiet_hours,
            config.time.local_offset_secs(),
        );
        WakeCycle::new(sensors, network, power, config)
    }
}

pub type SimWakeCycle<'w, 'a> = WakeCycle<
    'a,
    SimBusPort,
    SimAdc,
    SimRadio<'w>,
    SimClock<'w>,
    SimBroker<'w>,
    SimRetained<'w>,
    SimSleeper<'w>,
>;

// ---------------------------------------------------------------------------
// Network
// ---------------------------------------------------------------------------

pub struct SimRadio<'w> {
    world: &'w World,
    begun: bool,
    polls_left: u32,
}

impl<'w> SimRadio<'w> {
    pub fn new(world: &'w World) -> Self {
        Self {
            world,
            begun: false,
            polls_left: 0,
        }
    }
}

impl WifiRadio for SimRadio<'_> {
    fn mac_address(&self) -> MacAddress {
        SIM_MAC
    }

    async fn begin(&mut self, _ssid: &str, _password: &str) -> Result<(), NetworkError> {
        if self.world.radio_hangs.get() {
            core::future::pending::<()>().await;
        }
        self.begun = true;
        self.polls_left = self.world.wifi_polls_until_associated.get();
        self.world.radio_powered_down.set(false);
        Ok(())
    }

    fn is_connected(&mut self) -> bool {
        if self.world.associated.get() {
            return true;
        }
        if !self.begun || !self.world.wifi_available.get() {
            return false;
        }
        if self.polls_left > 0 {
            self.polls_left -= 1;
            return false;
        }
        self.world.associated.set(true);
        true
    }

    fn rssi(&mut self) -> Option<i8> {
        self.world.associated.get().then_some(SIM_RSSI)
    }

    async fn power_down(&mut self) {
        if self.world.radio_hangs.get() {
            core::future::pending::<()>().await;
        }
        self.begun = false;
        self.world.associated.set(false);
        self.world.radio_powered_down.set(true);
    }
}

pub struct SimClock<'w> {
    world: &'w World,
}

impl<'w> SimClock<'w> {
    pub fn new(world: &'w World) -> Self {
        Self { world }
    }
}

impl TimeSource for SimClock<'_> {
    fn now_unix(&self) -> u64 {
        self.world.rtc.get()
    }

    async fn exchange(&mut self, _server: &str) -> Result<(), NetworkError> {
        let world = self.world;
        world.ntp_requests.set(world.ntp_requests.get() + 1);

        if !world.associated.get() || !world.ntp_reachable.get() {
            return Err(NetworkError::TimeSync("no response"));
        }
        let failures = world.ntp_failures_before_success.get();
        if failures > 0 {
            world.ntp_failures_before_success.set(failures - 1);
            return Err(NetworkError::TimeSync("no response"));
        }
        world.rtc.set(world.true_time.get());
        Ok(())
    }
}

pub struct SimBroker<'w> {
    world: &'w World,
}

impl<'w> SimBroker<'w> {
    pub fn new(world: &'w World) -> Self {
        Self { world }
    }
}

impl MqttTransport for SimBroker<'_> {
    async fn connect(
        &mut self,
        client_id: &str,
        _username: &str,
        _password: &str,
    ) -> Result<(), NetworkError> {
        let world = self.world;
        world.broker_connects.set(world.broker_connects.get() + 1);
        *world.last_client_id.borrow_mut() = client_id.into();

        if !world.associated.get() {
            return Err(NetworkError::Transport("no route to broker"));
        }
        if world.broker_hangs.get() {
            core::future::pending::<()>().await;
        }
        let refusals = world.broker_refusals.get();
        if refusals > 0 {
            world.broker_refusals.set(refusals - 1);
            return Err(NetworkError::Transport("connection refused"));
        }
        world.broker_session.set(true);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.world.broker_session.get()
    }

    async fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), NetworkError> {
        if !self.world.broker_session.get() {
            return Err(NetworkError::Publish("no session"));
        }
        let body = String::from_utf8_lossy(payload).into_owned();
        self.world
            .published
            .borrow_mut()
            .push((topic.into(), body));
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.world.broker_session.set(false);
    }
}

// ---------------------------------------------------------------------------
// Power
// ---------------------------------------------------------------------------

pub struct SimRetained<'w> {
    world: &'w World,
}

impl<'w> SimRetained<'w> {
    pub fn new(world: &'w World) -> Self {
        Self { world }
    }
}

impl RetainedStore for SimRetained<'_> {
    fn load(&self) -> [u32; STATE_WORDS] {
        self.world.retained.get()
    }

    fn store(&mut self, words: [u32; STATE_WORDS]) {
        self.world.retained.set(words);
        self.world
            .retained_writes
            .set(self.world.retained_writes.get() + 1);
    }
}

/// Records each sleep and lets the world's time pass instead of halting.
pub struct SimSleeper<'w> {
    world: &'w World,
}

impl<'w> SimSleeper<'w> {
    pub fn new(world: &'w World) -> Self {
        Self { world }
    }
}

impl SleepController for SimSleeper<'_> {
    fn enter_deep_sleep(&mut self, seconds: u32) {
        let world = self.world;
        world
            .radio_down_at_sleep
            .set(Some(world.radio_powered_down.get()));
        world.slept.borrow_mut().push(seconds);
        world.advance_sleep(seconds);
    }
}
