//! Wake-cycle orchestration for cognitiv
//!
//! Every boot of the node is one pass through [`WakeCycle::run`]: either a
//! chained quiet-hours wake that only re-arms the timer, or a full cycle
//! (measure, connect, publish) followed by the schedule decision. Faults never
//! escape; each one degrades to "skip publish, sleep the standard interval".

use heapless::Vec;
use log::{error, info, warn};
use thiserror_no_std::Error;

use crate::bus::{BusError, BusPort};
use crate::config::NodeConfig;
use crate::network::{MqttTransport, NetworkError, NetworkManager, TimeSource, WifiRadio};
use crate::power::{PersistentScheduleState, PowerManager, RetainedStore, SleepController};
use crate::sensors::{BatteryAdc, SensorError, SensorManager, SensorReading};

/// Upper bound on faults remembered for one wake.
pub const MAX_CYCLE_FAULTS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WakePhase {
    #[default]
    Booting,
    /// Mid quiet period, only re-arming the timer.
    ChainedSleep,
    Measuring,
    WifiConnecting,
    TimeSyncing,
    Publishing,
    Scheduling,
    Sleeping,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleError {
    #[error("bus: {0}")]
    Bus(BusError),
    #[error("sensor: {0}")]
    Sensor(SensorError),
    #[error("network: {0}")]
    Network(NetworkError),
}

impl From<BusError> for CycleError {
    fn from(e: BusError) -> Self {
        Self::Bus(e)
    }
}

impl From<SensorError> for CycleError {
    fn from(e: SensorError) -> Self {
        Self::Sensor(e)
    }
}

impl From<NetworkError> for CycleError {
    fn from(e: NetworkError) -> Self {
        Self::Network(e)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepReason {
    /// Regular measurement interval.
    Interval,
    /// One full chunk of a quiet period; `remaining` chunks are still owed.
    QuietChunk { remaining: u32 },
    /// Last segment of a quiet period, ending at the wake target.
    QuietFinal,
    /// Network time was not available, so the schedule could not be checked.
    ClockUnavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SleepPlan {
    pub seconds: u32,
    pub reason: SleepReason,
}

pub struct WakeCycle<'a, P, A, W, C, T, R, S> {
    sensors: SensorManager<P, A>,
    network: NetworkManager<'a, W, C, T>,
    power: PowerManager<R, S>,
    config: NodeConfig<'a>,
    phase: WakePhase,
    faults: Vec<CycleError, MAX_CYCLE_FAULTS>,
}

impl<'a, P, A, W, C, T, R, S> WakeCycle<'a, P, A, W, C, T, R, S>
where
    P: BusPort,
    A: BatteryAdc,
    W: WifiRadio,
    C: TimeSource,
    T: MqttTransport,
    R: RetainedStore,
    S: SleepController,
{
    pub fn new(
        sensors: SensorManager<P, A>,
        network: NetworkManager<'a, W, C, T>,
        power: PowerManager<R, S>,
        config: &NodeConfig<'a>,
    ) -> Self {
        Self {
            sensors,
            network,
            power,
            config: *config,
            phase: WakePhase::Booting,
            faults: Vec::new(),
        }
    }

    /// Run this wake up to (not including) the sleep itself.
    ///
    /// Any retained-state update happens in here, exactly once, before the
    /// plan is returned.
    pub async fn run(&mut self) -> SleepPlan {
        self.enter(WakePhase::Booting);

        let retained = self.power.read_persistent_state();
        if let Some(state) = retained.filter(|s| s.remaining_chunks > 0) {
            return self.continue_quiet_period(state).await;
        }
        let pending = retained.is_some_and(|s| s.wake_target != 0);

        let reading = self.measure().await;

        self.enter(WakePhase::WifiConnecting);
        let now = match self.network.connect_wifi().await {
            Ok(()) => self.sync_time().await,
            Err(e) => {
                self.record(e);
                None
            }
        };

        match (reading, now) {
            (Some(reading), Some(_)) if reading.is_valid() => self.publish(&reading).await,
            (Some(_), Some(_)) => warn!("Reading out of range, not published"),
            (None, _) => warn!("No reading this wake, nothing to publish"),
            (Some(_), None) => warn!("Time unknown, reading not published"),
        }

        self.enter(WakePhase::Scheduling);
        self.schedule(now, pending)
    }

    /// Shut the network down and enter deep sleep for `plan`.
    pub async fn sleep(&mut self, plan: SleepPlan) {
        self.enter(WakePhase::Sleeping);
        info!("Sleep plan: {} s ({:?})", plan.seconds, plan.reason);
        self.power.deep_sleep(plan.seconds, &mut self.network).await;
    }

    async fn continue_quiet_period(&mut self, state: PersistentScheduleState) -> SleepPlan {
        self.enter(WakePhase::ChainedSleep);

        let wake_target = state.wake_target as u64;
        let remaining = state.remaining_chunks - 1;
        self.power.write_persistent_state(wake_target, remaining);

        if remaining > 0 {
            return SleepPlan {
                seconds: self.power.config().sleep_chunk_secs,
                reason: SleepReason::QuietChunk { remaining },
            };
        }

        // Last link: correct the clock so the wake lands on target.
        self.enter(WakePhase::WifiConnecting);
        let synced = match self.network.connect_wifi().await {
            Ok(()) => self.sync_time().await,
            Err(e) => {
                self.record(e);
                None
            }
        };
        let now = synced.unwrap_or_else(|| {
            warn!("Final quiet-hours chunk timed from the local clock");
            self.network.local_time()
        });

        let seconds = u32::try_from(wake_target.saturating_sub(now))
            .unwrap_or(u32::MAX)
            .max(1);
        info!("Final quiet-hours chunk: {} s until {}", seconds, wake_target);
        SleepPlan {
            seconds,
            reason: SleepReason::QuietFinal,
        }
    }

    /// Bus init, optional scan and one reading, with a single bus recovery
    /// and retry if the sensor cannot be reached.
    async fn measure(&mut self) -> Option<SensorReading> {
        self.enter(WakePhase::Measuring);
        self.sensors.bus_mut().init();

        if self.config.sensor.scan_on_boot {
            self.sensors.bus_mut().scan_bus().await;
        }

        let result = match self.acquire().await {
            Ok(reading) => Ok(reading),
            Err(e) => {
                warn!("Sensor acquisition failed: {}", e);
                self.record(e);
                if let Err(e) = self.sensors.bus_mut().recover() {
                    self.record(e);
                }
                self.acquire().await
            }
        };
        let voltage = self.sensors.read_battery_voltage();

        match result {
            Ok(mut reading) => {
                reading.voltage = voltage;
                Some(reading)
            }
            Err(e) => {
                error!("Sensor acquisition failed after bus recovery: {}", e);
                self.record(e);
                None
            }
        }
    }

    async fn acquire(&mut self) -> Result<SensorReading, SensorError> {
        self.sensors.init().await?;
        self.sensors.measure().await
    }

    async fn sync_time(&mut self) -> Option<u64> {
        self.enter(WakePhase::TimeSyncing);
        match self.network.sync_ntp().await {
            Ok(now) => Some(now),
            Err(e) => {
                self.record(e);
                None
            }
        }
    }

    async fn publish(&mut self, reading: &SensorReading) {
        self.enter(WakePhase::Publishing);
        let attempts = self.config.mqtt.publish_attempts.max(1);

        for attempt in 1..=attempts {
            match self.try_publish(reading).await {
                Ok(()) => return,
                Err(e) => {
                    warn!("Publish sequence {}/{} failed: {}", attempt, attempts, e);
                    self.record(e);
                }
            }
        }
        error!("Reading dropped after {} publish attempt(s)", attempts);
    }

    async fn try_publish(&mut self, reading: &SensorReading) -> Result<(), NetworkError> {
        self.network.connect_mqtt().await?;
        self.network
            .publish(
                reading.co2,
                reading.temperature,
                reading.humidity,
                reading.voltage,
            )
            .await
    }

    fn schedule(&mut self, now: Option<u64>, pending: bool) -> SleepPlan {
        let interval = self.power.config().measurement_interval_secs;

        let Some(now) = now else {
            warn!("Time unknown, quiet-hours check skipped");
            return SleepPlan {
                seconds: interval,
                reason: SleepReason::ClockUnavailable,
            };
        };

        if !self.power.in_quiet_hours(now) {
            if pending {
                self.power.clear_persistent_state();
            }
            return SleepPlan {
                seconds: interval,
                reason: SleepReason::Interval,
            };
        }

        let wake_target = self.power.calculate_wake_target(now);
        let plan = self.power.plan_quiet_period(now, wake_target);
        info!(
            "Quiet hours until {}: {} full chunk(s) then {} s",
            wake_target, plan.full_chunks, plan.final_secs
        );

        if plan.full_chunks == 0 {
            if pending {
                self.power.clear_persistent_state();
            }
            SleepPlan {
                seconds: plan.final_secs,
                reason: SleepReason::QuietFinal,
            }
        } else {
            self.power
                .write_persistent_state(wake_target, plan.full_chunks);
            SleepPlan {
                seconds: self.power.config().sleep_chunk_secs,
                reason: SleepReason::QuietChunk {
                    remaining: plan.full_chunks,
                },
            }
        }
    }

    fn enter(&mut self, phase: WakePhase) {
        if self.phase != phase {
            info!("Wake phase: {:?} -> {:?}", self.phase, phase);
        }
        self.phase = phase;
    }

    fn record(&mut self, fault: impl Into<CycleError>) {
        // Oldest faults are the interesting ones; later ones are dropped.
        let _ = self.faults.push(fault.into());
    }

    pub fn phase(&self) -> WakePhase {
        self.phase
    }

    /// Faults seen during this wake, in order.
    pub fn faults(&self) -> &[CycleError] {
        &self.faults
    }

    pub fn sensors(&self) -> &SensorManager<P, A> {
        &self.sensors
    }

    pub fn network(&self) -> &NetworkManager<'a, W, C, T> {
        &self.network
    }

    pub fn power(&self) -> &PowerManager<R, S> {
        &self.power
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimBusPort, SimScd41, World};
    use embassy_futures::block_on;

    // 2024-06-10 00:00:00 UTC
    const DAY_N: u64 = 1_717_977_600;

    fn config() -> NodeConfig<'static> {
        let mut config = NodeConfig::default();
        config.wifi.ssid = "lab";
        config.wifi.connect_timeout_ms = 200;
        config.wifi.poll_interval_ms = 20;
        config.time.sync_timeout_ms = 200;
        config.time.poll_interval_ms = 20;
        config.mqtt.connect_timeout_ms = 300;
        config.mqtt.retry_backoff_ms = 10;
        config.sensor.warmup_reads = 0;
        config.sensor.settle_delay_ms = 0;
        config.sensor.data_ready_timeout_ms = 200;
        config.sensor.data_ready_poll_ms = 20;
        config
    }

    fn healthy_port() -> SimBusPort {
        SimBusPort::with_sensor(SimScd41::new(812, 21.345, 40.1))
    }

    /// One boot: run the cycle, then sleep it (which advances the world).
    fn wake(world: &World, config: &NodeConfig<'static>, port: SimBusPort) -> SleepPlan {
        let mut cycle = world.boot(config, port);
        let plan = block_on(cycle.run());
        block_on(cycle.sleep(plan));
        plan
    }

    #[test]
    fn test_daytime_cycle_publishes_and_sleeps_interval() {
        let world = World::new(DAY_N + 10 * 3600);
        let config = config();

        let plan = wake(&world, &config, healthy_port());

        assert_eq!(
            plan,
            SleepPlan {
                seconds: 300,
                reason: SleepReason::Interval
            }
        );
        assert_eq!(world.published.borrow().len(), 1);
        // nothing was pending, so retained memory was not touched
        assert_eq!(world.retained_writes.get(), 0);
        assert_eq!(world.radio_down_at_sleep.get(), Some(true));
    }

    #[test]
    fn test_stuck_bus_is_recovered_and_reading_retried() {
        let world = World::new(DAY_N + 10 * 3600);
        let config = config();
        let mut cycle = world.boot(&config, healthy_port().wedged_for(3));

        let plan = block_on(cycle.run());

        assert_eq!(plan.reason, SleepReason::Interval);
        assert!(matches!(cycle.faults()[0], CycleError::Sensor(_)));
        assert_eq!(cycle.sensors().bus().port().lines().pulses(), 3);
        assert_eq!(world.published.borrow().len(), 1);
    }

    #[test]
    fn test_out_of_range_reading_is_not_published() {
        let world = World::new(DAY_N + 10 * 3600);
        let config = config();
        let port = SimBusPort::with_sensor(SimScd41::new(6000, 21.0, 40.0));

        let plan = wake(&world, &config, port);

        assert_eq!(plan.reason, SleepReason::Interval);
        assert!(world.published.borrow().is_empty());
        assert_eq!(world.broker_connects.get(), 0);
    }

    #[test]
    fn test_no_wifi_falls_back_to_interval() {
        let world = World::new(DAY_N + 22 * 3600);
        world.wifi_available.set(false);
        let config = config();

        let plan = wake(&world, &config, healthy_port());

        assert_eq!(
            plan,
            SleepPlan {
                seconds: 300,
                reason: SleepReason::ClockUnavailable
            }
        );
        assert!(world.published.borrow().is_empty());
        assert_eq!(world.retained_writes.get(), 0);
    }

    #[test]
    fn test_corrupt_retained_chain_is_ignored() {
        let world = World::new(DAY_N + 10 * 3600);
        let wake_target = (DAY_N + 86_400 + 7 * 3600 + 55 * 60) as u32;
        let mut state = PersistentScheduleState::sealed(wake_target, 5);
        state.checksum ^= 1;
        world.store_state(state);
        let config = config();

        let plan = wake(&world, &config, healthy_port());

        assert_eq!(
            plan,
            SleepPlan {
                seconds: 300,
                reason: SleepReason::Interval
            }
        );
        assert_eq!(world.published.borrow().len(), 1);
        assert!(world.ntp_requests.get() > 0);
        assert_eq!(world.retained_writes.get(), 0);
    }

    #[test]
    fn test_publish_sequence_retried_once() {
        let world = World::new(DAY_N + 10 * 3600);
        world.broker_refusals.set(1);
        let mut config = config();
        config.mqtt.max_connect_attempts = 1;

        wake(&world, &config, healthy_port());

        assert_eq!(world.broker_connects.get(), 2);
        assert_eq!(world.published.borrow().len(), 1);
    }

    #[test]
    fn test_quiet_hours_disabled_keeps_measuring() {
        let world = World::new(DAY_N + 22 * 3600);
        let mut config = config();
        config.quiet_hours.enabled = false;

        let plan = wake(&world, &config, healthy_port());

        assert_eq!(plan.reason, SleepReason::Interval);
    }

    #[test]
    fn test_overnight_chain_lands_on_wake_time() {
        let world = World::new(DAY_N + 16 * 3600);
        // sleep timer runs 0.02 % slow
        world.drift.set(0.0002);
        let config = config();
        let wake_target = DAY_N + 86_400 + 7 * 3600 + 55 * 60;

        let plan = wake(&world, &config, healthy_port());
        assert_eq!(
            plan,
            SleepPlan {
                seconds: 7200,
                reason: SleepReason::QuietChunk { remaining: 7 }
            }
        );
        assert_eq!(world.published.borrow().len(), 1);
        let ntp_after_entry = world.ntp_requests.get();

        let mut counters = std::vec![7];
        for expected in (1..=6).rev() {
            let writes = world.retained_writes.get();
            let plan = wake(&world, &config, healthy_port());
            assert_eq!(
                plan,
                SleepPlan {
                    seconds: 7200,
                    reason: SleepReason::QuietChunk {
                        remaining: expected
                    }
                }
            );
            assert_eq!(world.retained_writes.get(), writes + 1);
            counters.push(world.stored_state().remaining_chunks);
        }
        // chained wakes never touched the network
        assert_eq!(world.ntp_requests.get(), ntp_after_entry);

        let final_plan = wake(&world, &config, healthy_port());
        assert_eq!(final_plan.reason, SleepReason::QuietFinal);
        counters.push(world.stored_state().remaining_chunks);
        assert_eq!(counters, std::vec![7, 6, 5, 4, 3, 2, 1, 0]);
        assert!(world.ntp_requests.get() > ntp_after_entry);

        // 7 chunks of 2 h taken by a slow timer leave a bit under 1h55m
        let nominal_final = 3600 + 55 * 60;
        assert!(final_plan.seconds < nominal_final);
        assert!(final_plan.seconds > nominal_final - 10);

        let error = world.true_time.get().abs_diff(wake_target);
        let tolerance = (final_plan.seconds as f64 * 0.0002).ceil() as u64 + 1;
        assert!(error <= tolerance, "woke {} s off target", error);

        // back to the day schedule; the finished chain is cleared
        let plan = wake(&world, &config, healthy_port());
        assert_eq!(plan.reason, SleepReason::Interval);
        assert_eq!(world.stored_state(), PersistentScheduleState::sealed(0, 0));
        assert_eq!(world.published.borrow().len(), 2);
    }

    #[test]
    fn test_final_chunk_uses_local_clock_without_network() {
        let world = World::new(DAY_N + 6 * 3600);
        let wake_target = DAY_N + 7 * 3600 + 55 * 60;
        world.store_state(PersistentScheduleState::sealed(wake_target as u32, 1));
        world.wifi_available.set(false);
        world.rtc.set(DAY_N + 6 * 3600 + 60);
        let config = config();

        let plan = wake(&world, &config, healthy_port());

        assert_eq!(
            plan,
            SleepPlan {
                seconds: 3600 + 54 * 60,
                reason: SleepReason::QuietFinal
            }
        );
        assert_eq!(world.stored_state().remaining_chunks, 0);
    }
}
