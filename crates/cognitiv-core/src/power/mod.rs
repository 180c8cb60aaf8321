//! Sleep scheduling and the reset-surviving schedule record
//!
//! The RTC timer only covers a few hours per deep sleep while the quiet
//! window is most of a day, so a quiet period is slept as a chain of fixed
//! chunks. The chain position lives in [`PersistentScheduleState`]; the last
//! link re-synchronizes network time before sleeping to the wake target.

pub mod schedule;
pub mod state;

use log::{info, warn};

use crate::config::{PowerConfig, QuietHours};
use crate::network::{MqttTransport, NetworkManager, TimeSource, WifiRadio};
pub use schedule::{ChunkPlan, calculate_wake_target, is_quiet_hours, local_time_of_day, plan_chunks};
pub use state::{PersistentScheduleState, STATE_WORDS, StateError, crc32};

/// Memory that keeps its contents through deep sleep.
pub trait RetainedStore {
    fn load(&self) -> [u32; STATE_WORDS];
    fn store(&mut self, words: [u32; STATE_WORDS]);
}

/// Hardware low-power state. On the device `enter_deep_sleep` does not
/// return: the chip reboots when the timer expires.
pub trait SleepController {
    fn enter_deep_sleep(&mut self, seconds: u32);
}

pub struct PowerManager<R, S> {
    store: R,
    sleeper: S,
    config: PowerConfig,
    quiet: QuietHours,
    local_offset_secs: i64,
}

impl<R: RetainedStore, S: SleepController> PowerManager<R, S> {
    pub fn new(
        store: R,
        sleeper: S,
        config: PowerConfig,
        quiet: QuietHours,
        local_offset_secs: i64,
    ) -> Self {
        Self {
            store,
            sleeper,
            config,
            quiet,
            local_offset_secs,
        }
    }

    /// The retained record, if it carries our marker and a matching checksum.
    pub fn read_persistent_state(&self) -> Option<PersistentScheduleState> {
        let state = PersistentScheduleState::from_words(self.store.load());
        match state.validate() {
            Ok(()) => {
                info!(
                    "Retained state: wake target {}, {} chunk(s) remaining",
                    state.wake_target, state.remaining_chunks
                );
                Some(state)
            }
            Err(e) => {
                info!("No usable retained state: {}", e);
                None
            }
        }
    }

    pub fn write_persistent_state(&mut self, wake_target: u64, remaining_chunks: u32) {
        let wake_target = u32::try_from(wake_target).unwrap_or(u32::MAX);
        let state = PersistentScheduleState::sealed(wake_target, remaining_chunks);
        self.store.store(state.to_words());
        info!(
            "Retained state written: wake target {}, {} chunk(s) remaining",
            wake_target, remaining_chunks
        );
    }

    /// Reset to "no quiet period pending".
    pub fn clear_persistent_state(&mut self) {
        self.store
            .store(PersistentScheduleState::sealed(0, 0).to_words());
        info!("Retained state cleared");
    }

    /// Quiet-window test against the configured window, at Unix time `now`.
    pub fn in_quiet_hours(&self, now: u64) -> bool {
        if !self.quiet.enabled {
            return false;
        }
        let (hour, minute) = local_time_of_day(now, self.local_offset_secs);
        is_quiet_hours(
            hour,
            minute,
            self.quiet.start_hour,
            self.quiet.start_minute,
            self.quiet.wake_hour,
            self.quiet.wake_minute,
        )
    }

    /// End of the quiet period that `now` is in.
    pub fn calculate_wake_target(&self, now: u64) -> u64 {
        calculate_wake_target(
            now,
            self.local_offset_secs,
            self.quiet.wake_hour,
            self.quiet.wake_minute,
        )
    }

    pub fn plan_quiet_period(&self, now: u64, wake_target: u64) -> ChunkPlan {
        let remaining = u32::try_from(wake_target.saturating_sub(now)).unwrap_or(u32::MAX);
        plan_chunks(remaining, self.config.sleep_chunk_secs)
    }

    /// Duration actually slept for a request: zero means the standard
    /// interval, and nothing exceeds the hardware maximum.
    pub fn effective_sleep_secs(&self, seconds: u32) -> u32 {
        let seconds = if seconds == 0 {
            self.config.measurement_interval_secs
        } else {
            seconds
        };
        if seconds > self.config.max_sleep_secs {
            warn!(
                "Requested sleep of {} s clamped to {} s",
                seconds, self.config.max_sleep_secs
            );
            self.config.max_sleep_secs
        } else {
            seconds
        }
    }

    /// Shut the network down and enter deep sleep.
    ///
    /// The radio is always off before the low-power state is entered. On the
    /// device this never returns.
    pub async fn deep_sleep<W, C, T>(
        &mut self,
        seconds: u32,
        network: &mut NetworkManager<'_, W, C, T>,
    ) where
        W: WifiRadio,
        C: TimeSource,
        T: MqttTransport,
    {
        let seconds = self.effective_sleep_secs(seconds);
        network.shutdown_wifi().await;
        info!("Entering deep sleep for {} s", seconds);
        self.sleeper.enter_deep_sleep(seconds);
    }

    pub async fn deep_sleep_normal<W, C, T>(&mut self, network: &mut NetworkManager<'_, W, C, T>)
    where
        W: WifiRadio,
        C: TimeSource,
        T: MqttTransport,
    {
        self.deep_sleep(self.config.measurement_interval_secs, network)
            .await;
    }

    pub fn config(&self) -> &PowerConfig {
        &self.config
    }

    pub fn store(&self) -> &R {
        &self.store
    }

    pub fn sleeper(&self) -> &S {
        &self.sleeper
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::sim::{SimBroker, SimClock, SimRadio, SimRetained, SimSleeper, World};
    use embassy_futures::block_on;

    fn power(world: &World) -> PowerManager<SimRetained<'_>, SimSleeper<'_>> {
        PowerManager::new(
            SimRetained::new(world),
            SimSleeper::new(world),
            PowerConfig::default(),
            QuietHours::default(),
            0,
        )
    }

    #[test]
    fn test_unwritten_memory_reads_as_absent() {
        let world = World::new(1_718_000_000);
        world.retained.set([0xDEAD_BEEF, 0x1234_5678, 42, 7]);
        let power = power(&world);

        assert_eq!(power.read_persistent_state(), None);
    }

    #[test]
    fn test_state_survives_round_trip_through_retained_memory() {
        let world = World::new(1_718_000_000);
        let mut power = power(&world);

        power.write_persistent_state(1_718_092_500, 7);
        let state = power.read_persistent_state().unwrap();
        assert_eq!(state.wake_target, 1_718_092_500);
        assert_eq!(state.remaining_chunks, 7);

        power.clear_persistent_state();
        let state = power.read_persistent_state().unwrap();
        assert_eq!(state.remaining_chunks, 0);
    }

    #[test]
    fn test_quiet_hours_disabled() {
        let world = World::new(1_718_000_000);
        let power = PowerManager::new(
            SimRetained::new(&world),
            SimSleeper::new(&world),
            PowerConfig::default(),
            QuietHours {
                enabled: false,
                ..QuietHours::default()
            },
            0,
        );
        // 2024-06-10 22:00 UTC
        assert!(!power.in_quiet_hours(1_717_977_600 + 22 * 3600));
    }

    #[test]
    fn test_sleep_duration_rules() {
        let world = World::new(1_718_000_000);
        let power = power(&world);

        assert_eq!(power.effective_sleep_secs(0), 300);
        assert_eq!(power.effective_sleep_secs(120), 120);
        assert_eq!(power.effective_sleep_secs(24 * 3600), 3 * 3600);
    }

    #[test]
    fn test_deep_sleep_shuts_radio_down_first() {
        let world = World::new(1_718_000_000);
        let mut power = power(&world);
        let mut network = NetworkManager::new(
            SimRadio::new(&world),
            SimClock::new(&world),
            SimBroker::new(&world),
            &NodeConfig::default(),
        );

        block_on(power.deep_sleep(0, &mut network));

        assert_eq!(world.slept.borrow().as_slice(), &[300]);
        assert_eq!(world.radio_down_at_sleep.get(), Some(true));
    }

    #[test]
    fn test_deep_sleep_entered_when_radio_stop_hangs() {
        let world = World::new(1_718_000_000);
        let mut power = power(&world);
        let mut config = NodeConfig::default();
        config.wifi.shutdown_timeout_ms = 100;
        let mut network = NetworkManager::new(
            SimRadio::new(&world),
            SimClock::new(&world),
            SimBroker::new(&world),
            &config,
        );
        world.radio_powered_down.set(false);
        world.radio_hangs.set(true);

        let started = std::time::Instant::now();
        block_on(power.deep_sleep(0, &mut network));

        assert!(started.elapsed() < std::time::Duration::from_millis(100 + 150));
        assert_eq!(world.slept.borrow().as_slice(), &[300]);
        assert_eq!(world.radio_down_at_sleep.get(), Some(false));
    }
}
