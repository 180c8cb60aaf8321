use cognitiv_core::SleepController;
use esp_hal::rtc_cntl::Rtc;
use esp_hal::rtc_cntl::sleep::TimerWakeupSource;
use log::info;

use crate::clock::SharedRtc;

fn timer_wakeup(seconds: u32) -> TimerWakeupSource {
    TimerWakeupSource::new(core::time::Duration::from_secs(u64::from(seconds)))
}

/// RTC-timer deep sleep. The chip resets on wake and starts again in `main`.
pub struct EspSleeper {
    rtc: &'static SharedRtc,
}

impl EspSleeper {
    pub fn new(rtc: &'static SharedRtc) -> Self {
        Self { rtc }
    }
}

impl SleepController for EspSleeper {
    fn enter_deep_sleep(&mut self, seconds: u32) {
        let wakeup = timer_wakeup(seconds);
        info!("Deep sleep, timer wakeup in {} s", seconds);
        self.rtc
            .lock(|rtc| rtc.borrow_mut().sleep_deep(&[&wakeup]));
    }
}

/// Deep sleep from a context that no longer owns the RTC, such as the panic
/// handler.
///
/// # Safety
/// Nothing else may touch the RTC peripheral afterwards.
pub unsafe fn sleep_from_fault(seconds: u32) -> ! {
    let lpwr = unsafe { esp_hal::peripherals::LPWR::steal() };
    let wakeup = timer_wakeup(seconds);
    Rtc::new(lpwr).sleep_deep(&[&wakeup])
}
