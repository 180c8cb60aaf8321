use cognitiv_core::RetainedStore;
use cognitiv_core::power::STATE_WORDS;

/// Schedule record in RTC fast memory. `persistent` leaves it uninitialized on
/// boot, so a deep-sleep wake sees what the previous boot wrote and a cold
/// boot sees garbage that fails validation.
#[esp_hal::ram(unstable(rtc_fast, persistent))]
static mut SCHEDULE_WORDS: [u32; STATE_WORDS] = [0; STATE_WORDS];

/// Only one instance may exist; it is the sole accessor of the region.
pub struct RtcRetained {
    _private: (),
}

impl RtcRetained {
    /// # Safety
    /// Must be called at most once per boot.
    pub unsafe fn take() -> Self {
        Self { _private: () }
    }
}

impl RetainedStore for RtcRetained {
    fn load(&self) -> [u32; STATE_WORDS] {
        critical_section::with(|_| unsafe {
            core::ptr::read_volatile(core::ptr::addr_of!(SCHEDULE_WORDS))
        })
    }

    fn store(&mut self, words: [u32; STATE_WORDS]) {
        critical_section::with(|_| unsafe {
            core::ptr::write_volatile(core::ptr::addr_of_mut!(SCHEDULE_WORDS), words);
        });
    }
}
