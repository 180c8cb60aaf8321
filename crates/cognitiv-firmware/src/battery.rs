use cognitiv_core::BatteryAdc;
use esp_hal::Blocking;
use esp_hal::analog::adc::{Adc, AdcConfig, AdcPin, Attenuation};
use esp_hal::peripherals::{ADC1, GPIO1};
use log::warn;

/// Conversions polled before a sample is given up on.
const MAX_POLLS: u32 = 10_000;

type BatteryPin = AdcPin<GPIO1<'static>, ADC1<'static>>;

/// Divided battery voltage on GPIO1 (ADC1 channel 0), full 0-3.3 V range.
pub struct EspBatteryAdc {
    adc: Adc<'static, ADC1<'static>, Blocking>,
    pin: BatteryPin,
}

impl EspBatteryAdc {
    pub fn new(adc1: ADC1<'static>, gpio: GPIO1<'static>) -> Self {
        let mut config = AdcConfig::new();
        let pin = config.enable_pin(gpio, Attenuation::_11dB);
        let adc = Adc::new(adc1, config);
        Self { adc, pin }
    }
}

impl BatteryAdc for EspBatteryAdc {
    fn read_raw(&mut self) -> u16 {
        for _ in 0..MAX_POLLS {
            if let Ok(raw) = self.adc.read_oneshot(&mut self.pin) {
                return raw;
            }
        }
        warn!("Battery ADC conversion did not complete");
        0
    }
}
