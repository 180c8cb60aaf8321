#![no_std]
#![no_main]
#![deny(
    clippy::mem_forget,
    reason = "mem::forget is generally not safe to do with esp_hal types, especially those \
    holding buffers for the duration of a data transfer."
)]
#![deny(clippy::large_stack_frames)]

use core::cell::RefCell;

use cognitiv_core::config::DEFAULT_MEASUREMENT_INTERVAL_SECS;
use cognitiv_core::{
    BusManager, NetworkManager, PowerManager, SensorManager, SleepController, WakeCycle,
};
use cognitiv_firmware::battery::EspBatteryAdc;
use cognitiv_firmware::bus::EspBusPort;
use cognitiv_firmware::clock::{EspClock, SharedRtc};
use cognitiv_firmware::radio::EspWifiRadio;
use cognitiv_firmware::retained::RtcRetained;
use cognitiv_firmware::settings;
use cognitiv_firmware::sleep::{self, EspSleeper};
use cognitiv_firmware::transport::{EspMqttTransport, HwRng};
use embassy_executor::Spawner;
use embassy_futures::select::select;
use embassy_net::StackResources;
use embassy_sync::blocking_mutex::Mutex;
use esp_hal::clock::CpuClock;
use esp_hal::rtc_cntl::{Rtc, reset_reason, wakeup_cause};
use esp_hal::system::Cpu;
use esp_hal::timer::timg::TimerGroup;
use log::{error, info};
use rand_core::RngCore;
use static_cell::StaticCell;

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    rtt_target::rprintln!("PANIC: {}", info);
    // SAFETY: nothing runs after the panic handler.
    unsafe { sleep::sleep_from_fault(DEFAULT_MEASUREMENT_INTERVAL_SECS) }
}

extern crate alloc;

// This creates a default app-descriptor required by the esp-idf bootloader.
// For more information see: <https://docs.espressif.com/projects/esp-idf/en/stable/esp32/api-reference/system/app_image_format.html#application-description>
esp_bootloader_esp_idf::esp_app_desc!();

static RADIO: StaticCell<esp_radio::Controller<'static>> = StaticCell::new();
static NET_RESOURCES: StaticCell<StackResources<4>> = StaticCell::new();
static RTC: StaticCell<SharedRtc> = StaticCell::new();

#[allow(
    clippy::large_stack_frames,
    reason = "it's not unusual to allocate larger buffers etc. in main"
)]
#[esp_rtos::main]
async fn main(_spawner: Spawner) -> ! {
    rtt_target::rtt_init_log!();

    let config = esp_hal::Config::default().with_cpu_clock(CpuClock::max());
    let peripherals = esp_hal::init(config);

    esp_alloc::heap_allocator!(#[esp_hal::ram(reclaimed)] size: 73744);

    let timg0 = TimerGroup::new(peripherals.TIMG0);
    esp_rtos::start(timg0.timer0);

    info!(
        "cognitiv node up: reset {:?}, wakeup {:?}",
        reset_reason(Cpu::ProCpu),
        wakeup_cause()
    );

    let node = settings::node_config();
    let rtc: &'static SharedRtc = RTC.init(Mutex::new(RefCell::new(Rtc::new(peripherals.LPWR))));

    let interval = node.power.measurement_interval_secs;
    let radio = match esp_radio::init() {
        Ok(radio) => RADIO.init(radio),
        Err(e) => {
            error!("Radio init failed: {:?}", e);
            sleep_and_retry(rtc, interval)
        }
    };
    let (controller, interfaces) =
        match esp_radio::wifi::new(radio, peripherals.WIFI, Default::default()) {
            Ok(wifi) => wifi,
            Err(e) => {
                error!("Wi-Fi controller init failed: {:?}", e);
                sleep_and_retry(rtc, interval)
            }
        };
    let mac = interfaces.sta.mac_address();

    let mut rng = HwRng::default();
    let seed = rng.next_u64();
    let (stack, mut net_runner) = embassy_net::new(
        interfaces.sta,
        embassy_net::Config::dhcpv4(Default::default()),
        NET_RESOURCES.init(StackResources::new()),
        seed,
    );

    let port = EspBusPort::new(peripherals.I2C0, peripherals.GPIO12, peripherals.GPIO11);
    let sensors = SensorManager::new(
        BusManager::new(port),
        EspBatteryAdc::new(peripherals.ADC1, peripherals.GPIO1),
        node.sensor,
        node.battery,
    );
    let network = NetworkManager::new(
        EspWifiRadio::new(controller, stack, mac),
        EspClock::new(rtc, stack),
        EspMqttTransport::new(stack, rng, &node.mqtt),
        &node,
    );
    // SAFETY: the only handle on the retained region this boot.
    let retained = unsafe { RtcRetained::take() };
    let power = PowerManager::new(
        retained,
        EspSleeper::new(rtc),
        node.power,
        node.quiet_hours,
        node.time.local_offset_secs(),
    );

    let mut cycle = WakeCycle::new(sensors, network, power, &node);
    let wake = async {
        let plan = cycle.run().await;
        cycle.sleep(plan).await;
    };
    select(net_runner.run(), wake).await;

    error!("Deep sleep returned, resetting");
    esp_hal::system::software_reset()
}

/// Skip this wake entirely and try again after `seconds`.
fn sleep_and_retry(rtc: &'static SharedRtc, seconds: u32) -> ! {
    EspSleeper::new(rtc).enter_deep_sleep(seconds);
    esp_hal::system::software_reset()
}
