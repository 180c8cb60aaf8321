//! Desktop simulator for the cognitiv CO2 sensor node.
//!
//! Boots the node's wake cycle over and over against simulated hardware from
//! `cognitiv-core`. Every deep sleep advances a virtual clock instead of
//! waiting, so days of operation (quiet-hour chains included) run in a few
//! seconds. One line is printed per boot:
//!
//! ```text
//! boot  local  slept    reason                  outcome
//!    0  12:00     300 s  interval                published
//!  ...
//!  106  21:05    7200 s  quiet chunk, 7 left     -
//! ```
//!
//! Set `RUST_LOG=info` to see the node's own log alongside the table.

use std::fs;
use std::ops::RangeInclusive;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::Parser;
use cognitiv_core::config::NodeConfig;
use cognitiv_core::power::local_time_of_day;
use cognitiv_core::sim::{SimBusPort, SimScd41, World};
use cognitiv_core::{SleepPlan, SleepReason};
use embassy_futures::block_on;
use log::info;

/// 2024-06-10 12:00:00 UTC
const DEFAULT_START: u64 = 1_718_020_800;

/// Clock pulses a wedged sensor needs before it lets go of SDA.
const WEDGE_PULSES: u8 = 3;

#[derive(Parser, Debug)]
#[command(version, about = "Run the cognitiv wake cycle against simulated hardware")]
struct Args {
    /// Number of boots to simulate.
    #[arg(short, long, default_value_t = 400)]
    cycles: u32,

    /// True Unix time of the first boot.
    #[arg(long, default_value_t = DEFAULT_START)]
    start: u64,

    /// Fractional error of the sleep timer; 0.0002 makes every sleep 200 ppm long.
    #[arg(long, default_value_t = 0.0)]
    drift: f64,

    /// NodeConfig as JSON. Built-in defaults are used when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Keep the sensor's real warm-up and settle delays.
    #[arg(long)]
    real_delays: bool,

    /// Every Nth boot the sensor starts out holding SDA low.
    #[arg(long)]
    wedge_every: Option<u32>,

    /// Boots during which the access point is unreachable, as FIRST..LAST.
    #[arg(long, value_parser = parse_boot_range)]
    wifi_outage: Option<RangeInclusive<u32>>,
}

fn parse_boot_range(s: &str) -> Result<RangeInclusive<u32>> {
    let Some((first, last)) = s.split_once("..") else {
        bail!("expected FIRST..LAST, got {s:?}");
    };
    let first: u32 = first.parse().context("bad first boot")?;
    let last: u32 = last.parse().context("bad last boot")?;
    if last < first {
        bail!("range {first}..{last} is empty");
    }
    Ok(first..=last)
}

/// Defaults with an access point name and every wait shortened to what the
/// simulated hardware needs.
fn default_config(real_delays: bool) -> NodeConfig<'static> {
    let mut config = NodeConfig::default();
    config.wifi.ssid = "sim-ap";
    config.mqtt.broker_host = "broker.sim";

    if !real_delays {
        config.wifi.poll_interval_ms = 1;
        config.time.poll_interval_ms = 1;
        config.mqtt.retry_backoff_ms = 1;
        config.sensor.warmup_delay_ms = 0;
        config.sensor.settle_delay_ms = 0;
        config.sensor.data_ready_poll_ms = 1;
    }
    config
}

/// Synthetic room air: CO2 rises through the working day and falls overnight.
fn sensor_at(unix: u64, local_offset_secs: i64) -> SimScd41 {
    let (hour, minute) = local_time_of_day(unix, local_offset_secs);
    let t = f64::from(hour) + f64::from(minute) / 60.0;
    let phase = (t - 9.0) / 24.0 * std::f64::consts::TAU;

    let co2 = 700.0 + 300.0 * phase.sin();
    let temperature = 22.0 + 2.0 * phase.sin();
    let humidity = 45.0 - 5.0 * phase.sin();
    SimScd41::new(co2.round() as u16, temperature as f32, humidity as f32)
}

fn describe(plan: &SleepPlan) -> String {
    match plan.reason {
        SleepReason::Interval => "interval".to_string(),
        SleepReason::QuietChunk { remaining } => format!("quiet chunk, {remaining} left"),
        SleepReason::QuietFinal => "quiet final".to_string(),
        SleepReason::ClockUnavailable => "clock unavailable".to_string(),
    }
}

#[derive(Default)]
struct Tally {
    published: u32,
    faulted: u32,
    quiet_boots: u32,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .format_timestamp_millis()
        .init();
    let args = Args::parse();

    let config_text;
    let config = match &args.config {
        Some(path) => {
            config_text = fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str::<NodeConfig<'_>>(&config_text)
                .with_context(|| format!("parsing {}", path.display()))?
        }
        None => default_config(args.real_delays),
    };
    let offset = config.time.local_offset_secs();

    info!(
        "Simulating {} boots from {} (drift {})",
        args.cycles, args.start, args.drift
    );

    let world = World::new(args.start);
    world.drift.set(args.drift);

    let mut tally = Tally::default();
    println!("boot  local  slept    reason                  outcome");

    for boot in 0..args.cycles {
        let outage = args
            .wifi_outage
            .as_ref()
            .is_some_and(|range| range.contains(&boot));
        world.wifi_available.set(!outage);

        let woke_at = world.true_time.get();
        let mut port = SimBusPort::with_sensor(sensor_at(woke_at, offset));
        if args.wedge_every.is_some_and(|n| n > 0 && boot % n == 0) {
            port = port.wedged_for(WEDGE_PULSES);
        }

        let published_before = world.published.borrow().len();
        let mut cycle = world.boot(&config, port);
        let plan = block_on(cycle.run());
        let faults = cycle.faults().len();
        block_on(cycle.sleep(plan));
        drop(cycle);

        let published = world.published.borrow().len() > published_before;
        tally.published += u32::from(published);
        tally.faulted += u32::from(faults > 0);
        if matches!(
            plan.reason,
            SleepReason::QuietChunk { .. } | SleepReason::QuietFinal
        ) {
            tally.quiet_boots += 1;
        }

        let (hour, minute) = local_time_of_day(woke_at, offset);
        let outcome = match (published, faults) {
            (true, 0) => "published".to_string(),
            (true, n) => format!("published, {n} fault(s)"),
            (false, 0) => "-".to_string(),
            (false, n) => format!("{n} fault(s)"),
        };
        println!(
            "{:>4}  {:02}:{:02}  {:>6} s  {:<22}  {}",
            boot,
            hour,
            minute,
            plan.seconds,
            describe(&plan),
            outcome
        );
    }

    let span = world.true_time.get() - args.start;
    let clock_error = world.rtc.get() as i64 - world.true_time.get() as i64;
    println!();
    println!(
        "{} boots over {:.1} h: {} published, {} in quiet hours, {} with faults",
        args.cycles,
        span as f64 / 3600.0,
        tally.published,
        tally.quiet_boots,
        tally.faulted
    );
    println!(
        "retained memory written {} time(s), device clock off by {} s at the end",
        world.retained_writes.get(),
        clock_error
    );
    Ok(())
}
