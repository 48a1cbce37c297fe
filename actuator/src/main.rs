//! Command line tool for the LED and servo drivers

mod cli;
mod shell;

use std::process::ExitCode;
use std::time::Duration;

use actuator::error::BusError;
use actuator::gpio::{MockLine, OutputLine};
use actuator::led::Led;
use actuator::peripheral::mock::MockDevice;
use actuator::peripheral::pca9685::Pca9685;
use actuator::peripheral::probe::{self, Discovered, CANDIDATE_ADDRESSES, CANDIDATE_BUSES, SCAN_ADDRESSES};
use actuator::peripheral::Device;
use actuator::soft_pwm::SoftPwm;
use anyhow::{anyhow, Context};
use clap::Parser;
use common::config::Config;
use crossbeam::channel::{self, Receiver};
use tracing::{error, info, Level};

use crate::cli::{Cli, Command, LedAction, PcaAction};

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            // Help and version also arrive as errors
            return if err.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:?}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if cli.dry_run {
        info!("Dry run, no hardware will be touched");
    }

    match cli.command {
        Command::Led { line, action } => {
            line.apply(&mut config);
            config.validate()?;

            let stop = stop_channel()?;
            let led = &config.led;
            if cli.dry_run {
                let bcm = config.numbering.to_bcm(led.pin).ok_or_else(|| {
                    anyhow!("{} pin {} is not a GPIO line", config.numbering, led.pin)
                })?;
                let pwm = SoftPwm::new(MockLine::new(bcm), led.frequency, led.invert)?;
                run_led(pwm, &config, action, &stop)
            } else {
                let pwm = SoftPwm::open(config.numbering, led.pin, led.frequency, led.invert)
                    .context("Open LED pin")?;
                run_led(pwm, &config, action, &stop)
            }
        }
        Command::Servo {
            chip,
            min_count,
            max_count,
            channel,
            angle,
        } => {
            chip.apply(&mut config);
            config.validate()?;
            let calibration = cli::calibration(&config, min_count, max_count)?;

            if cli.dry_run {
                let pca = Pca9685::new(MockDevice::pca9685(), config.pca.address);
                run_servo(pca.with_calibration(calibration), &config, channel, angle)
            } else {
                let pca = Pca9685::open(config.pca.bus, config.pca.address).context("Open PCA9685")?;
                run_servo(pca.with_calibration(calibration), &config, channel, angle)
            }
        }
        Command::Pca { chip, action } => {
            chip.apply(&mut config);
            config.validate()?;

            if cli.dry_run {
                run_pca(Pca9685::new(MockDevice::pca9685(), config.pca.address), &config, action)
            } else {
                let pca = Pca9685::open(config.pca.bus, config.pca.address).context("Open PCA9685")?;
                run_pca(pca, &config, action)
            }
        }
        Command::Probe { bus, address } => {
            let buses = if bus.is_empty() {
                CANDIDATE_BUSES.to_vec()
            } else {
                bus
            };
            let addresses = if address.is_empty() {
                CANDIDATE_ADDRESSES.collect()
            } else {
                address
            };

            let found = if cli.dry_run {
                let pca = (config.pca.bus, config.pca.address);
                probe::discover_with(&buses, &addresses, |bus, address| {
                    if (bus, address) == pca {
                        Ok(MockDevice::pca9685())
                    } else {
                        Err(BusError::NotAcknowledged)
                    }
                })
            } else {
                probe::discover(&buses, &addresses)
            };
            print_discovered(&found);

            Ok(())
        }
        Command::Scan { bus } => {
            let bus = bus.unwrap_or(config.pca.bus);
            let found = if cli.dry_run {
                probe::scan_with(SCAN_ADDRESSES, |address| address == config.pca.address)
            } else {
                probe::scan_bus(bus).context("Scan")?
            };

            println!("{} devices on bus {bus}", found.len());
            for address in found {
                let hint = probe::device_hint(address).unwrap_or("unknown");
                println!("  {address:#04x}  {hint}");
            }

            Ok(())
        }
    }
}

/// Fires once on Ctrl-C
fn stop_channel() -> anyhow::Result<Receiver<()>> {
    let (tx, rx) = channel::bounded(1);
    ctrlc::set_handler(move || {
        let _ = tx.try_send(());
    })
    .context("Set ctrl-c")?;

    Ok(rx)
}

fn seconds(secs: f64) -> anyhow::Result<Duration> {
    Duration::try_from_secs_f64(secs).with_context(|| format!("{secs} is not a duration"))
}

/// Blocks until the animation ends, cutting it short on Ctrl-C
fn wait_for_animation<P: OutputLine>(led: &Led<P>, stop: &Receiver<()>) {
    while led.is_animating() {
        if stop.recv_timeout(Duration::from_millis(50)).is_ok() {
            led.stop_animation();
            break;
        }
    }
}

fn run_led<P: OutputLine>(
    pwm: SoftPwm<P>,
    config: &Config,
    action: LedAction,
    stop: &Receiver<()>,
) -> anyhow::Result<()> {
    let led = Led::new(pwm.with_stop_timeout(config.stop_timeout()), config.led.max_brightness)?;

    let ret = led_action(&led, action, stop);
    led.cleanup().context("Clean up LED")?;

    ret
}

fn led_action<P: OutputLine>(
    led: &Led<P>,
    action: LedAction,
    stop: &Receiver<()>,
) -> anyhow::Result<()> {
    match action {
        LedAction::On { brightness } => {
            led.on(brightness)?;
            println!("LED on at {}%, Ctrl-C to turn it off", led.brightness());
            let _ = stop.recv();
        }
        LedAction::Off => {
            led.off()?;
            println!("LED off");
        }
        LedAction::Fade {
            target,
            duration,
            steps,
        } => {
            led.on(Some(0.0))?;
            led.fade_to(target, seconds(duration)?, steps)?;
            wait_for_animation(led, stop);
            println!("Faded to {}%", led.brightness());
        }
        LedAction::Blink {
            times,
            interval,
            brightness,
        } => {
            let interval = seconds(interval)?;
            led.blink(times, interval, interval, brightness)?;
            wait_for_animation(led, stop);
        }
        LedAction::Breathe { period, min, max } => {
            led.breathe(seconds(period)?, min, max)?;
            println!("Breathing, Ctrl-C to stop");
            let _ = stop.recv();
        }
        LedAction::Status => println!("{}", serde_json::to_string_pretty(&led.status())?),
        LedAction::Shell => shell::run(led, stop)?,
    }

    Ok(())
}

fn run_servo<D: Device>(pca: Pca9685<D>, config: &Config, channel: u8, angle: f64) -> anyhow::Result<()> {
    pca.initialize(config.pca.frequency)
        .context("Initialize PCA9685")?;
    let count = pca.set_servo_angle(channel, angle)?;
    println!("Channel {channel} at {angle}° (OFF count {count})");

    Ok(())
}

fn run_pca<D: Device>(pca: Pca9685<D>, config: &Config, action: PcaAction) -> anyhow::Result<()> {
    if let PcaAction::Read { channel } = action {
        let (on, off) = pca.read_channel(channel)?;
        println!("Channel {channel}: ON {on} OFF {off}");
        return Ok(());
    }

    let prescale = pca
        .initialize(config.pca.frequency)
        .context("Initialize PCA9685")?;
    info!("Prescale {prescale}");

    match action {
        PcaAction::Set { channel, on, off } => {
            pca.set_channel(channel, on, off)?;
            println!("Channel {channel}: ON {on} OFF {off}");
        }
        PcaAction::Duty { channel, percent } => {
            let count = pca.set_duty_cycle(channel, percent)?;
            println!("Channel {channel} at {percent}% (OFF count {count})");
        }
        PcaAction::Off { channel: Some(channel) } => {
            pca.turn_off(channel)?;
            println!("Channel {channel} off");
        }
        PcaAction::Off { channel: None } => {
            pca.turn_off_all()?;
            println!("All channels off");
        }
        PcaAction::Read { .. } => {}
    }

    Ok(())
}

fn print_discovered(found: &[Discovered]) {
    if found.is_empty() {
        println!("No PCA9685 found");
        return;
    }

    for Discovered {
        bus,
        address,
        report,
    } in found
    {
        print!(
            "Bus {bus} address {address:#04x}: MODE1 {:#04x} MODE2 {:#04x} PRE_SCALE {} ({:.1}Hz)",
            report.mode1,
            report.mode2,
            report.prescale,
            report.frequency()
        );
        match report.allcall {
            Some(allcall) => println!(" ALLCALLADR {allcall:#04x}"),
            None => println!(),
        }
    }
}
