use std::path::PathBuf;

use clap::{value_parser, Args, Parser, Subcommand};
use common::config::Config;
use common::types::{PinNumbering, ServoCalibration};

/// Drive LEDs over soft PWM and servos through a PCA9685
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// JSON configuration file, defaults are used for anything it leaves out
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Run against in-memory pins and registers instead of the hardware
    #[arg(long, global = true)]
    pub dry_run: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Control an LED on a soft PWM pin
    Led {
        #[command(flatten)]
        line: LineArgs,
        #[command(subcommand)]
        action: LedAction,
    },
    /// Point a servo on a PCA9685 channel
    Servo {
        #[command(flatten)]
        chip: ChipArgs,
        /// Count at 0°
        #[arg(long)]
        min_count: Option<u16>,
        /// Count at 180°
        #[arg(long)]
        max_count: Option<u16>,
        #[arg(short, long, value_parser = value_parser!(u8).range(..16))]
        channel: u8,
        /// Degrees, 0 to 180
        angle: f64,
    },
    /// Raw access to PCA9685 channels
    Pca {
        #[command(flatten)]
        chip: ChipArgs,
        #[command(subcommand)]
        action: PcaAction,
    },
    /// Look for PCA9685 chips without writing to anything
    Probe {
        /// Buses to search, comma separated
        #[arg(long, value_delimiter = ',')]
        bus: Vec<u8>,
        /// Addresses to search, comma separated
        #[arg(long, value_delimiter = ',', value_parser = parse_address)]
        address: Vec<u16>,
    },
    /// List the addresses answering on an I2C bus
    Scan {
        #[arg(long)]
        bus: Option<u8>,
    },
}

#[derive(Debug, Args)]
pub struct LineArgs {
    /// Pin the LED is wired to
    #[arg(short, long)]
    pub pin: Option<u8>,
    /// How `--pin` is interpreted: board or bcm
    #[arg(long)]
    pub numbering: Option<PinNumbering>,
    /// PWM frequency in Hz
    #[arg(short, long)]
    pub frequency: Option<f64>,
    /// Brightness cap in percent
    #[arg(long)]
    pub max_brightness: Option<f64>,
    /// The LED lights when the pin is low
    #[arg(long)]
    pub invert: bool,
}

#[derive(Debug, Subcommand)]
pub enum LedAction {
    /// Light the LED until interrupted
    On {
        #[arg(short, long)]
        brightness: Option<f64>,
    },
    /// Turn the LED off
    Off,
    /// Fade from dark to a brightness
    Fade {
        target: f64,
        /// Seconds
        #[arg(short, long, default_value_t = 1.0)]
        duration: f64,
        #[arg(long, default_value_t = 50)]
        steps: u32,
    },
    /// Flash the LED
    Blink {
        #[arg(short, long, default_value_t = 5)]
        times: u32,
        /// Seconds on and seconds off
        #[arg(short, long, default_value_t = 0.5)]
        interval: f64,
        #[arg(short, long)]
        brightness: Option<f64>,
    },
    /// Pulse the LED slowly until interrupted
    Breathe {
        /// Seconds per cycle
        #[arg(long, default_value_t = 2.0)]
        period: f64,
        #[arg(long, default_value_t = 0.0)]
        min: f64,
        #[arg(long)]
        max: Option<f64>,
    },
    /// Print the LED state as JSON
    Status,
    /// Interactive LED shell
    Shell,
}

#[derive(Debug, Args)]
pub struct ChipArgs {
    #[arg(long)]
    pub bus: Option<u8>,
    /// 7 bit address, decimal or 0x prefixed hex
    #[arg(long, value_parser = parse_address)]
    pub address: Option<u16>,
    /// PWM frequency in Hz
    #[arg(long)]
    pub frequency: Option<f64>,
}

#[derive(Debug, Subcommand)]
pub enum PcaAction {
    /// Write raw ON and OFF counts
    Set {
        #[arg(value_parser = value_parser!(u8).range(..16))]
        channel: u8,
        on: u16,
        off: u16,
    },
    /// Set a duty cycle in percent
    Duty {
        #[arg(value_parser = value_parser!(u8).range(..16))]
        channel: u8,
        percent: f64,
    },
    /// Turn one channel off, or all of them
    Off {
        #[arg(value_parser = value_parser!(u8).range(..16))]
        channel: Option<u8>,
    },
    /// Print a channel's ON and OFF counts
    Read {
        #[arg(value_parser = value_parser!(u8).range(..16))]
        channel: u8,
    },
}

pub fn parse_address(text: &str) -> Result<u16, String> {
    let address = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => text.parse(),
    }
    .map_err(|err| format!("Bad address {text:?}: {err}"))?;

    if address > 0x7F {
        return Err(format!("{address:#x} is not a 7 bit address"));
    }

    Ok(address)
}

impl LineArgs {
    pub fn apply(&self, config: &mut Config) {
        if let Some(pin) = self.pin {
            config.led.pin = pin;
        }
        if let Some(numbering) = self.numbering {
            config.numbering = numbering;
        }
        if let Some(frequency) = self.frequency {
            config.led.frequency = frequency;
        }
        if let Some(max_brightness) = self.max_brightness {
            config.led.max_brightness = max_brightness;
        }
        config.led.invert |= self.invert;
    }
}

impl ChipArgs {
    pub fn apply(&self, config: &mut Config) {
        if let Some(bus) = self.bus {
            config.pca.bus = bus;
        }
        if let Some(address) = self.address {
            config.pca.address = address;
        }
        if let Some(frequency) = self.frequency {
            config.pca.frequency = frequency;
        }
    }
}

/// Overrides one or both ends of the configured calibration
pub fn calibration(
    config: &Config,
    min_count: Option<u16>,
    max_count: Option<u16>,
) -> anyhow::Result<ServoCalibration> {
    let min_count = min_count.unwrap_or(config.servo.min_count());
    let max_count = max_count.unwrap_or(config.servo.max_count());

    Ok(ServoCalibration::new(min_count, max_count)?)
}
