//! Driver for the PCA9685 16 channel, 12 bit PWM controller.
//!
//! Every channel counts through a 4096 step period shared by the whole chip. The output goes
//! high at the channel's ON count and low at its OFF count.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use bitflags::bitflags;
use common::types::{ServoCalibration, MAX_COUNT, PWM_STEPS};
use serde::Serialize;
use tracing::{debug, info, trace};

use crate::error::{Error, Result};
use crate::peripheral::{Device, I2cDevice};

pub const OSCILLATOR_HZ: f64 = 25_000_000.0;
pub const CHANNELS: u8 = 16;
pub const PRESCALE_MIN: u8 = 3;
pub const PRESCALE_MAX: u8 = 255;
pub const DEFAULT_ADDRESS: u16 = 0x40;
pub const DEFAULT_BUS: u8 = 7;
/// Set in an ON_H or OFF_H register to hold the output fully on or off
pub const FULL_BIT: u8 = 0x10;
/// Time the oscillator needs after leaving sleep before a restart
pub const OSCILLATOR_SETTLE: Duration = Duration::from_millis(5);

pub mod register {
    pub const MODE1: u8 = 0x00;
    pub const MODE2: u8 = 0x01;
    pub const SUBADR1: u8 = 0x02;
    pub const SUBADR2: u8 = 0x03;
    pub const SUBADR3: u8 = 0x04;
    pub const ALLCALLADR: u8 = 0x05;
    pub const LED0_ON_L: u8 = 0x06;
    pub const ALL_LED_ON_L: u8 = 0xFA;
    pub const ALL_LED_ON_H: u8 = 0xFB;
    pub const ALL_LED_OFF_L: u8 = 0xFC;
    pub const ALL_LED_OFF_H: u8 = 0xFD;
    pub const PRE_SCALE: u8 = 0xFE;

    /// LEDn_ON_L, the first of the channel's four registers
    pub const fn led_base(channel: u8) -> u8 {
        LED0_ON_L + 4 * channel
    }
}

bitflags! {
    pub struct Mode1: u8 {
        const RESTART = 0x80;
        const EXTCLK  = 0x40;
        const AI      = 0x20;
        const SLEEP   = 0x10;
        const SUB1    = 0x08;
        const SUB2    = 0x04;
        const SUB3    = 0x02;
        const ALLCALL = 0x01;
    }
}

bitflags! {
    pub struct Mode2: u8 {
        const INVRT  = 0x10;
        const OCH    = 0x08;
        const OUTDRV = 0x04;
        const OUTNE1 = 0x02;
        const OUTNE0 = 0x01;
    }
}

/// Prescaler value giving the PWM frequency closest to `frequency`
pub fn prescale_for(frequency: f64) -> u8 {
    let prescale = (OSCILLATOR_HZ / (PWM_STEPS as f64 * frequency)).round() - 1.0;
    prescale.clamp(PRESCALE_MIN as f64, PRESCALE_MAX as f64) as u8
}

/// PWM frequency the chip produces with `prescale` loaded
pub fn frequency_for(prescale: u8) -> f64 {
    OSCILLATOR_HZ / (PWM_STEPS as f64 * (prescale as f64 + 1.0))
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize)]
pub enum State {
    Uninitialized,
    Active { prescale: u8 },
}

#[derive(Debug)]
struct Inner<D> {
    device: D,
    state: State,
}

impl<D: Device> Inner<D> {
    fn read(&mut self, register: u8) -> Result<u8> {
        self.device
            .read_byte(register)
            .map_err(|source| Error::DeviceIo { register, source })
    }

    fn write(&mut self, register: u8, value: u8) -> Result<()> {
        trace!("Write {value:#04x} to {register:#04x}");
        self.device
            .write_byte(register, value)
            .map_err(|source| Error::DeviceIo { register, source })
    }

    fn check_active(&self) -> Result<()> {
        match self.state {
            State::Active { .. } => Ok(()),
            State::Uninitialized => Err(Error::Uninitialized),
        }
    }
}

/// A PCA9685 on a register oriented bus.
///
/// Register sequences are serialized behind one lock, so the driver can be shared between
/// threads.
#[derive(Debug)]
pub struct Pca9685<D> {
    address: u16,
    calibration: ServoCalibration,
    inner: Mutex<Inner<D>>,
}

impl Pca9685<I2cDevice> {
    /// Connects to the chip at `address` on `/dev/i2c-{bus}`
    pub fn open(bus: u8, address: u16) -> Result<Self> {
        let device = I2cDevice::open(bus, address).map_err(|err| {
            Error::Configuration(format!("Open I2C bus {bus} at {address:#04x}: {err}"))
        })?;

        Ok(Self::new(device, address))
    }
}

impl<D: Device> Pca9685<D> {
    pub fn new(device: D, address: u16) -> Self {
        Self {
            address,
            calibration: ServoCalibration::DEFAULT,
            inner: Mutex::new(Inner {
                device,
                state: State::Uninitialized,
            }),
        }
    }

    #[must_use]
    pub fn with_calibration(mut self, calibration: ServoCalibration) -> Self {
        self.calibration = calibration;
        self
    }

    fn inner(&self) -> MutexGuard<'_, Inner<D>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Programs the prescaler for `frequency` and restarts the outputs.
    ///
    /// The prescaler only latches while the oscillator sleeps, so the chip is put to sleep,
    /// given the new value, woken with its previous mode and restarted once the oscillator
    /// has settled. Returns the prescaler value written.
    #[tracing::instrument(skip(self), fields(address = self.address))]
    pub fn initialize(&self, frequency: f64) -> Result<u8> {
        if !(frequency.is_finite() && frequency > 0.0) {
            return Err(Error::Configuration(format!(
                "PWM frequency must be positive, got {frequency}"
            )));
        }

        let prescale = prescale_for(frequency);
        let mut inner = self.inner();

        let old_mode = inner.read(register::MODE1)?;
        let sleep = (Mode1::from_bits_truncate(old_mode) - Mode1::RESTART) | Mode1::SLEEP;
        inner.write(register::MODE1, sleep.bits())?;
        inner.write(register::PRE_SCALE, prescale)?;
        inner.write(register::MODE1, old_mode)?;
        thread::sleep(OSCILLATOR_SETTLE);
        inner.write(register::MODE1, old_mode | Mode1::RESTART.bits())?;

        inner.state = State::Active { prescale };
        info!(
            "PCA9685 at {:#04x} running at {:.1}Hz (prescale {prescale})",
            self.address,
            frequency_for(prescale)
        );

        Ok(prescale)
    }

    fn check_channel(channel: u8) -> Result<()> {
        Error::check_range(
            "channel",
            channel as f64,
            0.0..=(CHANNELS - 1) as f64,
            "0..=15",
        )
    }

    /// Sets the step the output goes high and the step it goes low
    pub fn set_channel(&self, channel: u8, on: u16, off: u16) -> Result<()> {
        Self::check_channel(channel)?;
        Error::check_range("ON count", on as f64, 0.0..=MAX_COUNT as f64, "0..=4095")?;
        Error::check_range("OFF count", off as f64, 0.0..=MAX_COUNT as f64, "0..=4095")?;

        let mut inner = self.inner();
        inner.check_active()?;

        let base = register::led_base(channel);
        let [on_l, on_h] = on.to_le_bytes();
        let [off_l, off_h] = off.to_le_bytes();
        inner.write(base, on_l)?;
        inner.write(base + 1, on_h)?;
        inner.write(base + 2, off_l)?;
        inner.write(base + 3, off_h)?;

        debug!("Channel {channel} set to ON {on} OFF {off}");

        Ok(())
    }

    /// Reads back the channel's ON and OFF registers, FULL bits included
    pub fn read_channel(&self, channel: u8) -> Result<(u16, u16)> {
        Self::check_channel(channel)?;

        let mut inner = self.inner();
        let base = register::led_base(channel);
        let mut bytes = [0; 4];
        for (offset, byte) in bytes.iter_mut().enumerate() {
            *byte = inner.read(base + offset as u8)?;
        }

        Ok((
            u16::from_le_bytes([bytes[0], bytes[1]]),
            u16::from_le_bytes([bytes[2], bytes[3]]),
        ))
    }

    /// Points a servo at `angle` degrees. Returns the OFF count written
    pub fn set_servo_angle(&self, channel: u8, angle: f64) -> Result<u16> {
        Error::check_range("servo angle", angle, 0.0..=ServoCalibration::MAX_ANGLE, "0..=180")?;

        let count = self.calibration.count_for_angle(angle);
        self.set_channel(channel, 0, count)?;
        debug!("Channel {channel} servo at {angle}°");

        Ok(count)
    }

    pub fn set_duty_cycle(&self, channel: u8, percent: f64) -> Result<u16> {
        Error::check_range("duty cycle", percent, 0.0..=100.0, "0..=100")?;

        let count = (MAX_COUNT as f64 * percent / 100.0) as u16;
        self.set_channel(channel, 0, count)?;

        Ok(count)
    }

    /// Holds the output high for `width` at the start of every period
    pub fn set_pulse_width(&self, channel: u8, width: Duration) -> Result<u16> {
        let prescale = match self.state() {
            State::Active { prescale } => prescale,
            State::Uninitialized => return Err(Error::Uninitialized),
        };

        let count = (width.as_secs_f64() * frequency_for(prescale) * PWM_STEPS as f64).round();
        Error::check_range("pulse width count", count, 0.0..=MAX_COUNT as f64, "0..=4095")?;

        let count = count as u16;
        self.set_channel(channel, 0, count)?;

        Ok(count)
    }

    pub fn turn_off(&self, channel: u8) -> Result<()> {
        self.set_channel(channel, 0, 0)
    }

    pub fn turn_off_all(&self) -> Result<()> {
        for channel in 0..CHANNELS {
            self.turn_off(channel)?;
        }
        info!("Turned off all channels of PCA9685 at {:#04x}", self.address);

        Ok(())
    }

    /// Prescaler value loaded by the last successful `initialize`
    pub fn prescale(&self) -> Option<u8> {
        match self.state() {
            State::Active { prescale } => Some(prescale),
            State::Uninitialized => None,
        }
    }

    /// Frequency the chip actually produces, which the prescaler only approximates
    pub fn frequency(&self) -> Option<f64> {
        self.prescale().map(frequency_for)
    }

    pub fn state(&self) -> State {
        self.inner().state
    }

    pub fn address(&self) -> u16 {
        self.address
    }

    pub fn calibration(&self) -> ServoCalibration {
        self.calibration
    }
}
