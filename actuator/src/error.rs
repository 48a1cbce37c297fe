use std::io;
use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    Configuration(String),
    #[error("{what} {value} is out of range, expected {expected}")]
    Range {
        what: &'static str,
        value: f64,
        expected: &'static str,
    },
    #[error("Bus error at register {register:#04x}: {source}")]
    DeviceIo {
        register: u8,
        #[source]
        source: BusError,
    },
    #[error("Pin {0} has been released")]
    Released(u8),
    #[error("Write to pin {0} failed")]
    LineFault(u8),
    #[error("Worker thread did not exit within {0:?}")]
    StopTimeout(Duration),
    #[error("Could not spawn worker thread: {0}")]
    Spawn(#[from] io::Error),
    #[error("Device has not been initialized")]
    Uninitialized,
}

impl Error {
    /// Fails unless `value` lies within `range`. NaN is never in range
    pub(crate) fn check_range(
        what: &'static str,
        value: f64,
        range: std::ops::RangeInclusive<f64>,
        expected: &'static str,
    ) -> Result<()> {
        if range.contains(&value) {
            Ok(())
        } else {
            Err(Error::Range {
                what,
                value,
                expected,
            })
        }
    }

    /// Fails unless `value` is finite and above zero
    pub(crate) fn check_positive(what: &'static str, value: f64) -> Result<()> {
        if value.is_finite() && value > 0.0 {
            Ok(())
        } else {
            Err(Error::Range {
                what,
                value,
                expected: "> 0",
            })
        }
    }
}

#[derive(Error, Debug)]
pub enum BusError {
    #[error("I2C error: {0}")]
    I2c(#[from] rppal::i2c::Error),
    #[error("Device did not acknowledge")]
    NotAcknowledged,
}
