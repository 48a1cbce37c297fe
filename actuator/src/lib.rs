//! Drivers for GPIO soft PWM lines and PCA9685 PWM chips
#![warn(meta_variable_misuse)]

pub mod error;
pub mod gpio;
pub mod led;
pub mod peripheral;
pub mod soft_pwm;
mod task;

pub use error::{Error, Result};
