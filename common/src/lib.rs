//! Code shared between the actuator drivers and the command line tool

pub mod config;
pub mod error;
pub mod types;
