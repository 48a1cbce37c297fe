//! Read-only detection of PCA9685 chips and plain I2C bus scans.
//!
//! Nothing here writes to a device, so it is safe to point at a bus shared with unknown
//! hardware.

use std::ops::RangeInclusive;

use rppal::i2c::I2c;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{BusError, Error, Result};
use crate::peripheral::pca9685::{frequency_for, register, Mode2, FULL_BIT, PRESCALE_MIN};
use crate::peripheral::{Device, I2cDevice};

/// Buses tried by `discover`, most likely first
pub const CANDIDATE_BUSES: [u8; 6] = [7, 1, 0, 2, 4, 5];
/// Addresses selectable with the A0..A2 jumpers
pub const CANDIDATE_ADDRESSES: RangeInclusive<u16> = 0x40..=0x47;
/// Valid 7 bit addresses outside the reserved ranges
pub const SCAN_ADDRESSES: RangeInclusive<u16> = 0x03..=0x77;

/// Bus and address pairs occupied by other chips that happen to pass the probe
pub const KNOWN_CONFLICTS: [(u8, u16); 1] = [
    // INA3221 power monitor on Jetson carrier boards
    (1, 0x40),
];

/// Register values read from a chip that looks like a PCA9685
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize)]
pub struct ProbeReport {
    pub mode1: u8,
    pub mode2: u8,
    pub prescale: u8,
    /// `None` if the register could not be read
    pub allcall: Option<u8>,
}

impl ProbeReport {
    /// PWM frequency implied by the prescaler
    pub fn frequency(&self) -> f64 {
        frequency_for(self.prescale)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize)]
pub struct Discovered {
    pub bus: u8,
    pub address: u16,
    pub report: ProbeReport,
}

/// Checks whether `device` behaves like a PCA9685.
///
/// MODE1, MODE2 and PRE_SCALE must be readable. ALLCALLADR and the ALL_LED registers are
/// only checked when they can be read.
pub fn probe(device: &mut impl Device) -> Result<Option<ProbeReport>> {
    let mut read = |register| {
        device
            .read_byte(register)
            .map_err(|source| Error::DeviceIo { register, source })
    };

    let mode1 = read(register::MODE1)?;
    let prescale = read(register::PRE_SCALE)?;
    if prescale < PRESCALE_MIN {
        debug!("PRE_SCALE {prescale:#04x} is below the minimum");
        return Ok(None);
    }

    // Bits outside the defined MODE2 flags are reserved and read as zero
    let mode2 = read(register::MODE2)?;
    if Mode2::from_bits(mode2).is_none() {
        debug!("MODE2 {mode2:#04x} has reserved bits set");
        return Ok(None);
    }

    let allcall = read(register::ALLCALLADR).ok();
    if let Some(allcall) = allcall {
        if !matches!(allcall, 0xE0 | 0x00) && allcall & 0x01 != 0 {
            debug!("ALLCALLADR {allcall:#04x} is not an address");
            return Ok(None);
        }
    }

    for register in [register::ALL_LED_ON_H, register::ALL_LED_OFF_H] {
        if let Ok(value) = read(register) {
            if value & FULL_BIT != 0 {
                debug!("{register:#04x} reads {value:#04x}, expected the FULL bit clear");
                return Ok(None);
            }
        }
    }

    Ok(Some(ProbeReport {
        mode1,
        mode2,
        prescale,
        allcall,
    }))
}

/// Probes every address on every bus with real hardware
pub fn discover(buses: &[u8], addresses: &[u16]) -> Vec<Discovered> {
    discover_with(buses, addresses, I2cDevice::open)
}

/// Probes every candidate pair, skipping known conflicts. Buses or addresses that fail to
/// open or to answer are skipped
pub fn discover_with<D, F>(buses: &[u8], addresses: &[u16], mut open: F) -> Vec<Discovered>
where
    D: Device,
    F: FnMut(u8, u16) -> std::result::Result<D, BusError>,
{
    let mut found = Vec::new();

    for &bus in buses {
        for &address in addresses {
            if KNOWN_CONFLICTS.contains(&(bus, address)) {
                debug!("Skipping bus {bus} address {address:#04x}, known to be another chip");
                continue;
            }

            let mut device = match open(bus, address) {
                Ok(device) => device,
                Err(err) => {
                    debug!("Could not open bus {bus} address {address:#04x}: {err}");
                    continue;
                }
            };

            match probe(&mut device) {
                Ok(Some(report)) => {
                    info!(
                        "Found PCA9685 on bus {bus} at {address:#04x}, prescale {}",
                        report.prescale
                    );
                    found.push(Discovered {
                        bus,
                        address,
                        report,
                    });
                }
                Ok(None) => debug!("Bus {bus} address {address:#04x} is not a PCA9685"),
                Err(err) => debug!("No answer on bus {bus} at {address:#04x}: {err}"),
            }
        }
    }

    found
}

/// Lists the addresses on `/dev/i2c-{bus}` that answer a one byte read
#[tracing::instrument]
pub fn scan_bus(bus: u8) -> Result<Vec<u16>> {
    let mut i2c = I2c::with_bus(bus)
        .map_err(|err| Error::Configuration(format!("Open I2C bus {bus}: {err}")))?;

    Ok(scan_with(SCAN_ADDRESSES, |address| {
        i2c.set_slave_address(address).is_ok() && i2c.smbus_receive_byte().is_ok()
    }))
}

pub fn scan_with(addresses: RangeInclusive<u16>, mut responds: impl FnMut(u16) -> bool) -> Vec<u16> {
    addresses.filter(|&address| responds(address)).collect()
}

/// Name of the chip usually found at `address`
pub fn device_hint(address: u16) -> Option<&'static str> {
    match address {
        0x40 => Some("PCA9685 PWM driver"),
        0x48 => Some("ADS1115 ADC"),
        0x68 => Some("DS1307/DS3231 RTC"),
        0x76 => Some("BMP280 barometer"),
        0x77 => Some("BMP180 barometer"),
        _ => None,
    }
}
