use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use crate::error::BusError;
use crate::peripheral::pca9685::register;
use crate::peripheral::Device;

/// In-memory register file standing in for a bus device, for tests and dry runs.
///
/// Multi-byte accesses always auto increment. Clones share the same registers, so a clone
/// kept outside a driver can read back what the driver wrote.
#[derive(Debug, Clone)]
pub struct MockDevice {
    inner: Arc<Mutex<MockRegisters>>,
}

#[derive(Debug)]
struct MockRegisters {
    registers: [u8; 256],
    writes: Vec<(u8, u8, Instant)>,
    failing: Option<u8>,
    absent: bool,
}

impl MockDevice {
    /// A device with every register zeroed
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MockRegisters {
                registers: [0; 256],
                writes: Vec::new(),
                failing: None,
                absent: false,
            })),
        }
    }

    /// A device holding the PCA9685 power-on register values. The ALL_LED registers read
    /// back as zero
    pub fn pca9685() -> Self {
        let device = Self::new();
        device.set_register(register::MODE1, 0x11);
        device.set_register(register::MODE2, 0x04);
        device.set_register(register::SUBADR1, 0xE2);
        device.set_register(register::SUBADR2, 0xE4);
        device.set_register(register::SUBADR3, 0xE8);
        device.set_register(register::ALLCALLADR, 0xE0);
        device.set_register(register::PRE_SCALE, 0x1E);
        for channel in 0..16 {
            device.set_register(register::led_base(channel) + 3, 0x10);
        }
        device
    }

    fn inner(&self) -> MutexGuard<'_, MockRegisters> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, register: u8) -> u8 {
        self.inner().registers[register as usize]
    }

    pub fn set_register(&self, register: u8, value: u8) {
        self.inner().registers[register as usize] = value;
    }

    /// Every register write, in order
    pub fn writes(&self) -> Vec<(u8, u8)> {
        self.inner()
            .writes
            .iter()
            .map(|(register, value, _)| (*register, *value))
            .collect()
    }

    /// Every register write, in order, with the time it happened
    pub fn timed_writes(&self) -> Vec<(u8, u8, Instant)> {
        self.inner().writes.clone()
    }

    pub fn clear_writes(&self) {
        self.inner().writes.clear();
    }

    /// Makes any access touching `register` fail
    pub fn fail_on(&self, register: Option<u8>) {
        self.inner().failing = register;
    }

    /// Makes every access fail as if nothing answered at this address
    pub fn set_absent(&self, absent: bool) {
        self.inner().absent = absent;
    }
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRegisters {
    fn check(&self, register: u8, len: usize) -> Result<(), BusError> {
        let touches = |failing: u8| (0..len).any(|offset| register.wrapping_add(offset as u8) == failing);

        if self.absent || self.failing.map_or(false, touches) {
            Err(BusError::NotAcknowledged)
        } else {
            Ok(())
        }
    }
}

impl Device for MockDevice {
    fn read(&mut self, register: u8, buffer: &mut [u8]) -> Result<(), BusError> {
        let inner = self.inner();
        inner.check(register, buffer.len())?;

        for (offset, byte) in buffer.iter_mut().enumerate() {
            *byte = inner.registers[register.wrapping_add(offset as u8) as usize];
        }

        Ok(())
    }

    fn write(&mut self, register: u8, buffer: &[u8]) -> Result<(), BusError> {
        let mut inner = self.inner();
        inner.check(register, buffer.len())?;

        let now = Instant::now();
        for (offset, byte) in buffer.iter().enumerate() {
            let register = register.wrapping_add(offset as u8);
            inner.registers[register as usize] = *byte;
            inner.writes.push((register, *byte, now));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::peripheral::Device;

    use super::MockDevice;

    #[test]
    fn read_back() {
        let mut device = MockDevice::new();
        let observer = device.clone();

        device.write_byte(0x06, 0xAB).unwrap();
        device.write(0x08, &[1, 2]).unwrap();

        assert_eq!(observer.register(0x06), 0xAB);
        assert_eq!(device.read_byte(0x09).unwrap(), 2);
        assert_eq!(observer.writes(), vec![(0x06, 0xAB), (0x08, 1), (0x09, 2)]);

        let buffer = &mut [0; 4];
        device.read(0x06, buffer).unwrap();
        assert_eq!(buffer, &[0xAB, 0, 1, 2]);
    }

    #[test]
    fn injected_faults() {
        let mut device = MockDevice::new();

        device.fail_on(Some(0x07));
        assert!(device.write_byte(0x06, 1).is_ok());
        assert!(device.write_byte(0x07, 1).is_err());
        assert!(device.write(0x06, &[1, 2]).is_err());

        device.fail_on(None);
        device.set_absent(true);
        assert!(device.read_byte(0x00).is_err());
    }
}
