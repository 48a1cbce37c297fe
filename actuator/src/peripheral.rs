pub mod mock;
pub mod pca9685;
pub mod probe;

use rppal::i2c::I2c;
use tracing::trace;

use crate::error::BusError;

/// A register oriented device on a serial bus
pub trait Device {
    fn read_byte(&mut self, register: u8) -> Result<u8, BusError> {
        let bytes = &mut [0];
        self.read(register, bytes)?;
        Ok(bytes[0])
    }
    fn write_byte(&mut self, register: u8, byte: u8) -> Result<(), BusError> {
        self.write(register, &[byte])
    }

    fn read(&mut self, register: u8, buffer: &mut [u8]) -> Result<(), BusError>;
    fn write(&mut self, register: u8, buffer: &[u8]) -> Result<(), BusError>;
}

/// A device at a fixed 7 bit address on a Linux I2C bus
#[derive(Debug)]
pub struct I2cDevice {
    i2c: I2c,
}

impl I2cDevice {
    #[tracing::instrument]
    pub fn open(bus: u8, address: u16) -> Result<Self, BusError> {
        trace!("I2cDevice::open()");

        let mut i2c = I2c::with_bus(bus)?;
        i2c.set_slave_address(address)?;

        Ok(Self { i2c })
    }
}

impl Device for I2cDevice {
    fn read_byte(&mut self, register: u8) -> Result<u8, BusError> {
        Ok(self.i2c.smbus_read_byte(register)?)
    }

    fn write_byte(&mut self, register: u8, byte: u8) -> Result<(), BusError> {
        Ok(self.i2c.smbus_write_byte(register, byte)?)
    }

    fn read(&mut self, register: u8, buffer: &mut [u8]) -> Result<(), BusError> {
        self.i2c.write_read(&[register], buffer)?;

        Ok(())
    }

    fn write(&mut self, register: u8, buffer: &[u8]) -> Result<(), BusError> {
        let mut data = Vec::with_capacity(buffer.len() + 1);
        data.push(register);
        data.extend_from_slice(buffer);
        self.i2c.write(&data)?;

        Ok(())
    }
}
