use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use common::types::PinNumbering;
use rppal::gpio::{Gpio, Level, OutputPin};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// A binary output line
pub trait OutputLine: Send + 'static {
    /// BCM number of the line
    fn pin(&self) -> u8;

    fn write(&mut self, level: Level) -> Result<()>;

    /// Gives the line back to the system. Writes after this fail
    fn release(&mut self);
}

/// Output pin on the board's GPIO header
#[derive(Debug)]
pub struct GpioLine {
    bcm: u8,
    pin: Option<OutputPin>,
}

impl GpioLine {
    /// Claims `pin` as an output
    #[tracing::instrument]
    pub fn claim(numbering: PinNumbering, pin: u8) -> Result<Self> {
        let bcm = numbering.to_bcm(pin).ok_or_else(|| {
            Error::Configuration(format!("{numbering} pin {pin} is not a GPIO line"))
        })?;

        let gpio = Gpio::new().map_err(|err| Error::Configuration(format!("Open gpio: {err}")))?;
        let output = gpio
            .get(bcm)
            .map_err(|err| Error::Configuration(format!("Claim GPIO {bcm}: {err}")))?
            .into_output();

        info!("Claimed {numbering} pin {pin} (GPIO {bcm}) as output");

        Ok(Self {
            bcm,
            pin: Some(output),
        })
    }
}

impl OutputLine for GpioLine {
    fn pin(&self) -> u8 {
        self.bcm
    }

    fn write(&mut self, level: Level) -> Result<()> {
        let pin = self.pin.as_mut().ok_or(Error::Released(self.bcm))?;
        pin.write(level);

        Ok(())
    }

    fn release(&mut self) {
        // Dropping the pin resets it to its original mode
        if self.pin.take().is_some() {
            debug!("Released GPIO {}", self.bcm);
        }
    }
}

/// In-memory line that records every level change, for tests and dry runs.
///
/// Clones share the same record, so a clone kept outside a PWM engine can inspect what
/// the engine did.
#[derive(Debug, Clone)]
pub struct MockLine {
    pin: u8,
    record: Arc<Mutex<MockRecord>>,
}

#[derive(Debug, Default)]
struct MockRecord {
    level: Option<Level>,
    transitions: Vec<(Level, Instant)>,
    writes: usize,
    released: bool,
    failing: bool,
}

impl MockLine {
    pub fn new(pin: u8) -> Self {
        Self {
            pin,
            record: Default::default(),
        }
    }

    fn record(&self) -> MutexGuard<'_, MockRecord> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Last level written, `None` before the first write
    pub fn level(&self) -> Option<Level> {
        self.record().level
    }

    /// Every level change, in order, with the time it happened
    pub fn transitions(&self) -> Vec<(Level, Instant)> {
        self.record().transitions.clone()
    }

    /// Number of write calls, including ones that did not change the level
    pub fn writes(&self) -> usize {
        self.record().writes
    }

    pub fn is_released(&self) -> bool {
        self.record().released
    }

    /// Makes subsequent writes fail as if the line had gone away
    pub fn set_failing(&self, failing: bool) {
        self.record().failing = failing;
    }
}

impl OutputLine for MockLine {
    fn pin(&self) -> u8 {
        self.pin
    }

    fn write(&mut self, level: Level) -> Result<()> {
        let mut record = self.record();
        if record.released {
            return Err(Error::Released(self.pin));
        }
        if record.failing {
            return Err(Error::LineFault(self.pin));
        }

        record.writes += 1;
        if record.level != Some(level) {
            record.level = Some(level);
            record.transitions.push((level, Instant::now()));
        }

        Ok(())
    }

    fn release(&mut self) {
        self.record().released = true;
    }
}

#[cfg(test)]
mod tests {
    use rppal::gpio::Level;

    use crate::error::Error;

    use super::{MockLine, OutputLine};

    #[test]
    fn mock_records_transitions() {
        let mut line = MockLine::new(13);
        let observer = line.clone();

        line.write(Level::Low).unwrap();
        line.write(Level::Low).unwrap();
        line.write(Level::High).unwrap();

        assert_eq!(observer.level(), Some(Level::High));
        assert_eq!(observer.writes(), 3);

        let levels: Vec<_> = observer.transitions().into_iter().map(|(level, _)| level).collect();
        assert_eq!(levels, vec![Level::Low, Level::High]);
    }

    #[test]
    fn mock_rejects_writes_after_release() {
        let mut line = MockLine::new(13);
        line.release();

        assert!(line.is_released());
        assert!(matches!(line.write(Level::High), Err(Error::Released(13))));
        assert_eq!(line.level(), None);
    }

    #[test]
    fn mock_failure_is_not_a_release() {
        let mut line = MockLine::new(13);
        line.write(Level::High).unwrap();
        line.set_failing(true);

        assert!(matches!(line.write(Level::Low), Err(Error::LineFault(13))));
        assert!(!line.is_released());
        assert_eq!(line.level(), Some(Level::High));

        line.set_failing(false);
        line.write(Level::Low).unwrap();
        assert_eq!(line.level(), Some(Level::Low));
    }
}
