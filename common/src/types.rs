//! Definitions of value types used by both the drivers and the command line tool

use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of steps in one PCA9685 PWM period
pub const PWM_STEPS: u16 = 4096;
/// Largest ON/OFF count a PCA9685 channel accepts
pub const MAX_COUNT: u16 = PWM_STEPS - 1;

/// How pin numbers given by the user are interpreted
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PinNumbering {
    /// Physical position on the 40 pin header
    #[default]
    Board,
    /// Broadcom GPIO number
    Bcm,
}

/// Physical header position to BCM GPIO number, `None` for power and ground pins
#[rustfmt::skip]
const BOARD_TO_BCM: [Option<u8>; 41] = [
    None,                       // there is no pin 0
    None,       None,           //  1,  2: 3v3, 5v
    Some(2),    None,           //  3,  4
    Some(3),    None,           //  5,  6
    Some(4),    Some(14),       //  7,  8
    None,       Some(15),       //  9, 10
    Some(17),   Some(18),       // 11, 12
    Some(27),   None,           // 13, 14
    Some(22),   Some(23),       // 15, 16
    None,       Some(24),       // 17, 18
    Some(10),   None,           // 19, 20
    Some(9),    Some(25),       // 21, 22
    Some(11),   Some(8),        // 23, 24
    None,       Some(7),        // 25, 26
    Some(0),    Some(1),        // 27, 28
    Some(5),    None,           // 29, 30
    Some(6),    Some(12),       // 31, 32
    Some(13),   None,           // 33, 34
    Some(19),   Some(16),       // 35, 36
    Some(26),   Some(20),       // 37, 38
    None,       Some(21),       // 39, 40
];

impl PinNumbering {
    /// Translates `pin` to a BCM GPIO number
    pub fn to_bcm(self, pin: u8) -> Option<u8> {
        match self {
            PinNumbering::Bcm => (pin <= 27).then_some(pin),
            PinNumbering::Board => BOARD_TO_BCM.get(pin as usize).copied().flatten(),
        }
    }
}

impl Display for PinNumbering {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            PinNumbering::Board => write!(f, "BOARD"),
            PinNumbering::Bcm => write!(f, "BCM"),
        }
    }
}

impl FromStr for PinNumbering {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "board" => Ok(PinNumbering::Board),
            "bcm" => Ok(PinNumbering::Bcm),
            other => Err(format!("Unknown pin numbering {other:?}, expected board or bcm")),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CalibrationError {
    #[error("Servo counts must be at most {MAX_COUNT}, got {0}..{1}")]
    CountTooLarge(u16, u16),
    #[error("Servo minimum count {0} must be below the maximum {1}")]
    Inverted(u16, u16),
    #[error("Bad pulse width calibration: {0}")]
    PulseWidth(String),
}

/// Maps a servo angle in degrees onto a PCA9685 OFF count.
///
/// Servos differ, and the same servo needs different counts at a different PWM frequency,
/// so this is configuration rather than a constant.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "CalibrationCounts", into = "CalibrationCounts")]
pub struct ServoCalibration {
    /// Count at 0°
    min_count: u16,
    /// Count at 180°
    max_count: u16,
}

#[derive(Serialize, Deserialize)]
struct CalibrationCounts {
    min_count: u16,
    max_count: u16,
}

impl ServoCalibration {
    pub const MAX_ANGLE: f64 = 180.0;

    /// 150 counts at 0°, 600 counts at 180°, for a 50Hz period
    pub const DEFAULT: ServoCalibration = ServoCalibration {
        min_count: 150,
        max_count: 600,
    };

    pub fn new(min_count: u16, max_count: u16) -> Result<Self, CalibrationError> {
        if min_count > MAX_COUNT || max_count > MAX_COUNT {
            return Err(CalibrationError::CountTooLarge(min_count, max_count));
        }
        if min_count >= max_count {
            return Err(CalibrationError::Inverted(min_count, max_count));
        }

        Ok(Self {
            min_count,
            max_count,
        })
    }

    /// Derives the counts from the pulse widths the servo expects at 0° and 180°
    pub fn from_pulse_widths(
        min: Duration,
        max: Duration,
        frequency: f64,
    ) -> Result<Self, CalibrationError> {
        if !(frequency.is_finite() && frequency > 0.0) {
            return Err(CalibrationError::PulseWidth(format!(
                "frequency must be positive, got {frequency}"
            )));
        }

        let to_count = |pulse: Duration| {
            let count = (pulse.as_secs_f64() * frequency * PWM_STEPS as f64).round();
            if count > MAX_COUNT as f64 {
                Err(CalibrationError::PulseWidth(format!(
                    "{pulse:?} is longer than a {frequency}Hz period"
                )))
            } else {
                Ok(count as u16)
            }
        };

        Self::new(to_count(min)?, to_count(max)?)
    }

    #[must_use]
    pub const fn min_count(&self) -> u16 {
        self.min_count
    }

    #[must_use]
    pub const fn max_count(&self) -> u16 {
        self.max_count
    }

    /// Linear interpolation between the two counts, truncated. Angles outside 0..=180 are clamped
    #[must_use]
    pub fn count_for_angle(&self, angle: f64) -> u16 {
        let angle = if angle.is_nan() {
            0.0
        } else {
            angle.clamp(0.0, Self::MAX_ANGLE)
        };
        let span = (self.max_count - self.min_count) as f64;

        (self.min_count as f64 + angle / Self::MAX_ANGLE * span) as u16
    }
}

impl Default for ServoCalibration {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl TryFrom<CalibrationCounts> for ServoCalibration {
    type Error = CalibrationError;

    fn try_from(value: CalibrationCounts) -> Result<Self, Self::Error> {
        Self::new(value.min_count, value.max_count)
    }
}

impl From<ServoCalibration> for CalibrationCounts {
    fn from(value: ServoCalibration) -> Self {
        CalibrationCounts {
            min_count: value.min_count,
            max_count: value.max_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{CalibrationError, PinNumbering, ServoCalibration};

    #[test]
    fn board_numbering() {
        assert_eq!(PinNumbering::Board.to_bcm(33), Some(13));
        assert_eq!(PinNumbering::Board.to_bcm(12), Some(18));
        assert_eq!(PinNumbering::Board.to_bcm(7), Some(4));
        assert_eq!(PinNumbering::Board.to_bcm(40), Some(21));

        // Power and ground
        assert_eq!(PinNumbering::Board.to_bcm(1), None);
        assert_eq!(PinNumbering::Board.to_bcm(6), None);
        assert_eq!(PinNumbering::Board.to_bcm(0), None);
        assert_eq!(PinNumbering::Board.to_bcm(41), None);
    }

    #[test]
    fn numbering_from_str() {
        assert_eq!("BOARD".parse::<PinNumbering>(), Ok(PinNumbering::Board));
        assert_eq!("bcm".parse::<PinNumbering>(), Ok(PinNumbering::Bcm));
        assert!("wiringpi".parse::<PinNumbering>().is_err());
    }

    #[test]
    fn bcm_numbering() {
        assert_eq!(PinNumbering::Bcm.to_bcm(0), Some(0));
        assert_eq!(PinNumbering::Bcm.to_bcm(27), Some(27));
        assert_eq!(PinNumbering::Bcm.to_bcm(28), None);
    }

    #[test]
    fn default_servo_endpoints() {
        let servo = ServoCalibration::default();
        assert_eq!(servo.count_for_angle(0.0), 150);
        assert_eq!(servo.count_for_angle(180.0), 600);
    }

    #[test]
    fn servo_interpolates_linearly() {
        let servo = ServoCalibration::DEFAULT;
        assert_eq!(servo.count_for_angle(90.0), 375);
        assert_eq!(servo.count_for_angle(45.0), 262);
        assert_eq!(servo.count_for_angle(135.0), 487);

        let mut last = 0;
        for angle in 0..=180 {
            let count = servo.count_for_angle(angle as f64);
            assert!(count >= last);
            last = count;
        }
    }

    #[test]
    fn servo_clamps_angle() {
        let servo = ServoCalibration::DEFAULT;
        assert_eq!(servo.count_for_angle(-10.0), 150);
        assert_eq!(servo.count_for_angle(200.0), 600);
        assert_eq!(servo.count_for_angle(f64::NAN), 150);
    }

    #[test]
    fn invalid_calibration() {
        assert_eq!(
            ServoCalibration::new(600, 150),
            Err(CalibrationError::Inverted(600, 150))
        );
        assert_eq!(
            ServoCalibration::new(100, 5000),
            Err(CalibrationError::CountTooLarge(100, 5000))
        );
    }

    #[test]
    fn calibration_from_pulse_widths() {
        // 5% and 10% of a 20ms period
        let servo = ServoCalibration::from_pulse_widths(
            Duration::from_millis(1),
            Duration::from_millis(2),
            50.0,
        )
        .unwrap();
        assert_eq!(servo.min_count(), 205);
        assert_eq!(servo.max_count(), 410);

        assert!(ServoCalibration::from_pulse_widths(
            Duration::from_millis(1),
            Duration::from_millis(30),
            50.0
        )
        .is_err());
        assert!(ServoCalibration::from_pulse_widths(
            Duration::from_millis(1),
            Duration::from_millis(2),
            0.0
        )
        .is_err());
    }

    #[test]
    fn calibration_serde() {
        let servo: ServoCalibration =
            serde_json::from_str(r#"{"min_count": 200, "max_count": 500}"#).unwrap();
        assert_eq!(servo, ServoCalibration::new(200, 500).unwrap());

        let inverted = serde_json::from_str::<ServoCalibration>(r#"{"min_count": 500, "max_count": 200}"#);
        assert!(inverted.is_err());
    }
}
