//! Software generated PWM on a single output line.
//!
//! A background thread splits each period into an active segment of `period * duty / 100`
//! and an inactive remainder, toggling the line and sleeping in between. This is inherently
//! jittery on a multitasking OS, so use it for LEDs and hobby servos rather than anything
//! needing an accurate signal.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use common::error::LogErrorExt;
use common::types::PinNumbering;
use crossbeam::channel::Receiver;
use rppal::gpio::Level;
use serde::Serialize;
use tracing::{debug, error, info, span, warn};

use crate::error::{Error, Result};
use crate::gpio::{GpioLine, OutputLine};
use crate::task::{self, Task};

pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(1);
/// Shortest period the generator runs with, however high the frequency
const MIN_PERIOD: Duration = Duration::from_nanos(1);

/// State shared with the generator thread
struct Shared<P> {
    line: Mutex<P>,
    /// f64 bits
    duty: AtomicU64,
    /// f64 bits
    frequency: AtomicU64,
    pulses: AtomicU64,
    active: Level,
}

impl<P> Shared<P> {
    fn duty(&self) -> f64 {
        f64::from_bits(self.duty.load(Ordering::Relaxed))
    }

    fn frequency(&self) -> f64 {
        f64::from_bits(self.frequency.load(Ordering::Relaxed))
    }

    fn inactive(&self) -> Level {
        match self.active {
            Level::High => Level::Low,
            Level::Low => Level::High,
        }
    }

    fn line(&self) -> MutexGuard<'_, P> {
        self.line.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Serialize)]
pub struct PwmStatus {
    pub pin: u8,
    pub frequency: f64,
    pub duty_cycle: f64,
    pub running: bool,
    pub inverted: bool,
    pub pulses: u64,
}

/// A PWM channel bit-banged on one output line
pub struct SoftPwm<P: OutputLine> {
    pin: u8,
    shared: Arc<Shared<P>>,
    worker: Mutex<Option<Task>>,
    released: AtomicBool,
    stop_timeout: Duration,
}

impl SoftPwm<GpioLine> {
    /// Claims `pin` on the GPIO header and wraps it in a stopped PWM channel
    pub fn open(numbering: PinNumbering, pin: u8, frequency: f64, invert: bool) -> Result<Self> {
        Error::check_positive("frequency", frequency)
            .map_err(|err| Error::Configuration(err.to_string()))?;
        let line = GpioLine::claim(numbering, pin)?;

        Self::new(line, frequency, invert)
    }
}

impl<P: OutputLine> SoftPwm<P> {
    /// Drives `line` to its inactive level and returns a stopped channel.
    ///
    /// With `invert` set the active level is low, for loads wired active-low.
    #[tracing::instrument(skip(line), fields(pin = line.pin()))]
    pub fn new(mut line: P, frequency: f64, invert: bool) -> Result<Self> {
        if !(frequency.is_finite() && frequency > 0.0) {
            return Err(Error::Configuration(format!(
                "PWM frequency must be positive, got {frequency}"
            )));
        }

        let active = if invert { Level::Low } else { Level::High };
        let inactive = if invert { Level::High } else { Level::Low };
        let pin = line.pin();
        line.write(inactive)
            .map_err(|err| Error::Configuration(format!("Drive pin {pin} inactive: {err}")))?;

        info!("PWM ready on pin {pin} at {frequency}Hz, inverted: {invert}");

        Ok(Self {
            pin,
            shared: Arc::new(Shared {
                line: Mutex::new(line),
                duty: AtomicU64::new(0f64.to_bits()),
                frequency: AtomicU64::new(frequency.to_bits()),
                pulses: AtomicU64::new(0),
                active,
            }),
            worker: Mutex::new(None),
            released: AtomicBool::new(false),
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        })
    }

    /// Upper bound on how long `stop` waits for the generator to exit
    #[must_use]
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    fn worker(&self) -> MutexGuard<'_, Option<Task>> {
        self.worker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts the generator thread. Returns `Ok(false)` if it is already running
    pub fn start(&self, initial_duty: f64) -> Result<bool> {
        Error::check_range("duty cycle", initial_duty, 0.0..=100.0, "0..=100")?;
        if self.released.load(Ordering::Relaxed) {
            return Err(Error::Released(self.pin));
        }

        let mut worker = self.worker();
        if let Some(task) = worker.as_ref() {
            if !task.is_finished() {
                warn!("PWM on pin {} is already running", self.pin);
                return Ok(false);
            }

            // The generator gave up on its own, reap it before starting over
            if let Some(task) = worker.take() {
                task.stop(self.stop_timeout);
            }
        }

        self.shared.duty.store(initial_duty.to_bits(), Ordering::Relaxed);

        let shared = self.shared.clone();
        let pin = self.pin;
        let task = Task::spawn(format!("soft-pwm-{pin}"), move |stop| {
            let span = span!(tracing::Level::DEBUG, "Soft PWM", pin);
            let _enter = span.enter();

            generate(&shared, stop);
        })?;
        *worker = Some(task);

        info!("Started PWM on pin {pin} at {initial_duty}%");

        Ok(true)
    }

    /// Stops the generator, waits for it to exit and leaves the line inactive.
    /// Returns `Ok(false)` if it was not running
    pub fn stop(&self) -> Result<bool> {
        let mut worker = self.worker();
        let Some(task) = worker.take() else {
            debug!("PWM on pin {} is not running", self.pin);
            return Ok(false);
        };

        let exited = task.stop(self.stop_timeout);
        self.drive_inactive()?;

        if !exited {
            error!(
                "PWM thread for pin {} did not exit within {:?}",
                self.pin, self.stop_timeout
            );
            return Err(Error::StopTimeout(self.stop_timeout));
        }

        info!("Stopped PWM on pin {}", self.pin);

        Ok(true)
    }

    /// Stops the generator and gives the line back to the system
    pub fn cleanup(&self) -> Result<()> {
        self.stop()?;

        if !self.released.swap(true, Ordering::Relaxed) {
            self.shared.line().release();
            info!("Released pin {}", self.pin);
        }

        Ok(())
    }

    fn drive_inactive(&self) -> Result<()> {
        if self.released.load(Ordering::Relaxed) {
            return Ok(());
        }

        self.shared.line().write(self.shared.inactive())
    }

    /// Takes effect from the next period on. Out of range values leave the duty cycle unchanged
    pub fn set_duty_cycle(&self, percent: f64) -> Result<()> {
        Error::check_range("duty cycle", percent, 0.0..=100.0, "0..=100")?;
        self.shared.duty.store(percent.to_bits(), Ordering::Relaxed);
        debug!("Pin {} duty cycle set to {percent}%", self.pin);

        Ok(())
    }

    /// Takes effect from the next period on. Out of range values leave the frequency unchanged
    pub fn set_frequency(&self, hz: f64) -> Result<()> {
        Error::check_positive("frequency", hz)?;
        self.shared.frequency.store(hz.to_bits(), Ordering::Relaxed);
        debug!("Pin {} frequency set to {hz}Hz", self.pin);

        Ok(())
    }

    pub fn pin(&self) -> u8 {
        self.pin
    }

    pub fn duty_cycle(&self) -> f64 {
        self.shared.duty()
    }

    pub fn frequency(&self) -> f64 {
        self.shared.frequency()
    }

    pub fn is_inverted(&self) -> bool {
        self.shared.active == Level::Low
    }

    pub fn is_running(&self) -> bool {
        self.worker()
            .as_ref()
            .map_or(false, |task| !task.is_finished())
    }

    /// Periods that contained an active segment since construction
    pub fn pulse_count(&self) -> u64 {
        self.shared.pulses.load(Ordering::Relaxed)
    }

    pub fn status(&self) -> PwmStatus {
        PwmStatus {
            pin: self.pin,
            frequency: self.frequency(),
            duty_cycle: self.duty_cycle(),
            running: self.is_running(),
            inverted: self.is_inverted(),
            pulses: self.pulse_count(),
        }
    }
}

impl<P: OutputLine> Drop for SoftPwm<P> {
    fn drop(&mut self) {
        self.stop().log_error("Stop PWM on drop");
    }
}

/// Splits one period into its active and inactive parts
fn segments(period: Duration, duty: f64) -> (Duration, Duration) {
    if duty <= 0.0 {
        return (Duration::ZERO, period);
    }
    if duty >= 100.0 {
        return (period, Duration::ZERO);
    }

    let active = period.mul_f64(duty / 100.0);
    (active, period.saturating_sub(active))
}

fn period(frequency: f64) -> Duration {
    Duration::try_from_secs_f64(1.0 / frequency)
        .unwrap_or(Duration::MAX)
        .max(MIN_PERIOD)
}

/// Generator loop, runs until told to stop or the line fails
fn generate<P: OutputLine>(shared: &Shared<P>, stop: &Receiver<()>) {
    let inactive = shared.inactive();
    let mut level = None;

    let mut drive = |target: Level| -> bool {
        if level == Some(target) {
            return true;
        }

        match shared.line().write(target) {
            Ok(()) => {
                level = Some(target);
                true
            }
            Err(err) => {
                error!("Could not drive line, stopping PWM: {err}");
                false
            }
        }
    };

    loop {
        // Sampled once per period
        let period = period(shared.frequency());
        let duty = shared.duty();
        let (on_time, off_time) = segments(period, duty);

        if duty <= 0.0 {
            // Hold inactive but wake up every period to pick up a new duty cycle
            if !drive(inactive) || task::wait(stop, period) {
                return;
            }
            continue;
        }

        if !drive(shared.active) {
            return;
        }
        shared.pulses.fetch_add(1, Ordering::Relaxed);
        if task::wait(stop, on_time) {
            return;
        }

        if !off_time.is_zero() {
            if !drive(inactive) || task::wait(stop, off_time) {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::{Duration, Instant};

    use rppal::gpio::Level;

    use crate::error::Error;
    use crate::gpio::MockLine;

    use super::{period, segments, SoftPwm};

    fn pwm(frequency: f64, invert: bool) -> (SoftPwm<MockLine>, MockLine) {
        let line = MockLine::new(13);
        let observer = line.clone();
        (SoftPwm::new(line, frequency, invert).unwrap(), observer)
    }

    /// Mean time between rising edges inside `[from, to]`
    fn mean_rising_gap(transitions: &[(Level, Instant)], from: Instant, to: Instant) -> Duration {
        let rising: Vec<Instant> = transitions
            .iter()
            .filter(|(level, at)| *level == Level::High && (from..=to).contains(at))
            .map(|(_, at)| *at)
            .collect();
        assert!(rising.len() >= 3, "only {} rising edges", rising.len());

        (rising[rising.len() - 1] - rising[0]) / (rising.len() - 1) as u32
    }

    /// Fraction of `[from, to]` spent at `level`
    fn fraction_at(transitions: &[(Level, Instant)], level: Level, from: Instant, to: Instant) -> f64 {
        let mut time_at_level = Duration::ZERO;
        for (idx, (current, at)) in transitions.iter().enumerate() {
            let start = (*at).max(from);
            let end = transitions.get(idx + 1).map_or(to, |(_, next)| *next).min(to);
            if *current == level && end > start {
                time_at_level += end - start;
            }
        }

        time_at_level.as_secs_f64() / (to - from).as_secs_f64()
    }

    #[test]
    fn segments_split_period() {
        let period = Duration::from_millis(10);
        let (on, off) = segments(period, 25.0);
        assert_eq!(on + off, period);
        assert!((on.as_nanos() as i128 - 2_500_000).abs() < 1_000, "{on:?}");

        assert_eq!(segments(period, 0.0), (Duration::ZERO, period));
        assert_eq!(segments(period, 100.0), (period, Duration::ZERO));
    }

    #[test]
    fn period_never_reaches_zero() {
        assert!((period(50.0).as_secs_f64() - 0.02).abs() < 1e-9);
        assert!(period(4e9) > Duration::ZERO);
        assert!(period(f64::MAX) > Duration::ZERO);

        let (on, off) = segments(period(4e9), 100.0);
        assert!(on > Duration::ZERO);
        assert_eq!(off, Duration::ZERO);
    }

    #[test]
    fn rejects_bad_frequency() {
        for frequency in [0.0, -50.0, f64::NAN, f64::INFINITY] {
            let ret = SoftPwm::new(MockLine::new(13), frequency, false);
            assert!(matches!(ret, Err(Error::Configuration(_))), "{frequency}");
        }
    }

    #[test]
    fn construction_drives_inactive() {
        let (_pwm, line) = pwm(100.0, false);
        assert_eq!(line.level(), Some(Level::Low));

        let (_pwm, line) = pwm(100.0, true);
        assert_eq!(line.level(), Some(Level::High));
    }

    #[test]
    fn construction_fails_on_dead_line() {
        let line = MockLine::new(13);
        line.set_failing(true);

        assert!(matches!(
            SoftPwm::new(line, 100.0, false),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn rejected_duty_cycle_keeps_previous() {
        let (pwm, _line) = pwm(100.0, false);
        pwm.set_duty_cycle(40.0).unwrap();

        for bad in [-0.1, 100.1, 250.0, f64::NAN] {
            assert!(matches!(pwm.set_duty_cycle(bad), Err(Error::Range { .. })));
            assert_eq!(pwm.duty_cycle(), 40.0);
        }

        pwm.set_duty_cycle(0.0).unwrap();
        pwm.set_duty_cycle(100.0).unwrap();
        assert_eq!(pwm.duty_cycle(), 100.0);
    }

    #[test]
    fn rejected_frequency_keeps_previous() {
        let (pwm, _line) = pwm(100.0, false);

        assert!(pwm.set_frequency(0.0).is_err());
        assert!(pwm.set_frequency(-1.0).is_err());
        assert_eq!(pwm.frequency(), 100.0);

        pwm.set_frequency(250.0).unwrap();
        assert_eq!(pwm.frequency(), 250.0);
    }

    #[test]
    fn bad_initial_duty_does_not_start() {
        let (pwm, _line) = pwm(100.0, false);
        assert!(pwm.start(101.0).is_err());
        assert!(!pwm.is_running());
    }

    #[test]
    fn double_start_keeps_one_generator() {
        let (pwm, _line) = pwm(100.0, false);

        assert!(pwm.start(50.0).unwrap());
        assert!(!pwm.start(50.0).unwrap());
        assert!(pwm.is_running());

        thread::sleep(Duration::from_millis(300));
        pwm.stop().unwrap();

        // One generator at 100Hz makes about 30 pulses, two would make about 60
        let pulses = pwm.pulse_count();
        assert!((10..=40).contains(&pulses), "{pulses} pulses");
    }

    #[test]
    fn stop_is_idempotent() {
        let (pwm, line) = pwm(200.0, false);

        assert!(!pwm.stop().unwrap());

        pwm.start(100.0).unwrap();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(line.level(), Some(Level::High));

        assert!(pwm.stop().unwrap());
        assert_eq!(line.level(), Some(Level::Low));
        assert!(!pwm.stop().unwrap());
        assert_eq!(line.level(), Some(Level::Low));
        assert!(!pwm.is_running());
    }

    #[test]
    fn nothing_toggles_after_stop() {
        let (pwm, line) = pwm(500.0, false);
        pwm.start(50.0).unwrap();
        thread::sleep(Duration::from_millis(50));
        pwm.stop().unwrap();

        let stopped = line.transitions().len();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(line.transitions().len(), stopped);
        assert_eq!(line.level(), Some(Level::Low));
    }

    #[test]
    fn zero_duty_emits_nothing() {
        let (pwm, line) = pwm(200.0, false);
        pwm.start(0.0).unwrap();
        thread::sleep(Duration::from_millis(100));
        pwm.stop().unwrap();

        assert_eq!(pwm.pulse_count(), 0);
        assert!(line.transitions().iter().all(|(level, _)| *level == Level::Low));
    }

    #[test]
    fn full_duty_holds_active() {
        let (pwm, line) = pwm(200.0, false);
        pwm.start(100.0).unwrap();
        thread::sleep(Duration::from_millis(100));

        let levels: Vec<_> = line.transitions().into_iter().map(|(level, _)| level).collect();
        assert_eq!(levels, vec![Level::Low, Level::High]);
        assert!(pwm.pulse_count() > 0);

        pwm.stop().unwrap();
        assert_eq!(line.level(), Some(Level::Low));
    }

    #[test]
    fn full_duty_holds_active_at_extreme_frequency() {
        let (pwm, line) = pwm(4e9, false);
        pwm.start(100.0).unwrap();
        thread::sleep(Duration::from_millis(50));

        assert_eq!(line.level(), Some(Level::High));
        assert!(pwm.pulse_count() > 0);
        let levels: Vec<_> = line.transitions().into_iter().map(|(level, _)| level).collect();
        assert_eq!(levels, vec![Level::Low, Level::High]);

        pwm.stop().unwrap();
        assert_eq!(line.level(), Some(Level::Low));
    }

    #[test]
    fn inverted_logic() {
        let (pwm, line) = pwm(200.0, true);
        assert!(pwm.is_inverted());

        pwm.start(100.0).unwrap();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(line.level(), Some(Level::Low));

        pwm.stop().unwrap();
        assert_eq!(line.level(), Some(Level::High));
    }

    #[test]
    fn duty_fraction_converges() {
        let (pwm, line) = pwm(50.0, false);

        pwm.start(30.0).unwrap();
        let from = Instant::now();
        thread::sleep(Duration::from_millis(1000));
        let to = Instant::now();
        pwm.stop().unwrap();

        let fraction = fraction_at(&line.transitions(), Level::High, from, to);
        assert!((0.2..=0.4).contains(&fraction), "active {fraction}");
    }

    #[test]
    fn duty_change_applies_while_running() {
        let (pwm, line) = pwm(100.0, false);
        pwm.start(0.0).unwrap();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(pwm.pulse_count(), 0);

        pwm.set_duty_cycle(100.0).unwrap();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(line.level(), Some(Level::High));
        assert!(pwm.pulse_count() > 0);
    }

    #[test]
    fn frequency_change_applies_while_running() {
        let (pwm, line) = pwm(50.0, false);
        pwm.start(50.0).unwrap();

        let slow_from = Instant::now();
        thread::sleep(Duration::from_millis(300));
        let slow_to = Instant::now();

        pwm.set_frequency(200.0).unwrap();
        // Let the period already under way finish
        thread::sleep(Duration::from_millis(40));
        let fast_from = Instant::now();
        thread::sleep(Duration::from_millis(300));
        let fast_to = Instant::now();
        pwm.stop().unwrap();

        let transitions = line.transitions();
        let slow = mean_rising_gap(&transitions, slow_from, slow_to);
        let fast = mean_rising_gap(&transitions, fast_from, fast_to);

        // About 20ms, then about 5ms
        assert!(slow >= Duration::from_millis(15), "{slow:?}");
        assert!(fast * 2 < slow, "{fast:?} against {slow:?}");
        assert_eq!(pwm.frequency(), 200.0);
    }

    #[test]
    fn cleanup_releases_line() {
        let (pwm, line) = pwm(100.0, false);
        pwm.start(50.0).unwrap();
        pwm.cleanup().unwrap();

        assert!(line.is_released());
        assert!(!pwm.is_running());
        assert!(matches!(pwm.start(50.0), Err(Error::Released(13))));

        // Idempotent
        pwm.cleanup().unwrap();
    }

    #[test]
    fn generator_gives_up_on_line_failure() {
        let (pwm, line) = pwm(200.0, false);
        pwm.start(50.0).unwrap();
        line.set_failing(true);
        thread::sleep(Duration::from_millis(50));

        assert!(!pwm.is_running());

        line.set_failing(false);
        assert!(pwm.start(50.0).unwrap());
        assert!(pwm.is_running());
    }

    #[test]
    fn status_snapshot() {
        let (pwm, _line) = pwm(1000.0, false);
        pwm.set_duty_cycle(25.0).unwrap();

        let status = pwm.status();
        assert_eq!(status.pin, 13);
        assert_eq!(status.frequency, 1000.0);
        assert_eq!(status.duty_cycle, 25.0);
        assert!(!status.running);
        assert!(!status.inverted);
        assert_eq!(status.pulses, 0);
    }
}
