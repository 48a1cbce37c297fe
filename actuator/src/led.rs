//! Brightness control and simple animations for an LED on a soft PWM line

use std::f64::consts::TAU;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use common::error::LogErrorExt;
use serde::Serialize;
use tracing::{debug, error, info, span, warn};

use crate::error::{Error, Result};
use crate::gpio::OutputLine;
use crate::soft_pwm::{PwmStatus, SoftPwm};
use crate::task::{self, Task};

/// How long `stop_animation` waits for the animation thread
pub const ANIMATION_STOP_TIMEOUT: Duration = Duration::from_secs(1);
/// Brightness updates per second while breathing
pub const BREATHE_RATE: u32 = 50;

struct Inner<P: OutputLine> {
    pwm: SoftPwm<P>,
    max_brightness: f64,
    /// f64 bits, the brightness last applied after clamping
    brightness: AtomicU64,
}

impl<P: OutputLine> Inner<P> {
    fn brightness(&self) -> f64 {
        f64::from_bits(self.brightness.load(Ordering::Relaxed))
    }

    /// Applies `brightness`, capped at the maximum, starting the PWM if needed
    fn apply(&self, brightness: f64) -> Result<()> {
        Error::check_range("brightness", brightness, 0.0..=100.0, "0..=100")?;
        let actual = brightness.min(self.max_brightness);

        if self.pwm.is_running() {
            self.pwm.set_duty_cycle(actual)?;
        } else {
            self.pwm.start(actual)?;
        }
        self.brightness.store(actual.to_bits(), Ordering::Relaxed);
        debug!("LED brightness set to {actual}%");

        Ok(())
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Serialize)]
pub struct LedStatus {
    pub brightness: f64,
    pub max_brightness: f64,
    pub on: bool,
    pub animating: bool,
    pub pwm: PwmStatus,
}

/// An LED driven by a soft PWM channel, duty cycle standing in for brightness
pub struct Led<P: OutputLine> {
    inner: Arc<Inner<P>>,
    on: AtomicBool,
    animation: Mutex<Option<Task>>,
}

impl<P: OutputLine> Led<P> {
    /// Wraps a stopped PWM channel. Brightness is never driven above `max_brightness`
    #[tracing::instrument(skip(pwm), fields(pin = pwm.pin()))]
    pub fn new(pwm: SoftPwm<P>, max_brightness: f64) -> Result<Self> {
        if !(0.0..=100.0).contains(&max_brightness) {
            return Err(Error::Configuration(format!(
                "Maximum brightness must be within 0..=100, got {max_brightness}"
            )));
        }

        info!("LED on pin {} limited to {max_brightness}%", pwm.pin());

        Ok(Self {
            inner: Arc::new(Inner {
                pwm,
                max_brightness,
                brightness: AtomicU64::new(0f64.to_bits()),
            }),
            on: AtomicBool::new(false),
            animation: Mutex::new(None),
        })
    }

    fn animation(&self) -> MutexGuard<'_, Option<Task>> {
        self.animation.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Turns the LED on at `brightness`, or at the last non-zero brightness, or at the maximum
    pub fn on(&self, brightness: Option<f64>) -> Result<()> {
        let brightness = brightness.unwrap_or_else(|| {
            let current = self.brightness();
            if current > 0.0 {
                current
            } else {
                self.inner.max_brightness
            }
        });

        self.inner.apply(brightness)?;
        self.on.store(true, Ordering::Relaxed);
        info!("LED on at {}%", self.brightness());

        Ok(())
    }

    /// Stops any animation and drives the LED dark
    pub fn off(&self) -> Result<()> {
        self.stop_animation();
        self.inner.apply(0.0)?;
        self.on.store(false, Ordering::Relaxed);
        info!("LED off");

        Ok(())
    }

    pub fn set_brightness(&self, brightness: f64) -> Result<()> {
        self.inner.apply(brightness)
    }

    pub fn brightness(&self) -> f64 {
        self.inner.brightness()
    }

    pub fn max_brightness(&self) -> f64 {
        self.inner.max_brightness
    }

    pub fn is_on(&self) -> bool {
        self.on.load(Ordering::Relaxed)
    }

    /// Moves from the current brightness to `target` in `steps` equal steps over `duration`
    pub fn fade_to(&self, target: f64, duration: Duration, steps: u32) -> Result<()> {
        Error::check_range("target brightness", target, 0.0..=100.0, "0..=100")?;
        Error::check_positive("fade duration", duration.as_secs_f64())?;
        Error::check_positive("fade steps", steps as f64)?;

        let inner = self.inner.clone();
        self.animate("fade", move |stop| {
            let start = inner.brightness();
            let step = (target - start) / steps as f64;
            let interval = duration / steps;

            for idx in 0..=steps {
                if let Err(err) = inner.apply(start + step * idx as f64) {
                    error!("Fade stopped: {err}");
                    return;
                }
                if idx < steps && task::wait(stop, interval) {
                    return;
                }
            }
        })?;

        info!("Fading from {}% to {target}% over {duration:?}", self.brightness());

        Ok(())
    }

    /// Flashes the LED `times` times, then goes back to the previous brightness unless
    /// interrupted. `brightness` defaults to the maximum
    pub fn blink(
        &self,
        times: u32,
        on_time: Duration,
        off_time: Duration,
        brightness: Option<f64>,
    ) -> Result<()> {
        Error::check_positive("blink count", times as f64)?;
        Error::check_positive("blink on time", on_time.as_secs_f64())?;
        Error::check_positive("blink off time", off_time.as_secs_f64())?;
        let brightness = brightness.unwrap_or(self.inner.max_brightness);
        Error::check_range("blink brightness", brightness, 0.0..=100.0, "0..=100")?;

        let inner = self.inner.clone();
        self.animate("blink", move |stop| {
            let original = inner.brightness();

            for _ in 0..times {
                if let Err(err) = inner.apply(brightness) {
                    error!("Blink stopped: {err}");
                    return;
                }
                if task::wait(stop, on_time) {
                    return;
                }

                if let Err(err) = inner.apply(0.0) {
                    error!("Blink stopped: {err}");
                    return;
                }
                if task::wait(stop, off_time) {
                    return;
                }
            }

            inner.apply(original).log_error("Restore brightness after blink");
        })?;

        info!("Blinking {times} times at {brightness}%");

        Ok(())
    }

    /// Swings the brightness along a sine wave between `min` and `max` until stopped.
    /// `max` defaults to the maximum brightness
    pub fn breathe(&self, period: Duration, min: f64, max: Option<f64>) -> Result<()> {
        Error::check_positive("breathe period", period.as_secs_f64())?;
        Error::check_range("breathe minimum", min, 0.0..=100.0, "0..=100")?;
        let max = max.unwrap_or(self.inner.max_brightness);
        if !(min..=100.0).contains(&max) {
            return Err(Error::Range {
                what: "breathe maximum",
                value: max,
                expected: "minimum..=100",
            });
        }

        let inner = self.inner.clone();
        let interval = Duration::from_secs(1) / BREATHE_RATE;
        self.animate("breathe", move |stop| {
            let start = Instant::now();

            loop {
                let level = breathe_level(start.elapsed(), period, min, max);
                if let Err(err) = inner.apply(level) {
                    error!("Breathe stopped: {err}");
                    return;
                }
                if task::wait(stop, interval) {
                    return;
                }
            }
        })?;

        info!("Breathing between {min}% and {max}% every {period:?}");

        Ok(())
    }

    /// Replaces the running animation with `body`
    fn animate<F>(&self, name: &'static str, body: F) -> Result<()>
    where
        F: FnOnce(&crossbeam::channel::Receiver<()>) + Send + 'static,
    {
        let mut animation = self.animation();
        if let Some(task) = animation.take() {
            stop_task(task);
        }

        let pin = self.inner.pwm.pin();
        let task = Task::spawn(format!("led-{name}-{pin}"), move |stop| {
            let span = span!(tracing::Level::DEBUG, "LED animation", animation = name, pin);
            let _enter = span.enter();

            body(stop);
        })?;
        *animation = Some(task);

        Ok(())
    }

    /// Stops the running animation, leaving the brightness where it was
    pub fn stop_animation(&self) {
        if let Some(task) = self.animation().take() {
            stop_task(task);
        }
    }

    pub fn is_animating(&self) -> bool {
        self.animation()
            .as_ref()
            .map_or(false, |task| !task.is_finished())
    }

    pub fn status(&self) -> LedStatus {
        LedStatus {
            brightness: self.brightness(),
            max_brightness: self.inner.max_brightness,
            on: self.is_on(),
            animating: self.is_animating(),
            pwm: self.inner.pwm.status(),
        }
    }

    /// Stops everything, turns the LED off and releases the line
    pub fn cleanup(&self) -> Result<()> {
        self.off().log_warn("Turn LED off during cleanup");
        self.on.store(false, Ordering::Relaxed);
        self.inner.pwm.cleanup()?;
        info!("LED on pin {} cleaned up", self.inner.pwm.pin());

        Ok(())
    }
}

impl<P: OutputLine> Drop for Led<P> {
    fn drop(&mut self) {
        self.stop_animation();
    }
}

fn stop_task(task: Task) {
    if task.stop(ANIMATION_STOP_TIMEOUT) {
        debug!("Animation stopped");
    } else {
        warn!("Animation thread did not stop within {ANIMATION_STOP_TIMEOUT:?}");
    }
}

/// Brightness `elapsed` into a breathing cycle, starting halfway up
pub fn breathe_level(elapsed: Duration, period: Duration, min: f64, max: f64) -> f64 {
    let period = period.as_secs_f64();
    let phase = (elapsed.as_secs_f64() % period) / period * TAU;

    min + (max - min) * (phase.sin() + 1.0) / 2.0
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::{Duration, Instant};

    use rppal::gpio::Level;

    use crate::error::Error;
    use crate::gpio::MockLine;
    use crate::soft_pwm::SoftPwm;

    use super::{breathe_level, Led};

    fn led(max_brightness: f64) -> (Led<MockLine>, MockLine) {
        let line = MockLine::new(13);
        let observer = line.clone();
        let pwm = SoftPwm::new(line, 1000.0, false).unwrap();
        (Led::new(pwm, max_brightness).unwrap(), observer)
    }

    fn wait_until_idle(led: &Led<MockLine>) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while led.is_animating() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(!led.is_animating());
    }

    #[test]
    fn rejects_bad_maximum() {
        let pwm = SoftPwm::new(MockLine::new(13), 1000.0, false).unwrap();
        assert!(matches!(Led::new(pwm, 150.0), Err(Error::Configuration(_))));
    }

    #[test]
    fn brightness_is_capped() {
        let (led, _line) = led(60.0);

        led.set_brightness(80.0).unwrap();
        assert_eq!(led.brightness(), 60.0);
        assert_eq!(led.status().pwm.duty_cycle, 60.0);

        led.set_brightness(25.0).unwrap();
        assert_eq!(led.brightness(), 25.0);

        assert!(matches!(led.set_brightness(101.0), Err(Error::Range { .. })));
        assert!(led.set_brightness(-1.0).is_err());
        assert_eq!(led.brightness(), 25.0);
    }

    #[test]
    fn on_defaults() {
        let (led, _line) = led(80.0);
        assert!(!led.is_on());

        led.on(None).unwrap();
        assert!(led.is_on());
        assert_eq!(led.brightness(), 80.0);
        assert!(led.status().pwm.running);

        led.set_brightness(30.0).unwrap();
        led.on(None).unwrap();
        assert_eq!(led.brightness(), 30.0);

        led.on(Some(50.0)).unwrap();
        assert_eq!(led.brightness(), 50.0);
    }

    #[test]
    fn off_goes_dark() {
        let (led, line) = led(100.0);
        led.on(Some(100.0)).unwrap();
        thread::sleep(Duration::from_millis(20));

        led.off().unwrap();
        assert!(!led.is_on());
        assert_eq!(led.brightness(), 0.0);

        thread::sleep(Duration::from_millis(20));
        assert_eq!(line.level(), Some(Level::Low));
    }

    #[test]
    fn fade_reaches_target() {
        let (led, _line) = led(100.0);
        led.on(Some(10.0)).unwrap();

        led.fade_to(80.0, Duration::from_millis(100), 10).unwrap();
        assert!(led.is_animating());
        wait_until_idle(&led);

        assert!((led.brightness() - 80.0).abs() < 1e-9);
    }

    #[test]
    fn fade_rejects_bad_arguments() {
        let (led, _line) = led(100.0);

        assert!(led.fade_to(120.0, Duration::from_millis(100), 10).is_err());
        assert!(led.fade_to(50.0, Duration::ZERO, 10).is_err());
        assert!(led.fade_to(50.0, Duration::from_millis(100), 0).is_err());
        assert!(!led.is_animating());
    }

    #[test]
    fn blink_restores_brightness() {
        let (led, _line) = led(100.0);
        led.on(Some(20.0)).unwrap();

        led.blink(3, Duration::from_millis(10), Duration::from_millis(10), Some(90.0))
            .unwrap();
        wait_until_idle(&led);

        assert_eq!(led.brightness(), 20.0);
    }

    #[test]
    fn interrupted_blink_keeps_brightness() {
        let (led, _line) = led(100.0);
        led.on(Some(20.0)).unwrap();

        led.blink(5, Duration::from_secs(10), Duration::from_secs(10), Some(90.0))
            .unwrap();
        thread::sleep(Duration::from_millis(50));
        led.stop_animation();

        assert!(!led.is_animating());
        assert_eq!(led.brightness(), 90.0);
    }

    #[test]
    fn breathe_until_stopped() {
        let (led, _line) = led(100.0);

        assert!(led.breathe(Duration::from_millis(200), 50.0, Some(40.0)).is_err());
        assert!(led.breathe(Duration::ZERO, 10.0, None).is_err());

        led.breathe(Duration::from_millis(200), 10.0, Some(70.0)).unwrap();
        thread::sleep(Duration::from_millis(150));
        assert!(led.is_animating());

        let start = Instant::now();
        led.stop_animation();
        assert!(start.elapsed() < Duration::from_millis(500));
        assert!(!led.is_animating());

        let brightness = led.brightness();
        assert!((10.0..=70.0).contains(&brightness), "{brightness}");
    }

    #[test]
    fn breathe_curve() {
        let period = Duration::from_secs(2);

        assert!((breathe_level(Duration::ZERO, period, 10.0, 70.0) - 40.0).abs() < 1e-9);
        assert!((breathe_level(Duration::from_millis(500), period, 10.0, 70.0) - 70.0).abs() < 1e-9);
        assert!((breathe_level(Duration::from_millis(1500), period, 10.0, 70.0) - 10.0).abs() < 1e-9);
        assert!((breathe_level(Duration::from_millis(2500), period, 10.0, 70.0) - 70.0).abs() < 1e-9);
    }

    #[test]
    fn new_animation_replaces_old() {
        let (led, _line) = led(100.0);

        led.breathe(Duration::from_secs(1), 0.0, None).unwrap();
        thread::sleep(Duration::from_millis(30));
        led.fade_to(35.0, Duration::from_millis(50), 5).unwrap();
        wait_until_idle(&led);

        assert!((led.brightness() - 35.0).abs() < 1e-9);
    }

    #[test]
    fn cleanup_releases_line() {
        let (led, line) = led(100.0);
        led.breathe(Duration::from_secs(1), 0.0, None).unwrap();

        led.cleanup().unwrap();

        assert!(!led.is_animating());
        assert!(!led.is_on());
        assert!(line.is_released());
        assert!(led.on(None).is_err());
    }

    #[test]
    fn status_serializes() {
        let (led, _line) = led(75.0);
        led.on(Some(40.0)).unwrap();

        let status = serde_json::to_value(led.status()).unwrap();
        assert_eq!(status["brightness"], 40.0);
        assert_eq!(status["max_brightness"], 75.0);
        assert_eq!(status["on"], true);
        assert_eq!(status["pwm"]["pin"], 13);
    }
}
