use std::{thread, time::Duration};

use actuator::peripheral::pca9685::{Pca9685, DEFAULT_ADDRESS, DEFAULT_BUS};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().init();

    let pca = Pca9685::open(DEFAULT_BUS, DEFAULT_ADDRESS)?;
    pca.initialize(50.0)?;

    let angles = (0..=180).step_by(10).chain((0..=180).rev().step_by(10));
    for angle in angles {
        pca.set_servo_angle(0, angle as f64)?;
        thread::sleep(Duration::from_millis(100));
    }

    pca.turn_off_all()?;

    Ok(())
}
