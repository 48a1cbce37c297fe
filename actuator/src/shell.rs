use std::io::{self, BufRead, Write};
use std::thread;
use std::time::Duration;

use actuator::gpio::OutputLine;
use actuator::led::Led;
use anyhow::{bail, Context};
use crossbeam::channel::{self, Receiver};
use crossbeam::select;
use tracing::debug;

const HELP: &str = "\
Commands:
  on [brightness]              light the LED, optionally at a brightness (0-100)
  off                          turn the LED off
  brightness [value]           set or show the brightness
  fade <target> [seconds]      fade to a brightness
  blink [times] [interval] [brightness]
  breathe                      pulse slowly until stopped
  stop                         stop the running animation
  status                       show the LED state
  help                         show this help
  quit | exit | q              leave the shell";

const BLINK_TIMES: u32 = 3;
const BLINK_INTERVAL: f64 = 0.5;
const FADE_DURATION: f64 = 1.0;
const FADE_STEPS: u32 = 50;
const BREATHE_PERIOD: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq)]
pub enum ShellCommand {
    On(Option<f64>),
    Off,
    Brightness(Option<f64>),
    Fade {
        target: f64,
        duration: Duration,
    },
    Blink {
        times: u32,
        interval: Duration,
        brightness: Option<f64>,
    },
    Breathe,
    Stop,
    Status,
    Help,
    Quit,
}

/// Parses one line of input. Blank lines give `None`
pub fn parse_command(line: &str) -> anyhow::Result<Option<ShellCommand>> {
    let line = line.trim().to_lowercase();
    let mut words = line.split_whitespace();
    let Some(command) = words.next() else {
        return Ok(None);
    };
    let args: Vec<&str> = words.collect();

    let number = |idx: usize| -> anyhow::Result<Option<f64>> {
        args.get(idx)
            .map(|word| {
                word.parse::<f64>()
                    .with_context(|| format!("{word:?} is not a number"))
            })
            .transpose()
    };
    let seconds = |idx: usize, default: f64| -> anyhow::Result<Duration> {
        let secs = number(idx)?.unwrap_or(default);
        Duration::try_from_secs_f64(secs).with_context(|| format!("{secs} is not a duration"))
    };

    let command = match command {
        "on" => ShellCommand::On(number(0)?),
        "off" => ShellCommand::Off,
        "brightness" => ShellCommand::Brightness(number(0)?),
        "fade" => {
            let Some(target) = number(0)? else {
                bail!("Usage: fade <target> [seconds]");
            };
            ShellCommand::Fade {
                target,
                duration: seconds(1, FADE_DURATION)?,
            }
        }
        "blink" => {
            let times = match args.first() {
                Some(word) => word
                    .parse()
                    .with_context(|| format!("{word:?} is not a count"))?,
                None => BLINK_TIMES,
            };
            ShellCommand::Blink {
                times,
                interval: seconds(1, BLINK_INTERVAL)?,
                brightness: number(2)?,
            }
        }
        "breathe" => ShellCommand::Breathe,
        "stop" => ShellCommand::Stop,
        "status" => ShellCommand::Status,
        "help" => ShellCommand::Help,
        "quit" | "exit" | "q" => ShellCommand::Quit,
        other => bail!("Unknown command {other:?}, type help for a list"),
    };

    Ok(Some(command))
}

/// Reads commands from stdin until quit, end of input or `stop` fires
pub fn run<P: OutputLine>(led: &Led<P>, stop: &Receiver<()>) -> anyhow::Result<()> {
    let (lines_tx, lines) = channel::unbounded();
    thread::Builder::new()
        .name("stdin".into())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                let Ok(line) = line else {
                    break;
                };
                if lines_tx.send(line).is_err() {
                    break;
                }
            }
        })
        .context("Spawn stdin reader")?;

    println!("LED shell on pin {}, type help for commands", led.status().pwm.pin);

    loop {
        print!("LED> ");
        io::stdout().flush().context("Flush stdout")?;

        let line = select! {
            recv(lines) -> line => match line {
                Ok(line) => line,
                Err(_) => break,
            },
            recv(stop) -> _ => break,
        };

        let command = match parse_command(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(err) => {
                println!("Error: {err:#}");
                continue;
            }
        };
        debug!("Shell command {command:?}");

        if command == ShellCommand::Quit {
            break;
        }
        if let Err(err) = execute(led, command) {
            println!("Error: {err:#}");
        }
    }

    println!();

    Ok(())
}

fn execute<P: OutputLine>(led: &Led<P>, command: ShellCommand) -> anyhow::Result<()> {
    match command {
        ShellCommand::On(brightness) => {
            led.on(brightness)?;
            println!("LED on at {}%", led.brightness());
        }
        ShellCommand::Off => {
            led.off()?;
            println!("LED off");
        }
        ShellCommand::Brightness(Some(brightness)) => {
            led.set_brightness(brightness)?;
            println!("Brightness set to {}%", led.brightness());
        }
        ShellCommand::Brightness(None) => println!("Brightness is {}%", led.brightness()),
        ShellCommand::Fade { target, duration } => {
            if !led.is_on() {
                led.on(Some(0.0))?;
            }
            led.fade_to(target, duration, FADE_STEPS)?;
            println!("Fading to {target}% over {duration:?}");
        }
        ShellCommand::Blink {
            times,
            interval,
            brightness,
        } => {
            led.blink(times, interval, interval, brightness)?;
            println!("Blinking {times} times");
        }
        ShellCommand::Breathe => {
            led.breathe(BREATHE_PERIOD, 0.0, None)?;
            println!("Breathing, type stop to end");
        }
        ShellCommand::Stop => {
            led.stop_animation();
            println!("Animation stopped");
        }
        ShellCommand::Status => {
            println!("{}", serde_json::to_string_pretty(&led.status())?);
        }
        ShellCommand::Help => println!("{HELP}"),
        ShellCommand::Quit => {}
    }

    Ok(())
}
