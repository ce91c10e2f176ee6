//! Command-line interface for rpicam
//!
//! Usage:
//!   rpicam cam timelapse -d 120 --spf 10      # 2 h timelapse, one frame every 10 s
//!   rpicam cam timelapse --servo pan=cw,pause  # move the "pan" servo meanwhile
//!   rpicam cam live --spf 0.5                 # refresh a preview image
//!   rpicam cam stream --port 10001            # MPEG-TS over UDP
//!   rpicam servo move --channel 1 noon cw(45) # drive a servo directly

pub mod cam;
pub mod servo;

pub use cam::CamCommand;
pub use servo::ServoCommand;

use std::path::PathBuf;
use std::time::Duration;

use argh::FromArgs;

use crate::config::{self, Config};
use crate::error::{Error, Result};
use crate::servo::{parse_program, ServoOp};
use crate::shutdown::CancelToken;

/// Raspberry Pi camera timelapses, previews and streams with pan/tilt servos
#[derive(FromArgs, Debug)]
pub struct Args {
    /// path to the config file (default: ~/.rpicam/config.yaml)
    #[argh(option, short = 'c')]
    pub config: Option<PathBuf>,

    /// log debug messages
    #[argh(switch, short = 'v')]
    pub verbose: bool,

    /// log level (error, warn, info, debug, trace); overrides --verbose
    #[argh(option, short = 'l')]
    pub log_level: Option<String>,

    #[argh(subcommand)]
    pub command: Command,
}

impl Args {
    /// Log filter for `env_logger`.
    pub fn log_filter(&self) -> &str {
        match (&self.log_level, self.verbose) {
            (Some(level), _) => level,
            (None, true) => "debug",
            (None, false) => "info",
        }
    }
}

#[derive(FromArgs, Debug)]
#[argh(subcommand)]
pub enum Command {
    Cam(CamCommand),
    Servo(ServoCommand),
}

/// Run the parsed command until it finishes or `cancel` fires.
pub fn run(args: Args, cancel: CancelToken) -> Result<()> {
    let config = config::load_config_or_default(args.config.as_deref())
        .map_err(|e| Error::Config(e.to_string()))?;
    match args.command {
        Command::Cam(cmd) => cmd.run(&config, cancel),
        Command::Servo(cmd) => cmd.run(&config, cancel),
    }
}

/// Parse a resolution in format "WIDTHxHEIGHT"
pub fn parse_resolution(s: &str) -> std::result::Result<(u32, u32), String> {
    let (w, h) = s
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("Invalid resolution '{}'. Expected 'WIDTHxHEIGHT'", s))?;
    let parse = |v: &str| {
        v.trim()
            .parse::<u32>()
            .ok()
            .filter(|v| *v > 0)
            .ok_or_else(|| format!("Invalid resolution '{}'", s))
    };
    Ok((parse(w)?, parse(h)?))
}

/// Parse a positive number of seconds, fractions allowed
pub fn parse_seconds(s: &str) -> std::result::Result<Duration, String> {
    let secs: f64 = s
        .trim()
        .parse()
        .map_err(|_| format!("Invalid number of seconds '{}'", s))?;
    if !(secs > 0.0) || !secs.is_finite() {
        return Err(format!("Seconds must be positive, got '{}'", s));
    }
    Duration::try_from_secs_f64(secs).map_err(|_| format!("Too many seconds: '{}'", s))
}

/// Parse a servo op program, e.g. "noon cw(30) pause"
pub fn parse_ops(s: &str) -> std::result::Result<Vec<ServoOp>, String> {
    let ops = parse_program(s).map_err(|e| e.to_string())?;
    if ops.is_empty() {
        return Err("Empty servo program".to_string());
    }
    Ok(ops)
}

/// Parse a servo program bound to a servo name, in format "name=program"
pub fn parse_servo_program(s: &str) -> std::result::Result<(String, Vec<ServoOp>), String> {
    let (name, program) = s
        .split_once('=')
        .ok_or_else(|| format!("Invalid servo program '{}'. Expected 'name=ops'", s))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("Missing servo name in '{}'", s));
    }
    Ok((name.to_string(), parse_ops(program)?))
}

/// Merge a flag into a config value: the flag wins when given.
fn pick<T>(flag: Option<T>, from_config: T) -> T {
    flag.unwrap_or(from_config)
}

fn config_state_store(config: &Config) -> crate::state::StateStore {
    let path = config
        .state_file
        .clone()
        .unwrap_or_else(crate::state::StateStore::default_path);
    crate::state::StateStore::open(path)
}
