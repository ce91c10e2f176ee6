//! `rpicam servo` commands

use std::path::PathBuf;

use argh::FromArgs;

use super::{config_state_store, parse_ops, pick};
use crate::config::{Config, ServoEntry};
use crate::error::{Error, Result};
use crate::servo::{
    Actuator, RangePolicy, Servo, SimulatedActuator, SysfsPwm, HARDWARE_SETTLE_TIME,
};
use crate::shutdown::CancelToken;
use crate::state::StateStore;

/// Control a servo directly
#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "servo")]
pub struct ServoCommand {
    #[argh(subcommand)]
    action: ServoAction,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand)]
enum ServoAction {
    Move(MoveArgs),
}

/// Run a servo op program, e.g. `noon cw(30) pause ccw`
#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "move")]
struct MoveArgs {
    /// servo name, used for its config entry and stored angle (default: servo)
    #[argh(option, short = 'n', default = "String::from(\"servo\")")]
    name: String,

    /// sysfs PWM chip (default: /sys/class/pwm/pwmchip0)
    #[argh(option)]
    chip: Option<PathBuf>,

    /// PWM channel the servo signal is wired to
    #[argh(option, short = 'p')]
    channel: Option<u32>,

    /// what to do with targets outside of [0, 180]: raise, warn, ignore
    #[argh(option)]
    on_invalid_angle: Option<String>,

    /// allow targets outside of [0, 180]
    #[argh(switch)]
    unsafe_range: bool,

    /// start from the angle stored by the previous run
    #[argh(switch)]
    load_previous_angle: bool,

    /// repeat the program, returning to the start angle each time, until Ctrl+C
    #[argh(switch)]
    cycle: bool,

    /// log the motions instead of driving the PWM signal
    #[argh(switch)]
    dry_run: bool,

    /// ops: cw, ccw, cw(N), ccw(N), full_cw, full_ccw, noon, abs(N), N, pause, pause(S)
    #[argh(positional)]
    ops: Vec<String>,
}

impl ServoCommand {
    pub fn run(self, config: &Config, cancel: CancelToken) -> Result<()> {
        match self.action {
            ServoAction::Move(args) => args.run(config, cancel),
        }
    }
}

impl MoveArgs {
    fn entry(&self, config: &Config) -> Result<ServoEntry> {
        let mut entry = config.servos.get(&self.name).cloned().unwrap_or_default();
        entry.chip = pick(self.chip.clone(), entry.chip);
        entry.channel = pick(self.channel, entry.channel);
        if let Some(policy) = &self.on_invalid_angle {
            entry.on_invalid_angle = policy.parse::<RangePolicy>()?;
        }
        entry.unsafe_range |= self.unsafe_range;
        entry.load_previous_angle |= self.load_previous_angle;
        Ok(entry)
    }

    fn run(self, config: &Config, cancel: CancelToken) -> Result<()> {
        let ops = parse_ops(&self.ops.join(" ")).map_err(Error::Config)?;
        let entry = self.entry(config)?;
        let state = (!self.dry_run).then(|| config_state_store(config));
        let mut servo = build_servo(&self.name, &entry, self.dry_run, state)?;

        servo.execute_sequence(&ops, self.cycle, &cancel)?;
        log::info!("[servo:{}] Final angle {}°", servo.name(), servo.angle());
        println!("{}", servo.angle());
        Ok(())
    }
}

/// Servo driven by the PWM channel of `entry`, or a simulated one for dry runs.
pub(crate) fn build_servo(
    name: &str,
    entry: &ServoEntry,
    dry_run: bool,
    state: Option<StateStore>,
) -> Result<Servo> {
    let actuator: Box<dyn Actuator> = if dry_run {
        log::info!("[servo:{name}] Dry run, PWM signal is simulated");
        Box::new(SimulatedActuator::new().with_settle_time(HARDWARE_SETTLE_TIME))
    } else {
        Box::new(SysfsPwm::open(&entry.chip, entry.channel, entry.freq_hz)?)
    };
    Ok(Servo::new(actuator, entry.servo_config(name), state)?)
}
