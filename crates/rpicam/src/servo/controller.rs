use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::{Actuator, Sense, ServoError, ServoOp};
use crate::shutdown::CancelToken;
use crate::state::StateStore;

/// Moves smaller than this are imprecise on hobby servos.
pub const PRECISION_THRESHOLD_ANGLE: i32 = 20;

const MIN_ANGLE: i32 = 0;
const MAX_ANGLE: i32 = 180;

/// What to do with a target angle outside of [0, 180].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RangePolicy {
    #[default]
    Raise,
    Warn,
    Ignore,
}

impl FromStr for RangePolicy {
    type Err = ServoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "raise" => Ok(RangePolicy::Raise),
            "warn" => Ok(RangePolicy::Warn),
            "ignore" => Ok(RangePolicy::Ignore),
            _ => Err(ServoError::UnknownPolicy(s.to_string())),
        }
    }
}

impl fmt::Display for RangePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RangePolicy::Raise => f.write_str("raise"),
            RangePolicy::Warn => f.write_str("warn"),
            RangePolicy::Ignore => f.write_str("ignore"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServoConfig {
    /// Name used in logs and as state key
    pub name: String,
    /// Allow angles outside of [0, 180]
    pub unsafe_range: bool,
    pub on_invalid_angle: RangePolicy,
    /// Move to the angle persisted by a previous run after initialisation
    pub load_previous_angle: bool,
    /// Move here after initialisation, unless a previous angle was loaded
    pub initial_angle: Option<i32>,
}

impl Default for ServoConfig {
    fn default() -> Self {
        Self {
            name: "servo".to_string(),
            unsafe_range: false,
            on_invalid_angle: RangePolicy::Raise,
            load_previous_angle: false,
            initial_angle: None,
        }
    }
}

impl ServoConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// A servo driven through an [`Actuator`].
///
/// The servo is driven to 0° on construction, so relative ops always start
/// from a known angle.
pub struct Servo {
    config: ServoConfig,
    actuator: Box<dyn Actuator>,
    angle: i32,
    state: Option<StateStore>,
}

impl fmt::Debug for Servo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Servo")
            .field("name", &self.config.name)
            .field("angle", &self.angle)
            .finish()
    }
}

impl Servo {
    pub fn new(
        actuator: Box<dyn Actuator>,
        config: ServoConfig,
        state: Option<StateStore>,
    ) -> Result<Self, ServoError> {
        let mut servo = Self {
            config,
            actuator,
            angle: MIN_ANGLE,
            state,
        };
        servo.initialize()?;
        Ok(servo)
    }

    fn initialize(&mut self) -> Result<(), ServoError> {
        log::info!("[servo:{}] Move: ??° ==> 0°", self.config.name);
        self.drive(MIN_ANGLE)?;
        self.angle = MIN_ANGLE;

        let previous = if self.config.load_previous_angle {
            self.load_angle()
        } else {
            None
        };
        match previous.or(self.config.initial_angle) {
            Some(angle) => self.apply_motion(&ServoOp::absolute(angle)),
            None => {
                self.persist_angle();
                Ok(())
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Current absolute angle in degrees.
    pub fn angle(&self) -> i32 {
        self.angle
    }

    pub fn angle_to_duty_cycle(angle: i32) -> f64 {
        ((f64::from(MAX_ANGLE) - f64::from(angle)) / 18.0) + 2.5
    }

    fn state_key(&self) -> [&str; 3] {
        ["servo", &self.config.name, "angle"]
    }

    fn load_angle(&self) -> Option<i32> {
        let state = self.state.as_ref()?;
        match state.get(&self.state_key()) {
            Ok(Some(value)) => match value.as_i64() {
                Some(angle) => i32::try_from(angle).ok(),
                None => {
                    log::warn!(
                        "[servo:{}] Ignoring persisted angle {}",
                        self.config.name,
                        value
                    );
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                log::warn!("[servo:{}] Could not load angle: {}", self.config.name, e);
                None
            }
        }
    }

    fn persist_angle(&self) {
        if let Some(state) = &self.state {
            if let Err(e) = state.set(&self.state_key(), serde_json::json!(self.angle)) {
                log::warn!("[servo:{}] Could not persist angle: {}", self.config.name, e);
            }
        }
    }

    /// Absolute angle `op` moves to from the current angle, `None` for pauses.
    ///
    /// A relative move past the `i32` range is always out of range, whatever
    /// the range policy.
    pub fn target_angle(&self, op: &ServoOp) -> Result<Option<i32>, ServoError> {
        let overflow = |saturated: i32| ServoError::OutOfRange {
            name: self.config.name.clone(),
            angle: saturated,
        };
        let target = match (op.angle, op.sense) {
            (Some(angle), None) => Some(angle),
            (Some(angle), Some(Sense::Cw)) => Some(
                self.angle
                    .checked_add(angle)
                    .ok_or_else(|| overflow(self.angle.saturating_add(angle)))?,
            ),
            (Some(angle), Some(Sense::Ccw)) => Some(
                self.angle
                    .checked_sub(angle)
                    .ok_or_else(|| overflow(self.angle.saturating_sub(angle)))?,
            ),
            (None, Some(Sense::Cw)) => Some(MAX_ANGLE),
            (None, Some(Sense::Ccw)) => Some(MIN_ANGLE),
            (None, None) => None,
        };
        Ok(target)
    }

    fn drive(&mut self, angle: i32) -> Result<(), ServoError> {
        self.actuator
            .set_duty_cycle(Self::angle_to_duty_cycle(angle))?;
        std::thread::sleep(self.actuator.settle_time());
        self.actuator.release()
    }

    /// Perform the motion part of `op`, without its pause.
    fn apply_motion(&mut self, op: &ServoOp) -> Result<(), ServoError> {
        let Some(target) = self.target_angle(op)? else {
            return Ok(());
        };

        if !self.config.unsafe_range && !(MIN_ANGLE..=MAX_ANGLE).contains(&target) {
            match self.config.on_invalid_angle {
                RangePolicy::Raise => {
                    return Err(ServoError::OutOfRange {
                        name: self.config.name.clone(),
                        angle: target,
                    })
                }
                RangePolicy::Warn => {
                    log::warn!(
                        "[servo:{}] Skipping {}: target {}° out of range",
                        self.config.name,
                        op,
                        target
                    );
                    return Ok(());
                }
                RangePolicy::Ignore => {
                    log::debug!(
                        "[servo:{}] Skipping {}: target {}° out of range",
                        self.config.name,
                        op,
                        target
                    );
                    return Ok(());
                }
            }
        }

        if target == self.angle {
            return Ok(());
        }
        if self.angle.abs_diff(target) < PRECISION_THRESHOLD_ANGLE.unsigned_abs() {
            log::warn!(
                "[servo:{}] Operation under precision threshold ({}°)",
                self.config.name,
                PRECISION_THRESHOLD_ANGLE
            );
        }

        log::info!("[servo:{}] Move: {}° ==> {}°", self.config.name, self.angle, target);
        self.drive(target)?;
        self.angle = target;
        self.persist_angle();
        Ok(())
    }

    /// Move as described by `op`, then sleep its pause.
    pub fn apply_op(&mut self, op: &ServoOp) -> Result<(), ServoError> {
        self.apply_motion(op)?;
        if !op.pause.is_zero() {
            std::thread::sleep(op.pause);
        }
        Ok(())
    }

    /// Apply `ops` in order.
    ///
    /// With `cycle`, the servo returns to the angle it started at after each
    /// pass and the sequence repeats until `cancel` fires. The signal is
    /// released whenever the sequence stops.
    pub fn execute_sequence(
        &mut self,
        ops: &[ServoOp],
        cycle: bool,
        cancel: &CancelToken,
    ) -> Result<(), ServoError> {
        let result = self.run_sequence(ops, cycle, cancel);
        if let Err(e) = self.actuator.release() {
            log::warn!("[servo:{}] Failed to release: {}", self.config.name, e);
        }
        result
    }

    fn run_sequence(
        &mut self,
        ops: &[ServoOp],
        cycle: bool,
        cancel: &CancelToken,
    ) -> Result<(), ServoError> {
        if ops.is_empty() {
            return Ok(());
        }
        let start = self.angle;
        loop {
            for op in ops {
                if cancel.is_cancelled() {
                    log::debug!("[servo:{}] Sequence cancelled", self.config.name);
                    return Ok(());
                }
                self.apply_motion(op)?;
                if !cancel.sleep(op.pause) {
                    return Ok(());
                }
            }
            if !cycle {
                return Ok(());
            }
            if cancel.is_cancelled() {
                return Ok(());
            }
            self.apply_motion(&ServoOp::absolute(start))?;
        }
    }
}
