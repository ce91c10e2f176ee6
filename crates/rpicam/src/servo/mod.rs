//! Pan/tilt servo control.
//!
//! A [`ServoOp`] describes one motion or pause; [`Servo`] applies ops to a
//! PWM [`Actuator`] and keeps track of the current angle.

mod actuator;
mod controller;
mod op;

pub use actuator::{Actuator, SimulatedActuator, SysfsPwm, HARDWARE_SETTLE_TIME};
pub use controller::{RangePolicy, Servo, ServoConfig, PRECISION_THRESHOLD_ANGLE};
pub use op::{parse_program, Sense, ServoOp};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServoError {
    #[error("Invalid servo op '{0}'")]
    Parse(String),

    #[error("Servo '{name}': angle {angle}° outside of [0, 180]")]
    OutOfRange { name: String, angle: i32 },

    #[error("Unknown range policy '{0}' (expected raise, warn or ignore)")]
    UnknownPolicy(String),

    #[error("Actuator error: {0}")]
    Actuator(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
