use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use super::ServoError;

/// Direction of a relative motion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sense {
    Cw,
    Ccw,
}

impl fmt::Display for Sense {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sense::Cw => f.write_str("CW"),
            Sense::Ccw => f.write_str("CCW"),
        }
    }
}

/// One servo operation.
///
/// - `angle` without `sense`: move to that absolute angle
/// - `angle` with `sense`: move relative to the current angle
/// - `sense` only: full travel in that direction
/// - neither: pure pause
///
/// `pause` is slept after the motion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ServoOp {
    pub angle: Option<i32>,
    pub sense: Option<Sense>,
    pub pause: Duration,
}

impl ServoOp {
    pub const CW: ServoOp = ServoOp::relative(30, Sense::Cw);
    pub const CCW: ServoOp = ServoOp::relative(30, Sense::Ccw);
    pub const FULL_CW: ServoOp = ServoOp::full(Sense::Cw);
    pub const FULL_CCW: ServoOp = ServoOp::full(Sense::Ccw);
    pub const NOON: ServoOp = ServoOp::absolute(90);
    pub const PAUSE: ServoOp = ServoOp::pause_for(Duration::from_secs(1));

    pub const fn absolute(angle: i32) -> Self {
        Self {
            angle: Some(angle),
            sense: None,
            pause: Duration::ZERO,
        }
    }

    pub const fn relative(angle: i32, sense: Sense) -> Self {
        Self {
            angle: Some(angle),
            sense: Some(sense),
            pause: Duration::ZERO,
        }
    }

    pub const fn full(sense: Sense) -> Self {
        Self {
            angle: None,
            sense: Some(sense),
            pause: Duration::ZERO,
        }
    }

    pub const fn pause_for(pause: Duration) -> Self {
        Self {
            angle: None,
            sense: None,
            pause,
        }
    }

    /// Sleep for `pause` after the motion.
    pub fn then_pause(mut self, pause: Duration) -> Self {
        self.pause = pause;
        self
    }

    pub fn is_noop(&self) -> bool {
        self.angle.is_none() && self.sense.is_none() && self.pause.is_zero()
    }

    /// Whether the op moves the servo at all.
    pub fn is_motion(&self) -> bool {
        self.angle.is_some() || self.sense.is_some()
    }
}

impl fmt::Display for ServoOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.angle, self.sense) {
            (Some(a), Some(s)) => write!(f, "{}({})", s.to_string().to_lowercase(), a)?,
            (Some(a), None) => write!(f, "abs({})", a)?,
            (None, Some(s)) => write!(f, "full_{}", s.to_string().to_lowercase())?,
            (None, None) => return write!(f, "pause({})", self.pause.as_secs_f64()),
        }
        if !self.pause.is_zero() {
            write!(f, "+pause({})", self.pause.as_secs_f64())?;
        }
        Ok(())
    }
}

/// Split `name(arg)` into its parts. A bare name has no argument.
fn split_call(token: &str) -> Option<(&str, Option<&str>)> {
    match token.find('(') {
        None => Some((token, None)),
        Some(open) => {
            let arg = token[open + 1..].strip_suffix(')')?;
            Some((&token[..open], Some(arg.trim())))
        }
    }
}

impl FromStr for ServoOp {
    type Err = ServoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let token = s.trim().to_lowercase();
        let err = || ServoError::Parse(s.to_string());

        if let Ok(angle) = token.parse::<i32>() {
            return Ok(ServoOp::absolute(angle));
        }

        let (name, arg) = split_call(&token).ok_or_else(err)?;
        let int_arg = || -> Result<i32, ServoError> {
            arg.ok_or_else(err)?.parse::<i32>().map_err(|_| err())
        };

        match (name, arg) {
            ("cw", None) => Ok(ServoOp::CW),
            ("ccw", None) => Ok(ServoOp::CCW),
            ("cw", Some(_)) => Ok(ServoOp::relative(int_arg()?, Sense::Cw)),
            ("ccw", Some(_)) => Ok(ServoOp::relative(int_arg()?, Sense::Ccw)),
            ("full_cw", None) => Ok(ServoOp::FULL_CW),
            ("full_ccw", None) => Ok(ServoOp::FULL_CCW),
            ("noon", None) => Ok(ServoOp::NOON),
            ("abs", Some(_)) => Ok(ServoOp::absolute(int_arg()?)),
            ("pause", None) => Ok(ServoOp::PAUSE),
            ("pause", Some(secs)) => {
                let secs: f64 = secs.parse().map_err(|_| err())?;
                if !secs.is_finite() || secs < 0.0 {
                    return Err(err());
                }
                Ok(ServoOp::pause_for(Duration::try_from_secs_f64(secs).map_err(|_| err())?))
            }
            _ => Err(err()),
        }
    }
}

/// Parse a program of ops separated by whitespace or commas.
pub fn parse_program(program: &str) -> Result<Vec<ServoOp>, ServoError> {
    program
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|t| !t.is_empty())
        .map(str::parse)
        .collect()
}
