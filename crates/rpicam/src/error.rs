//! Error types shared by the camera drivers, encoder and platform.

use std::time::Duration;
use thiserror::Error;

use crate::notify::NotifyError;
use crate::process::ProcessError;
use crate::servo::ServoError;
use crate::state::StateError;
use crate::storage::StorageError;

/// Errors that can occur while recording, encoding or orchestrating jobs.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid job or driver configuration, raised before any hardware action
    #[error("Config error: {0}")]
    Config(String),

    /// A frame could not be captured and the failover policy escalated
    #[error("Capture error: {0}")]
    Capture(String),

    /// Too many consecutive frames took longer than the requested cadence
    #[error(
        "Cannot capture: sec_per_frame={:.3} but processing frame took {:.5} sec ({consecutive} consecutive overruns)",
        .sec_per_frame.as_secs_f64(),
        .took.as_secs_f64()
    )]
    Overrun {
        sec_per_frame: Duration,
        took: Duration,
        consecutive: u32,
    },

    /// Frame stack to video conversion failed
    #[error("Encoder error: {0}")]
    Encoder(String),

    /// A job exceeded its execution budget
    #[error("Timeout: job exceeded {:.1} sec", .0.as_secs_f64())]
    Timeout(Duration),

    /// The job was interrupted through its cancel token
    #[error("Cancelled")]
    Cancelled,

    /// Worker/queue level failure in the platform
    #[error("Platform error: {0}")]
    Platform(String),

    /// A callback handler failed or could not be invoked
    #[error("Callback error: {0}")]
    Callback(String),

    #[error("Servo error: {0}")]
    Servo(#[from] ServoError),

    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("Notify error: {0}")]
    Notify(#[from] NotifyError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Process error: {0}")]
    Process(#[from] ProcessError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
