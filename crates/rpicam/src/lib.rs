//! rpicam
//!
//! Timelapse recording, live preview and UDP streaming for the Raspberry Pi
//! camera, with optional pan/tilt servos moved while a recording is running.
//!
//! # Overview
//!
//! - [`callback`]: lifecycle hooks dispatched at fixed points of a recording
//! - [`camera`]: frame sources and the timelapse, preview and stream drivers
//! - [`encoder`]: background conversion of a frame stack into a video
//! - [`servo`]: servo ops, their parser and the PWM servo controller
//! - [`platform`]: one worker thread per camera/servo, fed through queues
//!
//! # Example
//!
//! ```no_run
//! use rpicam::camera::{CommandSource, TimelapseCam, TimelapseJob, TimelapseOptions};
//! use rpicam::callback::{AnnotateFrameWithDt, CallbackRegistry};
//! use rpicam::platform::Platform;
//! use std::time::Duration;
//!
//! let mut callbacks = CallbackRegistry::new();
//! callbacks.register(AnnotateFrameWithDt::new());
//! let source = CommandSource::detect().unwrap();
//! let cam = TimelapseCam::new(Box::new(source), callbacks, TimelapseOptions::default()).unwrap();
//!
//! let platform = Platform::builder(cam).build().unwrap();
//! let job = TimelapseJob::for_duration(Duration::from_secs(600), Duration::from_secs(10));
//! platform.submit_recording(job, false).unwrap();
//! let result = platform.poll_result().unwrap();
//! println!("{:?}", result.result);
//! ```

pub mod callback;
pub mod camera;
pub mod cli;
pub mod config;
pub mod encoder;
pub mod error;
pub mod notify;
pub mod platform;
pub mod process;
pub mod servo;
pub mod shutdown;
pub mod state;
pub mod storage;

pub use error::{Error, Result};
pub use shutdown::CancelToken;
