//! Stub hardware shared by the integration tests.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rpicam::callback::{Callback, CallbackRegistry, Context, ExecPoint};
use rpicam::camera::{FailoverPolicy, FrameSource, TimelapseCam, TimelapseOptions};
use rpicam::encoder::{EncodeJob, FrameEncoder};
use rpicam::Result;

/// One scripted capture: whether the frame gets written and how long it takes.
#[derive(Debug, Clone, Copy)]
pub struct Shot {
    pub write: bool,
    pub lag: Duration,
}

impl Shot {
    pub const fn ok(lag_ms: u64) -> Self {
        Self {
            write: true,
            lag: Duration::from_millis(lag_ms),
        }
    }

    pub const fn fail(lag_ms: u64) -> Self {
        Self {
            write: false,
            lag: Duration::from_millis(lag_ms),
        }
    }
}

/// Frame source following a script, then capturing instantly once it runs out.
pub struct StubSource {
    script: VecDeque<Shot>,
    attempts: Arc<Mutex<Vec<PathBuf>>>,
}

impl StubSource {
    pub fn new(script: &[Shot]) -> (Self, Arc<Mutex<Vec<PathBuf>>>) {
        let attempts = Arc::new(Mutex::new(Vec::new()));
        let source = Self {
            script: script.iter().copied().collect(),
            attempts: attempts.clone(),
        };
        (source, attempts)
    }
}

impl FrameSource for StubSource {
    fn name(&self) -> &str {
        "stub"
    }

    fn capture(&mut self, path: &Path) -> std::io::Result<()> {
        let shot = self.script.pop_front().unwrap_or(Shot::ok(1));
        std::thread::sleep(shot.lag);
        if shot.write {
            fs::write(path, b"frame")?;
        }
        self.attempts.lock().unwrap().push(path.to_path_buf());
        Ok(())
    }
}

/// Encoder writing a fake video after `delay`, remembering the frames it saw.
pub struct StubEncoder {
    pub delay: Duration,
    pub frames_seen: Arc<Mutex<Vec<PathBuf>>>,
}

impl StubEncoder {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            frames_seen: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl FrameEncoder for StubEncoder {
    fn encode(&self, job: &EncodeJob) -> Result<()> {
        std::thread::sleep(self.delay);
        *self.frames_seen.lock().unwrap() = job.frames()?;
        fs::write(&job.outfile, b"video")?;
        Ok(())
    }
}

/// Appends its exec point's name to a shared event log.
pub struct EventRecorder {
    point: ExecPoint,
    events: Arc<Mutex<Vec<String>>>,
}

impl Callback for EventRecorder {
    fn exec_at(&self) -> ExecPoint {
        self.point
    }

    fn name(&self) -> &str {
        "recorder"
    }

    fn call(&mut self, _ctx: &mut Context<'_>) -> Result<()> {
        self.events.lock().unwrap().push(self.point.to_string());
        Ok(())
    }
}

/// Registry logging every one of `points` into the returned event log.
pub fn event_log(points: &[ExecPoint]) -> (CallbackRegistry, Arc<Mutex<Vec<String>>>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let mut registry = CallbackRegistry::new();
    for &point in points {
        registry.register(EventRecorder {
            point,
            events: events.clone(),
        });
    }
    (registry, events)
}

pub fn timelapse_cam(
    source: StubSource,
    encoder: Arc<dyn FrameEncoder>,
    failover: FailoverPolicy,
    callbacks: CallbackRegistry,
) -> TimelapseCam {
    let options = TimelapseOptions {
        failover,
        ..Default::default()
    };
    TimelapseCam::new(Box::new(source), callbacks, options)
        .unwrap()
        .with_encoder(encoder)
}
