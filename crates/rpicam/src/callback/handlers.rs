//! Built-in callback handlers.

use std::time::{Duration, Instant};

use super::{Callback, Context, ExecPoint};
use crate::error::{Error, Result};

/// Logs every invocation. Useful to trace the lifecycle of a driver.
pub struct EchoCallback {
    exec_at: ExecPoint,
    priority: i32,
}

impl EchoCallback {
    pub fn new(exec_at: ExecPoint) -> Self {
        Self {
            exec_at,
            priority: 999,
        }
    }
}

impl Callback for EchoCallback {
    fn exec_at(&self) -> ExecPoint {
        self.exec_at
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn name(&self) -> &str {
        "echo"
    }

    fn call(&mut self, ctx: &mut Context<'_>) -> Result<()> {
        log::warn!(
            "Running callback at {} with priority {} (ctx={:?})",
            self.exec_at,
            self.priority,
            ctx
        );
        Ok(())
    }
}

/// Stamps each captured frame with the current local time.
///
/// Runs last among the `BeforeFrameCapture` handlers so that other handlers
/// can still override the annotation.
pub struct AnnotateFrameWithDt {
    fmt: Option<String>,
}

impl AnnotateFrameWithDt {
    pub const DEFAULT_FORMAT: &'static str = "%Y-%m-%dT%H:%M:%S";

    pub fn new() -> Self {
        Self::with_format(Some(Self::DEFAULT_FORMAT))
    }

    /// `None` clears any annotation instead.
    pub fn with_format(fmt: Option<&str>) -> Self {
        Self {
            fmt: fmt.map(str::to_string),
        }
    }
}

impl Default for AnnotateFrameWithDt {
    fn default() -> Self {
        Self::new()
    }
}

impl Callback for AnnotateFrameWithDt {
    fn exec_at(&self) -> ExecPoint {
        ExecPoint::BeforeFrameCapture
    }

    fn priority(&self) -> i32 {
        -999
    }

    fn name(&self) -> &str {
        "annotate_frame_with_dt"
    }

    fn call(&mut self, ctx: &mut Context<'_>) -> Result<()> {
        if let Context::Camera(cam) = ctx {
            let text = self
                .fmt
                .as_deref()
                .map(|fmt| chrono::Local::now().format(fmt).to_string());
            cam.set_annotation(text);
        }
        Ok(())
    }
}

/// Fails the running job once `limit` has passed since its first invocation.
///
/// Hook it at `BeforeFrameCapture` to bound a whole timelapse.
pub struct ExecutionTimeout {
    exec_at: ExecPoint,
    limit: Duration,
    started: Option<Instant>,
}

impl ExecutionTimeout {
    pub fn new(limit: Duration) -> Self {
        Self::at(ExecPoint::BeforeFrameCapture, limit)
    }

    pub fn at(exec_at: ExecPoint, limit: Duration) -> Self {
        Self {
            exec_at,
            limit,
            started: None,
        }
    }

    /// Forget the start instant so the budget applies to the next job anew.
    pub fn reset(&mut self) {
        self.started = None;
    }
}

impl Callback for ExecutionTimeout {
    fn exec_at(&self) -> ExecPoint {
        self.exec_at
    }

    fn priority(&self) -> i32 {
        999
    }

    fn name(&self) -> &str {
        "execution_timeout"
    }

    fn call(&mut self, _ctx: &mut Context<'_>) -> Result<()> {
        let started = *self.started.get_or_insert_with(Instant::now);
        if started.elapsed() > self.limit {
            self.started = None;
            return Err(Error::Timeout(self.limit));
        }
        Ok(())
    }
}
