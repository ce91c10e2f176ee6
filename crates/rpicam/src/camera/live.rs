use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use super::{FrameSource, Recorder, Recording};
use crate::callback::{CallbackRegistry, Context, ExecPoint};
use crate::error::{Error, Result};
use crate::shutdown::CancelToken;

/// Live preview settings.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveJob {
    /// Seconds between preview frames
    pub spf: Duration,
    /// Stop after this long; run until cancelled if unset
    pub duration: Option<Duration>,
}

impl Default for LiveJob {
    fn default() -> Self {
        Self {
            spf: Duration::from_millis(500),
            duration: None,
        }
    }
}

/// Keeps a preview image file up to date with the camera's view.
pub struct LivePreviewCam {
    source: Box<dyn FrameSource>,
    callbacks: CallbackRegistry,
    preview_path: PathBuf,
}

impl LivePreviewCam {
    pub fn new(
        source: Box<dyn FrameSource>,
        callbacks: CallbackRegistry,
        preview_path: impl Into<PathBuf>,
    ) -> Result<Self> {
        callbacks.dispatch_plain(ExecPoint::BeforeInit)?;
        let preview_path = preview_path.into();
        if let Some(parent) = preview_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let cam = Self {
            source,
            callbacks,
            preview_path,
        };
        cam.callbacks.dispatch_plain(ExecPoint::AfterInit)?;
        Ok(cam)
    }

    /// Default preview location in the temp dir.
    pub fn default_preview_path() -> PathBuf {
        std::env::temp_dir().join("rpicam-preview.jpg")
    }

    pub fn preview_path(&self) -> &Path {
        &self.preview_path
    }

    /// Capture one frame and atomically swap it into the preview file.
    fn refresh(&mut self) -> Result<bool> {
        self.callbacks.dispatch(
            ExecPoint::BeforeFrameCapture,
            &mut Context::Camera(self.source.as_mut()),
        )?;
        let staging = self.preview_path.with_extension(format!("tmp.{}", self.source.extension()));
        let t0 = Instant::now();
        if let Err(e) = self.source.capture(&staging) {
            log::warn!("[live] Capture command failed: {}", e);
        }
        log::debug!("[live] Capturing took {:.3} sec", t0.elapsed().as_secs_f64());
        let refreshed = staging.is_file();
        if refreshed {
            fs::rename(&staging, &self.preview_path)?;
        } else {
            log::warn!("[live] No frame captured, keeping previous preview");
        }
        self.callbacks.dispatch(
            ExecPoint::AfterFrameCapture,
            &mut Context::Camera(self.source.as_mut()),
        )?;
        Ok(refreshed)
    }

    pub fn record(&mut self, job: LiveJob, cancel: &CancelToken) -> Result<Recording> {
        if job.spf.is_zero() {
            return Err(self
                .callbacks
                .dispatch_and_raise(Error::Config("spf must be positive".to_string())));
        }
        self.callbacks.dispatch_plain(ExecPoint::BeforeRecord)?;
        log::info!(
            "[live] Refreshing {} every {:.2} sec",
            self.preview_path.display(),
            job.spf.as_secs_f64()
        );

        let started = Instant::now();
        let mut frames = 0u64;
        while !cancel.is_cancelled() {
            if job.duration.is_some_and(|d| started.elapsed() >= d) {
                break;
            }
            let t0 = Instant::now();
            if self.refresh()? {
                frames += 1;
            }
            if let Some(rest) = job.spf.checked_sub(t0.elapsed()) {
                cancel.sleep(rest);
            }
        }
        log::info!("[live] Preview finished after {} frames", frames);

        self.callbacks
            .dispatch(ExecPoint::AfterRecord, &mut Context::Output(&self.preview_path))?;
        Ok(Recording::finished(Some(self.preview_path.clone())))
    }
}

impl Recorder for LivePreviewCam {
    type Job = LiveJob;

    fn record(&mut self, job: LiveJob, cancel: &CancelToken) -> Result<Recording> {
        LivePreviewCam::record(self, job, cancel)
    }
}
