//! Conversion of a frame stack into a video.
//!
//! The conversion runs on its own thread so the next stack can be captured
//! meanwhile. The actual transcoding happens in an `ffmpeg` child process.
//! [`spawn`] returns an [`EncodeHandle`] carrying the outcome.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::callback::{CallbackRegistry, Context, ExecPoint};
use crate::error::{Error, Result};
use crate::process;

/// Execution points whose handlers run on the encoder thread.
pub const ENCODER_EXEC_POINTS: [ExecPoint; 3] = [
    ExecPoint::BeforeConvert,
    ExecPoint::AfterConvert,
    ExecPoint::OnException,
];

#[derive(Debug, Clone, PartialEq)]
pub struct EncodeJob {
    pub stack_dir: PathBuf,
    pub fps: u32,
    /// Extension of the frame files, without the dot
    pub frame_ext: String,
    pub outfile: PathBuf,
}

impl EncodeJob {
    /// Frame files of the stack in capture order.
    pub fn frames(&self) -> std::io::Result<Vec<PathBuf>> {
        let mut frames: Vec<PathBuf> = fs::read_dir(&self.stack_dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.is_file() && p.extension().and_then(|e| e.to_str()) == Some(self.frame_ext.as_str())
            })
            .collect();
        frames.sort();
        Ok(frames)
    }
}

/// Turns a directory of frames into a video file.
///
/// Success is judged by the existence of the output file afterwards.
pub trait FrameEncoder: Send + Sync {
    fn encode(&self, job: &EncodeJob) -> Result<()>;
}

/// Encodes through the `ffmpeg` command line tool.
#[derive(Debug, Clone)]
pub struct FfmpegEncoder {
    program: String,
    pix_fmt: String,
}

impl Default for FfmpegEncoder {
    fn default() -> Self {
        Self {
            program: "ffmpeg".to_string(),
            pix_fmt: "yuv420p".to_string(),
        }
    }
}

impl FfmpegEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_program(mut self, program: &str) -> Self {
        self.program = program.to_string();
        self
    }

    pub fn command(&self, job: &EncodeJob) -> Command {
        let pattern = format!("{}/*.{}", job.stack_dir.display(), job.frame_ext);
        let mut cmd = Command::new(&self.program);
        cmd.args(["-hide_banner", "-loglevel", "error"])
            .arg("-framerate")
            .arg(job.fps.to_string())
            .args(["-pattern_type", "glob", "-i"])
            .arg(pattern)
            .arg("-pix_fmt")
            .arg(&self.pix_fmt)
            .arg(&job.outfile);
        cmd
    }
}

impl FrameEncoder for FfmpegEncoder {
    fn encode(&self, job: &EncodeJob) -> Result<()> {
        process::run_to_completion("ffmpeg", &mut self.command(job))
            .map_err(|e| Error::Encoder(e.to_string()))?;
        Ok(())
    }
}

/// Convert `job` synchronously, dispatching the conversion callbacks.
pub fn run(encoder: &dyn FrameEncoder, job: &EncodeJob, callbacks: &CallbackRegistry) -> Result<PathBuf> {
    callbacks.dispatch(ExecPoint::BeforeConvert, &mut Context::StackDir(&job.stack_dir))?;
    log::info!("[encoder] Begin video conversion of {}", job.stack_dir.display());

    if job.outfile.is_file() {
        fs::remove_file(&job.outfile)?;
    }

    let encoded = encoder.encode(job);
    if !job.outfile.is_file() {
        let err = match encoded {
            Err(e) => e,
            Ok(()) => Error::Encoder("Error during processing: output file not found.".to_string()),
        };
        return Err(callbacks.dispatch_and_raise(err));
    }
    if let Err(e) = encoded {
        log::warn!("[encoder] Encoder reported '{}' but produced {}", e, job.outfile.display());
    }

    for frame in job.frames()? {
        if let Err(e) = fs::remove_file(&frame) {
            log::warn!("[encoder] Could not remove frame {}: {}", frame.display(), e);
        }
    }
    log::info!("[encoder] Finished video conversion: {}", job.outfile.display());
    callbacks.dispatch(ExecPoint::AfterConvert, &mut Context::Output(&job.outfile))?;
    Ok(job.outfile.clone())
}

/// Pending background conversion.
pub struct EncodeHandle {
    outfile: PathBuf,
    rx: flume::Receiver<Result<PathBuf>>,
    thread: Option<JoinHandle<()>>,
}

impl EncodeHandle {
    /// Destination of the conversion, known before it finishes.
    pub fn outfile(&self) -> &Path {
        &self.outfile
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Block until the conversion ends.
    pub fn wait(mut self) -> Result<PathBuf> {
        let result = self
            .rx
            .recv()
            .unwrap_or_else(|_| Err(Error::Encoder("encoder thread died".to_string())));
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        result
    }

    /// Like [`EncodeHandle::wait`], giving the handle back on timeout.
    pub fn wait_timeout(mut self, timeout: Duration) -> std::result::Result<Result<PathBuf>, Self> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => {
                if let Some(thread) = self.thread.take() {
                    let _ = thread.join();
                }
                Ok(result)
            }
            Err(flume::RecvTimeoutError::Timeout) => Err(self),
            Err(flume::RecvTimeoutError::Disconnected) => {
                Ok(Err(Error::Encoder("encoder thread died".to_string())))
            }
        }
    }
}

/// Run the conversion on a new thread.
///
/// `keep_alive` is dropped once the conversion ended; it holds whatever must
/// outlive it, such as the temporary directory containing the stack.
pub fn spawn<K: Send + 'static>(
    encoder: Arc<dyn FrameEncoder>,
    job: EncodeJob,
    callbacks: CallbackRegistry,
    keep_alive: K,
) -> Result<EncodeHandle> {
    let (tx, rx) = flume::bounded(1);
    let outfile = job.outfile.clone();
    let thread = std::thread::Builder::new()
        .name("rpicam-encoder".to_string())
        .spawn(move || {
            let result = run(encoder.as_ref(), &job, &callbacks);
            if let Err(e) = &result {
                log::error!("[encoder] Conversion of {} failed: {}", job.stack_dir.display(), e);
            }
            let _ = tx.send(result);
            drop(keep_alive);
        })?;
    Ok(EncodeHandle {
        outfile,
        rx,
        thread: Some(thread),
    })
}
