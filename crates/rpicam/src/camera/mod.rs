//! Camera drivers.
//!
//! A [`FrameSource`] captures single frames to files. The drivers built on
//! top of it ([`TimelapseCam`], [`LivePreviewCam`]) and the video streamer
//! ([`StreamCam`]) all implement [`Recorder`], the interface the platform's
//! camera worker runs jobs through.

mod live;
mod source;
mod stream;
mod timelapse;

pub use live::{LiveJob, LivePreviewCam};
pub use source::{Backend, CommandSource};
pub use stream::{StreamCam, StreamJob};
pub use timelapse::{
    FailoverPolicy, TimelapseCam, TimelapseJob, TimelapseOptions, TimelapseState,
    MAX_CONSECUTIVE_OVERRUNS,
};

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use crate::encoder::EncodeHandle;
use crate::error::Result;
use crate::shutdown::CancelToken;

/// Something that writes one frame to a file per call.
pub trait FrameSource: Send {
    fn name(&self) -> &str;

    /// Capture one frame to `path`.
    ///
    /// A missing file afterwards means the capture failed, even on `Ok`.
    fn capture(&mut self, path: &Path) -> io::Result<()>;

    /// Text burnt into (or attached to) subsequent frames. `None` clears it.
    fn set_annotation(&mut self, _text: Option<String>) {}

    /// Extension of the written frame files, without the dot.
    fn extension(&self) -> &str {
        "jpg"
    }
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn capture(&mut self, path: &Path) -> io::Result<()> {
        (**self).capture(path)
    }

    fn set_annotation(&mut self, text: Option<String>) {
        (**self).set_annotation(text)
    }

    fn extension(&self) -> &str {
        (**self).extension()
    }
}

/// Outcome of one recording job.
#[derive(Default)]
pub struct Recording {
    /// Produced file, if the job produces one
    pub output: Option<PathBuf>,
    /// Conversion still running in the background
    pub pending: Option<EncodeHandle>,
}

impl fmt::Debug for Recording {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Recording")
            .field("output", &self.output)
            .field("pending", &self.pending.is_some())
            .finish()
    }
}

impl Recording {
    pub fn finished(output: Option<PathBuf>) -> Self {
        Self {
            output,
            pending: None,
        }
    }

    /// Wait for a pending conversion and return the final output.
    pub fn wait(self) -> Result<Option<PathBuf>> {
        match self.pending {
            Some(handle) => handle.wait().map(Some),
            None => Ok(self.output),
        }
    }
}

/// A camera that runs recording jobs, one at a time.
pub trait Recorder: Send + 'static {
    type Job: Send + fmt::Debug + 'static;

    fn record(&mut self, job: Self::Job, cancel: &CancelToken) -> Result<Recording>;
}
