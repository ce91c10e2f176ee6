use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use super::{Recorder, Recording};
use crate::callback::{CallbackRegistry, ExecPoint};
use crate::error::{Error, Result};
use crate::process::ManagedChild;
use crate::shutdown::CancelToken;

const POLL_INTERVAL: Duration = Duration::from_millis(200);
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Where and for how long to stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamJob {
    pub addr: String,
    pub port: u16,
    /// Stop after this long; stream until cancelled if unset
    pub duration: Option<Duration>,
}

impl Default for StreamJob {
    fn default() -> Self {
        Self {
            addr: StreamCam::DEFAULT_ADDR.to_string(),
            port: StreamCam::DEFAULT_PORT,
            duration: None,
        }
    }
}

impl StreamJob {
    pub fn url(&self) -> String {
        format!("udp://{}:{}", self.addr, self.port)
    }
}

/// Streams H.264 in MPEG-TS over UDP through `rpicam-vid`.
pub struct StreamCam {
    program: String,
    resolution: Option<(u32, u32)>,
    hvflip: bool,
    bitrate: u32,
    callbacks: CallbackRegistry,
}

impl StreamCam {
    pub const DEFAULT_ADDR: &'static str = "232.255.23.23";
    pub const DEFAULT_PORT: u16 = 10001;

    pub fn new(callbacks: CallbackRegistry) -> Result<Self> {
        callbacks.dispatch_plain(ExecPoint::BeforeInit)?;
        let cam = Self {
            program: "rpicam-vid".to_string(),
            resolution: None,
            hvflip: false,
            bitrate: 1_000_000,
            callbacks,
        };
        cam.callbacks.dispatch_plain(ExecPoint::AfterInit)?;
        Ok(cam)
    }

    pub fn with_program(mut self, program: &str) -> Self {
        self.program = program.to_string();
        self
    }

    pub fn with_resolution(mut self, width: u32, height: u32) -> Self {
        self.resolution = Some((width, height));
        self
    }

    pub fn with_hvflip(mut self, hvflip: bool) -> Self {
        self.hvflip = hvflip;
        self
    }

    pub fn command(&self, job: &StreamJob) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(["-t", "0", "--nopreview", "--inline"])
            .arg("--bitrate")
            .arg(self.bitrate.to_string());
        if let Some((w, h)) = self.resolution {
            cmd.arg("--width")
                .arg(w.to_string())
                .arg("--height")
                .arg(h.to_string());
        }
        if self.hvflip {
            cmd.args(["--hflip", "--vflip"]);
        }
        cmd.args(["--codec", "libav", "--libav-format", "mpegts", "-o"])
            .arg(job.url())
            .stdout(Stdio::null());
        cmd
    }

    pub fn record(&mut self, job: StreamJob, cancel: &CancelToken) -> Result<Recording> {
        self.callbacks.dispatch_plain(ExecPoint::BeforeRecord)?;
        log::info!("[stream] Starting recording to UDP socket {}.", job.url());

        let mut child = match ManagedChild::spawn(&self.program, &mut self.command(&job)) {
            Ok(child) => child,
            Err(e) => return Err(self.callbacks.dispatch_and_raise(e.into())),
        };
        let started = Instant::now();
        loop {
            if cancel.is_cancelled() || job.duration.is_some_and(|d| started.elapsed() >= d) {
                child.stop(STOP_TIMEOUT)?;
                break;
            }
            if let Some(status) = child.try_wait()? {
                if status.success() {
                    break;
                }
                let err = Error::Capture(format!(
                    "{} exited with code {:?}",
                    self.program,
                    status.code()
                ));
                return Err(self.callbacks.dispatch_and_raise(err));
            }
            cancel.sleep(POLL_INTERVAL);
        }
        log::info!("[stream] Recording finished.");

        self.callbacks.dispatch_plain(ExecPoint::AfterRecord)?;
        Ok(Recording::finished(None))
    }
}

impl Recorder for StreamCam {
    type Job = StreamJob;

    fn record(&mut self, job: StreamJob, cancel: &CancelToken) -> Result<Recording> {
        StreamCam::record(self, job, cancel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_targets_udp_url() {
        let cam = StreamCam::new(CallbackRegistry::new())
            .unwrap()
            .with_resolution(640, 480);
        let cmd = cam.command(&StreamJob::default());
        let args: Vec<String> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(cmd.get_program(), "rpicam-vid");
        assert_eq!(args.last().unwrap(), "udp://232.255.23.23:10001");
        assert!(args.windows(2).any(|w| w == ["--libav-format", "mpegts"]));
        assert!(args.windows(2).any(|w| w == ["--width", "640"]));
    }

    fn script(dir: &std::path::Path, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("fake-rpicam-vid");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn test_stops_child_after_duration() {
        let dir = tempfile::tempdir().unwrap();
        let program = script(dir.path(), "exec sleep 30");
        let mut cam = StreamCam::new(CallbackRegistry::new())
            .unwrap()
            .with_program(&program);
        let job = StreamJob {
            duration: Some(Duration::from_millis(300)),
            ..Default::default()
        };
        let started = Instant::now();
        let recording = cam.record(job, &CancelToken::new()).unwrap();
        assert!(recording.output.is_none());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_crashing_streamer_is_a_capture_error() {
        let dir = tempfile::tempdir().unwrap();
        let program = script(dir.path(), "exit 2");
        let mut cam = StreamCam::new(CallbackRegistry::new())
            .unwrap()
            .with_program(&program);
        let err = cam.record(StreamJob::default(), &CancelToken::new()).unwrap_err();
        assert!(matches!(err, Error::Capture(_)));
    }

    #[test]
    fn test_missing_program_fails() {
        let mut cam = StreamCam::new(CallbackRegistry::new())
            .unwrap()
            .with_program("/nonexistent/rpicam-vid");
        let err = cam.record(StreamJob::default(), &CancelToken::new()).unwrap_err();
        assert!(matches!(err, Error::Process(_)));
    }
}
