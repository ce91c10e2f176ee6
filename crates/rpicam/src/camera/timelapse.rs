use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tempfile::TempDir;

use super::{FrameSource, Recorder, Recording};
use crate::callback::{CallbackRegistry, Context, ExecPoint};
use crate::encoder::{self, EncodeJob, FfmpegEncoder, FrameEncoder, ENCODER_EXEC_POINTS};
use crate::error::{Error, Result};
use crate::shutdown::CancelToken;

/// Overrunning frames tolerated in a row; one more fails the job.
pub const MAX_CONSECUTIVE_OVERRUNS: u32 = 3;

const TMPDIR_PREFIX: &str = "rpicam-timelapse-";
const WAIT_STEP: Duration = Duration::from_secs(1);
/// Slack in seconds for start times computed just before submission.
const START_GRACE_SECS: i64 = 1;

/// What to do when a frame could not be captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailoverPolicy {
    /// Leave a gap in the stack
    #[default]
    Skip,
    /// Copy the latest good frame in place of the missing one
    Heal,
    /// Fail the recording
    Raise,
}

impl FromStr for FailoverPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "skip" => Ok(FailoverPolicy::Skip),
            "heal" => Ok(FailoverPolicy::Heal),
            "raise" => Ok(FailoverPolicy::Raise),
            _ => Err(Error::Config(format!(
                "unknown failover policy '{s}' (expected skip, heal or raise)"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimelapseState {
    Idle,
    WaitingForStart,
    CapturingStack,
    Encoding,
    Failed,
}

impl fmt::Display for TimelapseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Default)]
pub struct TimelapseOptions {
    /// Working directory for frame stacks; a fresh temporary one if unset
    pub tmpdir: Option<PathBuf>,
    pub failover: FailoverPolicy,
    /// Block `record` until the video is encoded
    pub wait_for_encoder: bool,
}

/// One timelapse recording.
#[derive(Debug, Clone, PartialEq)]
pub struct TimelapseJob {
    /// Frame rate of the produced video
    pub fps: u32,
    pub sec_per_frame: Duration,
    /// Wait until this time before capturing; now if unset
    pub t_start: Option<DateTime<Local>>,
    /// Takes precedence over `t_end`
    pub duration: Option<Duration>,
    pub t_end: Option<DateTime<Local>>,
    /// Destination video; `<stack>/out.mp4` if unset
    pub outfile: Option<PathBuf>,
}

impl Default for TimelapseJob {
    fn default() -> Self {
        Self {
            fps: 24,
            sec_per_frame: Duration::from_secs(10),
            t_start: None,
            duration: None,
            t_end: None,
            outfile: None,
        }
    }
}

impl TimelapseJob {
    pub fn for_duration(duration: Duration, sec_per_frame: Duration) -> Self {
        Self {
            duration: Some(duration),
            sec_per_frame,
            ..Default::default()
        }
    }

    pub fn with_fps(mut self, fps: u32) -> Self {
        self.fps = fps;
        self
    }

    pub fn with_outfile(mut self, outfile: impl Into<PathBuf>) -> Self {
        self.outfile = Some(outfile.into());
        self
    }

    pub fn starting_at(mut self, t_start: DateTime<Local>) -> Self {
        self.t_start = Some(t_start);
        self
    }

    /// Check the job and resolve its start and end times.
    fn schedule(&self) -> Result<(DateTime<Local>, DateTime<Local>)> {
        if self.fps == 0 {
            return Err(Error::Config("fps must be positive".to_string()));
        }
        if self.sec_per_frame.is_zero() {
            return Err(Error::Config("sec_per_frame must be positive".to_string()));
        }
        let now = Local::now();
        let t_start = match self.t_start {
            Some(t) if t + chrono::Duration::seconds(START_GRACE_SECS) < now => {
                return Err(Error::Config(format!(
                    "start time {} is in the past",
                    t.format("%Y-%m-%d %H:%M:%S")
                )))
            }
            Some(t) => t,
            None => now,
        };
        let t_end = match (self.duration, self.t_end) {
            (Some(duration), t_end) => {
                if t_end.is_some() {
                    log::warn!("[timelapse] Ignoring `t_end` as `duration` was also supplied.");
                }
                let duration = chrono::Duration::from_std(duration)
                    .map_err(|e| Error::Config(format!("invalid duration: {e}")))?;
                t_start + duration
            }
            (None, Some(t_end)) => t_end,
            (None, None) => {
                return Err(Error::Config(
                    "either `duration` or `t_end` must be supplied".to_string(),
                ))
            }
        };
        Ok((t_start, t_end))
    }
}

fn unix_micros(t: DateTime<Local>) -> i64 {
    t.timestamp_micros()
}

/// Captures frame stacks at a fixed cadence and encodes them into videos.
pub struct TimelapseCam {
    source: Box<dyn FrameSource>,
    callbacks: CallbackRegistry,
    encoder: Arc<dyn FrameEncoder>,
    options: TimelapseOptions,
    workdir: PathBuf,
    tmpdir: Option<Arc<TempDir>>,
    state: TimelapseState,
    latest_frame: Option<PathBuf>,
}

impl fmt::Debug for TimelapseCam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimelapseCam")
            .field("source", &self.source.name())
            .field("workdir", &self.workdir)
            .field("state", &self.state)
            .field("callbacks", &self.callbacks)
            .finish()
    }
}

impl TimelapseCam {
    pub fn new(
        source: Box<dyn FrameSource>,
        callbacks: CallbackRegistry,
        options: TimelapseOptions,
    ) -> Result<Self> {
        callbacks.dispatch_plain(ExecPoint::BeforeInit)?;
        let (workdir, tmpdir) = match &options.tmpdir {
            Some(dir) => {
                fs::create_dir_all(dir)?;
                (dir.clone(), None)
            }
            None => {
                let tmp = tempfile::Builder::new().prefix(TMPDIR_PREFIX).tempdir()?;
                (tmp.path().to_path_buf(), Some(Arc::new(tmp)))
            }
        };
        log::debug!("[timelapse] Working directory: {}", workdir.display());
        let cam = Self {
            source,
            callbacks,
            encoder: Arc::new(FfmpegEncoder::new()),
            options,
            workdir,
            tmpdir,
            state: TimelapseState::Idle,
            latest_frame: None,
        };
        cam.callbacks.dispatch_plain(ExecPoint::AfterInit)?;
        Ok(cam)
    }

    pub fn with_encoder(mut self, encoder: Arc<dyn FrameEncoder>) -> Self {
        self.encoder = encoder;
        self
    }

    pub fn state(&self) -> TimelapseState {
        self.state
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn callbacks(&self) -> &CallbackRegistry {
        &self.callbacks
    }

    /// Record one timelapse.
    ///
    /// Returns once the stack is captured; the destination path is final at
    /// that point even if encoding continues in the background.
    pub fn record(&mut self, job: TimelapseJob, cancel: &CancelToken) -> Result<Recording> {
        self.state = TimelapseState::Idle;
        let result = self.run_job(job, cancel);
        self.state = match result {
            Ok(_) => TimelapseState::Idle,
            Err(_) => TimelapseState::Failed,
        };
        result
    }

    fn run_job(&mut self, job: TimelapseJob, cancel: &CancelToken) -> Result<Recording> {
        self.callbacks.dispatch_plain(ExecPoint::BeforeRecord)?;
        let (t_start, t_end) = match job.schedule() {
            Ok(times) => times,
            Err(e) => {
                log::error!("[timelapse] {}", e);
                return Err(self.callbacks.dispatch_and_raise(e));
            }
        };

        self.state = TimelapseState::WaitingForStart;
        log::info!("[timelapse] Setting up timelapse imaging.");
        while Local::now() < t_start {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let remaining = (t_start - Local::now()).to_std().unwrap_or_default();
            cancel.sleep(remaining.min(WAIT_STEP));
        }

        self.callbacks.dispatch_plain(ExecPoint::BeforeStackCapture)?;
        let stack_dir = self.workdir.join(unix_micros(t_start).to_string());
        if let Err(e) = fs::create_dir_all(&stack_dir) {
            return Err(self.callbacks.dispatch_and_raise(e.into()));
        }

        self.state = TimelapseState::CapturingStack;
        self.capture_stack(&stack_dir, job.sec_per_frame, t_end, cancel)?;
        self.callbacks.dispatch_plain(ExecPoint::AfterStackCapture)?;

        self.state = TimelapseState::Encoding;
        let outfile = job.outfile.unwrap_or_else(|| stack_dir.join("out.mp4"));
        let encode_job = EncodeJob {
            stack_dir,
            fps: job.fps,
            frame_ext: self.source.extension().to_string(),
            outfile: outfile.clone(),
        };
        let handle = match encoder::spawn(
            self.encoder.clone(),
            encode_job,
            self.callbacks.subset(&ENCODER_EXEC_POINTS),
            self.tmpdir.clone(),
        ) {
            Ok(handle) => handle,
            Err(e) => return Err(self.callbacks.dispatch_and_raise(e)),
        };
        let pending = if self.options.wait_for_encoder {
            // failures were already reported on the encoder thread
            handle.wait()?;
            None
        } else {
            Some(handle)
        };

        self.callbacks
            .dispatch(ExecPoint::AfterRecord, &mut Context::Output(&outfile))?;
        Ok(Recording {
            output: Some(outfile),
            pending,
        })
    }

    fn capture_stack(
        &mut self,
        stack_dir: &Path,
        sec_per_frame: Duration,
        t_end: DateTime<Local>,
        cancel: &CancelToken,
    ) -> Result<()> {
        self.latest_frame = None;
        let mut consecutive_overruns = 0u32;
        log::info!("[timelapse] Begin timelapse imaging.");
        loop {
            if cancel.is_cancelled() {
                log::info!("[timelapse] Recording cancelled.");
                return Err(Error::Cancelled);
            }
            if Local::now() >= t_end {
                break;
            }

            let t0 = Instant::now();
            self.capture_frame(stack_dir)?;
            let took = t0.elapsed();

            match sec_per_frame.checked_sub(took) {
                Some(sleep_time) => {
                    consecutive_overruns = 0;
                    cancel.sleep(sleep_time);
                }
                None => {
                    consecutive_overruns += 1;
                    let overrun = Error::Overrun {
                        sec_per_frame,
                        took,
                        consecutive: consecutive_overruns,
                    };
                    if consecutive_overruns > MAX_CONSECUTIVE_OVERRUNS {
                        log::error!("[timelapse] {}", overrun);
                        return Err(self.callbacks.dispatch_and_raise(overrun));
                    }
                    log::warn!("[timelapse] {}", overrun);
                }
            }
        }
        log::info!("[timelapse] Finished timelapse imaging.");
        Ok(())
    }

    fn capture_frame(&mut self, stack_dir: &Path) -> Result<()> {
        self.callbacks.dispatch(
            ExecPoint::BeforeFrameCapture,
            &mut Context::Camera(self.source.as_mut()),
        )?;

        let file_path = stack_dir.join(format!(
            "{}.{}",
            unix_micros(Local::now()),
            self.source.extension()
        ));
        if let Err(e) = self.source.capture(&file_path) {
            log::warn!("[timelapse] Capture command failed: {}", e);
        }

        if file_path.is_file() {
            self.latest_frame = Some(file_path);
        } else {
            match (self.options.failover, &self.latest_frame) {
                (FailoverPolicy::Raise, _) => {
                    let err = Error::Capture(format!(
                        "Could not capture frame: {}",
                        file_path.display()
                    ));
                    return Err(self.callbacks.dispatch_and_raise(err));
                }
                (FailoverPolicy::Heal, Some(latest)) => {
                    log::warn!(
                        "[timelapse] Healing missing frame {} from {}",
                        file_path.display(),
                        latest.display()
                    );
                    fs::copy(latest, &file_path)?;
                }
                (FailoverPolicy::Heal, None) | (FailoverPolicy::Skip, _) => {
                    log::warn!("[timelapse] Skipping missing frame {}", file_path.display());
                }
            }
        }

        self.callbacks.dispatch(
            ExecPoint::AfterFrameCapture,
            &mut Context::Camera(self.source.as_mut()),
        )
    }
}

impl Recorder for TimelapseCam {
    type Job = TimelapseJob;

    fn record(&mut self, job: TimelapseJob, cancel: &CancelToken) -> Result<Recording> {
        TimelapseCam::record(self, job, cancel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::Callback;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Writes frames, failing or lagging according to a script.
    struct ScriptedSource {
        /// (write the file, time the capture takes)
        script: VecDeque<(bool, Duration)>,
        captures: Arc<Mutex<Vec<PathBuf>>>,
    }

    impl ScriptedSource {
        fn new(script: Vec<(bool, Duration)>) -> (Self, Arc<Mutex<Vec<PathBuf>>>) {
            let captures = Arc::new(Mutex::new(Vec::new()));
            let source = Self {
                script: script.into(),
                captures: captures.clone(),
            };
            (source, captures)
        }
    }

    impl FrameSource for ScriptedSource {
        fn name(&self) -> &str {
            "scripted"
        }

        fn capture(&mut self, path: &Path) -> std::io::Result<()> {
            let (write, lag) = self.script.pop_front().unwrap_or((true, Duration::ZERO));
            std::thread::sleep(lag);
            if write {
                fs::write(path, path.to_string_lossy().as_bytes())?;
            }
            self.captures.lock().unwrap().push(path.to_path_buf());
            Ok(())
        }
    }

    struct TouchEncoder;

    impl FrameEncoder for TouchEncoder {
        fn encode(&self, job: &EncodeJob) -> Result<()> {
            fs::write(&job.outfile, b"video")?;
            Ok(())
        }
    }

    struct Points(Arc<Mutex<Vec<ExecPoint>>>, ExecPoint);

    impl Callback for Points {
        fn exec_at(&self) -> ExecPoint {
            self.1
        }

        fn name(&self) -> &str {
            "points"
        }

        fn call(&mut self, _ctx: &mut Context<'_>) -> Result<()> {
            self.0.lock().unwrap().push(self.1);
            Ok(())
        }
    }

    fn build_cam(
        source: ScriptedSource,
        failover: FailoverPolicy,
        callbacks: CallbackRegistry,
    ) -> TimelapseCam {
        let options = TimelapseOptions {
            failover,
            wait_for_encoder: true,
            ..Default::default()
        };
        TimelapseCam::new(Box::new(source), callbacks, options)
            .unwrap()
            .with_encoder(Arc::new(TouchEncoder))
    }

    #[test]
    fn test_rejects_invalid_jobs_before_capture() {
        let (source, captures) = ScriptedSource::new(vec![]);
        let points = Arc::new(Mutex::new(Vec::new()));
        let mut callbacks = CallbackRegistry::new();
        callbacks.register(Points(points.clone(), ExecPoint::OnException));
        let mut cam = build_cam(source, FailoverPolicy::Skip, callbacks);
        let cancel = CancelToken::new();

        let no_end = TimelapseJob::default();
        assert!(matches!(cam.record(no_end, &cancel), Err(Error::Config(_))));
        assert_eq!(cam.state(), TimelapseState::Failed);

        let zero_fps = TimelapseJob::for_duration(Duration::from_secs(1), Duration::from_millis(10))
            .with_fps(0);
        assert!(matches!(cam.record(zero_fps, &cancel), Err(Error::Config(_))));

        let past = TimelapseJob::for_duration(Duration::from_secs(1), Duration::from_millis(10))
            .starting_at(Local::now() - chrono::Duration::minutes(5));
        assert!(matches!(cam.record(past, &cancel), Err(Error::Config(_))));

        assert!(captures.lock().unwrap().is_empty());
        assert_eq!(points.lock().unwrap().len(), 3);
    }

    #[test]
    fn test_records_and_encodes() {
        let (source, captures) = ScriptedSource::new(vec![]);
        let points = Arc::new(Mutex::new(Vec::new()));
        let mut callbacks = CallbackRegistry::new();
        for point in [
            ExecPoint::BeforeRecord,
            ExecPoint::BeforeStackCapture,
            ExecPoint::AfterStackCapture,
            ExecPoint::AfterConvert,
            ExecPoint::AfterRecord,
        ] {
            callbacks.register(Points(points.clone(), point));
        }
        let mut cam = build_cam(source, FailoverPolicy::Skip, callbacks);
        let job = TimelapseJob::for_duration(Duration::from_millis(200), Duration::from_millis(50));

        let recording = cam.record(job, &CancelToken::new()).unwrap();

        let out = recording.output.clone().unwrap();
        assert!(out.is_file());
        assert_eq!(out.file_name().unwrap(), "out.mp4");
        assert!(recording.pending.is_none());
        assert!(captures.lock().unwrap().len() >= 2);
        assert_eq!(
            *points.lock().unwrap(),
            vec![
                ExecPoint::BeforeRecord,
                ExecPoint::BeforeStackCapture,
                ExecPoint::AfterStackCapture,
                ExecPoint::AfterConvert,
                ExecPoint::AfterRecord,
            ]
        );
        assert_eq!(cam.state(), TimelapseState::Idle);
    }

    #[test]
    fn test_heal_fills_gaps_after_first_good_frame() {
        let ms = Duration::from_millis(1);
        let script = vec![
            (false, ms),
            (true, ms),
            (false, ms),
            (false, ms),
            (true, ms),
            (false, ms),
        ];
        let (source, captures) = ScriptedSource::new(script);
        let mut cam = build_cam(source, FailoverPolicy::Heal, CallbackRegistry::new());
        let stack = cam.workdir().join("heal");
        fs::create_dir_all(&stack).unwrap();

        for _ in 0..6 {
            cam.capture_frame(&stack).unwrap();
        }

        let captures = captures.lock().unwrap();
        let present: Vec<bool> = captures.iter().map(|p| p.is_file()).collect();
        assert_eq!(present, vec![false, true, true, true, true, true]);
        // healed frames carry the content of the latest good frame
        assert_eq!(
            fs::read_to_string(&captures[2]).unwrap(),
            captures[1].to_string_lossy()
        );
        assert_eq!(
            fs::read_to_string(&captures[5]).unwrap(),
            captures[4].to_string_lossy()
        );
    }

    #[test]
    fn test_raise_fails_on_missing_frame() {
        let (source, _) = ScriptedSource::new(vec![(false, Duration::ZERO)]);
        let mut cam = build_cam(source, FailoverPolicy::Raise, CallbackRegistry::new());
        let job = TimelapseJob::for_duration(Duration::from_secs(5), Duration::from_millis(10));
        let err = cam.record(job, &CancelToken::new()).unwrap_err();
        assert!(matches!(err, Error::Capture(_)));
    }

    #[test]
    fn test_three_overruns_tolerated_fourth_fatal() {
        let lag = Duration::from_millis(30);
        let spf = Duration::from_millis(10);

        let (source, captures) = ScriptedSource::new(vec![(true, lag); 3]);
        let mut cam = build_cam(source, FailoverPolicy::Skip, CallbackRegistry::new());
        let job = TimelapseJob::for_duration(Duration::from_millis(300), spf);
        cam.record(job, &CancelToken::new()).unwrap();
        assert!(captures.lock().unwrap().len() > 3);

        let (source, captures) = ScriptedSource::new(vec![(true, lag); 4]);
        let mut cam = build_cam(source, FailoverPolicy::Skip, CallbackRegistry::new());
        let job = TimelapseJob::for_duration(Duration::from_secs(5), spf);
        let err = cam.record(job, &CancelToken::new()).unwrap_err();
        assert!(matches!(err, Error::Overrun { consecutive: 4, .. }));
        assert_eq!(captures.lock().unwrap().len(), 4);
    }

    #[test]
    fn test_on_time_frame_resets_overrun_count() {
        let lag = Duration::from_millis(30);
        let script = vec![
            (true, lag),
            (true, lag),
            (true, lag),
            (true, Duration::ZERO),
            (true, lag),
            (true, lag),
            (true, lag),
        ];
        let (source, captures) = ScriptedSource::new(script);
        let mut cam = build_cam(source, FailoverPolicy::Skip, CallbackRegistry::new());
        let job = TimelapseJob::for_duration(Duration::from_millis(400), Duration::from_millis(10));
        cam.record(job, &CancelToken::new()).unwrap();
        assert!(captures.lock().unwrap().len() >= 7);
    }

    #[test]
    fn test_cancel_before_capture() {
        let (source, captures) = ScriptedSource::new(vec![]);
        let mut cam = build_cam(source, FailoverPolicy::Skip, CallbackRegistry::new());
        let cancel = CancelToken::new();
        cancel.cancel();
        let job = TimelapseJob::for_duration(Duration::from_secs(5), Duration::from_millis(10));
        assert!(matches!(cam.record(job, &cancel), Err(Error::Cancelled)));
        assert!(captures.lock().unwrap().is_empty());
    }

    #[test]
    fn test_waits_for_start_time() {
        let (source, captures) = ScriptedSource::new(vec![]);
        let mut cam = build_cam(source, FailoverPolicy::Skip, CallbackRegistry::new());
        let t_start = Local::now() + chrono::Duration::milliseconds(300);
        let job = TimelapseJob::for_duration(Duration::from_millis(100), Duration::from_millis(50))
            .starting_at(t_start);
        cam.record(job, &CancelToken::new()).unwrap();
        let first = captures.lock().unwrap()[0].clone();
        let micros: i64 = first.file_stem().unwrap().to_str().unwrap().parse().unwrap();
        assert!(micros >= t_start.timestamp_micros());
    }

    #[test]
    fn test_explicit_outfile_and_background_encoding() {
        let (source, _) = ScriptedSource::new(vec![]);
        let out_dir = tempfile::tempdir().unwrap();
        let outfile = out_dir.path().join("video.mp4");
        let options = TimelapseOptions::default();
        let mut cam = TimelapseCam::new(Box::new(source), CallbackRegistry::new(), options)
            .unwrap()
            .with_encoder(Arc::new(TouchEncoder));
        let job = TimelapseJob::for_duration(Duration::from_millis(50), Duration::from_millis(20))
            .with_outfile(&outfile);

        let recording = cam.record(job, &CancelToken::new()).unwrap();
        assert_eq!(recording.output.as_deref(), Some(outfile.as_path()));
        assert!(recording.pending.is_some());
        assert_eq!(recording.wait().unwrap(), Some(outfile.clone()));
        assert!(outfile.is_file());
    }
}
