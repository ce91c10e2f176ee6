//! `rpicam cam` commands

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use argh::FromArgs;
use chrono::{DateTime, Local, NaiveTime};

use super::servo::build_servo;
use super::{config_state_store, parse_resolution, parse_seconds, parse_servo_program, pick};
use crate::callback::{AnnotateFrameWithDt, CallbackRegistry};
use crate::camera::{
    Backend, CommandSource, FailoverPolicy, LiveJob, LivePreviewCam, Recorder, StreamCam, StreamJob,
    TimelapseCam, TimelapseJob, TimelapseOptions,
};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::notify::{Notifier, PostToTelegram, SendExceptionToTelegram, TelegramPoster};
use crate::platform::Platform;
use crate::servo::{Servo, ServoOp};
use crate::shutdown::CancelToken;
use crate::storage::RotatingStorage;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Record with the camera
#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "cam")]
pub struct CamCommand {
    /// still capture tool: rpicam-still, libcamera-still, termux-camera-photo
    #[argh(option, short = 'b')]
    pub backend: Option<String>,

    /// frame size, e.g. 1920x1080
    #[argh(option, short = 'r', from_str_fn(parse_resolution))]
    pub resolution: Option<(u32, u32)>,

    /// rotate frames by 180°
    #[argh(switch)]
    pub hvflip: bool,

    /// run a servo program while recording, e.g. pan=cw,pause (repeatable)
    #[argh(option, short = 's', from_str_fn(parse_servo_program))]
    pub servo: Vec<(String, Vec<ServoOp>)>,

    /// repeat the servo programs until the recording ends
    #[argh(switch)]
    pub cycle: bool,

    /// simulate the servos instead of driving the PWM signal
    #[argh(switch)]
    pub dry_run_servos: bool,

    #[argh(subcommand)]
    pub mode: CamMode,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand)]
pub enum CamMode {
    Timelapse(TimelapseArgs),
    Live(LiveArgs),
    Stream(StreamArgs),
}

/// Capture a frame every few seconds and convert the frames into a video
#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "timelapse")]
pub struct TimelapseArgs {
    /// recording length in minutes (default: from config, 120)
    #[argh(option, short = 'd')]
    pub duration: Option<f64>,

    /// seconds between frames (default: from config, 10)
    #[argh(option, from_str_fn(parse_seconds))]
    pub spf: Option<Duration>,

    /// frame rate of the video (default: from config, 30)
    #[argh(option)]
    pub fps: Option<u32>,

    /// start time, HH:MM today or RFC 3339 (default: now)
    #[argh(option)]
    pub start: Option<String>,

    /// output video path (default: rotating storage or the temp dir)
    #[argh(option, short = 'o')]
    pub outfile: Option<PathBuf>,

    /// on capture failure: skip, heal, raise (default: from config, skip)
    #[argh(option)]
    pub failover: Option<String>,

    /// send the video (or the error) to Telegram
    #[argh(switch)]
    pub notify: bool,

    /// do not stamp frames with the capture time
    #[argh(switch)]
    pub no_annotate: bool,
}

/// Keep a preview image up to date
#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "live")]
pub struct LiveArgs {
    /// seconds between preview frames (default: 0.5)
    #[argh(option, from_str_fn(parse_seconds))]
    pub spf: Option<Duration>,

    /// stop after this many seconds (default: until Ctrl+C)
    #[argh(option, short = 'd', from_str_fn(parse_seconds))]
    pub duration: Option<Duration>,

    /// preview image path (default: $TMPDIR/rpicam-preview.jpg)
    #[argh(option, short = 'o')]
    pub output: Option<PathBuf>,
}

/// Stream H.264 video in MPEG-TS over UDP
#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "stream")]
pub struct StreamArgs {
    /// destination address (default: 232.255.23.23)
    #[argh(option, default = "String::from(StreamCam::DEFAULT_ADDR)")]
    pub addr: String,

    /// destination port (default: 10001)
    #[argh(option, default = "StreamCam::DEFAULT_PORT")]
    pub port: u16,

    /// stop after this many seconds (default: until Ctrl+C)
    #[argh(option, short = 'd', from_str_fn(parse_seconds))]
    pub duration: Option<Duration>,
}

impl CamCommand {
    pub fn run(self, config: &Config, cancel: CancelToken) -> Result<()> {
        let resolution = self
            .resolution
            .or(config.camera.width.zip(config.camera.height));
        let hvflip = self.hvflip || config.camera.hvflip;
        let servos = build_servos(&self.servo, self.dry_run_servos, config)?;
        let programs = ServoPrograms {
            servos,
            programs: self.servo,
            cycle: self.cycle,
        };

        let output = match self.mode {
            CamMode::Timelapse(args) => {
                let source = frame_source(self.backend.as_deref(), resolution, hvflip, config)?;
                let (cam, job) = args.prepare(source, config)?;
                run_on_platform(cam, job, programs, cancel)?
            }
            CamMode::Live(args) => {
                let source = frame_source(self.backend.as_deref(), resolution, hvflip, config)?;
                let mut callbacks = CallbackRegistry::new();
                if config.timelapse.annotate {
                    callbacks.register(AnnotateFrameWithDt::new());
                }
                let path = args
                    .output
                    .unwrap_or_else(LivePreviewCam::default_preview_path);
                let cam = LivePreviewCam::new(Box::new(source), callbacks, path)?;
                let job = LiveJob {
                    spf: args.spf.unwrap_or(LiveJob::default().spf),
                    duration: args.duration,
                };
                run_on_platform(cam, job, programs, cancel)?
            }
            CamMode::Stream(args) => {
                let mut cam = StreamCam::new(CallbackRegistry::new())?.with_hvflip(hvflip);
                if let Some((w, h)) = resolution {
                    cam = cam.with_resolution(w, h);
                }
                let job = StreamJob {
                    addr: args.addr,
                    port: args.port,
                    duration: args.duration,
                };
                run_on_platform(cam, job, programs, cancel)?
            }
        };
        if let Some(path) = output {
            println!("{}", path.display());
        }
        Ok(())
    }
}

impl TimelapseArgs {
    fn job(&self, config: &Config) -> Result<TimelapseJob> {
        let tl = &config.timelapse;
        let minutes = pick(self.duration, tl.duration_min);
        if !(minutes > 0.0) || !minutes.is_finite() {
            return Err(Error::Config(format!("duration must be positive, got {minutes}")));
        }
        let too_long = |what: &str| Error::Config(format!("{what} is too long"));
        let spf = match self.spf {
            Some(spf) => spf,
            None => Duration::try_from_secs_f64(tl.sec_per_frame)
                .map_err(|_| too_long("timelapse.sec_per_frame"))?,
        };
        let duration =
            Duration::try_from_secs_f64(minutes * 60.0).map_err(|_| too_long("duration"))?;
        let mut job = TimelapseJob::for_duration(duration, spf).with_fps(pick(self.fps, tl.fps));
        if let Some(start) = &self.start {
            job = job.starting_at(parse_start_time(start)?);
        }

        if let Some(outfile) = &self.outfile {
            job = job.with_outfile(outfile);
        } else if let Some(storage) = &config.storage {
            let path = RotatingStorage::new(storage.dir.clone())?
                .with_prefix(&storage.prefix)
                .with_rotate_fill_perc(storage.rotate_fill_perc)
                .next_path()?;
            job = job.with_outfile(path);
        }
        Ok(job)
    }

    fn prepare(self, source: CommandSource, config: &Config) -> Result<(TimelapseCam, TimelapseJob)> {
        let job = self.job(config)?;

        let mut callbacks = CallbackRegistry::new();
        if config.timelapse.annotate && !self.no_annotate {
            callbacks.register(AnnotateFrameWithDt::new());
        }
        if self.notify || config.telegram.enabled {
            register_telegram(&mut callbacks, config)?;
        }

        let failover = match &self.failover {
            Some(policy) => policy.parse::<FailoverPolicy>()?,
            None => config.timelapse.failover,
        };
        let options = TimelapseOptions {
            tmpdir: config.timelapse.tmpdir.clone(),
            failover,
            wait_for_encoder: false,
        };
        let cam = TimelapseCam::new(Box::new(source), callbacks, options)?;
        Ok((cam, job))
    }
}

/// `HH:MM` today, or a full RFC 3339 timestamp.
fn parse_start_time(s: &str) -> Result<DateTime<Local>> {
    let s = s.trim();
    if let Ok(time) = NaiveTime::parse_from_str(s, "%H:%M") {
        return Local::now()
            .date_naive()
            .and_time(time)
            .and_local_timezone(Local)
            .earliest()
            .ok_or_else(|| Error::Config(format!("start time {s} does not exist today")));
    }
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Local))
        .map_err(|_| Error::Config(format!("invalid start time '{s}', expected HH:MM or RFC 3339")))
}

fn frame_source(
    backend: Option<&str>,
    resolution: Option<(u32, u32)>,
    hvflip: bool,
    config: &Config,
) -> Result<CommandSource> {
    let backend = match backend {
        Some(name) => Some(name.parse::<Backend>()?),
        None => config.camera.backend,
    };
    let mut source = match backend {
        Some(backend) => CommandSource::new(backend),
        None => CommandSource::detect()?,
    };
    if let Some((w, h)) = resolution {
        source = source.with_resolution(w, h);
    }
    Ok(source.with_hvflip(hvflip))
}

fn register_telegram(callbacks: &mut CallbackRegistry, config: &Config) -> Result<()> {
    let tg = &config.telegram;
    let token = tg
        .api_token
        .clone()
        .or_else(|| std::env::var(TelegramPoster::API_TOKEN_ENV_VAR).ok())
        .unwrap_or_default();
    let chat_id = tg
        .chat_id
        .clone()
        .or_else(|| std::env::var(TelegramPoster::CHAT_ID_ENV_VAR).ok())
        .unwrap_or_default();
    let notifier: Arc<dyn Notifier> = Arc::new(TelegramPoster::new(&token, &chat_id)?);
    callbacks
        .register(PostToTelegram::new(notifier.clone()))
        .register(SendExceptionToTelegram::new(notifier));
    Ok(())
}

/// One servo per distinct name in `programs`, configured from `config`.
fn build_servos(
    programs: &[(String, Vec<ServoOp>)],
    dry_run: bool,
    config: &Config,
) -> Result<Vec<Servo>> {
    let names: BTreeMap<&str, ()> = programs.iter().map(|(n, _)| (n.as_str(), ())).collect();
    let state = (!dry_run).then(|| config_state_store(config));
    let mut servos = Vec::new();
    for name in names.keys() {
        let entry = match config.servos.get(*name) {
            Some(entry) => entry.clone(),
            None if dry_run => Default::default(),
            None => {
                return Err(Error::Config(format!(
                    "servo '{name}' is not configured (add it under 'servos' in the config file)"
                )))
            }
        };
        servos.push(build_servo(name, &entry, dry_run, state.clone())?);
    }
    Ok(servos)
}

struct ServoPrograms {
    servos: Vec<Servo>,
    programs: Vec<(String, Vec<ServoOp>)>,
    cycle: bool,
}

/// Run `job` on a fresh platform, moving the servos meanwhile.
fn run_on_platform<R: Recorder>(
    cam: R,
    job: R::Job,
    servos: ServoPrograms,
    cancel: CancelToken,
) -> Result<Option<PathBuf>> {
    let mut builder = Platform::builder(cam).cancel_token(cancel);
    if servos.servos.is_empty() {
        builder = builder.startup_grace(Duration::ZERO);
    }
    for servo in servos.servos {
        builder = builder.servo(servo);
    }
    let mut platform = builder.build()?;

    for (name, ops) in servos.programs {
        platform.submit_servo_sequence(&name, ops, servos.cycle)?;
    }
    platform.submit_recording(job, false)?;
    let result = platform.poll_result();
    platform.shutdown(SHUTDOWN_TIMEOUT);
    result?.result
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    fn parse(args: &[&str]) -> CamCommand {
        CamCommand::from_args(&["cam"], args).unwrap()
    }

    #[test]
    fn test_timelapse_args() {
        let cmd = parse(&[
            "-s", "pan=cw,pause", "--cycle", "timelapse", "-d", "30", "--spf", "2.5", "--notify",
        ]);
        assert!(cmd.cycle);
        assert_eq!(cmd.servo.len(), 1);
        assert_eq!(cmd.servo[0].0, "pan");
        let CamMode::Timelapse(args) = cmd.mode else {
            panic!("expected timelapse");
        };
        assert_eq!(args.duration, Some(30.0));
        assert_eq!(args.spf, Some(Duration::from_millis(2500)));
        assert!(args.notify);
    }

    #[test]
    fn test_stream_defaults() {
        let cmd = parse(&["stream"]);
        let CamMode::Stream(args) = cmd.mode else {
            panic!("expected stream");
        };
        assert_eq!(args.addr, "232.255.23.23");
        assert_eq!(args.port, 10001);
        assert_eq!(args.duration, None);
    }

    #[test]
    fn test_bad_servo_program_is_a_parse_error() {
        assert!(CamCommand::from_args(&["cam"], &["-s", "pan=spin", "live"]).is_err());
    }

    #[test]
    fn test_timelapse_job_from_config_and_flags() {
        let config = Config::parse("timelapse:\n  fps: 12\n  sec_per_frame: 5\n").unwrap();
        let CamMode::Timelapse(args) = parse(&["timelapse", "-d", "1", "-o", "/tmp/out.mp4"]).mode
        else {
            panic!("expected timelapse");
        };
        let job = args.job(&config).unwrap();
        assert_eq!(job.fps, 12);
        assert_eq!(job.sec_per_frame, Duration::from_secs(5));
        assert_eq!(job.duration, Some(Duration::from_secs(60)));
        assert_eq!(job.outfile, Some(PathBuf::from("/tmp/out.mp4")));
    }

    #[test]
    fn test_oversized_durations_are_config_errors() {
        let CamMode::Timelapse(args) = parse(&["timelapse", "-d", "1e300"]).mode else {
            panic!("expected timelapse");
        };
        assert!(matches!(args.job(&Config::default()), Err(Error::Config(_))));

        let config = Config::parse("timelapse:\n  sec_per_frame: 1.0e+300\n").unwrap();
        let CamMode::Timelapse(args) = parse(&["timelapse", "-d", "1"]).mode else {
            panic!("expected timelapse");
        };
        assert!(matches!(args.job(&config), Err(Error::Config(_))));
    }

    #[test]
    fn test_timelapse_outfile_from_rotating_storage() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            storage: Some(crate::config::StorageConfig {
                dir: dir.path().to_path_buf(),
                prefix: "tl".to_string(),
                rotate_fill_perc: 100.0,
            }),
            ..Default::default()
        };
        let CamMode::Timelapse(args) = parse(&["timelapse"]).mode else {
            panic!("expected timelapse");
        };
        let outfile = args.job(&config).unwrap().outfile.unwrap();
        assert_eq!(outfile.parent(), Some(dir.path()));
        let name = outfile.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("tl_") && name.ends_with(".mp4"), "{name}");
    }

    #[test]
    fn test_parse_start_time() {
        let t = parse_start_time("23:59").unwrap();
        assert_eq!((t.hour(), t.minute()), (23, 59));
        let t = parse_start_time("2030-01-01T08:00:00+00:00").unwrap();
        assert_eq!(t.with_timezone(&chrono::Utc).hour(), 8);
        assert!(parse_start_time("noon").is_err());
    }

    #[test]
    fn test_unconfigured_servo_needs_dry_run() {
        let programs = vec![("pan".to_string(), vec![ServoOp::NOON])];
        let err = build_servos(&programs, false, &Config::default()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_missing_telegram_credentials_fail_fast() {
        let config = Config::parse("telegram:\n  enabled: true\n  api_token: abc\n  chat_id: \"\"\n")
            .unwrap();
        let mut callbacks = CallbackRegistry::new();
        assert!(matches!(
            register_telegram(&mut callbacks, &config),
            Err(Error::Notify(_))
        ));
    }
}
