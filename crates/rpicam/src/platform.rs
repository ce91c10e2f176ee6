//! Worker-queue orchestration of one camera and any number of servos.
//!
//! Each hardware resource is owned by a dedicated worker thread fed through
//! its own FIFO queue, so the control thread never touches the hardware
//! directly. Recording results come back through a single result channel.
//!
//! ```text
//!                 submit_recording            ┌───────────────┐   JobResult
//!  control ──────────────────────────────────▶│ camera worker │──────────────┐
//!  thread         submit_servo_sequence       └───────────────┘              │
//!     │      ┌──────────────┐ ┌──────────────┐                               ▼
//!     └─────▶│ servo "pan"  │ │ servo "tilt" │                   poll_result()
//!            └──────────────┘ └──────────────┘
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::camera::{Recorder, Recording};
use crate::error::{Error, Result};
use crate::servo::{Servo, ServoOp};
use crate::shutdown::CancelToken;

pub type JobId = u64;

/// Outcome of one submitted recording.
#[derive(Debug)]
pub struct JobResult {
    pub job_id: JobId,
    /// Produced file (if the recorder produces one) or the job's error
    pub result: Result<Option<PathBuf>>,
}

enum CameraCommand<J> {
    Record { id: JobId, job: J, keep_alive: bool },
    Stop,
}

enum ServoCommand {
    Sequence { ops: Vec<ServoOp>, cycle: bool },
}

pub struct PlatformBuilder<R: Recorder> {
    camera: R,
    servos: Vec<Servo>,
    startup_grace: Duration,
    poll_timeout: Duration,
    cancel: CancelToken,
}

impl<R: Recorder> PlatformBuilder<R> {
    pub const DEFAULT_STARTUP_GRACE: Duration = Duration::from_secs(2);
    pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(2);

    pub fn servo(mut self, servo: Servo) -> Self {
        self.servos.push(servo);
        self
    }

    /// Delay between starting the camera worker and the servo workers.
    pub fn startup_grace(mut self, grace: Duration) -> Self {
        self.startup_grace = grace;
        self
    }

    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Share an existing token, e.g. the one set by the Ctrl+C handler.
    pub fn cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Start the workers: camera first, then the servos after the grace period.
    pub fn build(self) -> Result<Platform<R>> {
        let mut names = BTreeMap::new();
        for servo in &self.servos {
            if names.insert(servo.name().to_string(), ()).is_some() {
                return Err(Error::Config(format!("duplicate servo name '{}'", servo.name())));
            }
        }

        let (camera_tx, camera_rx) = flume::unbounded();
        let (result_tx, result_rx) = flume::unbounded();
        let mut workers = Vec::new();

        let cancel = self.cancel.clone();
        let camera = self.camera;
        let handle = std::thread::Builder::new()
            .name("rpicam-camera".to_string())
            .spawn(move || camera_worker(camera, camera_rx, result_tx, cancel))?;
        workers.push(("camera".to_string(), handle));
        log::info!("[platform] Camera worker started");

        let mut servo_txs = BTreeMap::new();
        if !self.servos.is_empty() && !self.startup_grace.is_zero() {
            log::debug!(
                "[platform] Waiting {:.1} sec before starting servos",
                self.startup_grace.as_secs_f64()
            );
            self.cancel.sleep(self.startup_grace);
        }
        for servo in self.servos {
            let name = servo.name().to_string();
            let (tx, rx) = flume::unbounded();
            let cancel = self.cancel.clone();
            let handle = std::thread::Builder::new()
                .name(format!("rpicam-servo-{name}"))
                .spawn(move || servo_worker(servo, rx, cancel))?;
            log::info!("[platform] Servo worker '{}' started", name);
            workers.push((format!("servo:{name}"), handle));
            servo_txs.insert(name, tx);
        }

        Ok(Platform {
            camera_tx,
            servo_txs,
            results: result_rx,
            workers,
            next_id: AtomicU64::new(1),
            cancel: self.cancel,
            poll_timeout: self.poll_timeout,
            shut_down: false,
        })
    }
}

/// Running camera and servo workers.
///
/// Dropping the platform shuts it down with a 5 sec timeout.
pub struct Platform<R: Recorder> {
    camera_tx: flume::Sender<CameraCommand<R::Job>>,
    servo_txs: BTreeMap<String, flume::Sender<ServoCommand>>,
    results: flume::Receiver<JobResult>,
    workers: Vec<(String, JoinHandle<()>)>,
    next_id: AtomicU64,
    cancel: CancelToken,
    poll_timeout: Duration,
    shut_down: bool,
}

impl<R: Recorder> Platform<R> {
    const DROP_TIMEOUT: Duration = Duration::from_secs(5);

    pub fn builder(camera: R) -> PlatformBuilder<R> {
        PlatformBuilder {
            camera,
            servos: Vec::new(),
            startup_grace: PlatformBuilder::<R>::DEFAULT_STARTUP_GRACE,
            poll_timeout: PlatformBuilder::<R>::DEFAULT_POLL_TIMEOUT,
            cancel: CancelToken::new(),
        }
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn servo_names(&self) -> Vec<&str> {
        self.servo_txs.keys().map(String::as_str).collect()
    }

    /// Queue a recording. The camera worker stops after the first job
    /// submitted with `keep_alive = false`; jobs queued behind it get a
    /// `Cancelled` result.
    pub fn submit_recording(&self, job: R::Job, keep_alive: bool) -> Result<JobId> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        log::debug!("[platform] Submitting job {id}: {job:?}");
        self.camera_tx
            .send(CameraCommand::Record {
                id,
                job,
                keep_alive,
            })
            .map_err(|_| Error::Platform("camera worker is not running".to_string()))?;
        Ok(id)
    }

    /// Queue an op sequence on the servo called `name`.
    pub fn submit_servo_sequence(&self, name: &str, ops: Vec<ServoOp>, cycle: bool) -> Result<()> {
        let tx = self
            .servo_txs
            .get(name)
            .ok_or_else(|| Error::Platform(format!("unknown servo '{name}'")))?;
        tx.send(ServoCommand::Sequence { ops, cycle })
            .map_err(|_| Error::Platform(format!("servo worker '{name}' is not running")))
    }

    /// Block until the next result arrives.
    ///
    /// Fails once the camera worker and every pending conversion are gone.
    pub fn poll_result(&self) -> Result<JobResult> {
        loop {
            if let Some(result) = self.poll_result_timeout(self.poll_timeout)? {
                return Ok(result);
            }
            log::debug!("[platform] No result yet, polling again");
        }
    }

    /// Wait at most `timeout` for the next result.
    pub fn poll_result_timeout(&self, timeout: Duration) -> Result<Option<JobResult>> {
        match self.results.recv_timeout(timeout) {
            Ok(result) => Ok(Some(result)),
            Err(flume::RecvTimeoutError::Timeout) => Ok(None),
            Err(flume::RecvTimeoutError::Disconnected) => {
                Err(Error::Platform("no worker left to produce results".to_string()))
            }
        }
    }

    pub fn try_result(&self) -> Option<JobResult> {
        self.results.try_recv().ok()
    }

    /// Cancel running work, stop the workers and wait up to `timeout` for them.
    ///
    /// Workers still running at the deadline are left behind. Results already
    /// posted stay available through [`Platform::try_result`].
    pub fn shutdown(&mut self, timeout: Duration) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        log::info!("[platform] Shutting down");

        self.cancel.cancel();
        let _ = self.camera_tx.send(CameraCommand::Stop);
        self.servo_txs.clear();

        let deadline = Instant::now() + timeout;
        for (name, handle) in self.workers.drain(..) {
            while !handle.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(10));
            }
            if handle.is_finished() {
                if handle.join().is_err() {
                    log::error!("[platform] Worker '{}' panicked", name);
                }
            } else {
                log::warn!("[platform] Worker '{}' did not stop in time, abandoning it", name);
            }
        }
    }
}

impl<R: Recorder> Drop for Platform<R> {
    fn drop(&mut self) {
        self.shutdown(Self::DROP_TIMEOUT);
    }
}

fn camera_worker<R: Recorder>(
    mut camera: R,
    rx: flume::Receiver<CameraCommand<R::Job>>,
    results: flume::Sender<JobResult>,
    cancel: CancelToken,
) {
    let mut forwarders = Vec::new();
    while let Ok(command) = rx.recv() {
        let CameraCommand::Record {
            id,
            job,
            keep_alive,
        } = command
        else {
            log::debug!("[platform] Camera worker stopped");
            break;
        };
        if cancel.is_cancelled() {
            let _ = results.send(JobResult {
                job_id: id,
                result: Err(Error::Cancelled),
            });
            break;
        }

        log::info!("[platform] Camera job {id} started");
        match camera.record(job, &cancel) {
            Ok(Recording {
                pending: Some(handle),
                ..
            }) => {
                let fwd = results.clone();
                let spawned = std::thread::Builder::new()
                    .name(format!("rpicam-job-{id}"))
                    .spawn(move || {
                        let result = handle.wait().map(Some);
                        let _ = fwd.send(JobResult { job_id: id, result });
                    });
                match spawned {
                    Ok(forwarder) => forwarders.push(forwarder),
                    Err(e) => {
                        let _ = results.send(JobResult {
                            job_id: id,
                            result: Err(e.into()),
                        });
                    }
                }
            }
            Ok(recording) => {
                let _ = results.send(JobResult {
                    job_id: id,
                    result: Ok(recording.output),
                });
            }
            Err(e) => {
                log::error!("[platform] Camera job {id} failed: {e}");
                let _ = results.send(JobResult {
                    job_id: id,
                    result: Err(e),
                });
            }
        }

        if !keep_alive {
            log::debug!("[platform] Job {id} was the last one, camera worker exiting");
            break;
        }
    }

    cancel_queued(rx, &results);
    for forwarder in forwarders {
        let _ = forwarder.join();
    }
}

/// Answer every job still queued behind the last one with `Cancelled`.
fn cancel_queued<J>(rx: flume::Receiver<CameraCommand<J>>, results: &flume::Sender<JobResult>) {
    let queued: Vec<_> = rx.drain().collect();
    drop(rx);
    for command in queued {
        if let CameraCommand::Record { id, .. } = command {
            log::debug!("[platform] Camera worker gone, cancelling job {id}");
            let _ = results.send(JobResult {
                job_id: id,
                result: Err(Error::Cancelled),
            });
        }
    }
}

fn servo_worker(mut servo: Servo, rx: flume::Receiver<ServoCommand>, cancel: CancelToken) {
    while let Ok(ServoCommand::Sequence { ops, cycle }) = rx.recv() {
        if cancel.is_cancelled() {
            break;
        }
        log::debug!("[servo:{}] Running {} ops (cycle={})", servo.name(), ops.len(), cycle);
        if let Err(e) = servo.execute_sequence(&ops, cycle, &cancel) {
            log::error!("[servo:{}] Sequence failed: {}", servo.name(), e);
        }
    }
    log::debug!("[servo:{}] Worker stopped at {}°", servo.name(), servo.angle());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::CallbackRegistry;
    use crate::encoder::{self, EncodeJob, FrameEncoder};
    use crate::servo::{ServoConfig, SimulatedActuator};
    use std::sync::{Arc, Mutex};

    /// Records the submitted jobs and answers with their value.
    struct Echo {
        seen: Arc<Mutex<Vec<u32>>>,
    }

    impl Recorder for Echo {
        type Job = u32;

        fn record(&mut self, job: u32, _cancel: &CancelToken) -> Result<Recording> {
            self.seen.lock().unwrap().push(job);
            if job == 0 {
                return Err(Error::Capture("no frames".to_string()));
            }
            Ok(Recording::finished(Some(PathBuf::from(format!("{job}.mp4")))))
        }
    }

    fn echo() -> (Echo, Arc<Mutex<Vec<u32>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        (Echo { seen: seen.clone() }, seen)
    }

    #[test]
    fn test_jobs_run_in_order() {
        let (cam, seen) = echo();
        let platform = Platform::builder(cam).build().unwrap();
        let a = platform.submit_recording(1, true).unwrap();
        let b = platform.submit_recording(0, true).unwrap();
        let c = platform.submit_recording(3, false).unwrap();
        assert!(a < b && b < c);

        let first = platform.poll_result().unwrap();
        assert_eq!(first.job_id, a);
        assert_eq!(first.result.unwrap(), Some(PathBuf::from("1.mp4")));
        let second = platform.poll_result().unwrap();
        assert!(matches!(second.result, Err(Error::Capture(_))));
        let third = platform.poll_result().unwrap();
        assert_eq!(third.job_id, c);

        // camera worker is gone after the keep_alive=false job
        assert!(platform.poll_result().is_err());
        assert_eq!(*seen.lock().unwrap(), vec![1, 0, 3]);
    }

    #[test]
    fn test_jobs_queued_behind_the_last_one_are_cancelled() {
        struct Gated {
            go: flume::Receiver<()>,
        }

        impl Recorder for Gated {
            type Job = u32;

            fn record(&mut self, job: u32, _cancel: &CancelToken) -> Result<Recording> {
                let _ = self.go.recv();
                Ok(Recording::finished(Some(PathBuf::from(format!("{job}.mp4")))))
            }
        }

        let (go_tx, go) = flume::unbounded();
        let platform = Platform::builder(Gated { go }).build().unwrap();
        let last = platform.submit_recording(1, false).unwrap();
        let queued = [
            platform.submit_recording(2, true).unwrap(),
            platform.submit_recording(3, true).unwrap(),
        ];
        go_tx.send(()).unwrap();

        let first = platform.poll_result().unwrap();
        assert_eq!(first.job_id, last);
        assert_eq!(first.result.unwrap(), Some(PathBuf::from("1.mp4")));
        for id in queued {
            let result = platform.poll_result().unwrap();
            assert_eq!(result.job_id, id);
            assert!(matches!(result.result, Err(Error::Cancelled)));
        }
        assert!(platform.poll_result().is_err());
        assert!(platform.submit_recording(4, true).is_err());
    }

    #[test]
    fn test_unknown_servo_is_rejected() {
        let (cam, _) = echo();
        let platform = Platform::builder(cam).build().unwrap();
        let err = platform
            .submit_servo_sequence("tilt", vec![ServoOp::CW], false)
            .unwrap_err();
        assert!(matches!(err, Error::Platform(_)));
    }

    #[test]
    fn test_duplicate_servo_names_rejected() {
        let (cam, _) = echo();
        let servo = |name: &str| {
            Servo::new(
                Box::new(SimulatedActuator::new().with_settle_time(Duration::ZERO)),
                ServoConfig::named(name),
                None,
            )
            .unwrap()
        };
        let result = Platform::builder(cam)
            .servo(servo("pan"))
            .servo(servo("pan"))
            .build();
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_servo_sequence_runs_on_worker() {
        let (cam, _) = echo();
        let sim = SimulatedActuator::new().with_settle_time(Duration::ZERO);
        let servo = Servo::new(Box::new(sim.clone()), ServoConfig::named("pan"), None).unwrap();
        let mut platform = Platform::builder(cam)
            .servo(servo)
            .startup_grace(Duration::ZERO)
            .build()
            .unwrap();
        assert_eq!(platform.servo_names(), vec!["pan"]);

        platform
            .submit_servo_sequence("pan", vec![ServoOp::CW, ServoOp::CW], false)
            .unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        // init 0°, 30°, 60°, each followed by a release
        while sim.duty_log().iter().filter(|d| **d > 0.0).count() < 3 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        platform.shutdown(Duration::from_secs(2));
        let moves: Vec<f64> = sim.duty_log().into_iter().filter(|d| *d > 0.0).collect();
        assert_eq!(
            moves,
            vec![
                Servo::angle_to_duty_cycle(0),
                Servo::angle_to_duty_cycle(30),
                Servo::angle_to_duty_cycle(60)
            ]
        );
    }

    #[test]
    fn test_shutdown_cancels_queued_jobs() {
        struct Blocking;

        impl Recorder for Blocking {
            type Job = ();

            fn record(&mut self, _job: (), cancel: &CancelToken) -> Result<Recording> {
                while !cancel.is_cancelled() {
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(Error::Cancelled)
            }
        }

        let mut platform = Platform::builder(Blocking).build().unwrap();
        platform.submit_recording((), true).unwrap();
        platform.submit_recording((), true).unwrap();
        std::thread::sleep(Duration::from_millis(50));

        let started = Instant::now();
        platform.shutdown(Duration::from_secs(2));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(platform.cancel_token().is_cancelled());

        let result = platform.try_result().unwrap();
        assert!(matches!(result.result, Err(Error::Cancelled)));
        assert!(platform.submit_recording((), false).is_err());
    }

    #[test]
    fn test_pending_conversion_result_is_forwarded() {
        struct Slow;

        impl FrameEncoder for Slow {
            fn encode(&self, job: &EncodeJob) -> Result<()> {
                std::thread::sleep(Duration::from_millis(100));
                std::fs::write(&job.outfile, b"video")?;
                Ok(())
            }
        }

        struct Deferred {
            dir: PathBuf,
        }

        impl Recorder for Deferred {
            type Job = ();

            fn record(&mut self, _job: (), _cancel: &CancelToken) -> Result<Recording> {
                let job = EncodeJob {
                    stack_dir: self.dir.clone(),
                    fps: 24,
                    frame_ext: "jpg".to_string(),
                    outfile: self.dir.join("out.mp4"),
                };
                let handle = encoder::spawn(Arc::new(Slow), job, CallbackRegistry::new(), ())?;
                Ok(Recording {
                    output: Some(handle.outfile().to_path_buf()),
                    pending: Some(handle),
                })
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let platform = Platform::builder(Deferred {
            dir: dir.path().to_path_buf(),
        })
        .build()
        .unwrap();
        let id = platform.submit_recording((), false).unwrap();
        let result = platform.poll_result().unwrap();
        assert_eq!(result.job_id, id);
        let out = result.result.unwrap().unwrap();
        assert!(out.is_file());
    }
}
