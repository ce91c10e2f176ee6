//! External tool processes (camera CLIs, ffmpeg).

use std::process::{Child, Command, ExitStatus, Output, Stdio};
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Errors that can occur with managed processes
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Failed to spawn process '{name}': {source}")]
    SpawnFailed {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Process '{name}' exited with code {code:?}: {stderr}")]
    Failed {
        name: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("IO error on process '{name}': {source}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// Last `n` lines of a process' stderr.
fn tail(stderr: &[u8], n: usize) -> String {
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text.lines().collect();
    lines[lines.len().saturating_sub(n)..].join("\n")
}

/// Run `cmd` to completion, failing on a non-zero exit.
pub fn run_to_completion(name: &str, cmd: &mut Command) -> Result<Output, ProcessError> {
    log::debug!("[{}] Running {:?}", name, cmd);
    let output = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .map_err(|source| ProcessError::SpawnFailed {
            name: name.to_string(),
            source,
        })?;
    if !output.status.success() {
        return Err(ProcessError::Failed {
            name: name.to_string(),
            code: output.status.code(),
            stderr: tail(&output.stderr, 5),
        });
    }
    Ok(output)
}

/// A long running child process, stopped on drop.
pub struct ManagedChild {
    name: String,
    child: Option<Child>,
    started_at: Instant,
}

impl ManagedChild {
    pub fn spawn(name: &str, cmd: &mut Command) -> Result<Self, ProcessError> {
        log::info!("[{}] Starting: {:?}", name, cmd);
        let child = cmd
            .stdin(Stdio::null())
            .spawn()
            .map_err(|source| ProcessError::SpawnFailed {
                name: name.to_string(),
                source,
            })?;
        Ok(Self {
            name: name.to_string(),
            child: Some(child),
            started_at: Instant::now(),
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Exit status if the process has ended.
    pub fn try_wait(&mut self) -> Result<Option<ExitStatus>, ProcessError> {
        let Some(child) = self.child.as_mut() else {
            return Ok(None);
        };
        let status = child.try_wait().map_err(|source| ProcessError::Io {
            name: self.name.clone(),
            source,
        })?;
        if status.is_some() {
            self.child = None;
        }
        Ok(status)
    }

    /// Stop the process gracefully (SIGTERM, then SIGKILL after timeout)
    pub fn stop(&mut self, timeout: Duration) -> Result<Option<i32>, ProcessError> {
        let Some(mut child) = self.child.take() else {
            return Ok(None);
        };
        log::info!("[{}] Stopping process...", self.name);

        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            let _ = kill(Pid::from_raw(child.id() as i32), Signal::SIGTERM);
        }

        #[cfg(not(unix))]
        {
            let _ = child.kill();
        }

        let deadline = Instant::now() + timeout;
        loop {
            let polled = child.try_wait().map_err(|source| ProcessError::Io {
                name: self.name.clone(),
                source,
            })?;
            if let Some(status) = polled {
                log::info!("[{}] Process exited with code: {:?}", self.name, status.code());
                return Ok(status.code());
            }
            if Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(POLL_INTERVAL);
        }

        log::warn!(
            "[{}] Process did not exit gracefully, forcing kill",
            self.name
        );
        let _ = child.kill();
        let _ = child.wait();
        Ok(None)
    }
}

impl Drop for ManagedChild {
    fn drop(&mut self) {
        if self.child.is_some() {
            if let Err(e) = self.stop(Duration::from_secs(2)) {
                log::warn!("[{}] Failed to stop on drop: {}", self.name, e);
            }
        }
    }
}
