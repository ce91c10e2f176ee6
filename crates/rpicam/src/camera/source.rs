use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::FrameSource;
use crate::error::Error;
use crate::process;

/// Still capture command line tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Backend {
    RpicamStill,
    LibcameraStill,
    Termux,
}

impl Backend {
    /// Backends in detection order.
    pub const ALL: [Backend; 3] = [Backend::RpicamStill, Backend::LibcameraStill, Backend::Termux];

    pub fn program(&self) -> &'static str {
        match self {
            Backend::RpicamStill => "rpicam-still",
            Backend::LibcameraStill => "libcamera-still",
            Backend::Termux => "termux-camera-photo",
        }
    }
}

impl FromStr for Backend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Backend::ALL
            .into_iter()
            .find(|b| b.program() == s || b.program().trim_end_matches("-still") == s)
            .ok_or_else(|| Error::Config(format!("unknown camera backend '{s}'")))
    }
}

/// Whether `program` resolves to an executable file on `PATH`.
fn on_path(program: &str) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

/// Captures frames by running a camera command line tool per frame.
#[derive(Debug, Clone)]
pub struct CommandSource {
    backend: Backend,
    resolution: Option<(u32, u32)>,
    hvflip: bool,
    annotation: Option<String>,
}

impl CommandSource {
    pub fn new(backend: Backend) -> Self {
        Self {
            backend,
            resolution: None,
            hvflip: false,
            annotation: None,
        }
    }

    /// First backend found on `PATH`.
    pub fn detect() -> crate::error::Result<Self> {
        Backend::ALL
            .into_iter()
            .find(|b| on_path(b.program()).is_some())
            .map(Self::new)
            .ok_or_else(|| {
                Error::Config(format!(
                    "no camera tool found on PATH (tried {})",
                    Backend::ALL.map(|b| b.program()).join(", ")
                ))
            })
    }

    pub fn with_resolution(mut self, width: u32, height: u32) -> Self {
        self.resolution = Some((width, height));
        self
    }

    /// Rotate frames by 180°.
    pub fn with_hvflip(mut self, hvflip: bool) -> Self {
        self.hvflip = hvflip;
        self
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn command(&self, path: &Path) -> Command {
        let mut cmd = Command::new(self.backend.program());
        match self.backend {
            Backend::RpicamStill | Backend::LibcameraStill => {
                cmd.args(["--nopreview", "--immediate", "--encoding", "jpg"]);
                if let Some((w, h)) = self.resolution {
                    cmd.arg("--width")
                        .arg(w.to_string())
                        .arg("--height")
                        .arg(h.to_string());
                }
                if self.hvflip {
                    cmd.args(["--hflip", "--vflip"]);
                }
                if let Some(text) = &self.annotation {
                    cmd.arg("--exif").arg(format!("EXIF.UserComment={text}"));
                }
                cmd.arg("--output").arg(path);
            }
            Backend::Termux => {
                cmd.args(["-c", "0"]).arg(path);
            }
        }
        cmd
    }
}

impl FrameSource for CommandSource {
    fn name(&self) -> &str {
        self.backend.program()
    }

    fn capture(&mut self, path: &Path) -> io::Result<()> {
        match process::run_to_completion(self.backend.program(), &mut self.command(path)) {
            Ok(_) => Ok(()),
            Err(process::ProcessError::SpawnFailed { source, .. }) => Err(source),
            Err(e) => {
                log::warn!("[camera] {}", e);
                Ok(())
            }
        }
    }

    fn set_annotation(&mut self, text: Option<String>) {
        if self.backend == Backend::Termux && text.is_some() {
            log::debug!("[camera] termux-camera-photo cannot annotate frames");
        }
        self.annotation = text;
    }
}
