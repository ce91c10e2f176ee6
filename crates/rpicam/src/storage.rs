//! Output naming for long running jobs, rotating out the oldest outputs
//! when the disk fills up.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage dir is a file: {0}")]
    NotADirectory(PathBuf),

    #[error("Could not free up enough storage in {dir}: {fill:.1}% used, limit {limit:.1}%")]
    Full { dir: PathBuf, fill: f64, limit: f64 },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

type UsageProbe = Box<dyn Fn(&Path) -> io::Result<f64> + Send>;

/// Percentage of the filesystem holding `path` that is in use.
pub fn disk_fill_perc(path: &Path) -> io::Result<f64> {
    let stat = nix::sys::statvfs::statvfs(path).map_err(io::Error::from)?;
    let fragment = stat.fragment_size() as f64;
    let total = stat.blocks() as f64 * fragment;
    if total <= 0.0 {
        return Ok(0.0);
    }
    let free = stat.blocks_free() as f64 * fragment;
    Ok(((total - free) / total * 1000.0).round() / 10.0)
}

/// Hands out `<dir>/<prefix>_<unix time>.<ext>` paths for job outputs.
pub struct RotatingStorage {
    dir: PathBuf,
    prefix: String,
    ext: String,
    rotate_fill_perc: f64,
    usage: UsageProbe,
}

impl RotatingStorage {
    pub const DEFAULT_PREFIX: &'static str = "file";
    pub const DEFAULT_EXT: &'static str = "mp4";
    pub const DEFAULT_FILL_PERC: f64 = 90.0;

    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        if dir.is_file() {
            return Err(StorageError::NotADirectory(dir));
        }
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            prefix: Self::DEFAULT_PREFIX.to_string(),
            ext: Self::DEFAULT_EXT.to_string(),
            rotate_fill_perc: Self::DEFAULT_FILL_PERC,
            usage: Box::new(disk_fill_perc),
        })
    }

    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.prefix = prefix.to_string();
        self
    }

    /// Extension with or without the leading dot.
    pub fn with_extension(mut self, ext: &str) -> Self {
        self.ext = ext.trim_start_matches('.').to_string();
        self
    }

    pub fn with_rotate_fill_perc(mut self, perc: f64) -> Self {
        self.rotate_fill_perc = perc;
        self
    }

    /// Replace the disk usage measurement.
    pub fn with_usage_probe<F>(mut self, probe: F) -> Self
    where
        F: Fn(&Path) -> io::Result<f64> + Send + 'static,
    {
        self.usage = Box::new(probe);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Files produced by this storage, oldest first.
    pub fn files(&self) -> Result<Vec<PathBuf>, StorageError> {
        let head = format!("{}_", self.prefix);
        let tail = format!(".{}", self.ext);
        let mut files: Vec<PathBuf> = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.is_file()
                    && path
                        .file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| n.starts_with(&head) && n.ends_with(&tail))
            })
            .collect();
        files.sort();
        Ok(files)
    }

    fn rotate_oldest(&self) -> Result<bool, StorageError> {
        let Some(oldest) = self.files()?.into_iter().next() else {
            return Ok(false);
        };
        fs::remove_file(&oldest)?;
        log::info!(
            "[storage] Rotated out oldest file: {}",
            oldest.file_name().and_then(|n| n.to_str()).unwrap_or_default()
        );
        Ok(true)
    }

    fn new_name(&self) -> PathBuf {
        let now = chrono::Local::now();
        self.dir.join(format!(
            "{}_{}_{:06}.{}",
            self.prefix,
            now.timestamp(),
            now.timestamp_subsec_micros(),
            self.ext
        ))
    }

    /// A fresh output path, deleting the oldest outputs while the disk is
    /// fuller than the rotation threshold.
    pub fn next_path(&mut self) -> Result<PathBuf, StorageError> {
        while (self.usage)(&self.dir)? > self.rotate_fill_perc {
            if !self.rotate_oldest()? {
                break;
            }
        }
        let fill = (self.usage)(&self.dir)?;
        if fill > self.rotate_fill_perc {
            log::error!("[storage] Could not free up enough storage.");
            return Err(StorageError::Full {
                dir: self.dir.clone(),
                fill,
                limit: self.rotate_fill_perc,
            });
        }
        Ok(self.new_name())
    }
}
