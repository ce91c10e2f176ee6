//! Small persistent key-value store backed by a JSON file.
//!
//! Values are addressed by key paths into nested JSON objects, e.g.
//! `["servo", "pan", "angle"]`. Every access takes an advisory lock on the
//! file so that several processes can share one state file.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use nix::fcntl::{Flock, FlockArg};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("Faulty structure: value of '{0}' is not an object")]
    Structure(String),

    #[error("Empty key path")]
    EmptyKey,

    #[error("Failed to lock state file: {0}")]
    Lock(nix::errno::Errno),

    #[error("Invalid state file: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StateError>;

#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
    local: Option<Arc<Mutex<()>>>,
}

impl StateStore {
    pub const FILE_NAME: &'static str = "rpicam-state.json";

    /// Store at `$TMPDIR/rpicam-state.json`.
    pub fn default_path() -> PathBuf {
        std::env::temp_dir().join(Self::FILE_NAME)
    }

    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            local: None,
        }
    }

    /// Also serialise writers of this process through a mutex.
    pub fn with_local_lock(mut self) -> Self {
        self.local = Some(Arc::new(Mutex::new(())));
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open_locked(&self, arg: FlockArg) -> Result<Flock<File>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)?;
        Flock::lock(file, arg).map_err(|(_, errno)| StateError::Lock(errno))
    }

    fn read_document(file: &mut File) -> Result<Value> {
        let mut content = String::new();
        file.read_to_string(&mut content)?;
        if content.trim().is_empty() {
            return Ok(Value::Object(Map::new()));
        }
        Ok(serde_json::from_str(&content)?)
    }

    /// Value at `keys`, or `None` if any key along the path is missing.
    pub fn get(&self, keys: &[&str]) -> Result<Option<Value>> {
        let mut file = self.open_locked(FlockArg::LockShared)?;
        let doc = Self::read_document(&mut file)?;
        lookup(&doc, keys)
    }

    /// Write `value` at `keys`, creating intermediate objects as needed.
    pub fn set(&self, keys: &[&str], value: Value) -> Result<()> {
        let _guard = match &self.local {
            Some(m) => Some(m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())),
            None => None,
        };
        let mut file = self.open_locked(FlockArg::LockExclusive)?;
        let mut doc = Self::read_document(&mut file)?;
        insert(&mut doc, keys, value)?;

        let serialized = serde_json::to_string_pretty(&doc)?;
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(serialized.as_bytes())?;
        file.flush()?;
        Ok(())
    }
}

fn lookup(doc: &Value, keys: &[&str]) -> Result<Option<Value>> {
    let mut current = doc;
    let mut parent = "<root>";
    for &key in keys {
        let Some(obj) = current.as_object() else {
            log::error!("[state] Faulty structure: value of '{}' is not an object", parent);
            return Err(StateError::Structure(parent.to_string()));
        };
        match obj.get(key) {
            Some(v) => current = v,
            None => return Ok(None),
        }
        parent = key;
    }
    Ok(Some(current.clone()))
}

fn insert(doc: &mut Value, keys: &[&str], value: Value) -> Result<()> {
    let Some((last, parents)) = keys.split_last() else {
        return Err(StateError::EmptyKey);
    };
    if !doc.is_object() {
        log::warn!("[state] Overwriting non-object state document");
        *doc = Value::Object(Map::new());
    }
    let mut current = doc;
    for key in parents {
        let obj = current
            .as_object_mut()
            .ok_or_else(|| StateError::Structure(key.to_string()))?;
        let entry = obj
            .entry(key.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            log::warn!("[state] Overwriting state structure at '{}'", key);
            *entry = Value::Object(Map::new());
        }
        current = entry;
    }
    current
        .as_object_mut()
        .ok_or_else(|| StateError::Structure(last.to_string()))?
        .insert(last.to_string(), value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> (tempfile::TempDir, StateStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path().join(StateStore::FILE_NAME));
        (dir, store)
    }

    #[test]
    fn test_round_trip_servo_angle() {
        let (_dir, store) = store();
        store.set(&["servo", "tilt", "angle"], json!(42)).unwrap();
        assert_eq!(
            store.get(&["servo", "tilt", "angle"]).unwrap(),
            Some(json!(42))
        );
        assert_eq!(store.get(&["servo", "tilt"]).unwrap(), Some(json!({"angle": 42})));
    }

    #[test]
    fn test_missing_keys_yield_none() {
        let (_dir, store) = store();
        assert_eq!(store.get(&["nothing", "here"]).unwrap(), None);
        store.set(&["a"], json!(1)).unwrap();
        assert_eq!(store.get(&["b"]).unwrap(), None);
    }

    #[test]
    fn test_read_through_scalar_is_structural_error() {
        let (_dir, store) = store();
        store.set(&["servo"], json!(5)).unwrap();
        let err = store.get(&["servo", "pan", "angle"]).unwrap_err();
        assert!(matches!(err, StateError::Structure(ref k) if k == "servo"));
    }

    #[test]
    fn test_write_through_scalar_replaces_it() {
        let (_dir, store) = store();
        store.set(&["servo"], json!("oops")).unwrap();
        store.set(&["servo", "pan", "angle"], json!(10)).unwrap();
        assert_eq!(
            store.get(&["servo", "pan", "angle"]).unwrap(),
            Some(json!(10))
        );
    }

    #[test]
    fn test_writes_preserve_siblings() {
        let (_dir, store) = store();
        let store = store.with_local_lock();
        store.set(&["servo", "pan", "angle"], json!(10)).unwrap();
        store.set(&["servo", "tilt", "angle"], json!(20)).unwrap();
        store.set(&["servo", "pan", "angle"], json!(30)).unwrap();
        let content = std::fs::read_to_string(store.path()).unwrap();
        let doc: Value = serde_json::from_str(&content).unwrap();
        assert_eq!(doc, json!({"servo": {"pan": {"angle": 30}, "tilt": {"angle": 20}}}));
    }

    #[test]
    fn test_empty_key_rejected() {
        let (_dir, store) = store();
        assert!(matches!(store.set(&[], json!(1)), Err(StateError::EmptyKey)));
    }
}
