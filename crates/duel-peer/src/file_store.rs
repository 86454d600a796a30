//! Directory-backed key/value store.
//!
//! Each key is one file inside the data directory (default `.duel/`).
//! Keys are mapped to safe file names: `duel:round:abc` becomes
//! `duel.round.abc`, and any byte outside `[A-Za-z0-9_-]` is hex-escaped so
//! ids received from the peer can never name a path outside the directory.

use duel_core::store::{KeyValueStore, Result, StoreError};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Open (and create if needed) the data directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .map_err(|e| StoreError::Unavailable(format!("{}: {}", dir.display(), e)))?;
        debug!("File store at {:?}", dir);
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(file_name(key))
    }
}

/// Map a key to a file name that stays inside the store directory.
fn file_name(key: &str) -> String {
    let mut name = String::with_capacity(key.len());
    for byte in key.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' => name.push(byte as char),
            b':' => name.push('.'),
            other => name.push_str(&format!("%{other:02x}")),
        }
    }
    name
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        match fs::read_to_string(self.path_for(key)) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Io(format!("read {key}: {e}"))),
        }
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let name = file_name(key);
        let path = self.dir.join(&name);
        // `~` never appears in an escaped key
        let tmp = self.dir.join(format!("{name}~"));
        // Write then rename
        fs::write(&tmp, value).map_err(|e| StoreError::Io(format!("write {key}: {e}")))?;
        fs::rename(&tmp, &path).map_err(|e| StoreError::Io(format!("rename {key}: {e}")))
    }

    fn remove(&mut self, key: &str) -> Result<()> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Io(format!("remove {key}: {e}"))),
        }
    }
}
