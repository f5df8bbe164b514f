// src/infra/store.rs — Per-tab durable key-value store
//
// The agent persists session identity and unsent buffers under well-known
// keys so a reload can pick up where the previous page left off. The store
// is single-writer per tab; writes are synchronous so unload-time
// persistence completes before teardown.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::infra::errors::PerceptrError;

/// Durable string key-value store scoped to one tab's lifetime.
pub trait StateStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> Result<(), PerceptrError>;
    fn remove(&self, key: &str);
}

/// File-backed store: one file per key under a root directory, written
/// atomically (temp file + rename).
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        // Keys are fixed well-known identifiers, not user input.
        self.root.join(format!("{key}.json"))
    }
}

impl StateStore for FileStore {
    fn get(&self, key: &str) -> Option<String> {
        std::fs::read_to_string(self.path_for(key)).ok()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), PerceptrError> {
        std::fs::create_dir_all(&self.root)?;
        let dst = self.path_for(key);
        let tmp = self.root.join(format!(".{key}.tmp"));

        let mut f = std::fs::File::create(&tmp)?;
        f.write_all(value.as_bytes())?;
        f.flush()?;
        f.sync_all()?;
        std::fs::rename(&tmp, &dst)?;
        Ok(())
    }

    fn remove(&self, key: &str) {
        let _ = std::fs::remove_file(self.path_for(key));
    }
}

/// In-memory store for tests and for hosts without a writable filesystem.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), PerceptrError> {
        self.entries
            .lock()
            .map_err(|_| PerceptrError::Store("store mutex poisoned".into()))?
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(key);
        }
    }
}
