//! Key/value persistence primitive used for session save/restore.
//!
//! Only get/set/remove by string key is required. [`MemoryStorage`] lives for the process;
//! [`FileStorage`] keeps all keys in one JSON object file (e.g. ~/.wakechat/session.json).

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

#[derive(Default)]
pub struct MemoryStorage {
    inner: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let g = self.inner.lock().map_err(|_| anyhow::anyhow!("storage lock poisoned"))?;
        Ok(g.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut g = self.inner.lock().map_err(|_| anyhow::anyhow!("storage lock poisoned"))?;
        g.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut g = self.inner.lock().map_err(|_| anyhow::anyhow!("storage lock poisoned"))?;
        g.remove(key);
        Ok(())
    }
}

/// All keys in a single JSON object file. A missing file is an empty store.
pub struct FileStorage {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStorage {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> Result<HashMap<String, String>> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        let s = std::fs::read_to_string(&self.path)
            .with_context(|| format!("reading {}", self.path.display()))?;
        if s.trim().is_empty() {
            return Ok(HashMap::new());
        }
        serde_json::from_str(&s).with_context(|| format!("parsing {}", self.path.display()))
    }

    fn write_all(&self, entries: &HashMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let s = serde_json::to_string_pretty(entries)?;
        std::fs::write(&self.path, s).with_context(|| format!("writing {}", self.path.display()))
    }

    fn modify(&self, f: impl FnOnce(&mut HashMap<String, String>)) -> Result<()> {
        let _g = self.lock.lock().map_err(|_| anyhow::anyhow!("storage lock poisoned"))?;
        // Unreadable contents are dropped and overwritten.
        let mut entries = self.read_all().unwrap_or_else(|e| {
            log::warn!("storage: discarding unreadable store: {:#}", e);
            HashMap::new()
        });
        f(&mut entries);
        self.write_all(&entries)
    }
}

impl KeyValueStore for FileStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let _g = self.lock.lock().map_err(|_| anyhow::anyhow!("storage lock poisoned"))?;
        Ok(self.read_all()?.remove(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.modify(|entries| {
            entries.insert(key.to_string(), value.to_string());
        })
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.modify(|entries| {
            entries.remove(key);
        })
    }
}
