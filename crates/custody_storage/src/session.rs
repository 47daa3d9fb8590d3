#![forbid(unsafe_code)]

//! Session-scoped key/value storage.
//!
//! Survives navigation and reload within one submission session. The track
//! orchestrator is its only writer.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use thiserror::Error;

use crate::fsutil::atomic_write;

#[derive(Debug, Error)]
pub enum SessionStoreError {
    #[error("invalid session key: {0}")]
    InvalidKey(String),
    #[error("session store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("session store lock poisoned")]
    Poisoned,
}

pub trait SessionStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, SessionStoreError>;
    fn set(&self, key: &str, value: &str) -> Result<(), SessionStoreError>;
    fn clear(&self, key: &str) -> Result<(), SessionStoreError>;
}

#[derive(Debug, Default)]
pub struct MemorySessionStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemorySessionStore {
    fn get(&self, key: &str) -> Result<Option<String>, SessionStoreError> {
        validate_key(key)?;
        let entries = self.entries.lock().map_err(|_| SessionStoreError::Poisoned)?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), SessionStoreError> {
        validate_key(key)?;
        let mut entries = self.entries.lock().map_err(|_| SessionStoreError::Poisoned)?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn clear(&self, key: &str) -> Result<(), SessionStoreError> {
        validate_key(key)?;
        let mut entries = self.entries.lock().map_err(|_| SessionStoreError::Poisoned)?;
        entries.remove(key);
        Ok(())
    }
}

/// One file per key inside a per-session directory.
#[derive(Debug, Clone)]
pub struct FileSessionStore {
    dir: PathBuf,
}

impl FileSessionStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, SessionStoreError> {
        validate_key(key)?;
        Ok(self.dir.join(format!("{key}.json")))
    }
}

impl SessionStore for FileSessionStore {
    fn get(&self, key: &str) -> Result<Option<String>, SessionStoreError> {
        let path = self.path_for(key)?;
        match fs::read_to_string(&path) {
            Ok(raw) => Ok(Some(raw)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), SessionStoreError> {
        let path = self.path_for(key)?;
        fs::create_dir_all(&self.dir)?;
        atomic_write(&path, value.as_bytes())?;
        Ok(())
    }

    fn clear(&self, key: &str) -> Result<(), SessionStoreError> {
        let path = self.path_for(key)?;
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

fn validate_key(key: &str) -> Result<(), SessionStoreError> {
    let ok = !key.is_empty()
        && key.len() <= 64
        && key
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'.' || b == b'_')
        && !key.starts_with('.');
    if !ok {
        return Err(SessionStoreError::InvalidKey(key.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_dir(name: &str) -> PathBuf {
        let suffix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(1);
        std::env::temp_dir().join(format!("custody-session-test-{name}-{suffix}"))
    }

    #[test]
    fn at_session_01_memory_get_set_clear() {
        let s = MemorySessionStore::new();
        assert_eq!(s.get("custody.track_queue").unwrap(), None);
        s.set("custody.track_queue", "{}").unwrap();
        assert_eq!(s.get("custody.track_queue").unwrap().as_deref(), Some("{}"));
        s.clear("custody.track_queue").unwrap();
        assert_eq!(s.get("custody.track_queue").unwrap(), None);
    }

    #[test]
    fn at_session_02_file_store_survives_new_handle() {
        let dir = temp_dir("reload");
        FileSessionStore::new(dir.clone())
            .set("custody.track_queue", "{\"cursor\":1}")
            .unwrap();
        let reopened = FileSessionStore::new(dir.clone());
        assert_eq!(
            reopened.get("custody.track_queue").unwrap().as_deref(),
            Some("{\"cursor\":1}")
        );
        reopened.clear("custody.track_queue").unwrap();
        reopened.clear("custody.track_queue").unwrap();
        assert_eq!(reopened.get("custody.track_queue").unwrap(), None);
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn at_session_03_path_like_keys_rejected() {
        let s = MemorySessionStore::new();
        assert!(matches!(
            s.set("../escape", "x"),
            Err(SessionStoreError::InvalidKey(_))
        ));
    }
}
