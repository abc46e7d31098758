//! Durable storage for the persisted subset of a session.

use log::debug;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::StorageError;
use crate::types::{Session, TokenPair, User};

/// Default name of the durable record
pub const DEFAULT_STORAGE_KEY: &str = "auth-store";

/// Which parts of a session survive a hard reload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PersistPolicy {
    /// Only the user is written; tokens live in memory and are
    /// re-established from the credential cookie or the refresh flow.
    #[default]
    UserOnly,
    /// User and both tokens are written.
    Full,
}

/// The record written to durable storage
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedSnapshot {
    pub user: Option<User>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<TokenPair>,
}

impl PersistedSnapshot {
    pub fn from_session(session: &Session, policy: PersistPolicy) -> Self {
        let tokens = match (policy, &session.access_token) {
            (PersistPolicy::Full, Some(access_token)) => Some(TokenPair {
                access_token: access_token.clone(),
                refresh_token: session.refresh_token.clone(),
            }),
            _ => None,
        };

        Self {
            user: session.user.as_deref().cloned(),
            tokens,
        }
    }
}

/// Strategy the session store calls after every committed transition.
pub trait SessionPersistence: Send + Sync {
    fn load(&self) -> Result<Option<PersistedSnapshot>, StorageError>;
    fn save(&self, snapshot: &PersistedSnapshot) -> Result<(), StorageError>;
    fn remove(&self) -> Result<(), StorageError>;
}

/// In-memory persistence, used for tests and memory-only deployments.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    record: Mutex<Option<PersistedSnapshot>>,
    writes: Mutex<usize>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-seed the record, as if written by an earlier page load.
    pub fn with_snapshot(snapshot: PersistedSnapshot) -> Self {
        Self {
            record: Mutex::new(Some(snapshot)),
            writes: Mutex::new(0),
        }
    }

    pub fn snapshot(&self) -> Option<PersistedSnapshot> {
        self.record.lock().clone()
    }

    /// Number of save/remove calls observed.
    pub fn writes(&self) -> usize {
        *self.writes.lock()
    }
}

impl SessionPersistence for MemoryPersistence {
    fn load(&self) -> Result<Option<PersistedSnapshot>, StorageError> {
        Ok(self.record.lock().clone())
    }

    fn save(&self, snapshot: &PersistedSnapshot) -> Result<(), StorageError> {
        *self.record.lock() = Some(snapshot.clone());
        *self.writes.lock() += 1;
        Ok(())
    }

    fn remove(&self) -> Result<(), StorageError> {
        *self.record.lock() = None;
        *self.writes.lock() += 1;
        Ok(())
    }
}

/// JSON file persistence; one file per named record.
#[derive(Debug, Clone)]
pub struct FilePersistence {
    path: PathBuf,
}

impl FilePersistence {
    /// Store the record `<dir>/<key>.json`.
    pub fn new(dir: &Path, key: &str) -> Self {
        Self {
            path: dir.join(format!("{}.json", key)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SessionPersistence for FilePersistence {
    fn load(&self) -> Result<Option<PersistedSnapshot>, StorageError> {
        match std::fs::read(&self.path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, snapshot: &PersistedSnapshot) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // 一時ファイルに書いてから置き換える
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec(snapshot)?)?;
        std::fs::rename(&tmp, &self.path)?;
        debug!("Persisted session snapshot to {}", self.path.display());
        Ok(())
    }

    fn remove(&self) -> Result<(), StorageError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
