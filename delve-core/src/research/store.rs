//! Session checkpoint storage.
//!
//! The orchestrator saves the session after every phase. [`FileStateStore`]
//! keeps one JSON file per session and writes it atomically (`.tmp` sibling
//! then rename) so a crash mid-write never leaves a truncated checkpoint.

use super::session::{ResearchSession, SessionSummary};
use crate::error::StoreError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

/// Persists research sessions.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn save(&self, session: &ResearchSession) -> Result<(), StoreError>;

    /// `Ok(None)` when no session has that id.
    async fn load(&self, id: Uuid) -> Result<Option<ResearchSession>, StoreError>;

    /// Summaries of all sessions, most recently updated first.
    async fn list(&self) -> Result<Vec<SessionSummary>, StoreError>;
}

fn sort_summaries(summaries: &mut [SessionSummary]) {
    summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
}

/// Process-local store, lost on exit.
#[derive(Default)]
pub struct InMemoryStateStore {
    sessions: RwLock<HashMap<Uuid, ResearchSession>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn save(&self, session: &ResearchSession) -> Result<(), StoreError> {
        self.sessions
            .write()
            .await
            .insert(session.id, session.clone());
        Ok(())
    }

    async fn load(&self, id: Uuid) -> Result<Option<ResearchSession>, StoreError> {
        Ok(self.sessions.read().await.get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<SessionSummary>, StoreError> {
        let mut summaries: Vec<SessionSummary> = self
            .sessions
            .read()
            .await
            .values()
            .map(ResearchSession::summary)
            .collect();
        sort_summaries(&mut summaries);
        Ok(summaries)
    }
}

/// One pretty-printed JSON file per session under a directory.
pub struct FileStateStore {
    dir: PathBuf,
}

impl FileStateStore {
    /// The directory is created on first save.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }
}

/// Write to a `.tmp` sibling, then rename over the target.
pub fn atomic_write(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn read_session(path: &Path) -> Result<Option<ResearchSession>, StoreError> {
    let data = match std::fs::read_to_string(path) {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(StoreError::ReadFailed {
                message: format!("{}: {e}", path.display()),
            });
        }
    };
    serde_json::from_str(&data)
        .map(Some)
        .map_err(|e| StoreError::Corrupt {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
}

fn list_dir(dir: &Path) -> Result<Vec<SessionSummary>, StoreError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(StoreError::ReadFailed {
                message: format!("{}: {e}", dir.display()),
            });
        }
    };

    let mut summaries = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().is_none_or(|ext| ext != "json") {
            continue;
        }
        match read_session(&path) {
            Ok(Some(session)) => summaries.push(session.summary()),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Skipping unreadable session file"),
        }
    }
    sort_summaries(&mut summaries);
    Ok(summaries)
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn save(&self, session: &ResearchSession) -> Result<(), StoreError> {
        let session_id = session.id;
        let json = serde_json::to_string_pretty(session).map_err(|e| StoreError::WriteFailed {
            session_id,
            message: e.to_string(),
        })?;
        let path = self.path_for(session_id);
        debug!(path = %path.display(), "Checkpointing session");

        tokio::task::spawn_blocking(move || atomic_write(&path, json.as_bytes()))
            .await
            .map_err(|e| StoreError::WriteFailed {
                session_id,
                message: e.to_string(),
            })?
            .map_err(|e| StoreError::WriteFailed {
                session_id,
                message: e.to_string(),
            })
    }

    async fn load(&self, id: Uuid) -> Result<Option<ResearchSession>, StoreError> {
        let path = self.path_for(id);
        tokio::task::spawn_blocking(move || read_session(&path))
            .await
            .map_err(|e| StoreError::ReadFailed {
                message: e.to_string(),
            })?
    }

    async fn list(&self) -> Result<Vec<SessionSummary>, StoreError> {
        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || list_dir(&dir))
            .await
            .map_err(|e| StoreError::ReadFailed {
                message: e.to_string(),
            })?
    }
}
