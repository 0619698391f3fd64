//! Competition persistence.
//!
//! [`JsonSnapshotStore`] keeps one pretty-printed JSON file per competition:
//!
//! ```text
//! snapshot_dir/
//!   comp-1718000000000-1.json
//!   comp-1718000000123-2.json
//! ```
//!
//! Writes go to a temp file that is renamed into place, so a reader never
//! sees a half-written snapshot. There is a single writer per directory.

use crate::model::Competition;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed snapshot {path}: {source}")]
    Format {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid competition id: {0:?}")]
    InvalidId(String),
}

pub trait Store: Send + Sync {
    /// `None` when no competition has this id.
    fn load_competition(&self, id: &str) -> Result<Option<Competition>, StoreError>;
    fn save_competition(&self, competition: &Competition) -> Result<(), StoreError>;
    fn list_competitions(&self) -> Result<Vec<Competition>, StoreError>;
}

// ── JSON snapshots ─────────────────────────────────────────────────

pub struct JsonSnapshotStore {
    dir: PathBuf,
}

impl JsonSnapshotStore {
    /// Create the store, ensuring `dir` exists.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|source| StoreError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> Result<PathBuf, StoreError> {
        let valid = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(StoreError::InvalidId(id.to_string()));
        }
        Ok(self.dir.join(format!("{id}.json")))
    }

    fn read(path: &Path) -> Result<Competition, StoreError> {
        let json = std::fs::read_to_string(path).map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&json).map_err(|source| StoreError::Format {
            path: path.to_path_buf(),
            source,
        })
    }
}

impl Store for JsonSnapshotStore {
    fn load_competition(&self, id: &str) -> Result<Option<Competition>, StoreError> {
        let path = self.path_for(id)?;
        if !path.exists() {
            return Ok(None);
        }
        Self::read(&path).map(Some)
    }

    fn save_competition(&self, competition: &Competition) -> Result<(), StoreError> {
        let final_path = self.path_for(&competition.id)?;
        let tmp_path = self.dir.join(format!(".{}.json.tmp", competition.id));
        let io = |path: &Path| {
            let path = path.to_path_buf();
            move |source| StoreError::Io { path, source }
        };

        let json = serde_json::to_string_pretty(competition).map_err(|source| {
            StoreError::Format {
                path: final_path.clone(),
                source,
            }
        })?;
        std::fs::write(&tmp_path, json).map_err(io(&tmp_path))?;
        std::fs::rename(&tmp_path, &final_path).map_err(io(&final_path))?;
        debug!("Saved snapshot {}", final_path.display());
        Ok(())
    }

    fn list_competitions(&self) -> Result<Vec<Competition>, StoreError> {
        let entries = std::fs::read_dir(&self.dir).map_err(|source| StoreError::Io {
            path: self.dir.clone(),
            source,
        })?;
        let mut competitions = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') || !name.ends_with(".json") {
                continue;
            }
            match Self::read(&path) {
                Ok(c) => competitions.push(c),
                Err(e) => warn!("Skipping snapshot: {e}"),
            }
        }
        competitions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(competitions)
    }
}

// ── In memory ──────────────────────────────────────────────────────

/// Keeps snapshots in a map. Nothing survives the process.
#[derive(Default)]
pub struct MemoryStore {
    competitions: RwLock<HashMap<String, Competition>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn load_competition(&self, id: &str) -> Result<Option<Competition>, StoreError> {
        Ok(self
            .competitions
            .read()
            .ok()
            .and_then(|map| map.get(id).cloned()))
    }

    fn save_competition(&self, competition: &Competition) -> Result<(), StoreError> {
        if let Ok(mut map) = self.competitions.write() {
            map.insert(competition.id.clone(), competition.clone());
        }
        Ok(())
    }

    fn list_competitions(&self) -> Result<Vec<Competition>, StoreError> {
        let mut list: Vec<Competition> = self
            .competitions
            .read()
            .map(|map| map.values().cloned().collect())
            .unwrap_or_default();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(list)
    }
}
