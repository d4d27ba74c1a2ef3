//! Monitor state persistence.
//!
//! The manager persists a [`MonitorState`] when a monitor starts tracking
//! or its Custom selection changes, and removes it when the fence is
//! deleted.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{GeofenceError, GeofenceResult};
use crate::fence::Fence;

const STATE_EXTENSION: &str = "json";

/// Persisted view of one monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorState {
    pub fence: Fence,
    /// Custom selection, sorted. Empty for other monitored types.
    #[serde(default)]
    pub selected_uids: Vec<String>,
    pub updated: DateTime<Utc>,
}

impl MonitorState {
    pub fn new(fence: Fence, mut selected_uids: Vec<String>) -> Self {
        selected_uids.sort();
        selected_uids.dedup();
        Self {
            fence,
            selected_uids,
            updated: Utc::now(),
        }
    }

    pub fn shape_id(&self) -> &str {
        &self.fence.shape_id
    }
}

/// Durable storage for monitor state.
pub trait PersistenceSink: Send + Sync {
    /// Insert or replace the state for its shape.
    fn persist(&self, state: &MonitorState) -> GeofenceResult<()>;

    /// Delete the state for a shape. Missing state is not an error.
    fn remove(&self, shape_id: &str) -> GeofenceResult<()>;

    /// Delete everything.
    fn clear_all(&self) -> GeofenceResult<()>;

    /// Load the state for a shape.
    fn load(&self, shape_id: &str) -> GeofenceResult<Option<MonitorState>>;

    /// Load every stored state.
    fn load_all(&self) -> GeofenceResult<Vec<MonitorState>>;
}

/// In-memory [`PersistenceSink`].
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    states: RwLock<HashMap<String, MonitorState>>,
    writes: AtomicU64,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `persist` calls so far.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.states.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.read().is_empty()
    }
}

impl PersistenceSink for MemoryPersistence {
    fn persist(&self, state: &MonitorState) -> GeofenceResult<()> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.states
            .write()
            .insert(state.shape_id().to_string(), state.clone());
        Ok(())
    }

    fn remove(&self, shape_id: &str) -> GeofenceResult<()> {
        self.states.write().remove(shape_id);
        Ok(())
    }

    fn clear_all(&self) -> GeofenceResult<()> {
        self.states.write().clear();
        Ok(())
    }

    fn load(&self, shape_id: &str) -> GeofenceResult<Option<MonitorState>> {
        Ok(self.states.read().get(shape_id).cloned())
    }

    fn load_all(&self) -> GeofenceResult<Vec<MonitorState>> {
        let mut states: Vec<MonitorState> = self.states.read().values().cloned().collect();
        states.sort_by(|a, b| a.shape_id().cmp(b.shape_id()));
        Ok(states)
    }
}

/// One JSON file per shape under a directory.
///
/// Writes go to a temporary file that is renamed into place, so a crash
/// never leaves a truncated state file.
#[derive(Debug, Clone)]
pub struct JsonFilePersistence {
    directory: PathBuf,
}

impl JsonFilePersistence {
    /// Use `directory`, creating it if needed.
    pub fn new(directory: impl Into<PathBuf>) -> GeofenceResult<Self> {
        let directory = directory.into();
        fs::create_dir_all(&directory).map_err(|e| GeofenceError::Persistence {
            path: directory.clone(),
            reason: e.to_string(),
        })?;
        Ok(Self { directory })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn path_for(&self, shape_id: &str) -> PathBuf {
        let name: String = shape_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.directory.join(format!("{}.{}", name, STATE_EXTENSION))
    }

    fn read(path: &Path) -> GeofenceResult<MonitorState> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    fn state_files(&self) -> GeofenceResult<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.directory)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some(STATE_EXTENSION) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}

impl PersistenceSink for JsonFilePersistence {
    fn persist(&self, state: &MonitorState) -> GeofenceResult<()> {
        let path = self.path_for(state.shape_id());
        let tmp = path.with_extension("tmp");
        let json = serde_json::to_string_pretty(state)?;
        fs::write(&tmp, json).map_err(|e| GeofenceError::Persistence {
            path: tmp.clone(),
            reason: e.to_string(),
        })?;
        fs::rename(&tmp, &path).map_err(|e| GeofenceError::Persistence {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        debug!(shape = %state.shape_id(), path = %path.display(), "Persisted monitor state");
        Ok(())
    }

    fn remove(&self, shape_id: &str) -> GeofenceResult<()> {
        let path = self.path_for(shape_id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(GeofenceError::Persistence {
                path,
                reason: e.to_string(),
            }),
        }
    }

    fn clear_all(&self) -> GeofenceResult<()> {
        for path in self.state_files()? {
            fs::remove_file(&path)?;
        }
        Ok(())
    }

    fn load(&self, shape_id: &str) -> GeofenceResult<Option<MonitorState>> {
        let path = self.path_for(shape_id);
        if !path.exists() {
            return Ok(None);
        }
        Self::read(&path).map(Some)
    }

    fn load_all(&self) -> GeofenceResult<Vec<MonitorState>> {
        let mut states = Vec::new();
        for path in self.state_files()? {
            match Self::read(&path) {
                Ok(state) => states.push(state),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable monitor state"),
            }
        }
        Ok(states)
    }
}
