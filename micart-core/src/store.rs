//! Persisted per-container state records.
//!
//! `<root>/<id>/state.json` is the only durable artifact. Writes go to a
//! temp file in the same directory and are renamed over the target, so a
//! concurrent reader sees either the old or the new record.

use std::collections::BTreeMap;
use std::io::Write;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{MicaError, MicaResult};
use crate::state::{ContainerState, OciStatus};
use crate::types::ContainerId;

/// State file name inside a container's state directory.
pub const STATE_FILENAME: &str = "state.json";

/// Schema version written into every record.
pub const STATE_VERSION: &str = "1.0.2";

/// Permissions of a freshly allocated state directory.
const STATE_DIR_MODE: u32 = 0o711;

/// JSON projection of a container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    pub version: String,
    pub id: ContainerId,
    pub status: OciStatus,
    /// Internal variant; lets a reload tell paused from running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lifecycle: Option<ContainerState>,
    /// 0 means no attached init process.
    #[serde(default)]
    pub pid: u32,
    pub bundle: PathBuf,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
}

/// Filesystem access to the state directories under one root.
#[derive(Debug, Clone)]
pub struct StateStore {
    root: PathBuf,
}

impl StateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/<id>`.
    pub fn state_dir(&self, id: &ContainerId) -> PathBuf {
        self.root.join(id.as_str())
    }

    /// Create `<root>/<id>`, failing if it already exists.
    pub fn allocate(&self, id: &ContainerId) -> MicaResult<PathBuf> {
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(STATE_DIR_MODE)
            .create(&self.root)
            .map_err(|e| MicaError::Io {
                context: "creating state root",
                source: e,
            })?;

        let dir = self.state_dir(id);
        match std::fs::DirBuilder::new().mode(STATE_DIR_MODE).create(&dir) {
            Ok(()) => Ok(dir),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(MicaError::ContainerExists { id: id.clone() })
            }
            Err(e) => Err(MicaError::Io {
                context: "creating state directory",
                source: e,
            }),
        }
    }

    /// Atomically replace `<root>/<id>/state.json`.
    pub fn save(&self, record: &StateRecord) -> MicaResult<()> {
        let dir = self.state_dir(&record.id);
        let data = serde_json::to_vec(record).map_err(|e| MicaError::Io {
            context: "encoding state record",
            source: e.into(),
        })?;

        let mut tmp = tempfile::Builder::new()
            .prefix(".state.")
            .tempfile_in(&dir)
            .map_err(|e| MicaError::Io {
                context: "creating temp state file",
                source: e,
            })?;
        tmp.write_all(&data)
            .and_then(|()| tmp.as_file().sync_all())
            .map_err(|e| MicaError::Io {
                context: "writing temp state file",
                source: e,
            })?;
        tmp.persist(dir.join(STATE_FILENAME))
            .map_err(|e| MicaError::Io {
                context: "renaming state file",
                source: e.error,
            })?;

        tracing::trace!(container_id = %record.id, status = %record.status, "State persisted");
        Ok(())
    }

    /// Read `<root>/<id>/state.json`.
    pub fn load(&self, id: &ContainerId) -> MicaResult<StateRecord> {
        let path = self.state_dir(id).join(STATE_FILENAME);
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(MicaError::ContainerNotFound { id: id.clone() })
            }
            Err(e) => {
                return Err(MicaError::Io {
                    context: "reading state file",
                    source: e,
                })
            }
        };

        serde_json::from_slice(&data).map_err(|e| MicaError::Io {
            context: "decoding state file",
            source: e.into(),
        })
    }

    /// Remove `<root>/<id>` and everything in it. Missing is not an error.
    pub fn remove(&self, id: &ContainerId) -> MicaResult<()> {
        match std::fs::remove_dir_all(self.state_dir(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(MicaError::Io {
                context: "removing state directory",
                source: e,
            }),
        }
    }

    /// Every readable record under the root, sorted by id.
    ///
    /// Directories that are not valid ids or hold no readable record are
    /// skipped with a warning.
    pub fn list(&self) -> MicaResult<Vec<StateRecord>> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(MicaError::Io {
                    context: "reading state root",
                    source: e,
                })
            }
        };

        let mut records = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| MicaError::Io {
                context: "reading state root",
                source: e,
            })?;
            if !entry.path().is_dir() {
                continue;
            }

            let name = entry.file_name().to_string_lossy().into_owned();
            let Ok(id) = ContainerId::new(name.as_str()) else {
                tracing::warn!(entry = %name, "Skipping non-container directory");
                continue;
            };

            match self.load(&id) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!(container_id = %id, error = %e, "Skipping unreadable state"),
            }
        }

        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }
}
