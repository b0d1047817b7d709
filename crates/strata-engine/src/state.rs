use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use strata_domain::{SNAPSHOT_VERSION, StateSnapshot};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::error::StateError;

/// Last-applied snapshot of one stack, stored as pretty JSON.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
    stack: String,
}

#[derive(Deserialize)]
struct VersionProbe {
    version: u32,
}

impl StateStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, stack: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            stack: stack.into(),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the snapshot, or an empty one when nothing was applied yet.
    ///
    /// # Errors
    ///
    /// Returns an error when the file cannot be read or decoded, or was
    /// written by a newer schema version.
    pub fn load(&self) -> Result<StateSnapshot, StateError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(source) if source.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no state snapshot yet");
                return Ok(StateSnapshot::empty(self.stack.clone()));
            }
            Err(source) => {
                return Err(StateError::Read {
                    path: self.path.clone(),
                    source,
                });
            }
        };

        // Check the version first so a newer layout reports as such instead
        // of as a decode failure.
        let probe: VersionProbe =
            serde_json::from_slice(&bytes).map_err(|source| StateError::Decode {
                path: self.path.clone(),
                source,
            })?;
        if probe.version > SNAPSHOT_VERSION {
            return Err(StateError::UnsupportedVersion {
                path: self.path.clone(),
                found: probe.version,
                supported: SNAPSHOT_VERSION,
            });
        }

        let mut snapshot: StateSnapshot =
            serde_json::from_slice(&bytes).map_err(|source| StateError::Decode {
                path: self.path.clone(),
                source,
            })?;
        snapshot.version = SNAPSHOT_VERSION;
        Ok(snapshot)
    }

    /// Atomically replace the stored snapshot.
    ///
    /// The new content is written to a temporary file next to the target,
    /// synced, then renamed over it. On error the previous file is left as
    /// it was.
    ///
    /// # Errors
    ///
    /// Returns an error when encoding, writing or renaming fails.
    pub fn save(&self, snapshot: &StateSnapshot) -> Result<(), StateError> {
        let mut encoded =
            serde_json::to_vec_pretty(snapshot).map_err(|source| StateError::Encode { source })?;
        encoded.push(b'\n');

        let persist_error = |source| StateError::Persist {
            path: self.path.clone(),
            source,
        };

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir).map_err(persist_error)?;

        let mut temp = NamedTempFile::new_in(&dir).map_err(persist_error)?;
        temp.write_all(&encoded).map_err(persist_error)?;
        temp.as_file().sync_all().map_err(persist_error)?;
        temp.persist(&self.path)
            .map_err(|error| persist_error(error.error))?;

        info!(
            path = %self.path.display(),
            resources = snapshot.resources.len(),
            "saved state snapshot"
        );
        Ok(())
    }
}
