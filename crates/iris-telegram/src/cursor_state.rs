//! Durable JSON store for the committed update-id floor.
//!
//! One file, one integer, atomic replace semantics. The floor is monotonic
//! for the lifetime of the store: loads below the last known value are
//! ignored and saves always persist the larger value, so a concurrent
//! external truncation can never move delivery backwards.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub const CURSOR_STATE_SCHEMA: &str = "1";

/// Deterministic cursor store failure, classified by phase.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CursorStateError {
    #[error("cursor state load io failed for {path}: {detail}")]
    LoadIo { path: String, detail: String },
    #[error("cursor state {path} is not valid JSON: {detail}")]
    LoadJson { path: String, detail: String },
    #[error("cursor state {path} has invalid shape: {detail}")]
    LoadShape { path: String, detail: String },
    #[error("cursor state save io failed for {path}: {detail}")]
    SaveIo { path: String, detail: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CursorStateFile {
    schema: String,
    committed_floor: i64,
}

/// Minimal durable JSON state store for the Telegram cursor floor.
#[derive(Debug)]
pub struct CursorStateStore {
    path: PathBuf,
    last_known_floor: Option<i64>,
}

impl CursorStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last_known_floor: None,
        }
    }

    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    /// Loads the committed floor; a missing file means no floor yet.
    pub fn load(&mut self) -> Result<Option<i64>, CursorStateError> {
        if !self.path.exists() {
            return Ok(self.last_known_floor);
        }

        let raw = std::fs::read_to_string(&self.path).map_err(|error| CursorStateError::LoadIo {
            path: self.path.display().to_string(),
            detail: error.to_string(),
        })?;
        let parsed: CursorStateFile =
            serde_json::from_str(&raw).map_err(|error| CursorStateError::LoadJson {
                path: self.path.display().to_string(),
                detail: error.to_string(),
            })?;

        if parsed.schema != CURSOR_STATE_SCHEMA {
            return Err(CursorStateError::LoadShape {
                path: self.path.display().to_string(),
                detail: format!(
                    "unsupported schema '{}' (expected '{CURSOR_STATE_SCHEMA}')",
                    parsed.schema
                ),
            });
        }
        if parsed.committed_floor < 0 {
            return Err(CursorStateError::LoadShape {
                path: self.path.display().to_string(),
                detail: "committed_floor must be >= 0".to_string(),
            });
        }

        // Monotonicity guard: never step below what this process already saw.
        let floor = match self.last_known_floor {
            Some(known) => known.max(parsed.committed_floor),
            None => parsed.committed_floor,
        };
        self.last_known_floor = Some(floor);
        Ok(Some(floor))
    }

    /// Persists the committed floor via temp-file write plus atomic rename.
    pub fn save(&mut self, committed_floor: i64) -> Result<(), CursorStateError> {
        let floor = self
            .last_known_floor
            .map_or(committed_floor, |known| known.max(committed_floor))
            .max(0);
        let payload = CursorStateFile {
            schema: CURSOR_STATE_SCHEMA.to_string(),
            committed_floor: floor,
        };
        let encoded = serde_json::to_string(&payload)
            .map_err(|error| self.save_io(format!("failed to encode state: {error}")))?;
        self.replace_state_file(&encoded)?;
        self.last_known_floor = Some(floor);
        Ok(())
    }

    // The new state lands in a sibling `<name>.tmp` first; the rename is the
    // commit point, so readers never observe a partial file.
    fn replace_state_file(&self, encoded: &str) -> Result<(), CursorStateError> {
        let Some(file_name) = self.path.file_name() else {
            return Err(self.save_io("state path has no file name"));
        };
        if let Some(parent) = self.path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|error| {
                self.save_io(format!("failed to create {}: {error}", parent.display()))
            })?;
        }

        let mut temp_name = file_name.to_os_string();
        temp_name.push(".tmp");
        let temp_path = self.path.with_file_name(&temp_name);
        std::fs::write(&temp_path, encoded).map_err(|error| {
            self.save_io(format!("failed to write {}: {error}", temp_path.display()))
        })?;
        std::fs::rename(&temp_path, &self.path).map_err(|error| {
            self.save_io(format!("failed to replace {}: {error}", self.path.display()))
        })?;
        Ok(())
    }

    fn save_io(&self, detail: impl Into<String>) -> CursorStateError {
        CursorStateError::SaveIo {
            path: self.path.display().to_string(),
            detail: detail.into(),
        }
    }
}
