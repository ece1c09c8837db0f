use std::{fs, io, path::PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed reading toggle storage at {}: {source}", .path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("invalid toggle storage json at {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("failed writing toggle storage at {}: {source}", .path.display())]
    Write { path: PathBuf, source: io::Error },
    #[error("failed serializing toggle document: {0}")]
    Serialize(serde_json::Error),
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ToggleDocument {
    #[serde(rename = "isReplacing", default)]
    is_replacing: bool,
}

// The persisted half of the toggle: one JSON document holding one key.
#[derive(Debug, Clone)]
pub struct ToggleStore {
    path: PathBuf,
}

impl ToggleStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    // A document that was never written reads as false, not as an error.
    pub fn load(&self) -> Result<bool, StorageError> {
        if !self.path.exists() {
            return Ok(false);
        }
        let text = fs::read_to_string(&self.path).map_err(|source| StorageError::Read {
            path: self.path.clone(),
            source,
        })?;
        let doc =
            serde_json::from_str::<ToggleDocument>(&text).map_err(|source| StorageError::Parse {
                path: self.path.clone(),
                source,
            })?;
        Ok(doc.is_replacing)
    }

    // Write goes through a sibling temp file and a rename so a concurrent
    // reader only ever sees a complete document.
    pub fn save(&self, value: bool) -> Result<(), StorageError> {
        let doc = ToggleDocument {
            is_replacing: value,
        };
        let payload = serde_json::to_string_pretty(&doc).map_err(StorageError::Serialize)?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|source| StorageError::Write {
                path: self.path.clone(),
                source,
            })?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, payload).map_err(|source| StorageError::Write {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, &self.path).map_err(|source| StorageError::Write {
            path: self.path.clone(),
            source,
        })?;
        Ok(())
    }
}
