//! Per-folder sync state and the crash-safe rotation protocol
//!
//! State is persisted as a single JSON document keyed by folder name,
//! loaded with backup fallback and saved through a three-file rotation
//! so a crash mid-write never leaves both the main file and its backup
//! unusable at once.

use crate::error::{Error, Result};
use crate::object_store::ObjectStore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FolderState {
    #[serde(rename = "savedLastUid")]
    pub last_uid: u32,
    #[serde(rename = "savedUidValidity")]
    pub uid_validity: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct StateDocument {
    mailboxes: HashMap<String, FolderState>,
}

/// In-memory per-folder state with auto-vivification on read, persisted
/// via the three-file rotation protocol.
#[derive(Debug, Default)]
pub struct StateStore {
    doc: StateDocument,
}

impl StateStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch or auto-vivify the state for `folder`.
    pub fn folder(&mut self, folder: &str) -> FolderState {
        *self.doc.mailboxes.entry(folder.to_string()).or_default()
    }

    pub fn set_folder(&mut self, folder: &str, state: FolderState) {
        self.doc.mailboxes.insert(folder.to_string(), state);
    }

    #[must_use]
    pub fn has_folder(&self, folder: &str) -> bool {
        self.doc.mailboxes.contains_key(folder)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.doc.mailboxes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.doc.mailboxes.is_empty()
    }

    /// Load state: try `S`; on parse/IO failure (other than "not found"),
    /// fall through to
    /// `S.backup`; if both are unusable, fail only if `S` existed and was
    /// corrupt (absence of both is just "never synchronized").
    pub async fn load(store: &dyn ObjectStore, state_dir: &str, state_file: &str) -> Result<Self> {
        let main = format!("{state_dir}/{state_file}");
        let backup = format!("{main}.backup");

        let main_exists = store.exists(&main).await?;
        if main_exists {
            match Self::read_doc(store, &main).await {
                Ok(doc) => return Ok(Self { doc }),
                Err(e) => warn!(path = %main, error = %e, "state file unreadable, falling back to backup"),
            }
        }

        let backup_exists = store.exists(&backup).await?;
        if backup_exists {
            return match Self::read_doc(store, &backup).await {
                Ok(doc) => Ok(Self { doc }),
                Err(e) => {
                    if main_exists {
                        Err(Error::StateCorrupt(format!(
                            "both {main} and {backup} are unreadable: {e}"
                        )))
                    } else {
                        Err(e)
                    }
                }
            };
        }

        if main_exists {
            return Err(Error::StateCorrupt(format!(
                "{main} is corrupt and no backup generation exists"
            )));
        }

        Ok(Self::new())
    }

    async fn read_doc(store: &dyn ObjectStore, path: &str) -> Result<StateDocument> {
        let bytes = store.read_file(path).await?;
        serde_json::from_slice(&bytes).map_err(|e| Error::StateCorrupt(format!("{path}: {e}")))
    }

    /// Persist following the rotation protocol:
    /// 1. `mkdir -p` the state directory.
    /// 2. Write the full document to `S.tmp`.
    /// 3. If `S` exists, rename `S -> S.backup` (overwriting any previous).
    /// 4. Rename `S.tmp -> S`.
    pub async fn save(&self, store: &dyn ObjectStore, state_dir: &str, state_file: &str) -> Result<()> {
        let main = format!("{state_dir}/{state_file}");
        let backup = format!("{main}.backup");
        let tmp = format!("{main}.tmp");

        store.mkdir_all(state_dir).await?;

        let bytes = serde_json::to_vec(&self.doc).expect("StateDocument serialization is infallible");
        store.write_file(&tmp, &bytes).await?;

        if store.exists(&main).await? {
            if store.exists(&backup).await? {
                store.remove(&backup).await?;
            }
            store.rename(&main, &backup).await?;
        }

        store.rename(&tmp, &main).await?;
        Ok(())
    }
}
