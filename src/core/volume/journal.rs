// src/core/volume/journal.rs

//! The reconciliation journal: the kernel's single source of truth for what
//! state each volume should be in (`desired_state`) versus what it was last
//! observed to be in (`observed_state`), plus enough bookkeeping
//! (`role`, `generation`, `needs_repair`, `last_error`) for a reconciliation
//! loop to decide what to do next.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::core::errors::PiccoloError;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VolumeState {
    Unattached,
    Mounting,
    Mounted,
    Detaching,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VolumeRole {
    Primary,
    Secondary,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct JournalEntry {
    pub volume_id: String,
    pub desired_state: VolumeState,
    pub observed_state: VolumeState,
    pub role: VolumeRole,
    pub generation: u64,
    pub needs_repair: bool,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl JournalEntry {
    fn new(volume_id: &str) -> Self {
        Self {
            volume_id: volume_id.to_string(),
            desired_state: VolumeState::Unattached,
            observed_state: VolumeState::Unattached,
            role: VolumeRole::Primary,
            generation: 1,
            needs_repair: false,
            last_error: None,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
struct JournalFile {
    entries: BTreeMap<String, JournalEntry>,
}

/// Durable, atomically-rewritten table of `JournalEntry` keyed by volume id.
pub struct VolumeJournal {
    path: PathBuf,
    state: Mutex<JournalFile>,
}

impl VolumeJournal {
    pub fn open(path: PathBuf) -> Result<Self, PiccoloError> {
        let state = if path.exists() {
            let bytes = std::fs::read(&path)?;
            serde_json::from_slice(&bytes)
                .map_err(|e| PiccoloError::VolumeMetadataCorrupted(format!("journal corrupt: {e}")))?
        } else {
            JournalFile::default()
        };
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    fn persist(&self, file: &JournalFile) -> Result<(), PiccoloError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec_pretty(file)?;
        let tmp_path = PathBuf::from(format!("{}.tmp.{}", self.path.display(), std::process::id()));
        {
            use std::io::Write;
            let mut f = std::fs::File::create(&tmp_path)?;
            f.write_all(&json)?;
            f.sync_all()?;
        }
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    pub fn entry(&self, volume_id: &str) -> Option<JournalEntry> {
        self.state.lock().entries.get(volume_id).cloned()
    }

    pub fn ensure_entry(&self, volume_id: &str) -> Result<JournalEntry, PiccoloError> {
        let mut guard = self.state.lock();
        if let Some(existing) = guard.entries.get(volume_id) {
            return Ok(existing.clone());
        }
        let entry = JournalEntry::new(volume_id);
        guard.entries.insert(volume_id.to_string(), entry.clone());
        self.persist(&guard)?;
        Ok(entry)
    }

    pub fn update(
        &self,
        volume_id: &str,
        f: impl FnOnce(&mut JournalEntry),
    ) -> Result<JournalEntry, PiccoloError> {
        let mut guard = self.state.lock();
        let entry = guard
            .entries
            .get_mut(volume_id)
            .ok_or_else(|| PiccoloError::NotFound(format!("volume {volume_id}")))?;
        f(entry);
        entry.updated_at = Utc::now();
        let updated = entry.clone();
        self.persist(&guard)?;
        Ok(updated)
    }

    pub fn all(&self) -> Vec<JournalEntry> {
        self.state.lock().entries.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn ensure_entry_is_idempotent() {
        let dir = tempdir().unwrap();
        let journal = VolumeJournal::open(dir.path().join("journal.json")).unwrap();
        let first = journal.ensure_entry("bootstrap").unwrap();
        let second = journal.ensure_entry("bootstrap").unwrap();
        assert_eq!(first.generation, second.generation);
        assert_eq!(journal.all().len(), 1);
    }

    #[test]
    fn update_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("journal.json");
        {
            let journal = VolumeJournal::open(path.clone()).unwrap();
            journal.ensure_entry("control").unwrap();
            journal
                .update("control", |e| {
                    e.desired_state = VolumeState::Mounted;
                    e.observed_state = VolumeState::Mounted;
                })
                .unwrap();
        }
        let reopened = VolumeJournal::open(path).unwrap();
        let entry = reopened.entry("control").unwrap();
        assert_eq!(entry.observed_state, VolumeState::Mounted);
    }

    #[test]
    fn update_missing_volume_is_not_found() {
        let dir = tempdir().unwrap();
        let journal = VolumeJournal::open(dir.path().join("journal.json")).unwrap();
        assert!(matches!(
            journal.update("missing", |_| {}),
            Err(PiccoloError::NotFound(_))
        ));
    }
}
