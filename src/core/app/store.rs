// src/core/app/store.rs

//! `AppFileStore`: the filesystem-backed state area for installed apps.
//! Each app gets its own directory: `<apps_dir>/<name>/app.yaml` holds the
//! canonical `AppDefinition`, `<apps_dir>/<name>/metadata.json` holds the
//! runtime-side `AppInstance` fields (status, container id, timestamps).
//! `update_image`/`revert` back the definition up to `app.prev.yaml` before
//! overwriting it. Every write is temp-file + rename + fsync(parent), the
//! same discipline the volume journal uses, so a crash mid-write never
//! leaves a half-written manifest behind.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::core::app::definition::AppDefinition;
use crate::core::app::instance::{AppInstance, AppStatus};
use crate::core::errors::PiccoloError;

#[derive(Serialize, Deserialize, Debug, Clone)]
struct Metadata {
    name: String,
    status: AppStatus,
    container_id: Option<String>,
    allocated_ports: Vec<(u16, u16)>,
    enabled: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Metadata {
    fn fresh(name: &str) -> Self {
        let now = Utc::now();
        Self {
            name: name.to_string(),
            status: AppStatus::Installed,
            container_id: None,
            allocated_ports: Vec::new(),
            enabled: false,
            created_at: now,
            updated_at: now,
        }
    }
}

pub struct AppFileStore {
    apps_dir: PathBuf,
}

impl AppFileStore {
    pub fn new(apps_dir: PathBuf) -> Self {
        Self { apps_dir }
    }

    fn app_dir(&self, name: &str) -> PathBuf {
        self.apps_dir.join(name)
    }

    fn manifest_path(&self, name: &str) -> PathBuf {
        self.app_dir(name).join("app.yaml")
    }

    fn prev_manifest_path(&self, name: &str) -> PathBuf {
        self.app_dir(name).join("app.prev.yaml")
    }

    fn metadata_path(&self, name: &str) -> PathBuf {
        self.app_dir(name).join("metadata.json")
    }

    /// Writes `instance`'s definition to `app.yaml` and its runtime fields to
    /// `metadata.json`, atomically.
    pub fn write(&self, instance: &AppInstance) -> Result<(), PiccoloError> {
        let name = &instance.definition.name;
        let dir = self.app_dir(name);
        std::fs::create_dir_all(&dir)?;

        let yaml = serde_yaml::to_string(&instance.definition)
            .map_err(|e| PiccoloError::Internal(format!("failed to encode app.yaml: {e}")))?;
        atomic_write(&self.manifest_path(name), yaml.as_bytes())?;

        let meta = Metadata {
            name: name.clone(),
            status: instance.status,
            container_id: instance.container_id.clone(),
            allocated_ports: instance.allocated_ports.clone(),
            enabled: instance.enabled,
            created_at: instance.created_at,
            updated_at: instance.updated_at,
        };
        let meta_json = serde_json::to_vec_pretty(&meta)?;
        atomic_write(&self.metadata_path(name), &meta_json)
    }

    /// Copies the current `app.yaml` to `app.prev.yaml`, if it exists. Called
    /// before `update_image`/`revert` overwrite the live definition.
    pub fn backup(&self, name: &str) -> Result<(), PiccoloError> {
        let current = self.manifest_path(name);
        if !current.exists() {
            return Ok(());
        }
        let bytes = std::fs::read(&current)?;
        atomic_write(&self.prev_manifest_path(name), &bytes)
    }

    /// Reads `<name>/app.prev.yaml` back, for `revert`-style restores.
    pub fn read_backup(&self, name: &str) -> Result<Option<AppDefinition>, PiccoloError> {
        let path = self.prev_manifest_path(name);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(&path)?;
        let definition = serde_yaml::from_slice(&bytes)
            .map_err(|e| PiccoloError::VolumeMetadataCorrupted(format!("app.prev.yaml corrupt: {e}")))?;
        Ok(Some(definition))
    }

    /// Reads the current on-disk definition plus metadata for `name`, if
    /// present. A manifest with no metadata.json (unexpected, but tolerated)
    /// gets fresh defaults rather than failing the read.
    pub fn read_current(&self, name: &str) -> Result<Option<AppInstance>, PiccoloError> {
        let manifest = self.manifest_path(name);
        if !manifest.exists() {
            return Ok(None);
        }
        let definition: AppDefinition = serde_yaml::from_slice(&std::fs::read(&manifest)?)
            .map_err(|e| PiccoloError::VolumeMetadataCorrupted(format!("app.yaml corrupt: {e}")))?;

        let meta_path = self.metadata_path(name);
        let meta = if meta_path.exists() {
            serde_json::from_slice::<Metadata>(&std::fs::read(&meta_path)?)?
        } else {
            Metadata::fresh(name)
        };

        Ok(Some(AppInstance {
            definition,
            status: meta.status,
            container_id: meta.container_id,
            allocated_ports: meta.allocated_ports,
            enabled: meta.enabled,
            created_at: meta.created_at,
            updated_at: meta.updated_at,
        }))
    }

    /// Removes the app's entire state directory. Best-effort: a missing
    /// directory is not an error.
    pub fn remove(&self, name: &str) -> Result<(), PiccoloError> {
        match std::fs::remove_dir_all(self.app_dir(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Loads every app under `apps_dir`, skipping (with a warning) any entry
    /// whose manifest fails to parse rather than aborting startup over one
    /// corrupt app.
    pub fn load_all(&self) -> Result<Vec<AppInstance>, PiccoloError> {
        if !self.apps_dir.exists() {
            return Ok(Vec::new());
        }
        let mut instances = Vec::new();
        for entry in std::fs::read_dir(&self.apps_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(|s| s.to_string()) else {
                continue;
            };
            match self.read_current(&name) {
                Ok(Some(instance)) => instances.push(instance),
                Ok(None) => {}
                Err(e) => warn!(app = %name, error = %e, "skipping unreadable app state"),
            }
        }
        Ok(instances)
    }
}

fn atomic_write(path: &Path, bytes: &[u8]) -> Result<(), PiccoloError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp_path = PathBuf::from(format!("{}.tmp.{}", path.display(), std::process::id()));
    {
        use std::io::Write;
        let mut f = std::fs::File::create(&tmp_path)?;
        f.write_all(bytes)?;
        f.sync_all()?;
    }
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::app::definition::ImageSource;
    use tempfile::tempdir;

    fn instance(name: &str) -> AppInstance {
        AppInstance::new(AppDefinition {
            name: name.to_string(),
            source: ImageSource { image: Some("demo:latest".to_string()), build: None },
            app_type: Default::default(),
            listeners: vec![],
            storage: Default::default(),
            permissions: Default::default(),
            env: vec![],
            resources: Default::default(),
            depends_on: vec![],
        })
    }

    #[test]
    fn write_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let store = AppFileStore::new(dir.path().to_path_buf());
        store.write(&instance("demo")).unwrap();

        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].definition.name, "demo");
        assert_eq!(loaded[0].status, AppStatus::Installed);
    }

    #[test]
    fn backup_preserves_prior_definition() {
        let dir = tempdir().unwrap();
        let store = AppFileStore::new(dir.path().to_path_buf());
        let mut inst = instance("demo");
        store.write(&inst).unwrap();
        store.backup("demo").unwrap();

        inst.definition.source.image = Some("demo:v2".to_string());
        store.write(&inst).unwrap();

        let backup = store.read_backup("demo").unwrap().unwrap();
        assert_eq!(backup.source.image.as_deref(), Some("demo:latest"));
    }

    #[test]
    fn remove_deletes_app_directory() {
        let dir = tempdir().unwrap();
        let store = AppFileStore::new(dir.path().to_path_buf());
        store.write(&instance("demo")).unwrap();
        store.remove("demo").unwrap();
        assert!(store.load_all().unwrap().is_empty());
    }

    #[test]
    fn corrupt_manifest_is_skipped_not_fatal() {
        let dir = tempdir().unwrap();
        let store = AppFileStore::new(dir.path().to_path_buf());
        std::fs::create_dir_all(dir.path().join("broken")).unwrap();
        std::fs::write(dir.path().join("broken").join("app.yaml"), b"not: [valid yaml").unwrap();
        assert!(store.load_all().unwrap().is_empty());
    }

    #[test]
    fn metadata_survives_independently_of_definition_rewrites() {
        let dir = tempdir().unwrap();
        let store = AppFileStore::new(dir.path().to_path_buf());
        let mut inst = instance("demo");
        inst.status = AppStatus::Running;
        inst.container_id = Some("demo-abcd".to_string());
        inst.enabled = true;
        store.write(&inst).unwrap();

        let reloaded = store.read_current("demo").unwrap().unwrap();
        assert_eq!(reloaded.status, AppStatus::Running);
        assert_eq!(reloaded.container_id.as_deref(), Some("demo-abcd"));
        assert!(reloaded.enabled);
    }
}
