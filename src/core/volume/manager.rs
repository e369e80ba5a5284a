// src/core/volume/manager.rs

//! `VolumeManager`: the component that turns a desired volume state into an
//! observed one. Two concurrent attach/detach calls against the same volume
//! are serialized by a per-volume lock; operations on distinct volumes
//! proceed in parallel, mirroring the sharded-locking discipline the kernel
//! uses elsewhere (see the Control Store guard and the storage layer this
//! pattern is grounded on).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex as AsyncMutex, watch};
use tracing::{info, warn};

use crate::core::crypt::Sdek;
use crate::core::errors::PiccoloError;
use crate::core::events::{Event, EventBus, VolumeStateChangedEvent};
use crate::core::volume::journal::{VolumeJournal, VolumeRole, VolumeState};
use crate::core::volume::metadata::{VolumeKind, VolumeMetadata};
use crate::core::volume::mount::{self, MountHandle};

struct VolumeHandle {
    lock: AsyncMutex<()>,
    mount: AsyncMutex<Option<MountHandle>>,
    role_tx: watch::Sender<VolumeRole>,
}

pub struct VolumeManager {
    volumes_dir: PathBuf,
    gocryptfs_path: PathBuf,
    fusermount_path: PathBuf,
    ready_deadline: Duration,
    term_grace: Duration,
    allow_unmounted_tests: bool,
    journal: Arc<VolumeJournal>,
    handles: DashMap<String, Arc<VolumeHandle>>,
    events: Arc<EventBus>,
}

impl VolumeManager {
    pub fn new(
        volumes_dir: PathBuf,
        gocryptfs_path: PathBuf,
        fusermount_path: PathBuf,
        ready_deadline: Duration,
        term_grace: Duration,
        allow_unmounted_tests: bool,
        events: Arc<EventBus>,
    ) -> Result<Arc<Self>, PiccoloError> {
        std::fs::create_dir_all(&volumes_dir)?;
        let journal = Arc::new(VolumeJournal::open(volumes_dir.join("journal.json"))?);
        Ok(Arc::new(Self {
            volumes_dir,
            gocryptfs_path,
            fusermount_path,
            ready_deadline,
            term_grace,
            allow_unmounted_tests,
            journal,
            handles: DashMap::new(),
            events,
        }))
    }

    pub fn journal(&self) -> &Arc<VolumeJournal> {
        &self.journal
    }

    fn handle_for(&self, volume_id: &str) -> Arc<VolumeHandle> {
        self.handles
            .entry(volume_id.to_string())
            .or_insert_with(|| {
                let (role_tx, _) = watch::channel(VolumeRole::Primary);
                Arc::new(VolumeHandle {
                    lock: AsyncMutex::new(()),
                    mount: AsyncMutex::new(None),
                    role_tx,
                })
            })
            .clone()
    }

    /// Idempotently creates a volume's metadata and journal entry, sealing a
    /// freshly generated passphrase under the SDEK if the volume is new.
    pub async fn ensure_volume(
        &self,
        volume_id: &str,
        kind: VolumeKind,
        sdek: &Sdek,
    ) -> Result<(), PiccoloError> {
        let handle = self.handle_for(volume_id);
        let _guard = handle.lock.lock().await;

        let metadata_path = VolumeMetadata::path_for(&self.volumes_dir, volume_id);
        if !metadata_path.exists() {
            let passphrase = generate_passphrase()?;
            let metadata = VolumeMetadata::create(volume_id, kind, sdek, &passphrase)?;
            metadata.save(&self.volumes_dir)?;
            info!(volume_id, "volume metadata created");
        }
        self.journal.ensure_entry(volume_id)?;
        Ok(())
    }

    /// Mounts the volume's ciphertext directory. A no-op if already mounted.
    pub async fn attach(&self, volume_id: &str, sdek: &Sdek) -> Result<(), PiccoloError> {
        let handle = self.handle_for(volume_id);
        let _guard = handle.lock.lock().await;

        let mut mount_guard = handle.mount.lock().await;
        if mount_guard.is_some() {
            return Ok(());
        }

        self.journal.update(volume_id, |e| {
            e.desired_state = VolumeState::Mounting;
        })?;

        let metadata = VolumeMetadata::load(&self.volumes_dir, volume_id)?;
        let passphrase = metadata.passphrase(sdek)?;
        let volume_root = self.volumes_dir.join(volume_id);
        let cipher_dir = volume_root.join("cipher");
        let mount_point = volume_root.join("plain");

        let result = if self.allow_unmounted_tests {
            std::fs::create_dir_all(&cipher_dir)?;
            std::fs::create_dir_all(&mount_point)?;
            Ok(None)
        } else {
            mount::mount(
                &self.gocryptfs_path,
                &cipher_dir,
                &mount_point,
                &passphrase,
                self.ready_deadline,
            )
            .await
            .map(Some)
        };

        match result {
            Ok(mount_handle) => {
                *mount_guard = mount_handle;
                self.journal.update(volume_id, |e| {
                    e.observed_state = VolumeState::Mounted;
                    e.needs_repair = false;
                    e.last_error = None;
                    e.generation += 1;
                })?;
                self.events
                    .publish(Event::VolumeStateChanged(VolumeStateChangedEvent {
                        volume_id: volume_id.to_string(),
                        needs_repair: false,
                        last_error: None,
                    }));
                Ok(())
            }
            Err(e) => {
                warn!(volume_id, error = %e, "volume attach failed");
                self.journal.update(volume_id, |entry| {
                    entry.needs_repair = true;
                    entry.last_error = Some(e.to_string());
                })?;
                self.events
                    .publish(Event::VolumeStateChanged(VolumeStateChangedEvent {
                        volume_id: volume_id.to_string(),
                        needs_repair: true,
                        last_error: Some(e.to_string()),
                    }));
                Err(e)
            }
        }
    }

    /// Unmounts the volume. A no-op if it is not currently mounted.
    pub async fn detach(&self, volume_id: &str) -> Result<(), PiccoloError> {
        let handle = self.handle_for(volume_id);
        let _guard = handle.lock.lock().await;

        let mut mount_guard = handle.mount.lock().await;
        let Some(mount_handle) = mount_guard.take() else {
            return Ok(());
        };

        self.journal.update(volume_id, |e| {
            e.desired_state = VolumeState::Detaching;
        })?;

        mount_handle
            .unmount(&self.fusermount_path, self.term_grace)
            .await?;

        self.journal.update(volume_id, |e| {
            e.desired_state = VolumeState::Unattached;
            e.observed_state = VolumeState::Unattached;
        })?;
        Ok(())
    }

    pub fn set_role(&self, volume_id: &str, role: VolumeRole) -> Result<(), PiccoloError> {
        let handle = self.handle_for(volume_id);
        self.journal.update(volume_id, |e| e.role = role)?;
        let _ = handle.role_tx.send(role);
        Ok(())
    }

    /// A live stream of role transitions for this volume (primary/secondary),
    /// independent of the kernel-wide leadership role.
    pub fn role_stream(&self, volume_id: &str) -> watch::Receiver<VolumeRole> {
        self.handle_for(volume_id).role_tx.subscribe()
    }
}

fn generate_passphrase() -> Result<String, PiccoloError> {
    let mut bytes = [0u8; 32];
    getrandom::fill(&mut bytes).map_err(|e| PiccoloError::Crypto(e.to_string()))?;
    Ok(hex::encode(bytes))
}
