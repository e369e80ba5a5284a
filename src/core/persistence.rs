// src/core/persistence.rs

//! Persistence Module: composes the Volume Manager, Control Store and Export
//! Manager behind the kernel's global lock flag, and owns the background
//! tasks (follower poller, quick-check loop) that keep the control store's
//! event stream live.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::info;

use crate::config::Config;
use crate::core::cluster::{ClusterRegistry, KERNEL_RESOURCE_ID, Role};
use crate::core::control::health::{run_follower_poller, run_quick_check_loop};
use crate::core::control::{ControlGuard, ControlStore};
use crate::core::crypt::CryptKeyset;
use crate::core::errors::PiccoloError;
use crate::core::events::{Event, EventBus, LockStateChangedEvent, Topic};
use crate::core::export::ExportManager;
use crate::core::volume::{VolumeKind, VolumeManager};

pub struct PersistenceModule {
    pub keyset: Arc<CryptKeyset>,
    pub volumes: Arc<VolumeManager>,
    pub control_store: Arc<ControlStore>,
    pub control_guard: Arc<ControlGuard>,
    pub exports: Arc<ExportManager>,
    pub cluster: Arc<ClusterRegistry>,
    pub events: Arc<EventBus>,
    locked: AtomicBool,
}

impl PersistenceModule {
    pub async fn initialize(config: &Config, events: Arc<EventBus>) -> Result<Arc<Self>, PiccoloError> {
        let keyset = Arc::new(CryptKeyset::new(config.keyset_path()));
        let cluster = ClusterRegistry::new(events.clone());

        let volumes = VolumeManager::new(
            config.volumes_dir(),
            config.gocryptfs_path.clone(),
            config.fusermount_path.clone(),
            config.mount.ready_deadline(),
            config.mount.term_grace(),
            config.allow_unmounted_tests,
            events.clone(),
        )?;

        let control_store = Arc::new(ControlStore::open(config.control_store_path(), true)?);
        let control_guard = Arc::new(ControlGuard::new(keyset.clone(), cluster.clone()));
        let exports = Arc::new(ExportManager::new(config.exports_dir()));

        let module = Arc::new(Self {
            keyset,
            volumes,
            control_store,
            control_guard,
            exports,
            cluster,
            events,
            locked: AtomicBool::new(true),
        });

        if module.keyset.is_initialized() {
            info!("keyset already initialized; kernel starting locked");
        } else {
            info!("no keyset found; kernel awaiting first-time setup");
        }

        Ok(module)
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }

    /// Bootstraps the bootstrap and control volumes on first run. Idempotent.
    pub async fn ensure_core_volumes(&self) -> Result<(), PiccoloError> {
        self.keyset.with_sdek(|sdek| sdek.clone_key())?;
        let sdek = self.keyset.with_sdek(|sdek| sdek.clone_key())?;
        self.volumes.ensure_volume("bootstrap", VolumeKind::Bootstrap, &sdek).await?;
        self.volumes.ensure_volume("control", VolumeKind::Control, &sdek).await?;
        Ok(())
    }

    /// Attaches the bootstrap and control volumes and flips the persistence
    /// module to unlocked. Publishes `lock.state_changed`.
    pub async fn unlock(&self) -> Result<(), PiccoloError> {
        let sdek = self.keyset.with_sdek(|sdek| sdek.clone_key())?;
        self.volumes.attach("bootstrap", &sdek).await?;
        self.volumes.attach("control", &sdek).await?;
        self.control_store.set_read_only(!self.cluster.is_leader(KERNEL_RESOURCE_ID))?;
        self.locked.store(false, Ordering::SeqCst);
        self.events
            .publish(Event::LockStateChanged(LockStateChangedEvent { locked: false }));
        info!("persistence module unlocked");
        Ok(())
    }

    /// Detaches volumes and flips back to locked. Publishes
    /// `lock.state_changed`.
    pub async fn lock(&self) -> Result<(), PiccoloError> {
        self.control_store.set_read_only(true)?;
        self.volumes.detach("control").await?;
        self.volumes.detach("bootstrap").await?;
        self.keyset.lock();
        self.locked.store(true, Ordering::SeqCst);
        self.events
            .publish(Event::LockStateChanged(LockStateChangedEvent { locked: true }));
        info!("persistence module locked");
        Ok(())
    }

    /// Reacts to `leadership.role_changed` for the `kernel` resource: flips
    /// the control store's read-only mode to match and, on demotion, logs the
    /// paper trail `ControlGuard::on_demoted` provides. Mirrors the app
    /// manager's own leadership reactor, generalized from "stop apps" to
    /// "toggle store mode".
    pub fn spawn_event_reactor(self: &Arc<Self>, events: &Arc<EventBus>) {
        let module = self.clone();
        let mut role_rx = events.subscribe(Topic::LeadershipRoleChanged);
        tokio::spawn(async move {
            while let Some(event) = role_rx.recv().await {
                let Event::LeadershipRoleChanged(e) = event else { continue };
                if e.resource_id != KERNEL_RESOURCE_ID || module.is_locked() {
                    continue;
                }
                let is_leader = e.role == Role::Leader;
                if let Err(err) = module.control_store.set_read_only(!is_leader) {
                    tracing::error!(error = %err, "failed to switch control store mode after role change");
                }
                if !is_leader {
                    module.control_guard.on_demoted();
                }
            }
        });
    }

    /// Spawns the follower poller and quick-check loop onto `tasks`, wired to
    /// `shutdown`.
    pub fn spawn_background_tasks(
        self: &Arc<Self>,
        config: &Config,
        tasks: &mut JoinSet<()>,
        shutdown: &broadcast::Sender<()>,
    ) {
        let store = self.control_store.clone();
        let events = self.events.clone();
        let quick_check_interval = config.control_store.quick_check_interval();
        let rx = shutdown.subscribe();
        tasks.spawn(async move {
            run_quick_check_loop(store, events, quick_check_interval, rx).await;
        });

        let store = self.control_store.clone();
        let events = self.events.clone();
        let poll_interval = config.control_store.follower_poll_interval();
        let rx = shutdown.subscribe();
        tasks.spawn(async move {
            run_follower_poller(store, events, poll_interval, rx).await;
        });
    }
}
