// src/lib.rs

//! Piccolo Kernel: the persistence and lifecycle kernel for the Piccolo
//! appliance daemon. Wires together the Crypt Keyset, Volume Manager,
//! Control Store, Export Manager, App Lifecycle Manager, Cluster Registry,
//! Event Bus and Command Dispatcher behind a single `Kernel::initialize`
//! entry point.

pub mod config;
pub mod core;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex as AsyncMutex, broadcast};
use tokio::task::JoinSet;
use tracing::info;

pub use crate::config::Config;
use crate::core::app::{AppManager, InMemoryContainerRuntime, LoggingRouterRegistrar};
use crate::core::cluster::ClusterRegistry;
use crate::core::dispatcher::{CommandHandler, Dispatcher};
use crate::core::errors::PiccoloError;
use crate::core::events::EventBus;
use crate::core::persistence::PersistenceModule;
use crate::core::volume::VolumeKind;

/// The fully wired kernel and the handle needed to shut it down cleanly.
pub struct KernelInit {
    pub kernel: Arc<Kernel>,
    pub shutdown_tx: broadcast::Sender<()>,
}

pub struct Kernel {
    pub config: Config,
    pub events: Arc<EventBus>,
    pub cluster: Arc<ClusterRegistry>,
    pub persistence: Arc<PersistenceModule>,
    pub apps: Arc<AppManager>,
    pub dispatcher: Arc<Dispatcher>,
    critical_tasks: AsyncMutex<JoinSet<()>>,
}

impl Kernel {
    pub async fn initialize(config: Config) -> Result<KernelInit, PiccoloError> {
        let events = EventBus::new();
        let persistence = PersistenceModule::initialize(&config, events.clone()).await?;
        persistence.spawn_event_reactor(&events);

        let apps = AppManager::new(
            persistence.keyset.clone(),
            persistence.cluster.clone(),
            Arc::new(InMemoryContainerRuntime::new()),
            Arc::new(LoggingRouterRegistrar),
            config.apps_dir(),
            config.enabled_dir(),
            config.apps.reserved_names.clone(),
            config.apps.install_retries,
        );
        apps.load_persisted().await?;
        apps.spawn_event_reactor(&events);

        let mut dispatcher = Dispatcher::new();
        register_persistence_handlers(&mut dispatcher, &persistence);

        let (shutdown_tx, _) = broadcast::channel(1);

        let kernel = Arc::new(Self {
            config,
            events,
            cluster: persistence.cluster.clone(),
            persistence,
            apps,
            dispatcher: Arc::new(dispatcher),
            critical_tasks: AsyncMutex::new(JoinSet::new()),
        });

        Ok(KernelInit { kernel, shutdown_tx })
    }

    /// Spawns the persistence module's background tasks (quick-check loop,
    /// follower poller) so they start reacting on `shutdown_tx`.
    pub async fn spawn_background_tasks(self: &Arc<Self>, shutdown_tx: &broadcast::Sender<()>) {
        let mut tasks = self.critical_tasks.lock().await;
        self.persistence.spawn_background_tasks(&self.config, &mut tasks, shutdown_tx);
    }

    /// Broadcasts shutdown and waits for every spawned background task to
    /// finish, so a caller never returns control while a quick-check or
    /// poller loop is still mid-iteration.
    pub async fn shutdown(self: &Arc<Self>, shutdown_tx: broadcast::Sender<()>) {
        info!("kernel shutdown initiated");
        let _ = shutdown_tx.send(());
        let mut tasks = self.critical_tasks.lock().await;
        while tasks.join_next().await.is_some() {}
        info!("kernel shutdown complete");
    }
}

fn register_persistence_handlers(dispatcher: &mut Dispatcher, persistence: &Arc<PersistenceModule>) {
    dispatcher.register(
        "persistence.ensure_volume",
        Arc::new(EnsureVolumeHandler { persistence: persistence.clone() }),
    );
    dispatcher.register(
        "persistence.attach_volume",
        Arc::new(AttachVolumeHandler { persistence: persistence.clone() }),
    );
    dispatcher.register(
        "persistence.record_lock_state",
        Arc::new(RecordLockStateHandler { persistence: persistence.clone() }),
    );
    dispatcher.register(
        "persistence.run_control_export",
        Arc::new(RunExportHandler {
            persistence: persistence.clone(),
            kind: crate::core::export::ExportKind::ControlOnly,
        }),
    );
    dispatcher.register(
        "persistence.run_full_export",
        Arc::new(RunExportHandler {
            persistence: persistence.clone(),
            kind: crate::core::export::ExportKind::FullData,
        }),
    );
}

struct EnsureVolumeHandler {
    persistence: Arc<PersistenceModule>,
}

#[async_trait]
impl CommandHandler for EnsureVolumeHandler {
    async fn handle(&self, payload: Value) -> Result<Value, PiccoloError> {
        let volume_id = payload
            .get("volume_id")
            .and_then(Value::as_str)
            .ok_or_else(|| PiccoloError::InvalidInput("volume_id is required".to_string()))?;
        let sdek = self.persistence.keyset.with_sdek(|s| s.clone_key())?;
        self.persistence.volumes.ensure_volume(volume_id, VolumeKind::App, &sdek).await?;
        Ok(serde_json::json!({"volume_id": volume_id, "status": "ensured"}))
    }
}

struct AttachVolumeHandler {
    persistence: Arc<PersistenceModule>,
}

#[async_trait]
impl CommandHandler for AttachVolumeHandler {
    async fn handle(&self, payload: Value) -> Result<Value, PiccoloError> {
        let volume_id = payload
            .get("volume_id")
            .and_then(Value::as_str)
            .ok_or_else(|| PiccoloError::InvalidInput("volume_id is required".to_string()))?;
        let sdek = self.persistence.keyset.with_sdek(|s| s.clone_key())?;
        self.persistence.volumes.attach(volume_id, &sdek).await?;
        Ok(serde_json::json!({"volume_id": volume_id, "status": "attached"}))
    }
}

struct RecordLockStateHandler {
    persistence: Arc<PersistenceModule>,
}

#[async_trait]
impl CommandHandler for RecordLockStateHandler {
    async fn handle(&self, payload: Value) -> Result<Value, PiccoloError> {
        let locked = payload
            .get("locked")
            .and_then(Value::as_bool)
            .ok_or_else(|| PiccoloError::InvalidInput("locked (bool) is required".to_string()))?;
        if locked {
            self.persistence.lock().await?;
        } else {
            self.persistence.unlock().await?;
        }
        Ok(serde_json::json!({"locked": locked}))
    }
}

struct RunExportHandler {
    persistence: Arc<PersistenceModule>,
    kind: crate::core::export::ExportKind,
}

#[async_trait]
impl CommandHandler for RunExportHandler {
    async fn handle(&self, payload: Value) -> Result<Value, PiccoloError> {
        let name = payload
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or("export");
        let control_dir = self
            .persistence
            .control_store
            .path()
            .parent()
            .ok_or_else(|| PiccoloError::Internal("control store path has no parent directory".to_string()))?
            .to_path_buf();
        let dirs = vec![("control".to_string(), control_dir)];
        let path = self.persistence.exports.export(name, self.kind, dirs).await?;
        Ok(serde_json::json!({"path": path.to_string_lossy()}))
    }
}
