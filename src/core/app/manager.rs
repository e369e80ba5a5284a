// src/core/app/manager.rs

//! `AppManager`: the App Lifecycle Manager. Orchestrates container
//! start/stop against the `ContainerRuntime` trait, port allocation via the
//! `ServiceManager`, and route registration via the `RouterRegistrar`, all
//! gated by the kernel's lock state and leadership role.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use crate::core::app::definition::{AppDefinition, AppType, InternetPolicy, replace_image_tag};
use crate::core::app::instance::{AppInstance, AppStatus};
use crate::core::app::router::{RouteSpec, RouterRegistrar};
use crate::core::app::runtime::{ContainerRuntime, ContainerSpec, ContainerState};
use crate::core::app::service::ServiceManager;
use crate::core::app::store::AppFileStore;
use crate::core::cluster::{ClusterRegistry, KERNEL_RESOURCE_ID, Role, app_name_from_resource};
use crate::core::crypt::CryptKeyset;
use crate::core::errors::PiccoloError;
use crate::core::events::{Event, EventBus, Topic};

pub struct AppManager {
    keyset: Arc<CryptKeyset>,
    cluster: Arc<ClusterRegistry>,
    runtime: Arc<dyn ContainerRuntime>,
    router: Arc<dyn RouterRegistrar>,
    service: Arc<ServiceManager>,
    store: AppFileStore,
    apps_dir: PathBuf,
    enabled_dir: PathBuf,
    reserved_names: Vec<String>,
    install_retries: u32,
    apps: DashMap<String, Arc<AsyncMutex<AppInstance>>>,
}

impl AppManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        keyset: Arc<CryptKeyset>,
        cluster: Arc<ClusterRegistry>,
        runtime: Arc<dyn ContainerRuntime>,
        router: Arc<dyn RouterRegistrar>,
        apps_dir: PathBuf,
        enabled_dir: PathBuf,
        reserved_names: Vec<String>,
        install_retries: u32,
    ) -> Arc<Self> {
        Arc::new(Self {
            keyset,
            cluster,
            runtime,
            router,
            service: Arc::new(ServiceManager::new()),
            store: AppFileStore::new(apps_dir.clone()),
            apps_dir,
            enabled_dir,
            reserved_names,
            install_retries,
            apps: DashMap::new(),
        })
    }

    /// Restores every persisted app into the in-memory app table. A container
    /// the kernel may have been supervising before a restart is no longer
    /// known to be running, so any instance found `Running` or `Starting` is
    /// loaded as `Stopped` with its container id and port bindings cleared
    /// rather than asserted without evidence; `start` re-creates the
    /// container and re-allocates ports from scratch.
    pub async fn load_persisted(&self) -> Result<(), PiccoloError> {
        for mut instance in self.store.load_all()? {
            if instance.status == AppStatus::Running || instance.status == AppStatus::Starting {
                instance.status = AppStatus::Stopped;
                instance.container_id = None;
                instance.allocated_ports.clear();
            }
            info!(app = %instance.definition.name, status = ?instance.status, "restored app from disk");
            self.apps.insert(instance.definition.name.clone(), Arc::new(AsyncMutex::new(instance)));
        }
        Ok(())
    }

    /// Spawns a task that reacts to `lock.state_changed` and
    /// `leadership.role_changed`: a kernel-level lock/demotion stops every
    /// running app; an unlock kicks off `restore_services` in the
    /// background; a per-app `app:<name>` role change routes that one app
    /// between local and tunnel mode.
    pub fn spawn_event_reactor(self: &Arc<Self>, events: &Arc<EventBus>) {
        let manager = self.clone();
        let mut lock_rx = events.subscribe(Topic::LockStateChanged);
        let mut role_rx = events.subscribe(Topic::LeadershipRoleChanged);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(event) = lock_rx.recv() => {
                        if let Event::LockStateChanged(e) = event {
                            if e.locked {
                                manager.stop_all_on_gating_loss("device locked").await;
                            } else {
                                let manager = manager.clone();
                                tokio::spawn(async move { manager.restore_services().await; });
                            }
                        }
                    }
                    Some(event) = role_rx.recv() => {
                        if let Event::LeadershipRoleChanged(e) = event {
                            if e.resource_id == KERNEL_RESOURCE_ID {
                                if e.role == Role::Follower {
                                    manager.stop_all_on_gating_loss("kernel demoted from leader").await;
                                }
                            } else if let Some(app_name) = app_name_from_resource(&e.resource_id) {
                                manager.handle_app_role_change(app_name, e.role).await;
                            }
                        }
                    }
                    else => break,
                }
            }
        });
    }

    async fn stop_all_on_gating_loss(&self, reason: &str) {
        warn!(reason, "stopping all running apps");
        let names: Vec<String> = self.apps.iter().map(|e| e.key().clone()).collect();
        for name in names {
            if let Err(e) = self.stop_inner(&name).await {
                warn!(app = %name, error = %e, "failed to stop app during gating loss");
            }
        }
    }

    /// Per-app leadership routing: a follower stops the app locally and
    /// routes its traffic through the tunnel; a leader routes locally again.
    /// Neither direction auto-restarts a stopped app — leadership only
    /// decides where traffic for an already-running app goes.
    async fn handle_app_role_change(&self, app_name: &str, role: Role) {
        match role {
            Role::Follower => {
                if let Err(e) = self.stop_inner(app_name).await {
                    warn!(app = app_name, error = %e, "stop on follower demotion failed");
                }
                let route = RouteSpec { app_name: app_name.to_string(), host_port: None };
                if let Err(e) = self.router.register_tunnel(&route).await {
                    warn!(app = app_name, error = %e, "tunnel route registration failed");
                }
            }
            Role::Leader => {
                let _ = self.router.unregister_tunnel(app_name).await;
                let host_port = match self.apps.get(app_name) {
                    Some(entry) => entry.clone().lock().await.allocated_ports.first().map(|(h, _)| *h),
                    None => None,
                };
                let route = RouteSpec { app_name: app_name.to_string(), host_port };
                if let Err(e) = self.router.register_local(&route).await {
                    warn!(app = app_name, error = %e, "local route registration failed");
                }
            }
        }
    }

    /// Re-reads each installed app with a container id, inspects the ports
    /// the runtime actually has published, and reconciles service
    /// reservations to match — dropping them entirely when the runtime
    /// reports nothing published. Run asynchronously after an unlock.
    pub async fn restore_services(&self) {
        let names: Vec<String> = self.apps.iter().map(|e| e.key().clone()).collect();
        for name in names {
            let Some(handle) = self.apps.get(&name).map(|e| e.clone()) else { continue };
            let mut instance = handle.lock().await;
            let Some(container_id) = instance.container_id.clone() else { continue };

            if let Ok(Some(persisted)) = self.store.read_current(&name) {
                instance.definition = persisted.definition;
            }

            match self.runtime.published_ports(&container_id).await {
                Ok(ports) if !ports.is_empty() => {
                    self.service.release_all_for(&name);
                    for (host, _guest) in &ports {
                        let _ = self.service.reserve(&name, Some(*host));
                    }
                    instance.allocated_ports = ports;
                }
                _ => {
                    self.service.release_all_for(&name);
                    instance.allocated_ports.clear();
                }
            }
            instance.touch();
            if let Err(e) = self.store.write(&instance) {
                warn!(app = %name, error = %e, "failed to persist restored service state");
            }
            info!(app = %name, "service endpoints restored after unlock");
        }
    }

    fn check_gate(&self) -> Result<(), PiccoloError> {
        if !self.keyset.is_unlocked() {
            return Err(PiccoloError::Locked);
        }
        if !self.cluster.is_leader(KERNEL_RESOURCE_ID) {
            return Err(PiccoloError::NotLeader);
        }
        Ok(())
    }

    fn resolve_image(definition: &AppDefinition) -> String {
        match (&definition.source.image, &definition.source.build) {
            (Some(image), _) => image.clone(),
            (None, Some(build)) => format!("local-build:{}", build.context),
            (None, None) => unreachable!("AppDefinition::validate enforces image XOR build"),
        }
    }

    fn container_spec_for(definition: &AppDefinition, port_bindings: Vec<(u16, u16)>) -> ContainerSpec {
        ContainerSpec {
            name: definition.name.clone(),
            image: Self::resolve_image(definition),
            env: definition.env.clone(),
            port_bindings,
            restart_always: definition.app_type == AppType::System,
            network_none: definition.permissions.internet == InternetPolicy::Deny,
        }
    }

    /// One install attempt: allocates a host port per listener, builds the
    /// container spec, and creates the container. On a runtime-reported
    /// `PortInUse` the caller releases this app's claims, permanently
    /// reserves the offending port, and retries with a fresh allocation.
    async fn try_create_container(&self, definition: &AppDefinition) -> Result<(String, Vec<(u16, u16)>), PiccoloError> {
        let requested: Vec<Option<u16>> = definition.listeners.iter().map(|l| l.host_port).collect();
        let hosts = self.service.reserve_with_retries(&definition.name, &requested, 1)?;
        let port_bindings: Vec<(u16, u16)> = definition
            .listeners
            .iter()
            .zip(hosts.iter())
            .map(|(l, h)| (*h, l.guest_port))
            .collect();

        let spec = Self::container_spec_for(definition, port_bindings.clone());
        match self.runtime.create(&spec).await {
            Ok(id) => Ok((id, port_bindings)),
            Err(e) => {
                self.service.release_all_for(&definition.name);
                Err(e)
            }
        }
    }

    /// Installs a new app. Fails with `AlreadyExists` if the name is taken;
    /// use `upsert` to update an existing app's definition. Retries up to
    /// `install_retries` attempts, but only on a port conflict — any other
    /// failure aborts immediately and leaves no filesystem state.
    pub async fn install(&self, definition: AppDefinition) -> Result<(), PiccoloError> {
        self.check_gate()?;
        definition.validate(&self.reserved_names)?;
        if self.apps.contains_key(&definition.name) {
            return Err(PiccoloError::AlreadyExists(definition.name));
        }
        let name = definition.name.clone();
        let mut instance = AppInstance::new(definition);

        let mut last_err = None;
        for attempt in 0..self.install_retries {
            match self.try_create_container(&instance.definition).await {
                Ok((container_id, port_bindings)) => {
                    instance.container_id = Some(container_id);
                    instance.allocated_ports = port_bindings;
                    instance.status = AppStatus::Installed;
                    self.store.write(&instance)?;
                    info!(app = %name, attempt, "app installed");
                    self.apps.insert(name, Arc::new(AsyncMutex::new(instance)));
                    return Ok(());
                }
                Err(PiccoloError::PortInUse(port)) => {
                    warn!(app = %name, port, attempt, "install retrying after port conflict");
                    self.service.reserve_offending(port);
                    last_err = Some(PiccoloError::PortInUse(port));
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| PiccoloError::Transient("install retries exhausted".to_string())))
    }

    /// Reconciles an existing app's listeners (or installs it fresh if it
    /// does not exist yet). The live container is recreated against the new
    /// definition rather than patched in place, since the runtime
    /// abstraction has no live-publish-update primitive; endpoints already
    /// bound to unchanged listeners are preserved across the swap.
    pub async fn upsert(&self, definition: AppDefinition) -> Result<(), PiccoloError> {
        self.check_gate()?;
        definition.validate(&self.reserved_names)?;
        if !self.apps.contains_key(&definition.name) {
            return self.install(definition).await;
        }
        let name = definition.name.clone();
        self.store.backup(&name)?;
        self.recreate_container(&name, definition).await
    }

    fn app_handle(&self, name: &str) -> Result<Arc<AsyncMutex<AppInstance>>, PiccoloError> {
        self.apps
            .get(name)
            .map(|e| e.clone())
            .ok_or_else(|| PiccoloError::NotFound(name.to_string()))
    }

    /// Core of `start`, parameterized on a preferred host port per guest
    /// port so `recreate_container` can ask for the previously-bound ports
    /// back instead of fresh ephemeral ones.
    async fn start_inner(&self, name: &str, preferred_hosts: &HashMap<u16, u16>) -> Result<(), PiccoloError> {
        let handle = self.app_handle(name)?;
        let mut instance = handle.lock().await;

        if !instance.status.can_transition_to(AppStatus::Starting) {
            return Err(PiccoloError::InvalidInput(format!(
                "cannot start app '{name}' from status {:?}",
                instance.status
            )));
        }
        instance.status = AppStatus::Starting;

        if instance.allocated_ports.is_empty() {
            let requested: Vec<Option<u16>> = instance
                .definition
                .listeners
                .iter()
                .map(|l| preferred_hosts.get(&l.guest_port).copied().or(l.host_port))
                .collect();
            let hosts = match self.service.reserve_with_retries(name, &requested, 5) {
                Ok(hosts) => hosts,
                Err(e) => {
                    instance.status = AppStatus::Failed;
                    return Err(e);
                }
            };
            instance.allocated_ports = instance
                .definition
                .listeners
                .iter()
                .zip(hosts.iter())
                .map(|(l, h)| (*h, l.guest_port))
                .collect();
        }

        let container_id = match &instance.container_id {
            Some(id) => id.clone(),
            None => {
                let spec = Self::container_spec_for(&instance.definition, instance.allocated_ports.clone());
                match self.runtime.create(&spec).await {
                    Ok(id) => id,
                    Err(e) => {
                        instance.status = AppStatus::Failed;
                        self.service.release_all_for(name);
                        return Err(e);
                    }
                }
            }
        };

        if let Err(e) = self.runtime.start(&container_id).await {
            instance.status = AppStatus::Failed;
            self.service.release_all_for(name);
            return Err(e);
        }

        instance.container_id = Some(container_id);
        instance.status = AppStatus::Running;
        instance.touch();

        for (host_port, _) in instance.allocated_ports.clone() {
            let route = RouteSpec { app_name: name.to_string(), host_port: Some(host_port) };
            if let Err(e) = self.router.register_local(&route).await {
                warn!(app = name, error = %e, "local route registration failed");
            }
        }
        info!(app = name, "app started");
        Ok(())
    }

    pub async fn start(&self, name: &str) -> Result<(), PiccoloError> {
        self.check_gate()?;
        self.start_inner(name, &HashMap::new()).await
    }

    /// Stops `name` without evaluating the lock/leadership gate. Used
    /// internally for gating-loss reactions and per-app follower demotion,
    /// where the gate has either already been evaluated or does not apply.
    async fn stop_inner(&self, name: &str) -> Result<(), PiccoloError> {
        let handle = self.app_handle(name)?;
        let mut instance = handle.lock().await;
        if instance.status != AppStatus::Running {
            return Ok(());
        }
        instance.status = AppStatus::Stopping;

        if let Some(container_id) = &instance.container_id {
            if let Err(e) = self.runtime.stop(container_id).await {
                instance.status = AppStatus::Failed;
                return Err(e);
            }
        }
        let _ = self.router.unregister_local(name).await;
        self.service.release_all_for(name);
        instance.allocated_ports.clear();
        instance.status = AppStatus::Stopped;
        instance.touch();
        info!(app = name, "app stopped");
        Ok(())
    }

    pub async fn stop(&self, name: &str) -> Result<(), PiccoloError> {
        self.check_gate()?;
        self.stop_inner(name).await
    }

    /// Stops and removes the app. With `purge`, also attempts to remove its
    /// persistent/temporary data directory; without it, only the app
    /// manager's own state (`app.yaml`/`metadata.json`) and enable symlink
    /// are removed.
    pub async fn uninstall(&self, name: &str, purge: bool) -> Result<(), PiccoloError> {
        self.check_gate()?;
        let _ = self.stop_inner(name).await;
        let handle = self.app_handle(name)?;
        let instance = handle.lock().await;
        if let Some(container_id) = &instance.container_id {
            let _ = self.runtime.remove(container_id).await;
        }
        drop(instance);

        self.apps.remove(name);
        self.service.release_all_for(name);
        let _ = remove_enabled_symlink(&self.enabled_dir, name);
        self.store.remove(name)?;
        if purge {
            let data_dir = self.apps_dir.join(name).join("data");
            if data_dir.exists() {
                let _ = std::fs::remove_dir_all(&data_dir);
            }
        }
        info!(app = name, purge, "app uninstalled");
        Ok(())
    }

    /// Idempotently creates `<state>/enabled/<name> -> ../apps/<name>`. Has
    /// no effect on whether the app is currently running.
    pub async fn enable(&self, name: &str) -> Result<(), PiccoloError> {
        self.check_gate()?;
        let handle = self.app_handle(name)?;
        create_enabled_symlink(&self.enabled_dir, name)?;
        let mut instance = handle.lock().await;
        instance.enabled = true;
        instance.touch();
        self.store.write(&instance)
    }

    /// Idempotently removes the enable symlink. Has no effect on whether the
    /// app is currently running.
    pub async fn disable(&self, name: &str) -> Result<(), PiccoloError> {
        self.check_gate()?;
        let handle = self.app_handle(name)?;
        remove_enabled_symlink(&self.enabled_dir, name)?;
        let mut instance = handle.lock().await;
        instance.enabled = false;
        instance.touch();
        self.store.write(&instance)
    }

    /// Replaces the image tag (registry-aware: everything up to the last
    /// `/` is preserved, only the segment after the last `:` changes). A
    /// `None` tag re-creates the container against the current image
    /// unchanged, which is useful to pick up a freshly-pushed same-tag
    /// image. Fails for build-sourced apps, which have no image to retag.
    pub async fn update_image(&self, name: &str, tag: Option<String>) -> Result<(), PiccoloError> {
        self.check_gate()?;
        let handle = self.app_handle(name)?;
        let (current_image, mut new_definition) = {
            let instance = handle.lock().await;
            (instance.definition.source.image.clone(), instance.definition.clone())
        };
        let Some(current_image) = current_image else {
            return Err(PiccoloError::InvalidInput(format!(
                "app '{name}' is build-sourced and has no image tag to update"
            )));
        };
        let new_image = match &tag {
            Some(tag) => replace_image_tag(&current_image, tag),
            None => current_image,
        };
        new_definition.source.image = Some(new_image);

        self.store.backup(name)?;
        self.recreate_container(name, new_definition).await
    }

    /// Restores the definition backed up by the most recent
    /// `update_image`/`upsert`, a mirror of `update_image`.
    pub async fn revert(&self, name: &str) -> Result<(), PiccoloError> {
        self.check_gate()?;
        let backup = self
            .store
            .read_backup(name)?
            .ok_or_else(|| PiccoloError::NotFound(format!("no app.prev.yaml for '{name}'")))?;
        self.store.backup(name)?;
        self.recreate_container(name, backup).await
    }

    /// Stops the live container (if any), swaps in `new_definition`, and —
    /// if the app was running — starts it back up, preferring the host
    /// ports previously bound to each still-present guest port.
    async fn recreate_container(&self, name: &str, new_definition: AppDefinition) -> Result<(), PiccoloError> {
        let handle = self.app_handle(name)?;
        let (preserved, was_running) = {
            let mut instance = handle.lock().await;
            let preserved: HashMap<u16, u16> =
                instance.allocated_ports.iter().map(|(h, g)| (*g, *h)).collect();
            let was_running = instance.status == AppStatus::Running;

            if let Some(container_id) = instance.container_id.take() {
                let _ = self.runtime.stop(&container_id).await;
                let _ = self.runtime.remove(&container_id).await;
            }
            let _ = self.router.unregister_local(name).await;
            let _ = self.router.unregister_tunnel(name).await;
            self.service.release_all_for(name);
            instance.allocated_ports.clear();
            instance.definition = new_definition;
            instance.status = AppStatus::Stopped;
            instance.touch();
            self.store.write(&instance)?;
            (preserved, was_running)
        };

        if was_running {
            self.start_inner(name, &preserved).await?;
        }
        Ok(())
    }

    pub async fn status(&self, name: &str) -> Result<AppStatus, PiccoloError> {
        let handle = self.app_handle(name)?;
        Ok(handle.lock().await.status)
    }

    pub async fn logs(&self, name: &str, tail_lines: usize) -> Result<Vec<String>, PiccoloError> {
        let handle = self.app_handle(name)?;
        let instance = handle.lock().await;
        let container_id = instance
            .container_id
            .as_ref()
            .ok_or_else(|| PiccoloError::InvalidInput(format!("app '{name}' has never been started")))?;
        self.runtime.logs(container_id, tail_lines).await
    }

    pub async fn container_state(&self, name: &str) -> Result<ContainerState, PiccoloError> {
        let handle = self.app_handle(name)?;
        let instance = handle.lock().await;
        let container_id = instance
            .container_id
            .as_ref()
            .ok_or_else(|| PiccoloError::InvalidInput(format!("app '{name}' has never been started")))?;
        self.runtime.state(container_id).await
    }
}

fn create_enabled_symlink(enabled_dir: &std::path::Path, name: &str) -> Result<(), PiccoloError> {
    std::fs::create_dir_all(enabled_dir)?;
    let link_path = enabled_dir.join(name);
    let target = PathBuf::from("..").join("apps").join(name);
    match std::os::unix::fs::symlink(&target, &link_path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn remove_enabled_symlink(enabled_dir: &std::path::Path, name: &str) -> Result<(), PiccoloError> {
    match std::fs::remove_file(enabled_dir.join(name)) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::app::definition::{ImageSource, Listener};
    use crate::core::app::router::LoggingRouterRegistrar;
    use crate::core::app::runtime::InMemoryContainerRuntime;
    use tempfile::tempdir;

    fn manager_at(dir: &std::path::Path, runtime: Arc<InMemoryContainerRuntime>) -> Arc<AppManager> {
        let keyset = Arc::new(CryptKeyset::new(dir.join("keyset.json")));
        keyset.setup("pw").unwrap();
        let cluster = ClusterRegistry::new(EventBus::new());
        cluster.set(KERNEL_RESOURCE_ID.to_string(), Role::Leader);
        AppManager::new(
            keyset,
            cluster,
            runtime,
            Arc::new(LoggingRouterRegistrar),
            dir.join("apps"),
            dir.join("enabled"),
            vec!["kernel".to_string()],
            5,
        )
    }

    fn unlocked_leader_manager() -> Arc<AppManager> {
        // `tempdir()` is intentionally not kept alive past this call: every
        // path the manager needs is created lazily via `create_dir_all`, so
        // a manager built here still works after the directory is removed.
        let dir = tempdir().unwrap();
        manager_at(dir.path(), Arc::new(InMemoryContainerRuntime::new()))
    }

    fn def(name: &str) -> AppDefinition {
        AppDefinition {
            name: name.to_string(),
            source: ImageSource { image: Some("demo:latest".to_string()), build: None },
            app_type: Default::default(),
            listeners: vec![Listener { name: "web".to_string(), guest_port: 80, host_port: None }],
            storage: Default::default(),
            permissions: Default::default(),
            env: vec![],
            resources: Default::default(),
            depends_on: vec![],
        }
    }

    #[tokio::test]
    async fn install_start_stop_uninstall_lifecycle() {
        let manager = unlocked_leader_manager();
        manager.install(def("demo")).await.unwrap();
        assert_eq!(manager.status("demo").await.unwrap(), AppStatus::Installed);

        manager.start("demo").await.unwrap();
        assert_eq!(manager.status("demo").await.unwrap(), AppStatus::Running);

        manager.stop("demo").await.unwrap();
        assert_eq!(manager.status("demo").await.unwrap(), AppStatus::Stopped);

        manager.uninstall("demo", false).await.unwrap();
        assert!(matches!(manager.status("demo").await, Err(PiccoloError::NotFound(_))));
    }

    #[tokio::test]
    async fn install_already_creates_a_container() {
        let manager = unlocked_leader_manager();
        manager.install(def("demo")).await.unwrap();
        // install creates but does not start the container; state stays "created".
        assert_eq!(manager.status("demo").await.unwrap(), AppStatus::Installed);
        assert!(manager.container_state("demo").await.is_ok());
    }

    #[tokio::test]
    async fn locked_kernel_rejects_install() {
        let dir = tempdir().unwrap();
        let keyset = Arc::new(CryptKeyset::new(dir.path().join("keyset.json")));
        let cluster = ClusterRegistry::new(EventBus::new());
        let manager = AppManager::new(
            keyset,
            cluster,
            Arc::new(InMemoryContainerRuntime::new()),
            Arc::new(LoggingRouterRegistrar),
            dir.path().join("apps"),
            dir.path().join("enabled"),
            vec![],
            5,
        );
        assert!(matches!(manager.install(def("demo")).await, Err(PiccoloError::Locked)));
    }

    #[tokio::test]
    async fn double_install_is_already_exists() {
        let manager = unlocked_leader_manager();
        manager.install(def("demo")).await.unwrap();
        assert!(matches!(manager.install(def("demo")).await, Err(PiccoloError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn install_retries_past_a_port_conflict() {
        let dir = tempdir().unwrap();
        let runtime = Arc::new(InMemoryContainerRuntime::new());
        runtime.simulate_port_conflict(20000);
        let manager = manager_at(dir.path(), runtime);

        let mut definition = def("demo");
        definition.listeners = vec![Listener { name: "web".to_string(), guest_port: 80, host_port: None }];

        // The first attempt is offered 20000 (first free ephemeral port) and
        // conflicts; reserving it as offending forces the retry onto a
        // different host port, which then succeeds.
        manager.install(definition).await.unwrap();
        assert_eq!(manager.status("demo").await.unwrap(), AppStatus::Installed);
    }

    #[tokio::test]
    async fn lock_event_stops_running_apps() {
        let manager = unlocked_leader_manager();
        manager.install(def("demo")).await.unwrap();
        manager.start("demo").await.unwrap();

        let events = EventBus::new();
        manager.spawn_event_reactor(&events);
        events.publish(Event::LockStateChanged(crate::core::events::LockStateChangedEvent { locked: true }));

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(manager.status("demo").await.unwrap(), AppStatus::Stopped);
    }

    #[tokio::test]
    async fn unlock_event_restores_service_endpoints() {
        let manager = unlocked_leader_manager();
        manager.install(def("demo")).await.unwrap();
        manager.start("demo").await.unwrap();

        let events = EventBus::new();
        manager.spawn_event_reactor(&events);
        events.publish(Event::LockStateChanged(crate::core::events::LockStateChangedEvent { locked: false }));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let handle = manager.app_handle("demo").unwrap();
        assert!(!handle.lock().await.allocated_ports.is_empty());
    }

    #[tokio::test]
    async fn follower_demotion_stops_app_and_registers_tunnel() {
        let manager = unlocked_leader_manager();
        manager.install(def("demo")).await.unwrap();
        manager.start("demo").await.unwrap();

        manager
            .handle_app_role_change("demo", Role::Follower)
            .await;
        assert_eq!(manager.status("demo").await.unwrap(), AppStatus::Stopped);

        manager.handle_app_role_change("demo", Role::Leader).await;
        // Leadership flip alone does not restart a stopped app.
        assert_eq!(manager.status("demo").await.unwrap(), AppStatus::Stopped);
    }

    #[tokio::test]
    async fn enable_disable_toggle_symlink_without_touching_running_state() {
        let manager = unlocked_leader_manager();
        manager.install(def("demo")).await.unwrap();
        manager.start("demo").await.unwrap();

        manager.enable("demo").await.unwrap();
        manager.enable("demo").await.unwrap(); // idempotent
        assert_eq!(manager.status("demo").await.unwrap(), AppStatus::Running);

        manager.disable("demo").await.unwrap();
        manager.disable("demo").await.unwrap(); // idempotent
        assert_eq!(manager.status("demo").await.unwrap(), AppStatus::Running);
    }

    #[tokio::test]
    async fn load_persisted_restores_apps_across_a_fresh_manager() {
        let dir = tempdir().unwrap();
        let first = manager_at(dir.path(), Arc::new(InMemoryContainerRuntime::new()));
        first.install(def("demo")).await.unwrap();
        first.start("demo").await.unwrap();

        let second = manager_at(dir.path(), Arc::new(InMemoryContainerRuntime::new()));
        second.load_persisted().await.unwrap();

        // Running is not carried across a restart without evidence the
        // container survived it; the app comes back stopped and startable.
        assert_eq!(second.status("demo").await.unwrap(), AppStatus::Stopped);
        second.start("demo").await.unwrap();
        assert_eq!(second.status("demo").await.unwrap(), AppStatus::Running);
    }

    #[tokio::test]
    async fn update_image_then_revert_restores_prior_image() {
        let manager = unlocked_leader_manager();
        manager.install(def("demo")).await.unwrap();
        manager.start("demo").await.unwrap();

        manager.update_image("demo", Some("v2".to_string())).await.unwrap();
        let handle = manager.app_handle("demo").unwrap();
        assert_eq!(handle.lock().await.definition.source.image.as_deref(), Some("demo:v2"));
        // update_image preserves running state across the swap.
        assert_eq!(manager.status("demo").await.unwrap(), AppStatus::Running);

        manager.revert("demo").await.unwrap();
        let handle = manager.app_handle("demo").unwrap();
        assert_eq!(handle.lock().await.definition.source.image.as_deref(), Some("demo:latest"));
    }

    #[tokio::test]
    async fn revert_without_prior_update_is_not_found() {
        let manager = unlocked_leader_manager();
        manager.install(def("demo")).await.unwrap();
        assert!(matches!(manager.revert("demo").await, Err(PiccoloError::NotFound(_))));
    }

    #[tokio::test]
    async fn uninstall_with_purge_removes_data_directory() {
        let dir = tempdir().unwrap();
        let manager = manager_at(dir.path(), Arc::new(InMemoryContainerRuntime::new()));
        manager.install(def("demo")).await.unwrap();

        let data_dir = dir.path().join("apps").join("demo").join("data");
        std::fs::create_dir_all(&data_dir).unwrap();
        manager.uninstall("demo", true).await.unwrap();
        assert!(!data_dir.exists());
    }
}
