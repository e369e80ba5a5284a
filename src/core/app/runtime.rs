// src/core/app/runtime.rs

//! `ContainerRuntime`: the abstraction the App Lifecycle Manager drives
//! instead of calling a concrete container engine directly. Keeping this as
//! a trait object (rather than a concrete struct the manager downcasts)
//! avoids the "concrete cast" pattern flagged for redesign: swapping the
//! backing engine never requires touching `AppManager`.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::core::errors::PiccoloError;

#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub env: Vec<(String, String)>,
    /// `(host_port, guest_port)` pairs; the runtime publishes each as
    /// `127.0.0.1:<host_port>:<guest_port>` — loopback only, never a public bind.
    pub port_bindings: Vec<(u16, u16)>,
    /// System apps restart on exit/reboot; user apps do not.
    pub restart_always: bool,
    /// Set when the app's `permissions.internet` is `deny`: the container
    /// gets no network namespace at all.
    pub network_none: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    Running,
    Stopped,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn create(&self, spec: &ContainerSpec) -> Result<String, PiccoloError>;
    async fn start(&self, container_id: &str) -> Result<(), PiccoloError>;
    async fn stop(&self, container_id: &str) -> Result<(), PiccoloError>;
    async fn remove(&self, container_id: &str) -> Result<(), PiccoloError>;
    async fn state(&self, container_id: &str) -> Result<ContainerState, PiccoloError>;
    async fn logs(&self, container_id: &str, tail_lines: usize) -> Result<Vec<String>, PiccoloError>;
    /// The `(host_port, guest_port)` pairs the runtime currently has bound
    /// for this container, used to restore service proxies after a device
    /// unlock without asserting ports the runtime does not actually see.
    async fn published_ports(&self, container_id: &str) -> Result<Vec<(u16, u16)>, PiccoloError>;
}

struct TrackedContainer {
    spec: ContainerSpec,
    state: ContainerState,
    log_lines: Vec<String>,
}

/// An in-process runtime used where no real container engine is wired up
/// (tests, and any deployment that fronts this kernel with its own
/// orchestrator). Tracks containers purely in memory.
#[derive(Default)]
pub struct InMemoryContainerRuntime {
    containers: DashMap<String, TrackedContainer>,
    /// Host ports `create` should refuse with `PortInUse`, simulating a real
    /// engine finding the port already bound by something outside its view.
    conflicted_ports: DashMap<u16, ()>,
}

impl InMemoryContainerRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test/demo hook: makes the next `create` touching `host_port` fail with
    /// `PortInUse`, until the caller reserves the port elsewhere and retries
    /// with a different one.
    pub fn simulate_port_conflict(&self, host_port: u16) {
        self.conflicted_ports.insert(host_port, ());
    }
}

#[async_trait]
impl ContainerRuntime for InMemoryContainerRuntime {
    async fn create(&self, spec: &ContainerSpec) -> Result<String, PiccoloError> {
        for (host_port, _guest_port) in &spec.port_bindings {
            if self.conflicted_ports.contains_key(host_port) {
                return Err(PiccoloError::PortInUse(*host_port));
            }
        }
        let container_id = format!("{}-{}", spec.name, hex::encode(rand_suffix()?));
        info!(container_id, image = %spec.image, "container created");
        self.containers.insert(
            container_id.clone(),
            TrackedContainer {
                spec: spec.clone(),
                state: ContainerState::Stopped,
                log_lines: vec![format!("container {} created from {}", container_id, spec.image)],
            },
        );
        Ok(container_id)
    }

    async fn start(&self, container_id: &str) -> Result<(), PiccoloError> {
        let mut entry = self
            .containers
            .get_mut(container_id)
            .ok_or_else(|| PiccoloError::ContainerNotFound(container_id.to_string()))?;
        entry.state = ContainerState::Running;
        entry.log_lines.push("started".to_string());
        Ok(())
    }

    async fn stop(&self, container_id: &str) -> Result<(), PiccoloError> {
        let mut entry = self
            .containers
            .get_mut(container_id)
            .ok_or_else(|| PiccoloError::ContainerNotFound(container_id.to_string()))?;
        entry.state = ContainerState::Stopped;
        entry.log_lines.push("stopped".to_string());
        Ok(())
    }

    async fn remove(&self, container_id: &str) -> Result<(), PiccoloError> {
        self.containers
            .remove(container_id)
            .ok_or_else(|| PiccoloError::ContainerNotFound(container_id.to_string()))?;
        Ok(())
    }

    async fn state(&self, container_id: &str) -> Result<ContainerState, PiccoloError> {
        self.containers
            .get(container_id)
            .map(|c| c.state)
            .ok_or_else(|| PiccoloError::ContainerNotFound(container_id.to_string()))
    }

    async fn logs(&self, container_id: &str, tail_lines: usize) -> Result<Vec<String>, PiccoloError> {
        let entry = self
            .containers
            .get(container_id)
            .ok_or_else(|| PiccoloError::ContainerNotFound(container_id.to_string()))?;
        let lines = &entry.log_lines;
        let start = lines.len().saturating_sub(tail_lines);
        Ok(lines[start..].to_vec())
    }

    async fn published_ports(&self, container_id: &str) -> Result<Vec<(u16, u16)>, PiccoloError> {
        self.containers
            .get(container_id)
            .map(|c| c.spec.port_bindings.clone())
            .ok_or_else(|| PiccoloError::ContainerNotFound(container_id.to_string()))
    }
}

fn rand_suffix() -> Result<[u8; 4], PiccoloError> {
    let mut bytes = [0u8; 4];
    getrandom::fill(&mut bytes).map_err(|e| PiccoloError::Crypto(e.to_string()))?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_start_stop_remove_lifecycle() {
        let runtime = InMemoryContainerRuntime::new();
        let spec = ContainerSpec {
            name: "demo".to_string(),
            image: "demo:latest".to_string(),
            env: vec![],
            port_bindings: vec![],
            restart_always: false,
            network_none: false,
        };
        let id = runtime.create(&spec).await.unwrap();
        assert_eq!(runtime.state(&id).await.unwrap(), ContainerState::Stopped);

        runtime.start(&id).await.unwrap();
        assert_eq!(runtime.state(&id).await.unwrap(), ContainerState::Running);

        runtime.stop(&id).await.unwrap();
        assert_eq!(runtime.state(&id).await.unwrap(), ContainerState::Stopped);

        runtime.remove(&id).await.unwrap();
        assert!(matches!(runtime.state(&id).await, Err(PiccoloError::ContainerNotFound(_))));
    }

    #[tokio::test]
    async fn unknown_container_operations_error() {
        let runtime = InMemoryContainerRuntime::new();
        assert!(matches!(runtime.start("nope").await, Err(PiccoloError::ContainerNotFound(_))));
    }

    #[tokio::test]
    async fn conflicted_port_is_refused_until_cleared() {
        let runtime = InMemoryContainerRuntime::new();
        runtime.simulate_port_conflict(20000);
        let spec = ContainerSpec {
            name: "demo".to_string(),
            image: "demo:latest".to_string(),
            env: vec![],
            port_bindings: vec![(20000, 80)],
            restart_always: false,
            network_none: false,
        };
        assert!(matches!(runtime.create(&spec).await, Err(PiccoloError::PortInUse(20000))));

        let other = ContainerSpec { port_bindings: vec![(20001, 80)], ..spec };
        let id = runtime.create(&other).await.unwrap();
        assert_eq!(
            runtime.published_ports(&id).await.unwrap(),
            vec![(20001, 80)]
        );
    }
}
