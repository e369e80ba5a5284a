// src/core/control/repositories.rs

//! Typed repositories over the Control Store's three data tables, so callers
//! work in terms of `AuthState`/`RemoteConfig`/`AppRecord` rather than raw
//! JSON payloads.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::control::guard::ControlGuard;
use crate::core::control::store::{CommitRecord, ControlStore};
use crate::core::errors::PiccoloError;

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct AuthState {
    pub password_set: bool,
    pub recovery_key_set: bool,
}

pub struct AuthRepository {
    store: Arc<ControlStore>,
    guard: Arc<ControlGuard>,
}

impl AuthRepository {
    pub fn new(store: Arc<ControlStore>, guard: Arc<ControlGuard>) -> Self {
        Self { store, guard }
    }

    pub fn get(&self) -> Result<AuthState, PiccoloError> {
        match self.store.latest("auth_state", "singleton")? {
            Some(record) => Ok(serde_json::from_value(record.payload)?),
            None => Ok(AuthState::default()),
        }
    }

    pub fn put(&self, state: &AuthState) -> Result<CommitRecord, PiccoloError> {
        self.guard.check_write_allowed()?;
        self.store
            .commit("auth_state", "singleton", &serde_json::to_value(state)?)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct RemoteConfig {
    pub fields: serde_json::Map<String, serde_json::Value>,
}

pub struct RemoteConfigRepository {
    store: Arc<ControlStore>,
    guard: Arc<ControlGuard>,
}

impl RemoteConfigRepository {
    pub fn new(store: Arc<ControlStore>, guard: Arc<ControlGuard>) -> Self {
        Self { store, guard }
    }

    pub fn get(&self) -> Result<RemoteConfig, PiccoloError> {
        match self.store.latest("remote_config", "singleton")? {
            Some(record) => Ok(serde_json::from_value(record.payload)?),
            None => Ok(RemoteConfig::default()),
        }
    }

    pub fn put(&self, config: &RemoteConfig) -> Result<CommitRecord, PiccoloError> {
        self.guard.check_write_allowed()?;
        self.store
            .commit("remote_config", "singleton", &serde_json::to_value(config)?)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AppRecord {
    pub name: String,
    pub definition: serde_json::Value,
}

pub struct AppStateRepository {
    store: Arc<ControlStore>,
    guard: Arc<ControlGuard>,
}

impl AppStateRepository {
    pub fn new(store: Arc<ControlStore>, guard: Arc<ControlGuard>) -> Self {
        Self { store, guard }
    }

    pub fn get(&self, name: &str) -> Result<Option<AppRecord>, PiccoloError> {
        match self.store.latest("apps", name)? {
            Some(record) => Ok(Some(serde_json::from_value(record.payload)?)),
            None => Ok(None),
        }
    }

    pub fn put(&self, record: &AppRecord) -> Result<CommitRecord, PiccoloError> {
        self.guard.check_write_allowed()?;
        self.store
            .commit("apps", &record.name, &serde_json::to_value(record)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cluster::{ClusterRegistry, KERNEL_RESOURCE_ID, Role};
    use crate::core::crypt::CryptKeyset;
    use crate::core::events::EventBus;
    use tempfile::tempdir;

    fn unlocked_leader_guard(dir: &std::path::Path) -> Arc<ControlGuard> {
        let keyset = Arc::new(CryptKeyset::new(dir.join("keyset.json")));
        keyset.setup("pw").unwrap();
        let cluster = ClusterRegistry::new(EventBus::new());
        cluster.set(KERNEL_RESOURCE_ID.to_string(), Role::Leader);
        Arc::new(ControlGuard::new(keyset, cluster))
    }

    #[test]
    fn auth_repository_defaults_then_commits() {
        let dir = tempdir().unwrap();
        let store = Arc::new(ControlStore::open(dir.path().join("c.sqlite3"), false).unwrap());
        let guard = unlocked_leader_guard(dir.path());
        let repo = AuthRepository::new(store, guard);
        assert!(!repo.get().unwrap().password_set);
        repo.put(&AuthState { password_set: true, recovery_key_set: false }).unwrap();
        assert!(repo.get().unwrap().password_set);
    }

    #[test]
    fn auth_repository_rejects_write_when_locked() {
        let dir = tempdir().unwrap();
        let store = Arc::new(ControlStore::open(dir.path().join("c.sqlite3"), false).unwrap());
        let keyset = Arc::new(CryptKeyset::new(dir.path().join("keyset.json")));
        let cluster = ClusterRegistry::new(EventBus::new());
        cluster.set(KERNEL_RESOURCE_ID.to_string(), Role::Leader);
        let guard = Arc::new(ControlGuard::new(keyset, cluster));
        let repo = AuthRepository::new(store, guard);
        assert!(matches!(
            repo.put(&AuthState::default()),
            Err(PiccoloError::Locked)
        ));
    }
}
