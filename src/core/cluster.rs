// src/core/cluster.rs

//! The cluster registry: an in-memory map from resource id to role. The
//! leadership algorithm itself is owned by an external arbiter; this registry
//! only records and publishes the outcome of that algorithm's decisions.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;

use crate::core::events::{Event, EventBus, LeadershipRoleChangedEvent};

/// `"kernel"` or `"app:<name>"`.
pub type ResourceId = String;

pub const KERNEL_RESOURCE_ID: &str = "kernel";

pub fn app_resource_id(app_name: &str) -> ResourceId {
    format!("app:{app_name}")
}

/// Inverse of [`app_resource_id`]: `"app:demo"` -> `Some("demo")`,
/// `"kernel"` or any other shape -> `None`.
pub fn app_name_from_resource(resource_id: &str) -> Option<&str> {
    resource_id.strip_prefix("app:")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Leader,
    Follower,
}

pub struct ClusterRegistry {
    roles: DashMap<ResourceId, Role>,
    events: Arc<EventBus>,
}

impl ClusterRegistry {
    pub fn new(events: Arc<EventBus>) -> Arc<Self> {
        Arc::new(Self {
            roles: DashMap::new(),
            events,
        })
    }

    /// Returns the currently known role for `resource_id`, if any has been set.
    pub fn current(&self, resource_id: &str) -> Option<Role> {
        self.roles.get(resource_id).map(|r| *r)
    }

    pub fn is_leader(&self, resource_id: &str) -> bool {
        matches!(self.current(resource_id), Some(Role::Leader))
    }

    /// Records a new role for `resource_id`. Publishes
    /// `leadership.role_changed` only when the role actually changed, so
    /// re-announcements of an unchanged role stay silent.
    pub fn set(&self, resource_id: ResourceId, role: Role) {
        let changed = match self.roles.get(&resource_id) {
            Some(existing) => *existing != role,
            None => true,
        };
        if !changed {
            return;
        }
        info!(resource_id = %resource_id, ?role, "resource role changed");
        self.roles.insert(resource_id.clone(), role);
        self.events
            .publish(Event::LeadershipRoleChanged(LeadershipRoleChangedEvent {
                resource_id,
                role,
            }));
    }
}
