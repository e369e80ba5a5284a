// src/core/app/instance.rs

//! `AppInstance`: the runtime-side counterpart of an `AppDefinition` — its
//! current status, container id, allocated ports, and enable/timestamp
//! bookkeeping.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::app::definition::AppDefinition;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AppStatus {
    Installed,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl AppStatus {
    /// Whether a transition to `next` is a legal move in the status FSM.
    pub fn can_transition_to(self, next: AppStatus) -> bool {
        use AppStatus::*;
        matches!(
            (self, next),
            (Installed, Starting)
                | (Starting, Running)
                | (Starting, Failed)
                | (Running, Stopping)
                | (Running, Failed)
                | (Stopping, Stopped)
                | (Stopped, Starting)
                | (Failed, Starting)
                | (Failed, Stopped)
        )
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AppInstance {
    pub definition: AppDefinition,
    pub status: AppStatus,
    pub container_id: Option<String>,
    pub allocated_ports: Vec<(u16, u16)>,
    /// Mirrors whether `<state>/enabled/<name>` currently exists.
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AppInstance {
    pub fn new(definition: AppDefinition) -> Self {
        let now = Utc::now();
        Self {
            definition,
            status: AppStatus::Installed,
            container_id: None,
            allocated_ports: Vec::new(),
            enabled: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
