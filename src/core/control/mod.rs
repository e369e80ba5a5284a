// src/core/control/mod.rs

//! Control Store: the kernel's single embedded SQLite database for
//! `meta`/`auth_state`/`remote_config`/`apps`, gated by lock state and
//! kernel leadership.

pub mod guard;
pub mod health;
pub mod repositories;
pub mod store;

pub use guard::ControlGuard;
pub use repositories::{AppRecord, AppStateRepository, AuthRepository, AuthState, RemoteConfig, RemoteConfigRepository};
pub use store::{CommitRecord, ControlStore};
