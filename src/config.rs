// src/config.rs

//! Loads and validates the kernel's configuration: where on-disk state lives,
//! which external binaries supervise volume mounts, and the cadence of the
//! kernel's background tasks.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// A raw representation of the config file before defaults and env overrides
/// are resolved and the result is validated.
#[derive(Deserialize, Debug, Clone)]
struct RawConfig {
    #[serde(default = "default_state_dir")]
    state_dir: String,
    #[serde(default)]
    allow_unmounted_tests: bool,
    #[serde(default = "default_gocryptfs_path")]
    gocryptfs_path: String,
    #[serde(default = "default_fusermount_path")]
    fusermount_path: String,
    #[serde(default = "default_log_level")]
    log_level: String,
    #[serde(default)]
    control_store: ControlStoreConfig,
    #[serde(default)]
    mount: MountConfig,
    #[serde(default)]
    apps: AppsConfig,
}

impl Default for RawConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            allow_unmounted_tests: false,
            gocryptfs_path: default_gocryptfs_path(),
            fusermount_path: default_fusermount_path(),
            log_level: default_log_level(),
            control_store: ControlStoreConfig::default(),
            mount: MountConfig::default(),
            apps: AppsConfig::default(),
        }
    }
}

fn default_state_dir() -> String {
    "/var/lib/piccolo".to_string()
}
fn default_gocryptfs_path() -> String {
    "gocryptfs".to_string()
}
fn default_fusermount_path() -> String {
    "fusermount3".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

/// Control store health-check and follower-poll cadence.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ControlStoreConfig {
    #[serde(default = "default_quick_check_secs", with = "humantime_serde::option", rename = "quick_check_interval")]
    pub quick_check_interval_raw: Option<Duration>,
    #[serde(default = "default_follower_poll_secs", with = "humantime_serde::option", rename = "follower_poll_interval")]
    pub follower_poll_interval_raw: Option<Duration>,
}

fn default_quick_check_secs() -> Option<Duration> {
    Some(Duration::from_secs(300))
}
fn default_follower_poll_secs() -> Option<Duration> {
    Some(Duration::from_secs(5))
}

impl Default for ControlStoreConfig {
    fn default() -> Self {
        Self {
            quick_check_interval_raw: default_quick_check_secs(),
            follower_poll_interval_raw: default_follower_poll_secs(),
        }
    }
}

impl ControlStoreConfig {
    pub fn quick_check_interval(&self) -> Duration {
        self.quick_check_interval_raw.unwrap_or(Duration::from_secs(300))
    }
    pub fn follower_poll_interval(&self) -> Duration {
        self.follower_poll_interval_raw.unwrap_or(Duration::from_secs(5))
    }
}

/// Mount-process supervision timing.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MountConfig {
    #[serde(default = "default_mount_ready_secs", with = "humantime_serde::option", rename = "ready_deadline")]
    pub ready_deadline_raw: Option<Duration>,
    #[serde(default = "default_term_grace_secs", with = "humantime_serde::option", rename = "term_grace")]
    pub term_grace_raw: Option<Duration>,
}

fn default_mount_ready_secs() -> Option<Duration> {
    Some(Duration::from_secs(5))
}
fn default_term_grace_secs() -> Option<Duration> {
    Some(Duration::from_secs(2))
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            ready_deadline_raw: default_mount_ready_secs(),
            term_grace_raw: default_term_grace_secs(),
        }
    }
}

impl MountConfig {
    pub fn ready_deadline(&self) -> Duration {
        self.ready_deadline_raw.unwrap_or(Duration::from_secs(5))
    }
    pub fn term_grace(&self) -> Duration {
        self.term_grace_raw.unwrap_or(Duration::from_secs(2))
    }
}

/// App lifecycle policy knobs: reserved names and install retry count.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AppsConfig {
    #[serde(default = "default_reserved_app_names")]
    pub reserved_names: Vec<String>,
    #[serde(default = "default_install_retries")]
    pub install_retries: u32,
}

fn default_reserved_app_names() -> Vec<String> {
    ["api", "www", "admin", "root", "system", "piccolo"]
        .into_iter()
        .map(str::to_string)
        .collect()
}
fn default_install_retries() -> u32 {
    5
}

impl Default for AppsConfig {
    fn default() -> Self {
        Self {
            reserved_names: default_reserved_app_names(),
            install_retries: default_install_retries(),
        }
    }
}

/// The final, validated configuration used to wire up the kernel.
#[derive(Debug, Clone)]
pub struct Config {
    pub state_dir: PathBuf,
    pub allow_unmounted_tests: bool,
    pub gocryptfs_path: PathBuf,
    pub fusermount_path: PathBuf,
    pub log_level: String,
    pub control_store: ControlStoreConfig,
    pub mount: MountConfig,
    pub apps: AppsConfig,
}

impl Config {
    /// Loads configuration from a TOML file, applying `PICCOLO_*` environment
    /// overrides on top, then validating the result.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file at '{path}'"))?;
        let raw: RawConfig = toml::from_str(&contents)
            .with_context(|| format!("failed to parse TOML from '{path}'"))?;
        Self::from_raw(raw)
    }

    /// Loads configuration purely from environment variables and built-in
    /// defaults, for the common case where no config file is deployed.
    pub fn from_env() -> Result<Self> {
        Self::from_raw(RawConfig::default())
    }

    fn from_raw(mut raw: RawConfig) -> Result<Self> {
        if let Ok(v) = std::env::var("PICCOLO_STATE_DIR") {
            raw.state_dir = v;
        }
        if let Ok(v) = std::env::var("PICCOLO_ALLOW_UNMOUNTED_TESTS") {
            raw.allow_unmounted_tests = matches!(v.as_str(), "1" | "true" | "yes");
        }
        if let Ok(v) = std::env::var("PICCOLO_GOCRYPTFS_PATH") {
            raw.gocryptfs_path = v;
        }
        if let Ok(v) = std::env::var("PICCOLO_FUSERMOUNT_PATH") {
            raw.fusermount_path = v;
        }
        if let Ok(v) = std::env::var("RUST_LOG") {
            raw.log_level = v;
        }

        let config = Config {
            state_dir: PathBuf::from(raw.state_dir),
            allow_unmounted_tests: raw.allow_unmounted_tests,
            gocryptfs_path: PathBuf::from(raw.gocryptfs_path),
            fusermount_path: PathBuf::from(raw.fusermount_path),
            log_level: raw.log_level,
            control_store: raw.control_store,
            mount: raw.mount,
            apps: raw.apps,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.state_dir.as_os_str().is_empty() {
            return Err(anyhow!("state_dir cannot be empty"));
        }
        if self.control_store.quick_check_interval().is_zero() {
            return Err(anyhow!("control_store.quick_check_interval cannot be 0"));
        }
        if self.control_store.follower_poll_interval().is_zero() {
            return Err(anyhow!("control_store.follower_poll_interval cannot be 0"));
        }
        if self.mount.ready_deadline().is_zero() {
            return Err(anyhow!("mount.ready_deadline cannot be 0"));
        }
        if self.apps.install_retries == 0 {
            return Err(anyhow!("apps.install_retries cannot be 0"));
        }
        for name in &self.apps.reserved_names {
            if name.trim().is_empty() {
                return Err(anyhow!("apps.reserved_names entries cannot be empty"));
            }
        }
        Ok(())
    }

    pub fn keyset_path(&self) -> PathBuf {
        self.state_dir.join("keyset.json")
    }

    pub fn volumes_dir(&self) -> PathBuf {
        self.state_dir.join("volumes")
    }

    pub fn control_store_path(&self) -> PathBuf {
        self.state_dir.join("control").join("control.sqlite3")
    }

    pub fn exports_dir(&self) -> PathBuf {
        self.state_dir.join("exports")
    }

    pub fn apps_dir(&self) -> PathBuf {
        self.state_dir.join("apps")
    }

    pub fn enabled_dir(&self) -> PathBuf {
        self.state_dir.join("enabled")
    }
}
