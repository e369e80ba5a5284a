// src/core/app/definition.rs

//! `AppDefinition`: the declarative description of an installed app, plus
//! the validation every install/upsert passes through.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::errors::PiccoloError;

/// `^[a-z][a-z0-9-]*[a-z0-9]$` (multi-char) or `^[a-z]$` (single char).
static NAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([a-z]|[a-z][a-z0-9-]*[a-z0-9])$").expect("static regex is valid")
});

const MAX_NAME_LEN: usize = 50;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AppType {
    User,
    System,
}

impl Default for AppType {
    fn default() -> Self {
        AppType::User
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BuildSpec {
    /// Directory the container image is built from.
    pub context: String,
    #[serde(default)]
    pub dockerfile: Option<String>,
}

/// Exactly one of `image`/`build` is populated; `AppDefinition::validate`
/// enforces the XOR.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ImageSource {
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub build: Option<BuildSpec>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Listener {
    pub name: String,
    pub guest_port: u16,
    /// `None` means "allocate any free host port".
    #[serde(default)]
    pub host_port: Option<u16>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct StorageSpec {
    /// Absolute container path backed by the app's persistent volume.
    #[serde(default)]
    pub persistent_path: Option<String>,
    /// Absolute container path backed by scratch space, discarded on uninstall.
    #[serde(default)]
    pub temporary_path: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum InternetPolicy {
    #[default]
    Allow,
    Deny,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct PermissionsSpec {
    #[serde(default)]
    pub internet: InternetPolicy,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ResourceLimits {
    #[serde(default)]
    pub memory_mb: Option<u32>,
    #[serde(default)]
    pub cpu_shares: Option<u32>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AppDefinition {
    pub name: String,
    #[serde(flatten)]
    pub source: ImageSource,
    #[serde(default)]
    pub app_type: AppType,
    #[serde(default)]
    pub listeners: Vec<Listener>,
    #[serde(default)]
    pub storage: StorageSpec,
    #[serde(default)]
    pub permissions: PermissionsSpec,
    #[serde(default)]
    pub env: Vec<(String, String)>,
    #[serde(default)]
    pub resources: ResourceLimits,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl AppDefinition {
    pub fn validate(&self, reserved_names: &[String]) -> Result<(), PiccoloError> {
        if !NAME_RE.is_match(&self.name) {
            return Err(PiccoloError::InvalidInput(format!(
                "app name '{}' must be lowercase alphanumeric, hyphen-separated, \
                 starting and ending with a letter or digit",
                self.name
            )));
        }
        if self.name.len() > MAX_NAME_LEN {
            return Err(PiccoloError::InvalidInput(format!(
                "app name '{}' exceeds the {MAX_NAME_LEN}-character limit",
                self.name
            )));
        }
        if reserved_names.iter().any(|r| r == &self.name) {
            return Err(PiccoloError::InvalidInput(format!(
                "app name '{}' is reserved",
                self.name
            )));
        }

        match (&self.source.image, &self.source.build) {
            (Some(image), None) => {
                if image.trim().is_empty() {
                    return Err(PiccoloError::InvalidInput("image cannot be empty".to_string()));
                }
            }
            (None, Some(build)) => {
                if build.context.trim().is_empty() {
                    return Err(PiccoloError::InvalidInput("build.context cannot be empty".to_string()));
                }
            }
            (Some(_), Some(_)) => {
                return Err(PiccoloError::InvalidInput(
                    "exactly one of image/build may be set, not both".to_string(),
                ));
            }
            (None, None) => {
                return Err(PiccoloError::InvalidInput(
                    "exactly one of image/build must be set".to_string(),
                ));
            }
        }

        let mut seen_names = HashSet::new();
        let mut seen_ports = HashSet::new();
        for listener in &self.listeners {
            if listener.guest_port == 0 {
                return Err(PiccoloError::InvalidInput("guest_port cannot be 0".to_string()));
            }
            if !seen_names.insert(listener.name.as_str()) {
                return Err(PiccoloError::InvalidInput(format!(
                    "listener name '{}' declared more than once",
                    listener.name
                )));
            }
            if !seen_ports.insert(listener.guest_port) {
                return Err(PiccoloError::InvalidInput(format!(
                    "guest_port {} declared more than once",
                    listener.guest_port
                )));
            }
        }

        for path in [&self.storage.persistent_path, &self.storage.temporary_path]
            .into_iter()
            .flatten()
        {
            if !path.starts_with('/') {
                return Err(PiccoloError::InvalidInput(format!(
                    "storage path '{path}' must be absolute"
                )));
            }
        }

        if self.depends_on.iter().any(|dep| dep == &self.name) {
            return Err(PiccoloError::InvalidInput(format!(
                "app '{}' cannot depend on itself",
                self.name
            )));
        }

        Ok(())
    }
}

/// Registry-aware tag replacement: preserves everything up to and including
/// the last `/` (so a `host:port/` registry prefix is left untouched), then
/// replaces whatever follows the last `:` in the final path segment.
pub fn replace_image_tag(current: &str, new_tag: &str) -> String {
    let split = current.rfind('/').map(|i| i + 1).unwrap_or(0);
    let (prefix, last_segment) = current.split_at(split);
    let base = match last_segment.rfind(':') {
        Some(idx) => &last_segment[..idx],
        None => last_segment,
    };
    format!("{prefix}{base}:{new_tag}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def(name: &str) -> AppDefinition {
        AppDefinition {
            name: name.to_string(),
            source: ImageSource { image: Some("example/image:latest".to_string()), build: None },
            app_type: AppType::User,
            listeners: vec![],
            storage: StorageSpec::default(),
            permissions: PermissionsSpec::default(),
            env: vec![],
            resources: ResourceLimits::default(),
            depends_on: vec![],
        }
    }

    #[test]
    fn accepts_valid_names() {
        for name in ["a", "app", "my-app", "app2", "a1-b2"] {
            assert!(def(name).validate(&[]).is_ok(), "{name} should be valid");
        }
    }

    #[test]
    fn rejects_invalid_names() {
        for name in ["App", "-app", "app-", "app_name", "", "1app"] {
            assert!(def(name).validate(&[]).is_err(), "{name} should be invalid");
        }
    }

    #[test]
    fn rejects_names_over_max_length() {
        let long_name = "a".repeat(51);
        assert!(def(&long_name).validate(&[]).is_err());
        let ok_name = "a".repeat(50);
        assert!(def(&ok_name).validate(&[]).is_ok());
    }

    #[test]
    fn rejects_reserved_names() {
        assert!(def("kernel").validate(&["kernel".to_string()]).is_err());
    }

    #[test]
    fn rejects_image_and_build_both_set() {
        let mut d = def("app");
        d.source.build = Some(BuildSpec { context: "/src".to_string(), dockerfile: None });
        assert!(d.validate(&[]).is_err());
    }

    #[test]
    fn rejects_neither_image_nor_build() {
        let mut d = def("app");
        d.source.image = None;
        assert!(d.validate(&[]).is_err());
    }

    #[test]
    fn accepts_build_source() {
        let mut d = def("app");
        d.source.image = None;
        d.source.build = Some(BuildSpec { context: "/src".to_string(), dockerfile: None });
        assert!(d.validate(&[]).is_ok());
    }

    #[test]
    fn rejects_duplicate_listener_names_or_ports() {
        let mut d = def("app");
        d.listeners = vec![
            Listener { name: "web".to_string(), guest_port: 80, host_port: None },
            Listener { name: "web".to_string(), guest_port: 81, host_port: None },
        ];
        assert!(d.validate(&[]).is_err());

        d.listeners = vec![
            Listener { name: "web".to_string(), guest_port: 80, host_port: None },
            Listener { name: "admin".to_string(), guest_port: 80, host_port: None },
        ];
        assert!(d.validate(&[]).is_err());
    }

    #[test]
    fn rejects_relative_storage_paths() {
        let mut d = def("app");
        d.storage.persistent_path = Some("data".to_string());
        assert!(d.validate(&[]).is_err());
    }

    #[test]
    fn rejects_self_dependency() {
        let mut d = def("app");
        d.depends_on = vec!["app".to_string()];
        assert!(d.validate(&[]).is_err());
    }

    #[test]
    fn replace_image_tag_preserves_registry_prefix() {
        assert_eq!(
            replace_image_tag("repo.example.com:5000/lib/app:1.0", "2.0"),
            "repo.example.com:5000/lib/app:2.0"
        );
    }

    #[test]
    fn replace_image_tag_without_existing_tag_appends_one() {
        assert_eq!(replace_image_tag("library/alpine", "3.19"), "library/alpine:3.19");
    }

    #[test]
    fn replace_image_tag_with_no_registry_path() {
        assert_eq!(replace_image_tag("alpine:3.18", "3.19"), "alpine:3.19");
    }
}
