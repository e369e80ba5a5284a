// src/core/errors.rs

//! Defines the primary error type for the persistence and lifecycle kernel.

use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all failures the kernel can surface to its
/// collaborators (the admin API, CLI, remote-access manager).
#[derive(Error, Debug)]
pub enum PiccoloError {
    #[error("device is locked")]
    Locked,

    #[error("keyset has not been initialized")]
    NotInitialized,

    #[error("this node is not the kernel leader")]
    NotLeader,

    #[error("volume metadata is corrupted: {0}")]
    VolumeMetadataCorrupted(String),

    #[error("volume is unavailable: {0}")]
    VolumeUnavailable(String),

    #[error("port {0} is already in use")]
    PortInUse(u16),

    #[error("container not found: {0}")]
    ContainerNotFound(String),

    #[error("'{0}' already exists")]
    AlreadyExists(String),

    #[error("'{0}' not found")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("JSON error: {0}")]
    Json(Arc<serde_json::Error>),

    #[error("sqlite error: {0}")]
    Sqlite(Arc<rusqlite::Error>),

    #[error("cryptography error: {0}")]
    Crypto(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Clone for PiccoloError {
    fn clone(&self) -> Self {
        match self {
            PiccoloError::Locked => PiccoloError::Locked,
            PiccoloError::NotInitialized => PiccoloError::NotInitialized,
            PiccoloError::NotLeader => PiccoloError::NotLeader,
            PiccoloError::VolumeMetadataCorrupted(s) => {
                PiccoloError::VolumeMetadataCorrupted(s.clone())
            }
            PiccoloError::VolumeUnavailable(s) => PiccoloError::VolumeUnavailable(s.clone()),
            PiccoloError::PortInUse(p) => PiccoloError::PortInUse(*p),
            PiccoloError::ContainerNotFound(s) => PiccoloError::ContainerNotFound(s.clone()),
            PiccoloError::AlreadyExists(s) => PiccoloError::AlreadyExists(s.clone()),
            PiccoloError::NotFound(s) => PiccoloError::NotFound(s.clone()),
            PiccoloError::InvalidInput(s) => PiccoloError::InvalidInput(s.clone()),
            PiccoloError::Transient(s) => PiccoloError::Transient(s.clone()),
            PiccoloError::Io(e) => PiccoloError::Io(Arc::clone(e)),
            PiccoloError::Json(e) => PiccoloError::Json(Arc::clone(e)),
            PiccoloError::Sqlite(e) => PiccoloError::Sqlite(Arc::clone(e)),
            PiccoloError::Crypto(s) => PiccoloError::Crypto(s.clone()),
            PiccoloError::Internal(s) => PiccoloError::Internal(s.clone()),
        }
    }
}

impl PartialEq for PiccoloError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (PiccoloError::VolumeMetadataCorrupted(a), PiccoloError::VolumeMetadataCorrupted(b)) => a == b,
            (PiccoloError::VolumeUnavailable(a), PiccoloError::VolumeUnavailable(b)) => a == b,
            (PiccoloError::PortInUse(a), PiccoloError::PortInUse(b)) => a == b,
            (PiccoloError::ContainerNotFound(a), PiccoloError::ContainerNotFound(b)) => a == b,
            (PiccoloError::AlreadyExists(a), PiccoloError::AlreadyExists(b)) => a == b,
            (PiccoloError::NotFound(a), PiccoloError::NotFound(b)) => a == b,
            (PiccoloError::InvalidInput(a), PiccoloError::InvalidInput(b)) => a == b,
            (PiccoloError::Transient(a), PiccoloError::Transient(b)) => a == b,
            (PiccoloError::Io(a), PiccoloError::Io(b)) => a.to_string() == b.to_string(),
            (PiccoloError::Json(a), PiccoloError::Json(b)) => a.to_string() == b.to_string(),
            (PiccoloError::Sqlite(a), PiccoloError::Sqlite(b)) => a.to_string() == b.to_string(),
            (PiccoloError::Crypto(a), PiccoloError::Crypto(b)) => a == b,
            (PiccoloError::Internal(a), PiccoloError::Internal(b)) => a == b,
            _ => core::mem::discriminant(self) == core::mem::discriminant(other),
        }
    }
}

impl From<std::io::Error> for PiccoloError {
    fn from(e: std::io::Error) -> Self {
        PiccoloError::Io(Arc::new(e))
    }
}

impl From<serde_json::Error> for PiccoloError {
    fn from(e: serde_json::Error) -> Self {
        PiccoloError::Json(Arc::new(e))
    }
}

impl From<rusqlite::Error> for PiccoloError {
    fn from(e: rusqlite::Error) -> Self {
        PiccoloError::Sqlite(Arc::new(e))
    }
}

pub type PiccoloResult<T> = Result<T, PiccoloError>;
