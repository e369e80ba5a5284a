// src/core/volume/mod.rs

//! Volume Manager: FUSE-mounted (gocryptfs-style) encrypted ciphertext
//! directories, reconciled against a durable journal.

pub mod journal;
pub mod manager;
pub mod metadata;
pub mod mount;

pub use journal::{JournalEntry, VolumeJournal, VolumeRole, VolumeState};
pub use manager::VolumeManager;
pub use metadata::{VolumeKind, VolumeMetadata};
