// src/core/control/guard.rs

//! The guard layer every control-store write passes through: the device
//! must be unlocked and this node must hold the `kernel` leadership role.
//! Reads are always allowed, so a follower can still serve queries while
//! refusing writes.

use std::sync::Arc;

use tracing::warn;

use crate::core::cluster::{ClusterRegistry, KERNEL_RESOURCE_ID, Role};
use crate::core::crypt::CryptKeyset;
use crate::core::errors::PiccoloError;

pub struct ControlGuard {
    keyset: Arc<CryptKeyset>,
    cluster: Arc<ClusterRegistry>,
}

impl ControlGuard {
    pub fn new(keyset: Arc<CryptKeyset>, cluster: Arc<ClusterRegistry>) -> Self {
        Self { keyset, cluster }
    }

    /// Returns `Ok(())` if a write may proceed, otherwise the specific reason
    /// it may not (`Locked` or `NotLeader`), checked in that order since an
    /// unlocked-but-follower node should report the more actionable error.
    pub fn check_write_allowed(&self) -> Result<(), PiccoloError> {
        if !self.keyset.is_unlocked() {
            return Err(PiccoloError::Locked);
        }
        if !self.cluster.is_leader(KERNEL_RESOURCE_ID) {
            return Err(PiccoloError::NotLeader);
        }
        Ok(())
    }

    /// Called when the kernel resource transitions away from leader. Logs
    /// the demotion so the first write attempted afterwards has a paper
    /// trail explaining the rejection, mirroring a poisoned-master style
    /// guard against a demoted primary silently continuing to accept writes.
    pub fn on_demoted(&self) {
        warn!("kernel demoted from leader; control store writes will be rejected until re-promoted");
    }

    pub fn role(&self) -> Option<Role> {
        self.cluster.current(KERNEL_RESOURCE_ID)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::events::EventBus;
    use tempfile::tempdir;

    #[test]
    fn rejects_when_locked() {
        let dir = tempdir().unwrap();
        let keyset = Arc::new(CryptKeyset::new(dir.path().join("keyset.json")));
        let cluster = ClusterRegistry::new(EventBus::new());
        cluster.set(KERNEL_RESOURCE_ID.to_string(), Role::Leader);
        let guard = ControlGuard::new(keyset, cluster);
        assert!(matches!(guard.check_write_allowed(), Err(PiccoloError::Locked)));
    }

    #[test]
    fn rejects_when_follower() {
        let dir = tempdir().unwrap();
        let keyset = Arc::new(CryptKeyset::new(dir.path().join("keyset.json")));
        keyset.setup("pw").unwrap();
        let cluster = ClusterRegistry::new(EventBus::new());
        cluster.set(KERNEL_RESOURCE_ID.to_string(), Role::Follower);
        let guard = ControlGuard::new(keyset, cluster);
        assert!(matches!(guard.check_write_allowed(), Err(PiccoloError::NotLeader)));
    }

    #[test]
    fn allows_when_unlocked_leader() {
        let dir = tempdir().unwrap();
        let keyset = Arc::new(CryptKeyset::new(dir.path().join("keyset.json")));
        keyset.setup("pw").unwrap();
        let cluster = ClusterRegistry::new(EventBus::new());
        cluster.set(KERNEL_RESOURCE_ID.to_string(), Role::Leader);
        let guard = ControlGuard::new(keyset, cluster);
        assert!(guard.check_write_allowed().is_ok());
    }
}
