// src/core/volume/mount.rs

//! Supervises a single `gocryptfs` mount process: spawns it, feeds the
//! passphrase on stdin, polls for mount readiness, and on teardown escalates
//! from SIGTERM to SIGKILL if the process doesn't exit within its grace
//! period.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::AsyncWriteExt;
use tokio::process::Child;
use tracing::{error, info, warn};

use crate::core::errors::PiccoloError;

/// A running, supervised gocryptfs mount.
pub struct MountHandle {
    child: Child,
    pub mount_point: PathBuf,
}

impl MountHandle {
    fn pid(&self) -> Option<Pid> {
        self.child.id().map(|raw| Pid::from_raw(raw as i32))
    }

    /// Sends SIGTERM, waits up to `term_grace`, and escalates to SIGKILL if
    /// the process is still alive afterwards. Also runs `fusermount -u` so
    /// the mountpoint is released even if the process refuses to exit.
    pub async fn unmount(mut self, fusermount_path: &Path, term_grace: Duration) -> Result<(), PiccoloError> {
        if let Some(pid) = self.pid() {
            if let Err(e) = signal::kill(pid, Signal::SIGTERM) {
                warn!(error = %e, "failed to send SIGTERM to mount process");
            }
        }

        let waited = tokio::time::timeout(term_grace, self.child.wait()).await;
        if waited.is_err() {
            warn!("mount process did not exit within grace period, sending SIGKILL");
            if let Some(pid) = self.pid() {
                let _ = signal::kill(pid, Signal::SIGKILL);
            }
            let _ = self.child.wait().await;
        }

        let status = tokio::process::Command::new(fusermount_path)
            .arg("-u")
            .arg(&self.mount_point)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        match status {
            Ok(s) if s.success() => {}
            Ok(s) => warn!(status = ?s, "fusermount -u returned non-zero; mountpoint may already be clear"),
            Err(e) => warn!(error = %e, "failed to invoke fusermount -u"),
        }
        info!(mount_point = %self.mount_point.display(), "volume unmounted");
        Ok(())
    }
}

/// Spawns `gocryptfs` over `(cipher_dir, mount_point)`, writes `passphrase`
/// to its stdin, then polls `/proc/mounts` until the mountpoint appears or
/// `ready_deadline` elapses.
pub async fn mount(
    gocryptfs_path: &Path,
    cipher_dir: &Path,
    mount_point: &Path,
    passphrase: &str,
    ready_deadline: Duration,
) -> Result<MountHandle, PiccoloError> {
    std::fs::create_dir_all(cipher_dir)?;
    std::fs::create_dir_all(mount_point)?;

    let mut child = tokio::process::Command::new(gocryptfs_path)
        .arg("-q")
        .arg("-extpass=")
        .arg(cipher_dir)
        .arg(mount_point)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| PiccoloError::VolumeUnavailable(format!("failed to spawn gocryptfs: {e}")))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(passphrase.as_bytes())
            .await
            .map_err(|e| PiccoloError::VolumeUnavailable(format!("failed to write passphrase: {e}")))?;
        stdin
            .write_all(b"\n")
            .await
            .map_err(|e| PiccoloError::VolumeUnavailable(format!("failed to write passphrase: {e}")))?;
    }

    let deadline = Instant::now() + ready_deadline;
    loop {
        if is_mounted(mount_point)? {
            info!(mount_point = %mount_point.display(), "volume mounted");
            return Ok(MountHandle {
                child,
                mount_point: mount_point.to_path_buf(),
            });
        }
        if let Some(status) = child.try_wait().map_err(|e| PiccoloError::Io(std::sync::Arc::new(e)))? {
            error!(?status, "gocryptfs exited before mount became ready");
            return Err(PiccoloError::VolumeUnavailable(format!(
                "gocryptfs exited early with status {status:?}"
            )));
        }
        if Instant::now() >= deadline {
            let _ = child.start_kill();
            error!(mount_point = %mount_point.display(), "mount did not become ready within deadline");
            return Err(PiccoloError::VolumeUnavailable(
                "mount readiness deadline exceeded".to_string(),
            ));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn is_mounted(mount_point: &Path) -> Result<bool, PiccoloError> {
    let mounts = std::fs::read_to_string("/proc/mounts")?;
    let target = mount_point.to_string_lossy();
    Ok(mounts.lines().any(|line| {
        line.split_whitespace()
            .nth(1)
            .is_some_and(|mp| mp == target)
    }))
}
