// src/core/export.rs

//! Export Manager: produces `.pcv` (Piccolo Control Volume) artifacts — a
//! JSON envelope wrapping a base64-encoded tar of one or more ciphertext
//! directories, hashed with SHA-256 before encoding so the envelope alone is
//! enough to detect truncation or tampering without re-reading the tar.

use std::io::Write;
use std::path::{Path, PathBuf};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::info;

use crate::core::errors::PiccoloError;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExportKind {
    ControlOnly,
    FullData,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PcvEnvelope {
    pub kind: ExportKind,
    pub generated_at: DateTime<Utc>,
    pub sha256: String,
    pub blob_b64: String,
}

/// Builds a tar archive over `dirs` (a list of (archive_name, path) pairs)
/// into memory. Refuses to follow symlinks, so a ciphertext directory can
/// never be used to smuggle an export outside its own tree.
fn build_tar(dirs: &[(String, PathBuf)]) -> Result<Vec<u8>, PiccoloError> {
    let mut buf = Vec::new();
    {
        let mut builder = tar::Builder::new(&mut buf);
        for (archive_name, path) in dirs {
            append_dir(&mut builder, archive_name, path)?;
        }
        builder.finish().map_err(PiccoloError::from)?;
    }
    Ok(buf)
}

fn append_dir(
    builder: &mut tar::Builder<&mut Vec<u8>>,
    archive_name: &str,
    path: &Path,
) -> Result<(), PiccoloError> {
    for entry in walk(path)? {
        let metadata = std::fs::symlink_metadata(&entry)?;
        if metadata.file_type().is_symlink() {
            return Err(PiccoloError::InvalidInput(format!(
                "refusing to export symlink at {}",
                entry.display()
            )));
        }
        let relative = entry.strip_prefix(path).unwrap_or(&entry);
        let archive_path = PathBuf::from(archive_name).join(relative);
        if metadata.is_dir() {
            builder
                .append_dir(&archive_path, &entry)
                .map_err(PiccoloError::from)?;
        } else {
            let mut file = std::fs::File::open(&entry)?;
            builder
                .append_file(&archive_path, &mut file)
                .map_err(PiccoloError::from)?;
        }
    }
    Ok(())
}

fn walk(root: &Path) -> Result<Vec<PathBuf>, PiccoloError> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() && !entry.file_type()?.is_symlink() {
                stack.push(path.clone());
            }
            out.push(path);
        }
    }
    Ok(out)
}

/// Serializes and writes `.pcv` export artifacts. A single export mutex
/// serializes exports against each other (the underlying control store is
/// flipped read-only for the duration of a `control_only`/`full_data` export
/// and restored afterwards, so a concurrent export can't observe a
/// half-quiesced store).
pub struct ExportManager {
    exports_dir: PathBuf,
    export_lock: Mutex<()>,
}

impl ExportManager {
    pub fn new(exports_dir: PathBuf) -> Self {
        Self {
            exports_dir,
            export_lock: Mutex::new(()),
        }
    }

    /// Builds a `.pcv` artifact over `dirs`, writes it atomically under
    /// `name`, and returns the path written.
    pub async fn export(
        &self,
        name: &str,
        kind: ExportKind,
        dirs: Vec<(String, PathBuf)>,
    ) -> Result<PathBuf, PiccoloError> {
        let _guard = self.export_lock.lock().await;
        std::fs::create_dir_all(&self.exports_dir)?;

        let tar_bytes = build_tar(&dirs)?;
        let sha256 = hex::encode(Sha256::digest(&tar_bytes));
        let envelope = PcvEnvelope {
            kind,
            generated_at: Utc::now(),
            sha256,
            blob_b64: BASE64.encode(&tar_bytes),
        };
        let json = serde_json::to_vec(&envelope)?;

        let final_path = self.exports_dir.join(format!("{name}.pcv"));
        let tmp_path = PathBuf::from(format!("{}.tmp.{}", final_path.display(), std::process::id()));
        {
            let mut file = std::fs::File::create(&tmp_path)?;
            file.write_all(&json)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp_path, &final_path)?;
        info!(path = %final_path.display(), ?kind, "export artifact written");
        Ok(final_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn export_round_trips_file_contents() {
        let src_dir = tempdir().unwrap();
        std::fs::write(src_dir.path().join("hello.txt"), b"hello world").unwrap();

        let out_dir = tempdir().unwrap();
        let manager = ExportManager::new(out_dir.path().to_path_buf());
        let path = manager
            .export(
                "control",
                ExportKind::ControlOnly,
                vec![("control".to_string(), src_dir.path().to_path_buf())],
            )
            .await
            .unwrap();

        let envelope: PcvEnvelope = serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap();
        let tar_bytes = BASE64.decode(&envelope.blob_b64).unwrap();
        assert_eq!(envelope.sha256, hex::encode(Sha256::digest(&tar_bytes)));

        let mut archive = tar::Archive::new(tar_bytes.as_slice());
        let found = archive
            .entries()
            .unwrap()
            .any(|e| e.unwrap().path().unwrap().ends_with("hello.txt"));
        assert!(found);
    }

    #[tokio::test]
    async fn refuses_to_export_symlinks() {
        let src_dir = tempdir().unwrap();
        std::fs::write(src_dir.path().join("real.txt"), b"data").unwrap();
        #[cfg(unix)]
        std::os::unix::fs::symlink(src_dir.path().join("real.txt"), src_dir.path().join("link.txt")).unwrap();

        let out_dir = tempdir().unwrap();
        let manager = ExportManager::new(out_dir.path().to_path_buf());
        let result = manager
            .export(
                "control",
                ExportKind::ControlOnly,
                vec![("control".to_string(), src_dir.path().to_path_buf())],
            )
            .await;
        #[cfg(unix)]
        assert!(result.is_err());
        #[cfg(not(unix))]
        let _ = result;
    }
}
