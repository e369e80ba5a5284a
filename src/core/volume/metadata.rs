// src/core/volume/metadata.rs

//! Per-volume metadata: the durable record of a volume's identity and its
//! mount passphrase, sealed under the SDEK.

use std::path::{Path, PathBuf};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::crypt::Sdek;
use crate::core::errors::PiccoloError;

const NONCE_LEN: usize = 12;

#[derive(Serialize, Deserialize, Debug, Clone)]
struct SealedPassphrase {
    nonce_b64: String,
    ciphertext_b64: String,
}

fn seal_passphrase(sdek: &Sdek, passphrase: &str) -> Result<SealedPassphrase, PiccoloError> {
    let mut nonce_bytes = [0u8; NONCE_LEN];
    getrandom::fill(&mut nonce_bytes).map_err(|e| PiccoloError::Crypto(e.to_string()))?;
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(sdek.as_bytes()));
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, passphrase.as_bytes())
        .map_err(|e| PiccoloError::Crypto(format!("passphrase sealing failed: {e}")))?;
    Ok(SealedPassphrase {
        nonce_b64: BASE64.encode(nonce_bytes),
        ciphertext_b64: BASE64.encode(ciphertext),
    })
}

fn unseal_passphrase(sdek: &Sdek, sealed: &SealedPassphrase) -> Result<String, PiccoloError> {
    let nonce_bytes = BASE64
        .decode(&sealed.nonce_b64)
        .map_err(|e| PiccoloError::VolumeMetadataCorrupted(format!("bad nonce: {e}")))?;
    let ciphertext = BASE64
        .decode(&sealed.ciphertext_b64)
        .map_err(|e| PiccoloError::VolumeMetadataCorrupted(format!("bad ciphertext: {e}")))?;
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(sdek.as_bytes()));
    let nonce = Nonce::from_slice(&nonce_bytes);
    let plaintext = cipher
        .decrypt(nonce, ciphertext.as_slice())
        .map_err(|_| PiccoloError::VolumeMetadataCorrupted("passphrase unseal failed".to_string()))?;
    String::from_utf8(plaintext)
        .map_err(|e| PiccoloError::VolumeMetadataCorrupted(format!("passphrase not valid utf8: {e}")))
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VolumeKind {
    Bootstrap,
    Control,
    App,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct VolumeMetadata {
    pub volume_id: String,
    pub kind: VolumeKind,
    pub generation: u64,
    pub created_at: DateTime<Utc>,
    sealed_passphrase: SealedPassphrase,
}

impl VolumeMetadata {
    pub fn create(
        volume_id: &str,
        kind: VolumeKind,
        sdek: &Sdek,
        passphrase: &str,
    ) -> Result<Self, PiccoloError> {
        Ok(Self {
            volume_id: volume_id.to_string(),
            kind,
            generation: 1,
            created_at: Utc::now(),
            sealed_passphrase: seal_passphrase(sdek, passphrase)?,
        })
    }

    pub fn passphrase(&self, sdek: &Sdek) -> Result<String, PiccoloError> {
        unseal_passphrase(sdek, &self.sealed_passphrase)
    }

    pub fn path_for(volumes_dir: &Path, volume_id: &str) -> PathBuf {
        volumes_dir.join(volume_id).join("metadata.json")
    }

    pub fn load(volumes_dir: &Path, volume_id: &str) -> Result<Self, PiccoloError> {
        let path = Self::path_for(volumes_dir, volume_id);
        let bytes = std::fs::read(&path)?;
        serde_json::from_slice(&bytes)
            .map_err(|e| PiccoloError::VolumeMetadataCorrupted(format!("{volume_id}: {e}")))
    }

    pub fn save(&self, volumes_dir: &Path) -> Result<(), PiccoloError> {
        let path = Self::path_for(volumes_dir, &self.volume_id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec_pretty(self)?;
        let tmp_path = PathBuf::from(format!("{}.tmp.{}", path.display(), std::process::id()));
        {
            use std::io::Write;
            let mut file = std::fs::File::create(&tmp_path)?;
            file.write_all(&json)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp_path, &path)?;
        Ok(())
    }
}
