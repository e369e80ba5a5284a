// src/core/crypt/keyset.rs

//! The on-disk keyset descriptor and the `CryptKeyset` that seals/unseals the
//! Secret Data Encryption Key (SDEK) under a password and, optionally, a
//! recovery mnemonic.
//!
//! Sealing uses Argon2id to derive a key-encryption key from the passphrase
//! material, then AES-256-GCM to wrap the SDEK. The descriptor is written
//! with the same temp-file-then-rename pattern used throughout the kernel for
//! durable state: write to `<path>.tmp.<rand>`, fsync, then `rename` onto the
//! final path so a crash mid-write never leaves a half-written descriptor.

use std::path::{Path, PathBuf};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use argon2::Argon2;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::core::crypt::recovery::RecoveryMnemonic;
use crate::core::crypt::sdek::{Kek, SDEK_LEN, Sdek};
use crate::core::errors::PiccoloError;

const NONCE_LEN: usize = 12;
const SALT_LEN: usize = 16;

/// Argon2id tuning. Chosen for a headless appliance unlocking once per boot:
/// expensive enough to slow offline guessing, cheap enough not to stall boot.
const ARGON2_M_COST_KIB: u32 = 19 * 1024;
const ARGON2_T_COST: u32 = 2;
const ARGON2_P_COST: u32 = 1;

#[derive(Serialize, Deserialize, Debug, Clone)]
struct Argon2Params {
    m_cost_kib: u32,
    t_cost: u32,
    p_cost: u32,
}

impl Default for Argon2Params {
    fn default() -> Self {
        Self {
            m_cost_kib: ARGON2_M_COST_KIB,
            t_cost: ARGON2_T_COST,
            p_cost: ARGON2_P_COST,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
struct SealedSlot {
    salt_b64: String,
    nonce_b64: String,
    ciphertext_b64: String,
    params: Argon2Params,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
struct KeysetDescriptor {
    version: u32,
    password_slot: SealedSlot,
    recovery_slot: Option<SealedSlot>,
}

fn derive_kek(material: &[u8], salt: &[u8], params: &Argon2Params) -> Result<Kek, PiccoloError> {
    let argon2_params = argon2::Params::new(params.m_cost_kib, params.t_cost, params.p_cost, Some(32))
        .map_err(|e| PiccoloError::Crypto(format!("invalid argon2 params: {e}")))?;
    let argon2 = Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, argon2_params);
    let mut out = [0u8; 32];
    argon2
        .hash_password_into(material, salt, &mut out)
        .map_err(|e| PiccoloError::Crypto(format!("argon2id derivation failed: {e}")))?;
    Ok(Kek::from_bytes(out))
}

fn seal(sdek: &Sdek, material: &[u8]) -> Result<SealedSlot, PiccoloError> {
    let mut salt = [0u8; SALT_LEN];
    getrandom::fill(&mut salt).map_err(|e| PiccoloError::Crypto(e.to_string()))?;
    let params = Argon2Params::default();
    let kek = derive_kek(material, &salt, &params)?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    getrandom::fill(&mut nonce_bytes).map_err(|e| PiccoloError::Crypto(e.to_string()))?;

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(kek.as_bytes()));
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, sdek.as_bytes().as_slice())
        .map_err(|e| PiccoloError::Crypto(format!("SDEK sealing failed: {e}")))?;

    Ok(SealedSlot {
        salt_b64: BASE64.encode(salt),
        nonce_b64: BASE64.encode(nonce_bytes),
        ciphertext_b64: BASE64.encode(ciphertext),
        params,
    })
}

fn unseal(slot: &SealedSlot, material: &[u8]) -> Result<Sdek, PiccoloError> {
    let salt = BASE64
        .decode(&slot.salt_b64)
        .map_err(|e| PiccoloError::VolumeMetadataCorrupted(format!("bad salt encoding: {e}")))?;
    let nonce_bytes = BASE64
        .decode(&slot.nonce_b64)
        .map_err(|e| PiccoloError::VolumeMetadataCorrupted(format!("bad nonce encoding: {e}")))?;
    let ciphertext = BASE64
        .decode(&slot.ciphertext_b64)
        .map_err(|e| PiccoloError::VolumeMetadataCorrupted(format!("bad ciphertext encoding: {e}")))?;

    let kek = derive_kek(material, &salt, &slot.params)?;
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(kek.as_bytes()));
    let nonce = Nonce::from_slice(&nonce_bytes);
    let plaintext = cipher
        .decrypt(nonce, ciphertext.as_slice())
        .map_err(|_| PiccoloError::InvalidInput("incorrect passphrase".to_string()))?;

    let bytes: [u8; SDEK_LEN] = plaintext
        .try_into()
        .map_err(|_| PiccoloError::VolumeMetadataCorrupted("unsealed SDEK has wrong length".to_string()))?;
    Ok(Sdek::from_bytes(bytes))
}

fn write_descriptor_atomically(path: &Path, descriptor: &KeysetDescriptor) -> Result<(), PiccoloError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_vec_pretty(descriptor)?;
    let tmp_path = PathBuf::from(format!("{}.tmp.{}", path.display(), std::process::id()));
    {
        use std::io::Write;
        let mut file = std::fs::File::create(&tmp_path)?;
        file.write_all(&json)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

fn read_descriptor(path: &Path) -> Result<KeysetDescriptor, PiccoloError> {
    let bytes = std::fs::read(path)?;
    serde_json::from_slice(&bytes)
        .map_err(|e| PiccoloError::VolumeMetadataCorrupted(format!("keyset descriptor corrupt: {e}")))
}

/// Seals and unseals the SDEK. Holds the unsealed key in memory only while
/// unlocked; `lock()` drops and zeroizes it.
pub struct CryptKeyset {
    path: PathBuf,
    unlocked: RwLock<Option<Sdek>>,
}

impl CryptKeyset {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            unlocked: RwLock::new(None),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.path.exists()
    }

    pub fn is_unlocked(&self) -> bool {
        self.unlocked.read().is_some()
    }

    /// Generates a fresh SDEK, seals it under `password`, and persists the
    /// descriptor. Leaves the keyset unlocked with the new SDEK in memory.
    pub fn setup(&self, password: &str) -> Result<(), PiccoloError> {
        if self.is_initialized() {
            return Err(PiccoloError::AlreadyExists("keyset".to_string()));
        }
        let sdek = Sdek::generate().map_err(|e| PiccoloError::Crypto(e.to_string()))?;
        let password_slot = seal(&sdek, password.as_bytes())?;
        let descriptor = KeysetDescriptor {
            version: 1,
            password_slot,
            recovery_slot: None,
        };
        write_descriptor_atomically(&self.path, &descriptor)?;
        *self.unlocked.write() = Some(sdek);
        info!("keyset initialized");
        Ok(())
    }

    pub fn unlock(&self, password: &str) -> Result<(), PiccoloError> {
        if !self.is_initialized() {
            return Err(PiccoloError::NotInitialized);
        }
        let descriptor = read_descriptor(&self.path)?;
        let sdek = unseal(&descriptor.password_slot, password.as_bytes())?;
        *self.unlocked.write() = Some(sdek);
        info!("keyset unlocked via password");
        Ok(())
    }

    pub fn unlock_with_recovery_key(&self, phrase: &str) -> Result<(), PiccoloError> {
        if !self.is_initialized() {
            return Err(PiccoloError::NotInitialized);
        }
        let descriptor = read_descriptor(&self.path)?;
        let recovery_slot = descriptor
            .recovery_slot
            .as_ref()
            .ok_or_else(|| PiccoloError::NotFound("recovery key".to_string()))?;
        let mnemonic = RecoveryMnemonic::parse(phrase)?;
        let sdek = unseal(recovery_slot, &mnemonic.canonical_bytes())?;
        *self.unlocked.write() = Some(sdek);
        info!("keyset unlocked via recovery key");
        Ok(())
    }

    pub fn lock(&self) {
        if self.unlocked.write().take().is_some() {
            info!("keyset locked");
        }
    }

    /// Runs `f` with a reference to the unlocked SDEK, or returns
    /// `PiccoloError::Locked` if the keyset is currently locked.
    pub fn with_sdek<T>(&self, f: impl FnOnce(&Sdek) -> T) -> Result<T, PiccoloError> {
        let guard = self.unlocked.read();
        match guard.as_ref() {
            Some(sdek) => Ok(f(sdek)),
            None => Err(PiccoloError::Locked),
        }
    }

    /// Re-seals the SDEK under a new password, verifying `old_password`
    /// first. Works regardless of current lock state.
    pub fn rewrap(&self, old_password: &str, new_password: &str) -> Result<(), PiccoloError> {
        let descriptor = read_descriptor(&self.path)?;
        let sdek = unseal(&descriptor.password_slot, old_password.as_bytes())?;
        self.rewrap_with(sdek, new_password)
    }

    /// Re-seals the SDEK under a new password using the already-unlocked key,
    /// without requiring the old password.
    pub fn rewrap_unlocked(&self, new_password: &str) -> Result<(), PiccoloError> {
        let sdek = self
            .unlocked
            .read()
            .as_ref()
            .map(|s| s.clone_key())
            .ok_or(PiccoloError::Locked)?;
        self.rewrap_with(sdek, new_password)
    }

    fn rewrap_with(&self, sdek: Sdek, new_password: &str) -> Result<(), PiccoloError> {
        let mut descriptor = read_descriptor(&self.path)?;
        descriptor.password_slot = seal(&sdek, new_password.as_bytes())?;
        write_descriptor_atomically(&self.path, &descriptor)?;
        *self.unlocked.write() = Some(sdek);
        info!("password rewrapped");
        Ok(())
    }

    /// Generates a fresh recovery mnemonic, seals the current SDEK under it,
    /// and returns the phrase to be shown to the user exactly once. Requires
    /// the keyset to already be unlocked.
    pub fn generate_recovery_key(&self) -> Result<String, PiccoloError> {
        let sdek = self
            .unlocked
            .read()
            .as_ref()
            .map(|s| s.clone_key())
            .ok_or(PiccoloError::Locked)?;
        let mnemonic = RecoveryMnemonic::generate()?;
        let recovery_slot = seal(&sdek, &mnemonic.canonical_bytes())?;

        let mut descriptor = read_descriptor(&self.path)?;
        descriptor.recovery_slot = Some(recovery_slot);
        write_descriptor_atomically(&self.path, &descriptor)?;
        warn!("a new recovery key was generated; the previous one, if any, is now invalid");
        Ok(mnemonic.phrase())
    }
}
