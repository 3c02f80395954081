//! Content protection: DEK handling and payload decryption.
//!
//! The decryption key encrypted key (DEK) travels with the deployment,
//! wrapped under a device key. The unwrapped DEK lives only in a
//! zero-on-drop container and is never cloned or serialized.

use std::fs;
use std::path::Path;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use zeroize::Zeroizing;

use crate::error::AgentError;
use crate::types::ContentProtection;

/// Nonce length for AES-GCM.
const NONCE_SIZE: usize = 12;

/// Length of the raw device key file.
const DEVICE_KEY_SIZE: usize = 32;

/// Load the provisioned device key used to unwrap deployment DEKs.
///
/// The file holds exactly 32 raw bytes. Both the file copy and the
/// returned key are zeroed on drop.
pub fn load_device_key(path: &Path) -> Result<Zeroizing<[u8; DEVICE_KEY_SIZE]>, AgentError> {
    let bytes = Zeroizing::new(fs::read(path).map_err(|e| {
        AgentError::Config(format!("failed to read device key {}: {e}", path.display()))
    })?);
    if bytes.len() != DEVICE_KEY_SIZE {
        return Err(AgentError::Config(format!(
            "device key {} holds {} bytes, expected {DEVICE_KEY_SIZE}",
            path.display(),
            bytes.len()
        )));
    }
    let mut key = Zeroizing::new([0u8; DEVICE_KEY_SIZE]);
    key.copy_from_slice(&bytes);
    Ok(key)
}

/// Unwrapped content key. Zeroed on drop; deliberately neither `Clone` nor
/// `serde`-visible.
pub struct DekMaterial {
    key: Zeroizing<Vec<u8>>,
}

impl DekMaterial {
    fn new(key: Vec<u8>) -> Self {
        Self {
            key: Zeroizing::new(key),
        }
    }

    fn bytes(&self) -> &[u8] {
        &self.key
    }
}

impl std::fmt::Debug for DekMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        write!(f, "DekMaterial({} bytes)", self.key.len())
    }
}

impl ContentProtection {
    /// Unwrap the DEK under the device key.
    ///
    /// The wrapped blob is base64 of `nonce || ciphertext || tag`,
    /// AES-256-GCM under `device_key`.
    pub fn unwrap_dek(&self, device_key: &[u8; 32]) -> Result<DekMaterial, AgentError> {
        if !self.algorithm.eq_ignore_ascii_case("aes")
            || !self.mode.eq_ignore_ascii_case("gcm")
            || self.key_length != 256
        {
            return Err(AgentError::Config(format!(
                "unsupported content protection {}-{}-{}",
                self.algorithm, self.mode, self.key_length
            )));
        }
        let blob = BASE64
            .decode(&self.encrypted_dek)
            .map_err(|e| AgentError::Config(format!("encrypted DEK is not base64: {e}")))?;
        let key = open(&blob, device_key)
            .map_err(|e| AgentError::Config(format!("failed to unwrap DEK: {e}")))?;
        Ok(DekMaterial::new(key))
    }
}

/// Decrypt a payload file in the sandbox.
///
/// `src` holds base-64-free raw `nonce || ciphertext || tag`; the plaintext
/// is written to `dst`.
pub fn decrypt_payload(src: &Path, dst: &Path, dek: &DekMaterial) -> Result<(), AgentError> {
    if dek.bytes().len() != 32 {
        return Err(AgentError::Config(format!(
            "DEK has {} bytes, expected 32",
            dek.bytes().len()
        )));
    }
    let blob = fs::read(src)
        .map_err(|e| AgentError::TransientIo(format!("failed to read {}: {e}", src.display())))?;
    let mut key = [0u8; 32];
    key.copy_from_slice(dek.bytes());
    let plaintext = open(&blob, &key)
        .map_err(|_| AgentError::Verification(format!("payload {} failed to decrypt", src.display())))?;
    fs::write(dst, plaintext)
        .map_err(|e| AgentError::TransientIo(format!("failed to write {}: {e}", dst.display())))
}

fn open(blob: &[u8], key: &[u8; 32]) -> anyhow::Result<Vec<u8>> {
    if blob.len() < NONCE_SIZE + 16 {
        anyhow::bail!("ciphertext too short");
    }
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| anyhow::anyhow!("failed to build cipher: {e:?}"))?;
    let nonce = Nonce::from_slice(&blob[..NONCE_SIZE]);
    cipher
        .decrypt(nonce, &blob[NONCE_SIZE..])
        .map_err(|e| anyhow::anyhow!("decryption failed: {e:?}"))
}
