//! Payload hash verification.
//!
//! No downloaded file is handed to a handler before one of its declared
//! hashes matches; files that fail verification are deleted by the caller.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use sha2::{Digest, Sha256};

use crate::error::AgentError;
use crate::types::FileHash;

/// Streamed SHA-256 of a file, base64 encoded (the cloud schema's digest
/// form).
pub fn file_sha256_base64(path: &Path) -> Result<String, AgentError> {
    Ok(BASE64.encode(file_sha256(path)?))
}

/// Streamed SHA-256 of a file, lowercase hex (the source cache's key form).
pub fn file_sha256_hex(path: &Path) -> Result<String, AgentError> {
    let digest = file_sha256(path)?;
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    Ok(out)
}

fn file_sha256(path: &Path) -> Result<[u8; 32], AgentError> {
    let file = File::open(path)
        .map_err(|e| AgentError::TransientIo(format!("failed to open {}: {e}", path.display())))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf).map_err(|e| {
            AgentError::TransientIo(format!("failed to read {}: {e}", path.display()))
        })?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().into())
}

/// Whether the file matches any of its declared hashes.
///
/// A declared hash with an unsupported algorithm is skipped; a file whose
/// declarations are *all* unsupported fails verification rather than
/// passing unchecked.
pub fn is_hash_valid(path: &Path, declared: &[FileHash]) -> Result<bool, AgentError> {
    if declared.is_empty() {
        return Err(AgentError::Verification(format!(
            "{} declares no hashes",
            path.display()
        )));
    }
    let mut checked_any = false;
    for hash in declared {
        if !hash.hash_type.eq_ignore_ascii_case("sha256") {
            continue;
        }
        checked_any = true;
        if file_sha256_base64(path)? == hash.value {
            return Ok(true);
        }
    }
    if !checked_any {
        return Err(AgentError::Verification(format!(
            "{} declares only unsupported hash algorithms",
            path.display()
        )));
    }
    Ok(false)
}
