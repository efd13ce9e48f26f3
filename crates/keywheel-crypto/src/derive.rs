//! Stage-key derivation using HKDF
//!
//! The group ratchet emits stage-key material as a PKCS#8 PEM Ed25519
//! private key (the `stage-key` file on disk). The operational 256-bit
//! encryption key is derived from that key's raw seed with HKDF-SHA256 and
//! a fixed salt and info string, so the derived key never has to be
//! persisted anywhere.

use std::path::Path;

use ed25519_dalek::{SigningKey, pkcs8::DecodePrivateKey};
use hkdf::Hkdf;
use sha2::Sha256;
use thiserror::Error;
use zeroize::Zeroizing;

/// Length of the derived stage key in bytes (AES-256 class).
pub const STAGE_KEY_LEN: usize = 32;

/// Fixed HKDF salt for stage-key derivation.
const STAGE_KEY_SALT: &[u8] = b"keywheel/stage-key/v1";

/// Fixed HKDF info string, binding the derived key to its purpose.
const STAGE_KEY_INFO: &[u8] = b"aes-256-key from ed25519";

/// Errors produced while deriving a stage key.
#[derive(Error, Debug)]
pub enum StageKeyError {
    /// The stage-key file could not be read
    #[error("failed to read stage-key file: {0}")]
    Io(#[from] std::io::Error),

    /// The file contents are not a valid PKCS#8 PEM Ed25519 key
    #[error("invalid PKCS#8 PEM identity key: {0}")]
    Pem(String),
}

/// Derive a 32-byte stage key from PEM-encoded stage-key material.
///
/// Parses a PKCS#8 PEM Ed25519 private key and runs HKDF-SHA256 over its
/// 32-byte seed with the fixed salt and info string.
///
/// # Errors
///
/// Returns `StageKeyError::Pem` if the input is not a valid PKCS#8 PEM
/// Ed25519 private key.
pub fn stage_key_from_pem(pem: &str) -> Result<[u8; STAGE_KEY_LEN], StageKeyError> {
    let signing_key =
        SigningKey::from_pkcs8_pem(pem).map_err(|e| StageKeyError::Pem(e.to_string()))?;
    let seed = Zeroizing::new(signing_key.to_bytes());

    let hkdf = Hkdf::<Sha256>::new(Some(STAGE_KEY_SALT), seed.as_ref());

    let mut key = [0u8; STAGE_KEY_LEN];
    let Ok(()) = hkdf.expand(STAGE_KEY_INFO, &mut key) else {
        unreachable!("32 bytes is a valid HKDF-SHA256 output length");
    };

    Ok(key)
}

/// Derive a stage key from a PEM file on disk.
///
/// # Errors
///
/// Returns `StageKeyError::Io` if the file cannot be read, or
/// `StageKeyError::Pem` if its contents do not parse.
pub fn stage_key_from_pem_file(path: &Path) -> Result<[u8; STAGE_KEY_LEN], StageKeyError> {
    let pem = Zeroizing::new(std::fs::read_to_string(path)?);
    stage_key_from_pem(&pem)
}

#[cfg(test)]
mod tests {
    use ed25519_dalek::pkcs8::{EncodePrivateKey, spki::der::pem::LineEnding};
    use rand::rngs::OsRng;

    use super::*;

    fn random_pem() -> String {
        let key = SigningKey::generate(&mut OsRng);
        key.to_pkcs8_pem(LineEnding::LF).unwrap().to_string()
    }

    #[test]
    fn derive_is_deterministic() {
        let pem = random_pem();

        let key1 = stage_key_from_pem(&pem).unwrap();
        let key2 = stage_key_from_pem(&pem).unwrap();

        assert_eq!(key1, key2, "same material must derive the same key");
    }

    #[test]
    fn different_material_produces_different_keys() {
        let key_a = stage_key_from_pem(&random_pem()).unwrap();
        let key_b = stage_key_from_pem(&random_pem()).unwrap();

        assert_ne!(key_a, key_b);
    }

    #[test]
    fn garbage_input_is_a_pem_error() {
        let err = stage_key_from_pem("not a pem document").unwrap_err();
        assert!(matches!(err, StageKeyError::Pem(_)));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = stage_key_from_pem_file(Path::new("/nonexistent/stage-key")).unwrap_err();
        assert!(matches!(err, StageKeyError::Io(_)));
    }

    #[test]
    fn file_and_string_derivations_agree() {
        let pem = random_pem();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stage-key");
        std::fs::write(&path, &pem).unwrap();

        let from_file = stage_key_from_pem_file(&path).unwrap();
        let from_string = stage_key_from_pem(&pem).unwrap();

        assert_eq!(from_file, from_string);
    }
}
