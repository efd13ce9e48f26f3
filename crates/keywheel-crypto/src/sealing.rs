//! Object sealing using XChaCha20-Poly1305
//!
//! Seals a plaintext object under the current stage key, producing the raw
//! ciphertext plus a detached metadata attribute map (nonce, tag, nested
//! header) built by [`crate::metadata`]. The nested header travels as AAD,
//! so tampering with the attributes fails authentication.
//!
//! All functions are pure - random bytes must be provided by the caller.
//! This enables deterministic testing.

use chacha20poly1305::{
    Tag, XChaCha20Poly1305, XNonce,
    aead::{AeadInPlace, KeyInit},
};
use thiserror::Error;

use crate::metadata::{
    EncryptionMetadata, MetadataError, NONCE_SIZE, TAG_SIZE, decode_metadata, encode_metadata,
};

/// Errors produced while sealing or opening an object.
#[derive(Error, Debug)]
pub enum SealError {
    /// The metadata attribute map could not be decoded
    #[error(transparent)]
    Metadata(#[from] MetadataError),

    /// AEAD authentication failed (wrong key, tampered data or header)
    #[error("object authentication failed")]
    AuthenticationFailed,
}

/// Seal a plaintext object under a stage key.
///
/// Returns the raw ciphertext (same length as the plaintext; the tag is
/// detached into the metadata) and the string-keyed attribute map carrying
/// nonce, tag and nested header.
///
/// # Security
///
/// - Caller MUST provide a cryptographically random nonce in production
/// - The nested header is authenticated as AAD but not encrypted
pub fn seal_object(
    stage_key: &[u8; 32],
    plaintext: &[u8],
    nested_header: &[u8],
    nonce: [u8; NONCE_SIZE],
) -> (Vec<u8>, std::collections::BTreeMap<String, String>) {
    let cipher = XChaCha20Poly1305::new(stage_key.into());

    let mut buffer = plaintext.to_vec();
    let Ok(tag) =
        cipher.encrypt_in_place_detached(XNonce::from_slice(&nonce), nested_header, &mut buffer)
    else {
        unreachable!("XChaCha20-Poly1305 encryption cannot fail with valid inputs");
    };

    let tag_bytes: [u8; TAG_SIZE] = tag.into();
    let attributes = encode_metadata(&nonce, &tag_bytes, nested_header);

    (buffer, attributes)
}

/// Open a sealed object using its metadata attribute map.
///
/// # Errors
///
/// - `Metadata` if the attribute map is missing fields, is not valid hex,
///   or carries a wrong-sized nonce/tag
/// - `AuthenticationFailed` if the key is wrong or ciphertext/header were
///   tampered with
pub fn open_object(
    stage_key: &[u8; 32],
    ciphertext: &[u8],
    attributes: &std::collections::BTreeMap<String, String>,
) -> Result<Vec<u8>, SealError> {
    let EncryptionMetadata { nonce, tag, nested_header } = decode_metadata(attributes)?;

    let cipher = XChaCha20Poly1305::new(stage_key.into());

    let mut buffer = ciphertext.to_vec();
    cipher
        .decrypt_in_place_detached(
            XNonce::from_slice(&nonce),
            &nested_header,
            &mut buffer,
            Tag::from_slice(&tag),
        )
        .map_err(|_| SealError::AuthenticationFailed)?;

    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 32] = [0x42; 32];
    const NONCE: [u8; NONCE_SIZE] = [0x07; NONCE_SIZE];

    #[test]
    fn seal_open_roundtrip() {
        let plaintext = b"object contents";
        let header = b"wrapped-key";

        let (ciphertext, attributes) = seal_object(&KEY, plaintext, header, NONCE);
        let opened = open_object(&KEY, &ciphertext, &attributes).unwrap();

        assert_eq!(opened, plaintext);
    }

    #[test]
    fn ciphertext_length_matches_plaintext() {
        let plaintext = b"twelve bytes";
        let (ciphertext, _) = seal_object(&KEY, plaintext, b"", NONCE);

        // Tag is detached into the metadata
        assert_eq!(ciphertext.len(), plaintext.len());
    }

    #[test]
    fn wrong_key_fails_to_open() {
        let (ciphertext, attributes) = seal_object(&KEY, b"secret", b"hdr", NONCE);

        let wrong_key = [0x43; 32];
        let result = open_object(&wrong_key, &ciphertext, &attributes);

        assert!(matches!(result, Err(SealError::AuthenticationFailed)));
    }

    #[test]
    fn tampered_ciphertext_fails_to_open() {
        let (mut ciphertext, attributes) = seal_object(&KEY, b"secret data", b"hdr", NONCE);
        ciphertext[0] ^= 0xFF;

        let result = open_object(&KEY, &ciphertext, &attributes);
        assert!(matches!(result, Err(SealError::AuthenticationFailed)));
    }

    #[test]
    fn tampered_header_attribute_fails_to_open() {
        let (ciphertext, mut attributes) = seal_object(&KEY, b"secret data", b"hdr", NONCE);
        attributes
            .insert(crate::metadata::HEADER_KEY.to_string(), hex::encode(b"other-header"));

        let result = open_object(&KEY, &ciphertext, &attributes);
        assert!(matches!(result, Err(SealError::AuthenticationFailed)));
    }

    #[test]
    fn truncated_tag_is_a_metadata_error() {
        let (ciphertext, mut attributes) = seal_object(&KEY, b"secret", b"", NONCE);
        attributes.insert(crate::metadata::TAG_KEY.to_string(), hex::encode([0u8; 8]));

        let result = open_object(&KEY, &ciphertext, &attributes);
        assert!(matches!(result, Err(SealError::Metadata(MetadataError::TagSize { actual: 8 }))));
    }

    #[test]
    fn empty_plaintext_roundtrips() {
        let (ciphertext, attributes) = seal_object(&KEY, b"", b"hdr", NONCE);
        assert!(ciphertext.is_empty());

        let opened = open_object(&KEY, &ciphertext, &attributes).unwrap();
        assert!(opened.is_empty());
    }
}
