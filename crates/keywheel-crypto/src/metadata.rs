//! Encryption metadata codec
//!
//! Encodes the AEAD nonce, authentication tag and nested header of a sealed
//! object into a generic string-keyed attribute map, and decodes them back.
//! The map is attached to ciphertext objects by whatever store holds them;
//! this module only defines the encode/decode contract.
//!
//! Decoding is a correctness gate: nonce and tag lengths are validated
//! against the cipher's fixed sizes so truncated or corrupted attributes are
//! rejected before they reach AEAD decryption.

use std::collections::BTreeMap;

use thiserror::Error;

/// XChaCha20 nonce size in bytes.
pub const NONCE_SIZE: usize = 24;

/// Poly1305 authentication tag size in bytes.
pub const TAG_SIZE: usize = 16;

/// Attribute key for the hex-encoded nonce.
pub const NONCE_KEY: &str = "keywheel_nonce";

/// Attribute key for the hex-encoded authentication tag.
pub const TAG_KEY: &str = "keywheel_tag";

/// Attribute key for the hex-encoded nested header.
pub const HEADER_KEY: &str = "keywheel_header";

/// Errors produced by metadata encoding/decoding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MetadataError {
    /// A required attribute key is absent from the map
    #[error("metadata for key {key:?} does not exist")]
    Missing {
        /// The absent attribute key
        key: &'static str,
    },

    /// An attribute value is not valid hex
    #[error("can't decode metadata for key {key:?}: {reason}")]
    Decode {
        /// The offending attribute key
        key: &'static str,
        /// Description of the hex failure
        reason: String,
    },

    /// Decoded nonce has the wrong length
    #[error("nonce length {actual} does not match cipher nonce size {NONCE_SIZE}")]
    NonceSize {
        /// Length of the decoded nonce
        actual: usize,
    },

    /// Decoded tag has the wrong length
    #[error("tag length {actual} does not match cipher tag size {TAG_SIZE}")]
    TagSize {
        /// Length of the decoded tag
        actual: usize,
    },
}

/// Decoded encryption metadata for one sealed object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionMetadata {
    /// The 24-byte XChaCha20 nonce
    pub nonce: [u8; NONCE_SIZE],
    /// The 16-byte Poly1305 tag
    pub tag: [u8; TAG_SIZE],
    /// Variable-length nested header (authenticated as AAD when sealing)
    pub nested_header: Vec<u8>,
}

/// Encode (nonce, tag, header) into a string-keyed attribute map.
///
/// All three values are hex-encoded. The returned map contains exactly the
/// three keywheel attribute keys; callers merge it into whatever attribute
/// set their object store carries.
pub fn encode_metadata(
    nonce: &[u8; NONCE_SIZE],
    tag: &[u8; TAG_SIZE],
    nested_header: &[u8],
) -> BTreeMap<String, String> {
    let mut attributes = BTreeMap::new();
    attributes.insert(NONCE_KEY.to_string(), hex::encode(nonce));
    attributes.insert(TAG_KEY.to_string(), hex::encode(tag));
    attributes.insert(HEADER_KEY.to_string(), hex::encode(nested_header));
    attributes
}

/// Decode encryption metadata from a string-keyed attribute map.
///
/// # Errors
///
/// - `Missing` if any of the three attribute keys is absent
/// - `Decode` if a value is not valid hex
/// - `NonceSize` / `TagSize` if the decoded bytes do not match the cipher's
///   fixed sizes
pub fn decode_metadata(
    attributes: &BTreeMap<String, String>,
) -> Result<EncryptionMetadata, MetadataError> {
    let nonce_bytes = decode_field(attributes, NONCE_KEY)?;
    let nonce: [u8; NONCE_SIZE] = nonce_bytes
        .try_into()
        .map_err(|bytes: Vec<u8>| MetadataError::NonceSize { actual: bytes.len() })?;

    let tag_bytes = decode_field(attributes, TAG_KEY)?;
    let tag: [u8; TAG_SIZE] =
        tag_bytes.try_into().map_err(|bytes: Vec<u8>| MetadataError::TagSize {
            actual: bytes.len(),
        })?;

    let nested_header = decode_field(attributes, HEADER_KEY)?;

    Ok(EncryptionMetadata { nonce, tag, nested_header })
}

/// Look up and hex-decode a single attribute.
fn decode_field(
    attributes: &BTreeMap<String, String>,
    key: &'static str,
) -> Result<Vec<u8>, MetadataError> {
    let value = attributes.get(key).ok_or(MetadataError::Missing { key })?;
    hex::decode(value).map_err(|e| MetadataError::Decode { key, reason: e.to_string() })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ([u8; NONCE_SIZE], [u8; TAG_SIZE], Vec<u8>) {
        let mut nonce = [0u8; NONCE_SIZE];
        for (i, byte) in nonce.iter_mut().enumerate() {
            *byte = i as u8;
        }
        let tag = [0xA5u8; TAG_SIZE];
        let header = b"wrapped-object-key".to_vec();
        (nonce, tag, header)
    }

    #[test]
    fn encode_decode_roundtrip() {
        let (nonce, tag, header) = sample();
        let attributes = encode_metadata(&nonce, &tag, &header);
        let decoded = decode_metadata(&attributes).unwrap();

        assert_eq!(decoded.nonce, nonce);
        assert_eq!(decoded.tag, tag);
        assert_eq!(decoded.nested_header, header);
    }

    #[test]
    fn empty_header_roundtrips() {
        let (nonce, tag, _) = sample();
        let attributes = encode_metadata(&nonce, &tag, &[]);
        let decoded = decode_metadata(&attributes).unwrap();

        assert!(decoded.nested_header.is_empty());
    }

    #[test]
    fn missing_nonce_is_reported() {
        let (nonce, tag, header) = sample();
        let mut attributes = encode_metadata(&nonce, &tag, &header);
        attributes.remove(NONCE_KEY);

        let err = decode_metadata(&attributes).unwrap_err();
        assert_eq!(err, MetadataError::Missing { key: NONCE_KEY });
    }

    #[test]
    fn missing_tag_is_reported() {
        let (nonce, tag, header) = sample();
        let mut attributes = encode_metadata(&nonce, &tag, &header);
        attributes.remove(TAG_KEY);

        let err = decode_metadata(&attributes).unwrap_err();
        assert_eq!(err, MetadataError::Missing { key: TAG_KEY });
    }

    #[test]
    fn invalid_hex_is_a_decode_error() {
        let (nonce, tag, header) = sample();
        let mut attributes = encode_metadata(&nonce, &tag, &header);
        attributes.insert(HEADER_KEY.to_string(), "not hex!".to_string());

        let err = decode_metadata(&attributes).unwrap_err();
        assert!(matches!(err, MetadataError::Decode { key: HEADER_KEY, .. }));
    }

    #[test]
    fn short_nonce_is_rejected() {
        let (nonce, tag, header) = sample();
        let mut attributes = encode_metadata(&nonce, &tag, &header);
        attributes.insert(NONCE_KEY.to_string(), hex::encode([0u8; NONCE_SIZE - 1]));

        let err = decode_metadata(&attributes).unwrap_err();
        assert_eq!(err, MetadataError::NonceSize { actual: NONCE_SIZE - 1 });
    }

    #[test]
    fn long_tag_is_rejected() {
        let (nonce, tag, header) = sample();
        let mut attributes = encode_metadata(&nonce, &tag, &header);
        attributes.insert(TAG_KEY.to_string(), hex::encode([0u8; TAG_SIZE + 4]));

        let err = decode_metadata(&attributes).unwrap_err();
        assert_eq!(err, MetadataError::TagSize { actual: TAG_SIZE + 4 });
    }

    #[test]
    fn extra_attributes_are_ignored() {
        let (nonce, tag, header) = sample();
        let mut attributes = encode_metadata(&nonce, &tag, &header);
        attributes.insert("content-type".to_string(), "application/octet-stream".to_string());

        assert!(decode_metadata(&attributes).is_ok());
    }
}
