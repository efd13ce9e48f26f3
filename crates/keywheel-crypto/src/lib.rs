//! Keywheel Cryptographic Primitives
//!
//! Cryptographic building blocks for the Keywheel group-key protocol. Pure
//! functions with deterministic outputs. Callers provide random bytes for
//! deterministic testing.
//!
//! # Key Lifecycle
//!
//! The group ratchet produces stage-key material (a PEM-encoded identity
//! key) on every setup or rotation. The operational encryption key is
//! derived from that material and never persisted:
//!
//! ```text
//! Stage-Key Material (PEM, on disk)
//!        │
//!        ▼
//! HKDF-SHA256 → Stage Key (32 bytes, in memory only)
//!        │
//!        ▼
//! AEAD Sealing → Ciphertext + Metadata Attributes
//! ```
//!
//! # Security
//!
//! - The derived stage key exists only in memory; compromise of the disk
//!   image alone does not reveal it without the derivation inputs
//! - XChaCha20-Poly1305 AEAD authenticates both ciphertext and the nested
//!   header carried in the metadata attributes
//! - Metadata decoding validates exact nonce/tag lengths before any AEAD
//!   operation sees the bytes

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod derive;
pub mod metadata;
pub mod sealing;

pub use derive::{STAGE_KEY_LEN, StageKeyError, stage_key_from_pem, stage_key_from_pem_file};
pub use metadata::{
    EncryptionMetadata, MetadataError, NONCE_SIZE, TAG_SIZE, decode_metadata, encode_metadata,
};
pub use sealing::{SealError, open_object, seal_object};
