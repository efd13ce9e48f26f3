//! Group ratchet capability boundary.
//!
//! The tree cryptography (path-key derivation, tree updates, signature and
//! MAC verification) is an external collaborator. This module defines the
//! trait the [`crate::engine::Engine`] drives it through, plus a reference
//! [`ChainRatchet`] implementation used by tests and simulations.

mod chain;

pub use chain::{ChainRatchet, ChainState};
use thiserror::Error;

/// Errors surfaced across the ratchet capability boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RatchetError {
    /// Setup signature did not verify against the initiator's identity key
    #[error("setup signature verification failed")]
    InvalidSignature,

    /// Update MAC did not verify against the current state
    #[error("update MAC verification failed")]
    InvalidMac,

    /// This member's key share does not match the setup payload
    #[error("key share does not match setup confirmation")]
    ShareMismatch,

    /// A payload could not be parsed
    #[error("malformed ratchet payload: {0}")]
    MalformedPayload(String),

    /// State (de)serialization failed
    #[error("ratchet state serialization failed: {0}")]
    Serialization(String),
}

/// One completed key rotation, produced by [`GroupRatchet::update_key`].
#[derive(Debug, Clone)]
pub struct KeyRotation<S> {
    /// Opaque update object to broadcast to the other members
    pub update_payload: Vec<u8>,
    /// MAC over the update payload
    pub update_mac: Vec<u8>,
    /// The rotated local state
    pub new_state: S,
}

/// Versioned, opaque group-ratchet state.
///
/// Owned exclusively by the persistent store between mutations; only the
/// capability itself ever looks inside.
pub trait RatchetState: Sized {
    /// Serialize for the on-disk `state` file.
    fn serialize(&self) -> Result<Vec<u8>, RatchetError>;

    /// Deserialize from the on-disk `state` file.
    fn deserialize(bytes: &[u8]) -> Result<Self, RatchetError>;

    /// Derive the current stage-key material (a PEM document matching the
    /// on-disk `stage-key` file).
    fn derive_stage_key(&self) -> Result<Vec<u8>, RatchetError>;
}

/// The external tree-crypto capability.
///
/// All verification (setup signatures, update MACs) happens inside the
/// capability; the engine treats any error as a protocol violation and
/// leaves state untouched.
pub trait GroupRatchet {
    /// The opaque state this capability operates on.
    type State: RatchetState;

    /// Bootstrap local state from the initiator's setup message.
    fn process_setup_message(
        &self,
        index: u32,
        private_share: &[u8],
        setup_payload: &[u8],
        initiator_public_key: &[u8],
        signature: &[u8],
    ) -> Result<Self::State, RatchetError>;

    /// Apply another member's key-update broadcast.
    fn process_update_message(
        &self,
        index: u32,
        state: &Self::State,
        update_payload: &[u8],
        mac: &[u8],
    ) -> Result<Self::State, RatchetError>;

    /// Rotate this member's key, producing the update to broadcast.
    fn update_key(&self, index: u32, state: &Self::State)
    -> Result<KeyRotation<Self::State>, RatchetError>;
}
