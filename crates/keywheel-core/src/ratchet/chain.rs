//! Reference chain ratchet.
//!
//! An HMAC-SHA256 hash chain standing in for the real tree cryptography:
//! every member holds the same chain key, each rotation advances the chain
//! with fresh randomness, and update MACs are keyed by the pre-rotation
//! chain key so an update only verifies against the state it was produced
//! from. Setup messages are Ed25519-signed by the initiator.
//!
//! This gives the protocol engine real verification failures, real causal
//! ordering behavior (an out-of-order update fails its MAC) and real
//! stage-key material, without implementing a ratchet tree. It is a test
//! and simulation capability, not the production tree.

use std::collections::BTreeMap;

use ed25519_dalek::{
    Signature, Signer, SigningKey, Verifier, VerifyingKey,
    pkcs8::{EncodePrivateKey, spki::der::pem::LineEnding},
};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroize;

use super::{GroupRatchet, KeyRotation, RatchetError, RatchetState};
use crate::envelope::GroupSetupMessage;

type HmacSha256 = Hmac<Sha256>;

/// Label binding the setup confirmation to its purpose.
const CONFIRM_LABEL: &[u8] = b"keywheel confirm";

/// HKDF info for deriving the root chain key from a member's share.
const ROOT_LABEL: &[u8] = b"keywheel chain root";

/// Label for advancing the chain on rotation.
const CHAIN_LABEL: &[u8] = b"keywheel chain";

/// Label for deriving stage-key material from the chain key.
const STAGE_LABEL: &[u8] = b"keywheel stage";

/// Setup payload carried inside a [`GroupSetupMessage`].
#[derive(Serialize, Deserialize)]
struct SetupPayload {
    group: String,
    confirmation: Vec<u8>,
}

/// Update payload carried inside a key-update broadcast.
#[derive(Serialize, Deserialize)]
struct UpdatePayload {
    epoch: u64,
    nonce: [u8; 32],
}

/// Chain-ratchet state: the shared chain key and its epoch.
#[derive(Debug, Serialize, Deserialize)]
pub struct ChainState {
    group: String,
    epoch: u64,
    chain_key: [u8; 32],
}

impl ChainState {
    /// Group this state belongs to.
    pub fn group(&self) -> &str {
        &self.group
    }

    /// Number of rotations applied since setup.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

impl Drop for ChainState {
    fn drop(&mut self) {
        self.chain_key.zeroize();
    }
}

impl RatchetState for ChainState {
    fn serialize(&self) -> Result<Vec<u8>, RatchetError> {
        serde_json::to_vec(self).map_err(|e| RatchetError::Serialization(e.to_string()))
    }

    fn deserialize(bytes: &[u8]) -> Result<Self, RatchetError> {
        serde_json::from_slice(bytes).map_err(|e| RatchetError::Serialization(e.to_string()))
    }

    fn derive_stage_key(&self) -> Result<Vec<u8>, RatchetError> {
        // Stage-key material is a deterministic PEM Ed25519 key seeded from
        // the chain key, matching the on-disk stage-key format.
        let seed = hmac_digest(&self.chain_key, &[STAGE_LABEL, &self.epoch.to_be_bytes()]);
        let signing_key = SigningKey::from_bytes(&seed);
        let pem = signing_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| RatchetError::Serialization(e.to_string()))?;
        Ok(pem.as_bytes().to_vec())
    }
}

/// HMAC-SHA256 over the concatenation of `parts`, keyed by `key`.
fn hmac_digest(key: &[u8; 32], parts: &[&[u8]]) -> [u8; 32] {
    let Ok(mut mac) = HmacSha256::new_from_slice(key) else {
        unreachable!("HMAC-SHA256 accepts keys of any length");
    };
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().into()
}

/// Reference group-ratchet capability.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChainRatchet;

impl ChainRatchet {
    /// Create the capability.
    pub fn new() -> Self {
        Self
    }

    /// Initiator-side helper: build the one-time setup message for `members`.
    ///
    /// Every member receives the same root share here; the production tree
    /// capability encrypts a distinct share to each member instead.
    pub fn create_group(
        group: &str,
        members: &[String],
        initiator: &SigningKey,
    ) -> Result<GroupSetupMessage, RatchetError> {
        let mut share = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut share);

        let confirmation = hmac_digest(&share, &[CONFIRM_LABEL]).to_vec();
        let payload = SetupPayload { group: group.to_string(), confirmation };
        let setup_payload = serde_json::to_vec(&payload)
            .map_err(|e| RatchetError::Serialization(e.to_string()))?;

        let signature = initiator.sign(&setup_payload);

        let mut member_key_shares = BTreeMap::new();
        for member in members {
            member_key_shares.insert(member.clone(), share.to_vec());
        }
        share.zeroize();

        Ok(GroupSetupMessage {
            member_key_shares,
            initiator_identity_key: initiator.verifying_key().to_bytes().to_vec(),
            setup_signature: signature.to_bytes().to_vec(),
            setup_payload,
        })
    }
}

impl GroupRatchet for ChainRatchet {
    type State = ChainState;

    fn process_setup_message(
        &self,
        _index: u32,
        private_share: &[u8],
        setup_payload: &[u8],
        initiator_public_key: &[u8],
        signature: &[u8],
    ) -> Result<ChainState, RatchetError> {
        let key_bytes: [u8; 32] = initiator_public_key
            .try_into()
            .map_err(|_| RatchetError::MalformedPayload("initiator key length".to_string()))?;
        let verifying_key = VerifyingKey::from_bytes(&key_bytes)
            .map_err(|e| RatchetError::MalformedPayload(e.to_string()))?;
        let signature = Signature::from_slice(signature)
            .map_err(|_| RatchetError::InvalidSignature)?;

        verifying_key
            .verify(setup_payload, &signature)
            .map_err(|_| RatchetError::InvalidSignature)?;

        let payload: SetupPayload = serde_json::from_slice(setup_payload)
            .map_err(|e| RatchetError::MalformedPayload(e.to_string()))?;

        let share: [u8; 32] = private_share
            .try_into()
            .map_err(|_| RatchetError::MalformedPayload("key share length".to_string()))?;
        if hmac_digest(&share, &[CONFIRM_LABEL]).as_slice() != payload.confirmation.as_slice() {
            return Err(RatchetError::ShareMismatch);
        }

        let hkdf = Hkdf::<Sha256>::new(Some(payload.group.as_bytes()), &share);
        let mut chain_key = [0u8; 32];
        let Ok(()) = hkdf.expand(ROOT_LABEL, &mut chain_key) else {
            unreachable!("32 bytes is a valid HKDF-SHA256 output length");
        };

        Ok(ChainState { group: payload.group, epoch: 0, chain_key })
    }

    fn process_update_message(
        &self,
        _index: u32,
        state: &ChainState,
        update_payload: &[u8],
        mac: &[u8],
    ) -> Result<ChainState, RatchetError> {
        // The MAC is keyed by the pre-rotation chain key, so an update
        // applied out of causal order fails here.
        let Ok(mut verifier) = HmacSha256::new_from_slice(&state.chain_key) else {
            unreachable!("HMAC-SHA256 accepts keys of any length");
        };
        verifier.update(update_payload);
        verifier.verify_slice(mac).map_err(|_| RatchetError::InvalidMac)?;

        let payload: UpdatePayload = serde_json::from_slice(update_payload)
            .map_err(|e| RatchetError::MalformedPayload(e.to_string()))?;
        if payload.epoch != state.epoch + 1 {
            return Err(RatchetError::MalformedPayload(format!(
                "update epoch {} does not follow {}",
                payload.epoch, state.epoch
            )));
        }

        let chain_key = hmac_digest(&state.chain_key, &[CHAIN_LABEL, &payload.nonce]);
        Ok(ChainState { group: state.group.clone(), epoch: payload.epoch, chain_key })
    }

    fn update_key(
        &self,
        _index: u32,
        state: &ChainState,
    ) -> Result<KeyRotation<ChainState>, RatchetError> {
        let mut nonce = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut nonce);

        let payload = UpdatePayload { epoch: state.epoch + 1, nonce };
        let update_payload = serde_json::to_vec(&payload)
            .map_err(|e| RatchetError::Serialization(e.to_string()))?;
        let update_mac = hmac_digest(&state.chain_key, &[&update_payload]).to_vec();

        let chain_key = hmac_digest(&state.chain_key, &[CHAIN_LABEL, &nonce]);
        let new_state =
            ChainState { group: state.group.clone(), epoch: payload.epoch, chain_key };

        Ok(KeyRotation { update_payload, update_mac, new_state })
    }
}
