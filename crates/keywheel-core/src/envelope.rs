//! Message envelope model.
//!
//! Typed representations of the two protocol payloads (group-setup,
//! key-update) and the wire attribute conventions that route them. The bus
//! itself carries untyped string attributes; the conversion to and from the
//! closed [`MessageType`] enum happens here and nowhere else, so the rest of
//! the crate pattern-matches exhaustively instead of comparing strings.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Attribute key carrying the message type.
pub const MESSAGE_TYPE_KEY: &str = "messageType";

/// Attribute key routing an update request to one member.
pub const MESSAGE_FOR_KEY: &str = "messageFor";

/// Attribute key naming the member that produced a key update.
pub const UPDATED_BY_KEY: &str = "updatedBy";

/// Attribute key for the opaque ordering tag.
///
/// Pass-through used only for external measurement, never for protocol
/// correctness.
pub const ORDERING_KEY: &str = "orderingKey";

/// Errors produced while decoding envelope attributes or payloads.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    /// The attribute map has no message type
    #[error("envelope has no {MESSAGE_TYPE_KEY} attribute")]
    MissingType,

    /// The message type is not one of the protocol's wire names
    #[error("unknown message type {0:?}")]
    UnknownType(String),

    /// The payload is not valid JSON for the expected shape
    #[error("malformed payload: {0}")]
    Payload(String),
}

/// The closed set of protocol message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// One-time group bootstrap from the initiator (`setup_msg`)
    SetupGroup,
    /// Request telling one member it is their turn to rotate (`update_key`)
    UpdateRequest,
    /// Broadcast of a completed key rotation (`update_msg`)
    UpdateBroadcast,
}

impl MessageType {
    /// Wire name of this message type.
    pub fn wire_name(self) -> &'static str {
        match self {
            Self::SetupGroup => "setup_msg",
            Self::UpdateRequest => "update_key",
            Self::UpdateBroadcast => "update_msg",
        }
    }

    /// Parse a wire name.
    pub fn from_wire(name: &str) -> Option<Self> {
        match name {
            "setup_msg" => Some(Self::SetupGroup),
            "update_key" => Some(Self::UpdateRequest),
            "update_msg" => Some(Self::UpdateBroadcast),
            _ => None,
        }
    }
}

/// Typed view of an envelope's routing attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvelopeAttributes {
    /// What kind of protocol message this is
    pub message_type: MessageType,
    /// Member an update request is addressed to
    pub message_for: Option<String>,
    /// Member that produced a key-update broadcast
    pub updated_by: Option<String>,
    /// Opaque measurement tag, passed through untouched
    pub ordering_key: Option<String>,
}

impl EnvelopeAttributes {
    /// Attributes for a key-update broadcast authored by `member`.
    pub fn update_broadcast(member: &str, ordering_key: Option<String>) -> Self {
        Self {
            message_type: MessageType::UpdateBroadcast,
            message_for: None,
            updated_by: Some(member.to_string()),
            ordering_key,
        }
    }

    /// Convert to the bus's string attribute map.
    pub fn to_map(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        map.insert(MESSAGE_TYPE_KEY.to_string(), self.message_type.wire_name().to_string());
        if let Some(member) = &self.message_for {
            map.insert(MESSAGE_FOR_KEY.to_string(), member.clone());
        }
        if let Some(member) = &self.updated_by {
            map.insert(UPDATED_BY_KEY.to_string(), member.clone());
        }
        if let Some(key) = &self.ordering_key {
            map.insert(ORDERING_KEY.to_string(), key.clone());
        }
        map
    }

    /// Parse the bus's string attribute map.
    ///
    /// # Errors
    ///
    /// `MissingType` if the type attribute is absent, `UnknownType` if it is
    /// not one of the three wire names.
    pub fn from_map(map: &BTreeMap<String, String>) -> Result<Self, EnvelopeError> {
        let raw_type = map.get(MESSAGE_TYPE_KEY).ok_or(EnvelopeError::MissingType)?;
        let message_type = MessageType::from_wire(raw_type)
            .ok_or_else(|| EnvelopeError::UnknownType(raw_type.clone()))?;

        Ok(Self {
            message_type,
            message_for: map.get(MESSAGE_FOR_KEY).cloned(),
            updated_by: map.get(UPDATED_BY_KEY).cloned(),
            ordering_key: map.get(ORDERING_KEY).cloned(),
        })
    }
}

/// A member's position in the group.
///
/// Immutable after construction; used to decide "is this update request
/// addressed to me?" and to tag outbound broadcasts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberIdentity {
    /// Position in the ratchet tree
    pub index: u32,
    /// Stable member identifier
    pub member_name: String,
    /// Group this member belongs to
    pub group_name: String,
}

/// One-time group bootstrap message, produced by the initiator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupSetupMessage {
    /// Per-member encrypted key-share material, keyed by member name
    pub member_key_shares: BTreeMap<String, Vec<u8>>,
    /// Initiator's public identity key
    pub initiator_identity_key: Vec<u8>,
    /// Opaque tree-crypto setup object
    pub setup_payload: Vec<u8>,
    /// Initiator's signature over the setup payload
    pub setup_signature: Vec<u8>,
}

/// Broadcast of one completed key rotation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyUpdateMessage {
    /// Member whose rotation this is
    pub updated_by: String,
    /// Opaque tree-crypto update object
    pub update_payload: Vec<u8>,
    /// MAC over the update payload
    pub update_mac: Vec<u8>,
}

impl GroupSetupMessage {
    /// Decode from the JSON wire form.
    pub fn from_json(data: &[u8]) -> Result<Self, EnvelopeError> {
        serde_json::from_slice(data).map_err(|e| EnvelopeError::Payload(e.to_string()))
    }

    /// Encode to the JSON wire form.
    pub fn to_json(&self) -> Result<Vec<u8>, EnvelopeError> {
        serde_json::to_vec(self).map_err(|e| EnvelopeError::Payload(e.to_string()))
    }
}

impl KeyUpdateMessage {
    /// Decode from the JSON wire form.
    pub fn from_json(data: &[u8]) -> Result<Self, EnvelopeError> {
        serde_json::from_slice(data).map_err(|e| EnvelopeError::Payload(e.to_string()))
    }

    /// Encode to the JSON wire form.
    pub fn to_json(&self) -> Result<Vec<u8>, EnvelopeError> {
        serde_json::to_vec(self).map_err(|e| EnvelopeError::Payload(e.to_string()))
    }
}
