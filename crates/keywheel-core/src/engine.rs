//! Protocol engine.
//!
//! The state machine consuming inbound setup/update envelopes and producing
//! outbound envelopes, driving the [`StateStore`] and [`StageKeyStore`].
//! Synchronous and I/O-free apart from the store: the runtime decodes bus
//! messages into [`InboundEnvelope`]s outside the engine lock, calls
//! [`Engine::handle_envelope`] under it, and executes the returned
//! [`Outcome`] (ack/nack, optional publish) after releasing it.
//!
//! # States
//!
//! `Uninitialized → AwaitingSetup → Active ⇄ Rotating`. Construction
//! recovers from disk: a committed state file moves the engine straight to
//! `Active`. `Rotating` is transient, held only while a self-rotation is
//! being committed.
//!
//! # Ordering
//!
//! Updates are not commutative and the engine does not reorder or buffer
//! out-of-order deliveries; an update that does not verify against the
//! current state is rejected and left to bus redelivery. This matches the
//! capability's assumption that updates arrive in causal order per member
//! path.

use std::sync::Arc;

use thiserror::Error;

use crate::{
    config::MemberConfig,
    envelope::{
        EnvelopeAttributes, EnvelopeError, GroupSetupMessage, KeyUpdateMessage, MessageType,
    },
    keystore::StageKeyStore,
    ratchet::{GroupRatchet, RatchetError, RatchetState},
    store::{EnvelopeRecord, StateStore, StoreError},
};

/// Errors produced while handling an envelope.
#[derive(Error, Debug)]
pub enum EngineError {
    /// The envelope payload or attributes are malformed
    #[error("envelope rejected: {0}")]
    Envelope(#[from] EnvelopeError),

    /// The ratchet capability rejected the message (signature, MAC, share)
    #[error("protocol violation: {0}")]
    Ratchet(#[from] RatchetError),

    /// Persistence failed; nothing was committed
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The setup message carries no key share for this member
    #[error("no key share for member {member:?} in setup message")]
    MissingShare {
        /// This member's name
        member: String,
    },

    /// An update arrived before the group was set up
    #[error("cannot {operation} before group setup")]
    NotInitialized {
        /// The rejected operation
        operation: &'static str,
    },
}

impl EngineError {
    /// Whether this is a protocol violation (peer/message at fault) rather
    /// than a local persistence failure.
    ///
    /// Both classes leave the envelope un-acknowledged; the distinction is
    /// for logging and metrics only.
    pub fn is_violation(&self) -> bool {
        !matches!(self, Self::Store(_))
    }
}

/// Protocol engine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Constructed but not yet recovered from disk
    Uninitialized,
    /// Waiting for the initiator's one-time setup message
    AwaitingSetup,
    /// Holding a current state/stage-key pair
    Active,
    /// Committing a self-rotation (transient)
    Rotating,
}

/// What the runtime should do with the bus message after handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Acknowledge: the envelope was applied, or is a duplicate/echo
    Ack,
    /// Leave un-acknowledged for at-least-once redelivery
    Nack,
}

/// An envelope to publish after the engine lock is released.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundPublish {
    /// Topic to publish on
    pub topic: String,
    /// JSON payload bytes
    pub data: Vec<u8>,
    /// Routing attributes
    pub attributes: EnvelopeAttributes,
}

/// Result of handling one envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    /// Ack or nack the bus message
    pub disposition: Disposition,
    /// Envelope to publish, if the handling produced one
    pub publish: Option<OutboundPublish>,
}

impl Outcome {
    fn ack() -> Self {
        Self { disposition: Disposition::Ack, publish: None }
    }

    fn ack_and_publish(publish: OutboundPublish) -> Self {
        Self { disposition: Disposition::Ack, publish: Some(publish) }
    }
}

/// A decoded inbound envelope.
///
/// Built by the runtime from a raw bus message before taking the engine
/// lock; payload JSON is decoded inside the engine because its shape
/// depends on the message type.
#[derive(Debug, Clone)]
pub struct InboundEnvelope {
    /// Bus-assigned message id
    pub id: String,
    /// Bus publish timestamp, as formatted by the transport
    pub publish_time: String,
    /// Raw payload bytes
    pub data: Vec<u8>,
    /// Decoded routing attributes
    pub attributes: EnvelopeAttributes,
}

/// Per-member protocol state machine.
///
/// # Concurrency
///
/// A single engine instance exclusively owns its member's state/stage-key
/// files. The runtime must serialize calls to [`Self::handle_envelope`]
/// (one mutex across "dedup check → crypto transition → commit → key
/// install"); the bus may deliver concurrently across topics.
pub struct Engine<R: GroupRatchet> {
    config: MemberConfig,
    ratchet: R,
    store: StateStore,
    keystore: Arc<StageKeyStore>,
    state: EngineState,
    ratchet_state: Option<R::State>,
}

impl<R: GroupRatchet> Engine<R> {
    /// Create an engine, recovering any state committed by a previous run.
    ///
    /// With a committed state file the engine starts `Active`: the stage
    /// key is re-derived (repairing a stage-key file lost to a crash
    /// between the two commit writes) and installed in the key store.
    /// Otherwise it starts `AwaitingSetup`.
    pub fn new(
        config: MemberConfig,
        ratchet: R,
        store: StateStore,
        keystore: Arc<StageKeyStore>,
    ) -> Result<Self, EngineError> {
        let mut engine = Self {
            config,
            ratchet,
            store,
            keystore,
            state: EngineState::Uninitialized,
            ratchet_state: None,
        };
        engine.recover()?;
        Ok(engine)
    }

    fn recover(&mut self) -> Result<(), EngineError> {
        let Some(bytes) = self.store.load_state()? else {
            self.state = EngineState::AwaitingSetup;
            tracing::info!(
                member = %self.config.identity.member_name,
                "no committed state, awaiting group setup"
            );
            return Ok(());
        };

        let state = R::State::deserialize(&bytes)?;
        if !self.store.has_stage_key() {
            let material = state.derive_stage_key()?;
            self.store.repair_stage_key(&material)?;
            tracing::warn!(
                member = %self.config.identity.member_name,
                "stage-key file was missing, re-derived from state"
            );
        }
        self.keystore.install_from_pem_file(self.store.stage_key_file());

        self.ratchet_state = Some(state);
        self.state = EngineState::Active;
        tracing::info!(
            member = %self.config.identity.member_name,
            "recovered committed state, engine active"
        );
        Ok(())
    }

    /// Current engine state.
    pub fn state(&self) -> EngineState {
        self.state
    }

    /// This member's configuration.
    pub fn config(&self) -> &MemberConfig {
        &self.config
    }

    /// The persistent store backing this engine.
    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Handle one decoded inbound envelope.
    ///
    /// # Errors
    ///
    /// Any error means the envelope was rejected and no state was mutated;
    /// the runtime must leave the bus message un-acknowledged so
    /// at-least-once delivery retries it.
    pub fn handle_envelope(&mut self, envelope: &InboundEnvelope) -> Result<Outcome, EngineError> {
        match envelope.attributes.message_type {
            MessageType::SetupGroup => self.handle_setup(envelope),
            MessageType::UpdateRequest => self.handle_update_request(envelope),
            MessageType::UpdateBroadcast => self.handle_update_broadcast(envelope),
        }
    }

    /// One-time group bootstrap.
    fn handle_setup(&mut self, envelope: &InboundEnvelope) -> Result<Outcome, EngineError> {
        let member = self.config.identity.member_name.clone();

        if self.store.is_processed(&envelope.id, &envelope.publish_time) {
            tracing::debug!(member = %member, id = %envelope.id, "duplicate setup, skipping");
            return Ok(Outcome::ack());
        }
        if self.ratchet_state.is_some() {
            tracing::info!(member = %member, id = %envelope.id, "already set up, skipping setup");
            return Ok(Outcome::ack());
        }

        let setup = GroupSetupMessage::from_json(&envelope.data)?;
        let share = setup
            .member_key_shares
            .get(&member)
            .ok_or(EngineError::MissingShare { member: member.clone() })?;

        let state = self.ratchet.process_setup_message(
            self.config.identity.index,
            share,
            &setup.setup_payload,
            &setup.initiator_identity_key,
            &setup.setup_signature,
        )?;

        self.commit_state(&state)?;
        self.store.save_setup_artifacts(&setup.setup_payload, &setup.setup_signature)?;
        self.store.save_key_material(&setup.initiator_identity_key, share)?;
        self.record_processed(envelope)?;

        self.ratchet_state = Some(state);
        self.state = EngineState::Active;
        tracing::info!(member = %member, id = %envelope.id, "group setup applied, engine active");

        Ok(Outcome::ack())
    }

    /// A request telling one member it is their turn to rotate.
    fn handle_update_request(&mut self, envelope: &InboundEnvelope) -> Result<Outcome, EngineError> {
        let member = &self.config.identity.member_name;

        if envelope.attributes.message_for.as_deref() != Some(member.as_str()) {
            tracing::debug!(
                member = %member,
                addressed_to = ?envelope.attributes.message_for,
                "update request for another member, skipping"
            );
            return Ok(Outcome::ack());
        }
        if self.store.is_processed(&envelope.id, &envelope.publish_time) {
            tracing::debug!(member = %member, id = %envelope.id, "duplicate update request, skipping");
            return Ok(Outcome::ack());
        }
        if self.ratchet_state.is_none() {
            return Err(EngineError::NotInitialized { operation: "rotate the group key" });
        }

        self.state = EngineState::Rotating;
        let result = self.rotate(envelope);
        self.state = EngineState::Active;
        result
    }

    /// The rotation itself; `Rotating` is held across this call.
    fn rotate(&mut self, envelope: &InboundEnvelope) -> Result<Outcome, EngineError> {
        let member = self.config.identity.member_name.clone();
        let Some(current) = self.ratchet_state.as_ref() else {
            return Err(EngineError::NotInitialized { operation: "rotate the group key" });
        };

        let rotation = self.ratchet.update_key(self.config.identity.index, current)?;

        self.commit_state(&rotation.new_state)?;
        self.store.save_update_artifacts(&rotation.update_payload, &rotation.update_mac)?;
        self.record_processed(envelope)?;
        self.ratchet_state = Some(rotation.new_state);

        let broadcast = KeyUpdateMessage {
            updated_by: member.clone(),
            update_payload: rotation.update_payload,
            update_mac: rotation.update_mac,
        };
        tracing::info!(member = %member, id = %envelope.id, "rotated group key, broadcasting update");

        Ok(Outcome::ack_and_publish(OutboundPublish {
            topic: self.config.update_topic.clone(),
            data: broadcast.to_json()?,
            attributes: EnvelopeAttributes::update_broadcast(
                &member,
                envelope.attributes.ordering_key.clone(),
            ),
        }))
    }

    /// Another member's completed rotation.
    fn handle_update_broadcast(
        &mut self,
        envelope: &InboundEnvelope,
    ) -> Result<Outcome, EngineError> {
        let member = self.config.identity.member_name.clone();

        // Self-originated broadcast: already applied locally when rotating.
        // This is what tolerates a bus that echoes publishes back.
        if envelope.attributes.updated_by.as_deref() == Some(member.as_str()) {
            tracing::debug!(member = %member, id = %envelope.id, "own update echoed back, skipping");
            return Ok(Outcome::ack());
        }
        if self.store.is_processed(&envelope.id, &envelope.publish_time) {
            tracing::debug!(member = %member, id = %envelope.id, "duplicate update, skipping");
            return Ok(Outcome::ack());
        }
        let Some(current) = self.ratchet_state.as_ref() else {
            return Err(EngineError::NotInitialized { operation: "apply a key update" });
        };

        let update = KeyUpdateMessage::from_json(&envelope.data)?;
        if update.updated_by == member {
            tracing::debug!(member = %member, id = %envelope.id, "own update echoed back, skipping");
            return Ok(Outcome::ack());
        }

        let state = self.ratchet.process_update_message(
            self.config.identity.index,
            current,
            &update.update_payload,
            &update.update_mac,
        )?;

        self.commit_state(&state)?;
        self.store.save_update_artifacts(&update.update_payload, &update.update_mac)?;
        self.record_processed(envelope)?;
        self.ratchet_state = Some(state);
        tracing::info!(
            member = %member,
            updated_by = %update.updated_by,
            id = %envelope.id,
            "applied key update"
        );

        Ok(Outcome::ack())
    }

    /// Commit a new state/stage-key pair and install the derived key.
    fn commit_state(&self, state: &R::State) -> Result<(), EngineError> {
        let bytes = state.serialize()?;
        let material = state.derive_stage_key()?;
        self.store.commit(&bytes, &material)?;
        self.keystore.install_from_pem_file(self.store.stage_key_file());
        Ok(())
    }

    fn record_processed(&self, envelope: &InboundEnvelope) -> Result<(), EngineError> {
        let record = EnvelopeRecord::new(
            &envelope.id,
            &envelope.publish_time,
            envelope.attributes.to_map(),
            &envelope.data,
        );
        self.store.record_processed(&record)?;
        Ok(())
    }
}
