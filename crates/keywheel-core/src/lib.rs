//! Keywheel protocol core.
//!
//! Continuous group-key agreement for a set of members sharing a rotating
//! symmetric key over an at-least-once, unordered message bus, without a
//! trusted central server. One member (the initiator) distributes a one-time
//! group-setup message; thereafter any member can rotate the shared key and
//! the rotation propagates to everyone else.
//!
//! # Architecture
//!
//! The [`Engine`] is a synchronous state machine (Sans-IO): it consumes
//! decoded inbound envelopes and returns an [`engine::Outcome`] telling the
//! runtime whether to ack or nack the bus message and what, if anything, to
//! publish. All I/O lives in the runtime crate (`keywheel-bus`); all
//! persistence goes through the crash-consistent [`store::StateStore`].
//!
//! The tree cryptography itself is an external capability behind the
//! [`ratchet::GroupRatchet`] trait. A reference [`ratchet::ChainRatchet`]
//! implementation (an HMAC hash chain, not a tree) exercises the protocol in
//! tests and simulations.

#![forbid(unsafe_code)]

pub mod config;
pub mod engine;
pub mod envelope;
pub mod keystore;
pub mod ratchet;
pub mod store;

pub use config::MemberConfig;
pub use engine::{Disposition, Engine, EngineError, EngineState, InboundEnvelope, Outcome};
pub use envelope::{
    EnvelopeAttributes, EnvelopeError, GroupSetupMessage, KeyUpdateMessage, MemberIdentity,
    MessageType,
};
pub use keystore::StageKeyStore;
pub use ratchet::{ChainRatchet, GroupRatchet, KeyRotation, RatchetError, RatchetState};
pub use store::{StateStore, StoreError};
