//! Persistent state store.
//!
//! File-backed, crash-consistent storage for the group-ratchet state, the
//! stage-key material, the key material received at setup, per-message
//! dedup records and the latest setup/update artifacts. Every write goes through overwrite-by-rename:
//! write to a temporary path, fsync, rename over the target. A crash at any
//! point leaves either the old, fully-valid file or the new one on disk,
//! never a partial write.
//!
//! The `state` file is authoritative. The `stage-key` file is re-derivable
//! from it, so a crash between the two writes of a [`StateStore::commit`]
//! degrades to recovery (re-derive on load), never to a mixed pair.

use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::Write,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{MemberConfig, create_dirs_if_not_exist};

/// Errors produced by the persistent store.
///
/// All variants are persistence failures: fatal to the current operation,
/// never partially committed.
#[derive(Error, Debug)]
pub enum StoreError {
    /// A write, fsync or rename failed
    #[error("store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// An archive record could not be serialized
    #[error("archive record serialization failed: {0}")]
    Serialization(String),
}

/// Archived copy of one received envelope.
///
/// Written to `pubsub/<publish-time>-<id>.json` once the envelope has been
/// durably applied; the file's existence is the dedup record, its contents
/// are the audit log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeRecord {
    /// Bus-assigned message id
    pub id: String,
    /// Bus publish timestamp, as formatted by the transport
    pub publish_time: String,
    /// The envelope's string attributes
    pub attributes: BTreeMap<String, String>,
    /// Hex-encoded payload bytes
    pub data: String,
}

impl EnvelopeRecord {
    /// Build a record from a received envelope.
    pub fn new(
        id: impl Into<String>,
        publish_time: impl Into<String>,
        attributes: BTreeMap<String, String>,
        data: &[u8],
    ) -> Self {
        Self {
            id: id.into(),
            publish_time: publish_time.into(),
            attributes,
            data: hex::encode(data),
        }
    }
}

/// File-backed store for one member's protocol state.
pub struct StateStore {
    state_file: PathBuf,
    stage_key_file: PathBuf,
    pubsub_dir: PathBuf,
    setup_msg_file: PathBuf,
    setup_sig_file: PathBuf,
    update_msg_file: PathBuf,
    update_mac_file: PathBuf,
    initiator_key_file: PathBuf,
    member_share_file: PathBuf,
}

impl StateStore {
    /// Open the store for `config`, creating the directory tree if needed.
    pub fn open(config: &MemberConfig) -> Result<Self, StoreError> {
        create_dirs_if_not_exist(&config.directories())?;

        Ok(Self {
            state_file: config.state_file(),
            stage_key_file: config.stage_key_file(),
            pubsub_dir: config.pubsub_dir(),
            setup_msg_file: config.setup_msg_file(),
            setup_sig_file: config.setup_sig_file(),
            update_msg_file: config.update_msg_file(),
            update_mac_file: config.update_mac_file(),
            initiator_key_file: config.initiator_key_file(),
            member_share_file: config.member_share_file(),
        })
    }

    /// The single write path for protocol state.
    ///
    /// Atomically replaces the `state` file, then removes any stale
    /// `stage-key` file and atomically writes the new one.
    ///
    /// # Invariants
    ///
    /// - Post: on success, both files hold the new pair
    /// - Crash: the `state` file is always wholly old or wholly new; a
    ///   missing or stale `stage-key` file is repaired by recovery, which
    ///   re-derives it from the state
    pub fn commit(&self, state: &[u8], stage_key_material: &[u8]) -> Result<(), StoreError> {
        write_atomic(&self.state_file, state)?;

        if self.stage_key_file.exists() {
            fs::remove_file(&self.stage_key_file)?;
        }
        write_atomic(&self.stage_key_file, stage_key_material)?;

        Ok(())
    }

    /// Whether a group-ratchet state has ever been committed.
    ///
    /// Used to reject update requests and broadcasts arriving before setup.
    pub fn has_state(&self) -> bool {
        self.state_file.exists()
    }

    /// Load the committed state, if any.
    pub fn load_state(&self) -> Result<Option<Vec<u8>>, StoreError> {
        match fs::read(&self.state_file) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether the stage-key file is present and matches no pending repair.
    pub fn has_stage_key(&self) -> bool {
        self.stage_key_file.exists()
    }

    /// Path of the stage-key file (consumed by the key material store).
    pub fn stage_key_file(&self) -> &Path {
        &self.stage_key_file
    }

    /// Repair a missing stage-key file after a crash between the two
    /// commit writes.
    pub fn repair_stage_key(&self, stage_key_material: &[u8]) -> Result<(), StoreError> {
        write_atomic(&self.stage_key_file, stage_key_material)
    }

    /// Whether the envelope `(id, publish_time)` has already been applied.
    pub fn is_processed(&self, id: &str, publish_time: &str) -> bool {
        self.record_path(id, publish_time).exists()
    }

    /// Durably record an envelope as applied.
    ///
    /// Must be called only after the state transition it belongs to has
    /// been committed.
    pub fn record_processed(&self, record: &EnvelopeRecord) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(record)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        write_atomic(&self.record_path(&record.id, &record.publish_time), &json)
    }

    /// Persist the latest setup payload and its signature for audit.
    pub fn save_setup_artifacts(&self, payload: &[u8], signature: &[u8]) -> Result<(), StoreError> {
        write_atomic(&self.setup_msg_file, payload)?;
        write_atomic(&self.setup_sig_file, signature)
    }

    /// Persist the initiator's public identity key and this member's
    /// private key share under `keys/`.
    ///
    /// Both arrive in the setup message; keeping them on disk lets the
    /// member re-verify artifacts and re-enter the group after losing its
    /// in-memory copy.
    pub fn save_key_material(
        &self,
        initiator_key: &[u8],
        member_share: &[u8],
    ) -> Result<(), StoreError> {
        write_atomic(&self.initiator_key_file, initiator_key)?;
        write_atomic(&self.member_share_file, member_share)
    }

    /// Persist the latest update payload and its MAC for audit.
    pub fn save_update_artifacts(&self, payload: &[u8], mac: &[u8]) -> Result<(), StoreError> {
        write_atomic(&self.update_msg_file, payload)?;
        write_atomic(&self.update_mac_file, mac)
    }

    /// `pubsub/<publish-time>-<id>.json`
    fn record_path(&self, id: &str, publish_time: &str) -> PathBuf {
        self.pubsub_dir.join(format!("{publish_time}-{id}.json"))
    }
}

/// Write `bytes` to `path` via a temporary file, fsync and atomic rename.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let mut file = File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&tmp, path)?;
    Ok(())
}
