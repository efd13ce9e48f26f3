//! Member configuration.
//!
//! One immutable struct constructed at startup. The only mutable cell in
//! the system is the [`crate::keystore::StageKeyStore`]; everything else a
//! member needs (identity, topics, on-disk layout) is fixed here.
//!
//! # On-disk layout
//!
//! ```text
//! <base>/<group>/<member>/
//!     keys/initiator-ik.pub  initiator's public identity key
//!     keys/member-ek.key     this member's private key share
//!     setup/setup.msg        latest setup payload
//!     setup/setup.msg.sig    initiator signature over it
//!     update/update.msg      latest update payload
//!     update/update.msg.mac  MAC over it
//!     pubsub/                one JSON record per received envelope
//!     state                  serialized group-ratchet state
//!     stage-key              PEM stage-key material
//! ```

use std::path::{Path, PathBuf};

use crate::envelope::MemberIdentity;

/// Immutable per-member configuration.
#[derive(Debug, Clone)]
pub struct MemberConfig {
    /// This member's identity within the group
    pub identity: MemberIdentity,
    /// Root directory under which per-group, per-member trees live
    pub base_dir: PathBuf,
    /// Bus topic carrying group-setup messages
    pub setup_topic: String,
    /// Bus topic carrying update requests and broadcasts
    pub update_topic: String,
}

impl MemberConfig {
    /// Build a configuration rooted at `base_dir`.
    pub fn new(
        identity: MemberIdentity,
        base_dir: impl Into<PathBuf>,
        setup_topic: impl Into<String>,
        update_topic: impl Into<String>,
    ) -> Self {
        Self {
            identity,
            base_dir: base_dir.into(),
            setup_topic: setup_topic.into(),
            update_topic: update_topic.into(),
        }
    }

    /// This member's private directory: `<base>/<group>/<member>`.
    pub fn member_dir(&self) -> PathBuf {
        self.base_dir.join(&self.identity.group_name).join(&self.identity.member_name)
    }

    /// Identity key material directory.
    pub fn keys_dir(&self) -> PathBuf {
        self.member_dir().join("keys")
    }

    /// Setup artifact directory.
    pub fn setup_dir(&self) -> PathBuf {
        self.member_dir().join("setup")
    }

    /// Update artifact directory.
    pub fn update_dir(&self) -> PathBuf {
        self.member_dir().join("update")
    }

    /// Received-envelope archive directory (doubles as the dedup record).
    pub fn pubsub_dir(&self) -> PathBuf {
        self.member_dir().join("pubsub")
    }

    /// Serialized group-ratchet state file.
    pub fn state_file(&self) -> PathBuf {
        self.member_dir().join("state")
    }

    /// Stage-key material file.
    pub fn stage_key_file(&self) -> PathBuf {
        self.member_dir().join("stage-key")
    }

    /// The initiator's public identity key, as carried in the setup message.
    pub fn initiator_key_file(&self) -> PathBuf {
        self.keys_dir().join("initiator-ik.pub")
    }

    /// This member's private key share from the setup message.
    pub fn member_share_file(&self) -> PathBuf {
        self.keys_dir().join("member-ek.key")
    }

    /// Latest setup payload file.
    pub fn setup_msg_file(&self) -> PathBuf {
        self.setup_dir().join("setup.msg")
    }

    /// Signature over the latest setup payload.
    pub fn setup_sig_file(&self) -> PathBuf {
        self.setup_dir().join("setup.msg.sig")
    }

    /// Latest update payload file.
    pub fn update_msg_file(&self) -> PathBuf {
        self.update_dir().join("update.msg")
    }

    /// MAC over the latest update payload.
    pub fn update_mac_file(&self) -> PathBuf {
        self.update_dir().join("update.msg.mac")
    }

    /// All directories that must exist before the store operates.
    pub fn directories(&self) -> [PathBuf; 5] {
        [
            self.member_dir(),
            self.keys_dir(),
            self.setup_dir(),
            self.update_dir(),
            self.pubsub_dir(),
        ]
    }
}

/// Create every directory in `dirs` that does not already exist.
pub fn create_dirs_if_not_exist<P: AsRef<Path>>(dirs: &[P]) -> std::io::Result<()> {
    for dir in dirs {
        std::fs::create_dir_all(dir)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> MemberConfig {
        MemberConfig::new(
            MemberIdentity {
                index: 2,
                member_name: "bea".to_string(),
                group_name: "research".to_string(),
            },
            "/var/lib/keywheel",
            "group-setup",
            "key-update",
        )
    }

    #[test]
    fn layout_matches_group_and_member() {
        let config = config();
        assert_eq!(config.member_dir(), Path::new("/var/lib/keywheel/research/bea"));
        assert_eq!(config.state_file(), Path::new("/var/lib/keywheel/research/bea/state"));
        assert_eq!(config.stage_key_file(), Path::new("/var/lib/keywheel/research/bea/stage-key"));
        assert_eq!(
            config.setup_sig_file(),
            Path::new("/var/lib/keywheel/research/bea/setup/setup.msg.sig")
        );
        assert_eq!(
            config.initiator_key_file(),
            Path::new("/var/lib/keywheel/research/bea/keys/initiator-ik.pub")
        );
        assert_eq!(
            config.member_share_file(),
            Path::new("/var/lib/keywheel/research/bea/keys/member-ek.key")
        );
        assert_eq!(
            config.update_mac_file(),
            Path::new("/var/lib/keywheel/research/bea/update/update.msg.mac")
        );
    }

    #[test]
    fn directories_cover_the_whole_tree() {
        let config = config();
        let dirs = config.directories();
        assert!(dirs.contains(&config.keys_dir()));
        assert!(dirs.contains(&config.pubsub_dir()));
    }
}
