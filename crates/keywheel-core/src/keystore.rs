//! In-memory stage-key store.
//!
//! Holds the current derived stage key behind a read-write lock: encryption
//! and decryption paths take the shared lock, the protocol engine takes the
//! exclusive lock only for the instant of the swap.

use std::{
    path::Path,
    sync::{PoisonError, RwLock},
};

use keywheel_crypto::{STAGE_KEY_LEN, stage_key_from_pem_file};
use zeroize::Zeroizing;

/// Shared holder of the current stage key.
///
/// The key is `None` until the first setup or recovery installs one.
#[derive(Default)]
pub struct StageKeyStore {
    key: RwLock<Option<Zeroizing<[u8; STAGE_KEY_LEN]>>>,
}

impl StageKeyStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current stage key, if one has been installed.
    pub fn current(&self) -> Option<Zeroizing<[u8; STAGE_KEY_LEN]>> {
        self.key.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Whether a stage key is installed.
    pub fn is_loaded(&self) -> bool {
        self.key.read().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    /// Install a new stage key, replacing any previous one.
    pub fn install(&self, key: [u8; STAGE_KEY_LEN]) {
        let mut guard = self.key.write().unwrap_or_else(PoisonError::into_inner);
        *guard = Some(Zeroizing::new(key));
    }

    /// Derive the operational key from an on-disk stage-key PEM file and
    /// install it.
    ///
    /// Fail-safe, not fail-open: any read/parse/derive failure is logged and
    /// the previous key stays in place.
    pub fn install_from_pem_file(&self, path: &Path) {
        match stage_key_from_pem_file(path) {
            Ok(key) => self.install(key),
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "stage key derivation failed, keeping previous key");
            },
        }
    }
}
