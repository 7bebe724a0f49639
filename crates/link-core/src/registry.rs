//! Persistent peer registry.
//!
//! Remembers the last-known identity per peer kind so a restart can skip
//! straight to a targeted connect. The only consumer is the state machine
//! at startup and on forget.

use std::sync::Arc;

use tracing::debug;

use crate::peer::{PeerIdentity, PeerKind};
use crate::storage::KvStore;

/// Key-value-backed registry of known peers, one slot per kind.
#[derive(Clone)]
pub struct PeerRegistry {
    store: Arc<dyn KvStore>,
}

impl PeerRegistry {
    pub fn new(store: Arc<dyn KvStore>) -> PeerRegistry {
        PeerRegistry { store }
    }

    /// Persist `identity` as the known peer for its kind.
    pub fn put(&self, identity: &PeerIdentity) -> Result<(), crate::LinkError> {
        let json = serde_json::to_string(identity)
            .map_err(|e| crate::LinkError::Storage(e.to_string()))?;
        self.store
            .put(identity.kind.storage_key(), &json)
            .map_err(|e| crate::LinkError::Storage(e.to_string()))?;
        debug!(kind = ?identity.kind, address = %identity.address, "peer identity persisted");
        Ok(())
    }

    /// Look up the remembered peer for `kind`.
    ///
    /// A stored value that no longer parses (schema drift across app
    /// versions) reads as absent rather than failing startup.
    pub fn get(&self, kind: PeerKind) -> Result<Option<PeerIdentity>, crate::LinkError> {
        let raw = self
            .store
            .get(kind.storage_key())
            .map_err(|e| crate::LinkError::Storage(e.to_string()))?;
        Ok(raw.and_then(|json| serde_json::from_str(&json).ok()))
    }

    /// Drop the remembered peer for `kind`.
    pub fn forget(&self, kind: PeerKind) -> Result<(), crate::LinkError> {
        self.store
            .delete(kind.storage_key())
            .map_err(|e| crate::LinkError::Storage(e.to_string()))?;
        debug!(?kind, "peer identity forgotten");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
