//! Persisted user preferences.
//!
//! A thin, typed layer over the injected key-value store for the few
//! settings peer handlers and the upload relay reach for: the webhook
//! auth token and the last advertised name seen per peer kind. Keys are
//! opaque to the storage adapter.

use std::sync::Arc;

use crate::error::LinkError;
use crate::peer::PeerKind;
use crate::storage::KvStore;

const KEY_AUTH_TOKEN: &str = "prefs.webhook_auth_token";

fn last_name_key(kind: PeerKind) -> String {
    format!("prefs.last_peer_name.{}", kind.storage_key())
}

/// Typed accessors over the preference namespace.
#[derive(Clone)]
pub struct Preferences {
    store: Arc<dyn KvStore>,
}

impl Preferences {
    pub fn new(store: Arc<dyn KvStore>) -> Preferences {
        Preferences { store }
    }

    /// The auth token attached to webhook uploads when the caller
    /// supplies none.
    pub fn auth_token(&self) -> Result<Option<String>, LinkError> {
        self.store
            .get(KEY_AUTH_TOKEN)
            .map_err(|e| LinkError::Storage(e.to_string()))
    }

    pub fn set_auth_token(&self, token: &str) -> Result<(), LinkError> {
        self.store
            .put(KEY_AUTH_TOKEN, token)
            .map_err(|e| LinkError::Storage(e.to_string()))
    }

    pub fn clear_auth_token(&self) -> Result<(), LinkError> {
        self.store
            .delete(KEY_AUTH_TOKEN)
            .map_err(|e| LinkError::Storage(e.to_string()))
    }

    /// Last advertised name seen for a peer kind (display sugar for
    /// owners; the registry holds the authoritative identity).
    pub fn last_peer_name(&self, kind: PeerKind) -> Result<Option<String>, LinkError> {
        self.store
            .get(&last_name_key(kind))
            .map_err(|e| LinkError::Storage(e.to_string()))
    }

    pub fn set_last_peer_name(&self, kind: PeerKind, name: &str) -> Result<(), LinkError> {
        self.store
            .put(&last_name_key(kind), name)
            .map_err(|e| LinkError::Storage(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
