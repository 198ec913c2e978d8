//! Session identity and the unit of session persistence.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{error::CryptoError, ratchet::RatchetState, x3dh::SessionInit};

/// Canonical identifier of the unordered pair of user ids.
///
/// Both endpoints derive the same id without coordination: the ids are
/// sorted lexicographically, length-prefixed (so no separator can be
/// smuggled inside a user id), and hashed under a domain tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    pub fn canonical(a: &str, b: &str) -> Self {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"mur-session-id-v1\x00");
        hasher.update(&(lo.len() as u32).to_le_bytes());
        hasher.update(lo.as_bytes());
        hasher.update(&(hi.len() as u32).to_le_bytes());
        hasher.update(hi.as_bytes());
        SessionId(hex::encode(hasher.finalize().as_bytes()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Rehydrate an id that was previously produced by [`canonical`] and
    /// stored verbatim. Performs no validation.
    ///
    /// [`canonical`]: SessionId::canonical
    pub fn from_hex_unchecked(hex: String) -> Self {
        SessionId(hex)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What the key store persists per session: the ratchet state, the init
/// block still awaiting attachment to the first outbound envelope, and the
/// peer identity key the session was keyed against.
#[derive(Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub state: RatchetState,
    pub pending_init: Option<SessionInit>,
    /// Peer's Ed25519 identity public key, pinned at session creation.
    /// A later bundle carrying a different key must not silently replace
    /// an existing session.
    pub peer_identity_pub: [u8; 32],
}

impl SessionRecord {
    pub fn new(
        state: RatchetState,
        pending_init: Option<SessionInit>,
        peer_identity_pub: [u8; 32],
    ) -> Self {
        Self { state, pending_init, peer_identity_pub }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CryptoError> {
        bincode::serialize(self).map_err(|e| CryptoError::State(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        bincode::deserialize(bytes).map_err(|e| CryptoError::State(e.to_string()))
    }
}
