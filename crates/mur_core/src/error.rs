use thiserror::Error;

use mur_crypto::CryptoError;
use mur_proto::ProtoError;
use mur_store::StoreError;

use crate::directory::DirectoryError;

/// Unified error surface of the protocol core.
///
/// Propagation policy: cryptographic failures are fatal for the message and
/// surfaced; store I/O is retryable with the session at its previous
/// snapshot; parse and version failures are dropped by callers at the
/// protocol layer. No error path ever emits plaintext or writes partial
/// session state.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Proto(#[from] ProtoError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error("No session with {peer} and no inline session init")]
    SessionNotFound { peer: String },

    #[error("Simultaneous session open with {peer}; local session wins")]
    SessionConflict { peer: String },

    #[error("No published bundle found for {peer}")]
    BundleNotFound { peer: String },

    #[error("Local key material missing: {0}")]
    NotInitialized(String),
}

impl ProtocolError {
    /// Only storage I/O is retryable; everything else is final for the
    /// message (or the session) it occurred on.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProtocolError::Store(StoreError::Io(_)))
    }
}
