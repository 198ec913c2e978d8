use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying storage I/O — the only retryable class. The stored
    /// snapshot is unchanged when this surfaces.
    #[error("Store I/O error: {0}")]
    Io(#[from] sqlx::Error),

    /// At-rest unwrap failed: wrong password or tampered record. Fatal —
    /// never reported as a missing record.
    #[error("Store authentication failed — wrong password or corrupted data")]
    AuthFail,

    /// A record unwrapped cleanly but did not deserialise. Fatal.
    #[error("Corrupt store record: {0}")]
    Corrupt(String),

    #[error("Crypto error: {0}")]
    Crypto(#[from] mur_crypto::CryptoError),

    #[error("Migration error: {0}")]
    Migration(String),
}
