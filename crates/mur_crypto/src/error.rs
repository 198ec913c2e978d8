use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("AEAD authentication failed")]
    AuthFail,

    #[error("Invalid key material: {0}")]
    BadKey(String),

    #[error("System CSPRNG failure")]
    EntropyFail,

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Signature verification failed")]
    SignatureVerification,

    #[error("Invalid prekey bundle: {0}")]
    BadBundle(String),

    #[error("Prekey bundle expired ({age_days} days old)")]
    BundleExpired { age_days: i64 },

    #[error("Message already consumed")]
    Replay,

    #[error("Message would skip {requested} keys (bound {bound})")]
    TooManySkipped { requested: u32, bound: u32 },

    #[error("Session state error: {0}")]
    State(String),

    #[error("Base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),
}
