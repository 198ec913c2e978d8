//! Prekey records
//!
//! Signed prekey (SPK): medium-lived X25519 pair, public half signed by the
//! identity key, rotated externally (weekly by default). One is active at a
//! time; superseded records are retained so sessions initiated against an
//! older bundle can still be answered.
//!
//! One-time prekey (OPK): short-lived X25519 pair, consumed at most once.
//! The private half is deleted from the store as soon as it contributes to a
//! successful agreement.
//!
//! Both are persisted whole (secret included) by the key store — the
//! responder side of the agreement needs the private halves until
//! consumption.

use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::ZeroizeOnDrop;

use crate::{error::CryptoError, identity::IdentityKeyPair};

/// X25519 prekey signed by the identity key. `key_id` is monotonically
/// increasing per user.
#[derive(Clone, Serialize, Deserialize, ZeroizeOnDrop)]
pub struct SignedPrekey {
    #[zeroize(skip)]
    pub key_id: u32,
    secret: [u8; 32],
    #[zeroize(skip)]
    pub public: [u8; 32],
    #[zeroize(skip)]
    pub signature: Vec<u8>,
    #[zeroize(skip)]
    pub created_at_ms: i64,
}

impl SignedPrekey {
    pub fn generate(
        identity: &IdentityKeyPair,
        key_id: u32,
        now_ms: i64,
    ) -> Result<Self, CryptoError> {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519Public::from(&secret).to_bytes();
        let signature = identity.sign(&public);
        Ok(Self {
            key_id,
            secret: secret.to_bytes(),
            public,
            signature,
            created_at_ms: now_ms,
        })
    }

    pub fn secret(&self) -> StaticSecret {
        StaticSecret::from(self.secret)
    }

    /// Verify a signed-prekey signature against an identity public key.
    pub fn verify_signature(
        identity_pub: &[u8; 32],
        public: &[u8; 32],
        signature: &[u8],
    ) -> Result<(), CryptoError> {
        IdentityKeyPair::verify(identity_pub, public, signature)
    }
}

/// One-time X25519 prekey. No signature of its own — it is covered by the
/// outer bundle signature when published.
#[derive(Clone, Serialize, Deserialize, ZeroizeOnDrop)]
pub struct OneTimePrekey {
    #[zeroize(skip)]
    pub key_id: u32,
    secret: [u8; 32],
    #[zeroize(skip)]
    pub public: [u8; 32],
}

impl OneTimePrekey {
    pub fn generate(key_id: u32) -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519Public::from(&secret).to_bytes();
        Self { key_id, secret: secret.to_bytes(), public }
    }

    /// Generate a batch with consecutive ids starting at `first_id`.
    pub fn batch(first_id: u32, count: u32) -> Vec<Self> {
        (0..count).map(|i| Self::generate(first_id + i)).collect()
    }

    pub fn secret(&self) -> StaticSecret {
        StaticSecret::from(self.secret)
    }
}
