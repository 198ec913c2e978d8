//! Vault: the optional at-rest wrapping key.
//!
//! With a password, every stored value is sealed with ChaCha20-Poly1305
//! under a PBKDF2-derived key; without one, values are stored framed but
//! plain. Each blob carries a one-byte mode tag so a mismatch between the
//! open mode and the record (encrypted store opened without a password, or
//! the reverse) fails closed instead of yielding garbage.
//!
//! Blob layout: `0x00 | plaintext` or `0x01 | nonce:12 | tag:16 | ciphertext`.

use std::sync::Arc;

use zeroize::Zeroizing;

use mur_crypto::{aead, kdf};

use crate::error::StoreError;

const MODE_PLAIN: u8 = 0x00;
const MODE_SEALED: u8 = 0x01;

/// Store-scoped associated data for every wrapped value.
const STORE_AAD: &[u8] = b"murmur-store-v1";

/// Cheap-to-clone handle to the wrapping key (if any).
#[derive(Clone)]
pub struct Vault {
    key: Option<Arc<Zeroizing<[u8; 32]>>>,
}

impl Vault {
    /// No at-rest encryption.
    pub fn plaintext() -> Self {
        Self { key: None }
    }

    /// Derive the wrapping key from a user password (PBKDF2-HMAC-SHA256).
    pub fn from_password(password: &[u8]) -> Self {
        Self {
            key: Some(Arc::new(kdf::store_key_from_password(password))),
        }
    }

    pub fn is_keyed(&self) -> bool {
        self.key.is_some()
    }

    /// Wrap a value for storage.
    pub fn wrap(&self, plaintext: &[u8]) -> Result<Vec<u8>, StoreError> {
        match &self.key {
            None => {
                let mut out = Vec::with_capacity(1 + plaintext.len());
                out.push(MODE_PLAIN);
                out.extend_from_slice(plaintext);
                Ok(out)
            }
            Some(key) => {
                let sealed = aead::seal(key, plaintext, STORE_AAD)?;
                let mut out = Vec::with_capacity(1 + 12 + 16 + sealed.ciphertext.len());
                out.push(MODE_SEALED);
                out.extend_from_slice(&sealed.nonce);
                out.extend_from_slice(&sealed.tag);
                out.extend_from_slice(&sealed.ciphertext);
                Ok(out)
            }
        }
    }

    /// Unwrap a stored value. Any mismatch or authentication failure is
    /// `StoreError::AuthFail`.
    pub fn unwrap(&self, blob: &[u8]) -> Result<Zeroizing<Vec<u8>>, StoreError> {
        match (blob.first(), &self.key) {
            (Some(&MODE_PLAIN), None) => Ok(Zeroizing::new(blob[1..].to_vec())),
            (Some(&MODE_SEALED), Some(key)) => {
                if blob.len() < 1 + 12 + 16 {
                    return Err(StoreError::AuthFail);
                }
                let mut nonce = [0u8; 12];
                nonce.copy_from_slice(&blob[1..13]);
                let mut tag = [0u8; 16];
                tag.copy_from_slice(&blob[13..29]);
                let sealed = aead::Sealed {
                    nonce,
                    ciphertext: blob[29..].to_vec(),
                    tag,
                };
                aead::open(key, &sealed, STORE_AAD).map_err(|_| StoreError::AuthFail)
            }
            // Mode/key mismatch or unknown tag: fail closed.
            _ => Err(StoreError::AuthFail),
        }
    }
}
