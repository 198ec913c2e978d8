//! Authenticated Encryption with Associated Data
//!
//! ChaCha20-Poly1305 (96-bit nonce). Key: 32 bytes. Nonce: 12 bytes
//! (random per call — message keys are single-use, so random nonces
//! carry no collision risk). Tag: 16 bytes.
//!
//! Nonce, ciphertext and tag are kept as distinct fields because the
//! outer envelope carries them separately.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::{bytes, error::CryptoError};

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// Output of a single seal operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sealed {
    pub nonce: [u8; NONCE_LEN],
    pub ciphertext: Vec<u8>,
    pub tag: [u8; TAG_LEN],
}

/// Encrypt `plaintext` under a 32-byte key with a fresh random nonce.
/// `aad` is authenticated but not encrypted.
pub fn seal(key: &[u8; KEY_LEN], plaintext: &[u8], aad: &[u8]) -> Result<Sealed, CryptoError> {
    let cipher = ChaCha20Poly1305::new_from_slice(key)
        .map_err(|_| CryptoError::BadKey("AEAD key must be 32 bytes".into()))?;

    let nonce: [u8; NONCE_LEN] = bytes::random_array()?;

    let mut combined = cipher
        .encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::AuthFail)?;

    // The aead crate appends the tag to the ciphertext; split it back out.
    let split = combined.len() - TAG_LEN;
    let mut tag = [0u8; TAG_LEN];
    tag.copy_from_slice(&combined[split..]);
    combined.truncate(split);

    Ok(Sealed { nonce, ciphertext: combined, tag })
}

/// Decrypt a sealed message. Any tampering with nonce, ciphertext, tag or
/// `aad` yields `AuthFail` — never partial plaintext.
pub fn open(key: &[u8; KEY_LEN], sealed: &Sealed, aad: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let cipher = ChaCha20Poly1305::new_from_slice(key)
        .map_err(|_| CryptoError::BadKey("AEAD key must be 32 bytes".into()))?;

    let mut combined = Vec::with_capacity(sealed.ciphertext.len() + TAG_LEN);
    combined.extend_from_slice(&sealed.ciphertext);
    combined.extend_from_slice(&sealed.tag);

    let plaintext = cipher
        .decrypt(
            Nonce::from_slice(&sealed.nonce),
            Payload { msg: &combined, aad },
        )
        .map_err(|_| CryptoError::AuthFail)?;

    Ok(Zeroizing::new(plaintext))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_roundtrip() {
        let key = [7u8; 32];
        let sealed = seal(&key, b"attack at dawn", b"header").unwrap();
        let pt = open(&key, &sealed, b"header").unwrap();
        assert_eq!(&*pt, b"attack at dawn");
    }

    #[test]
    fn wrong_aad_fails() {
        let key = [7u8; 32];
        let sealed = seal(&key, b"attack at dawn", b"header").unwrap();
        assert!(matches!(
            open(&key, &sealed, b"other"),
            Err(CryptoError::AuthFail)
        ));
    }

    #[test]
    fn any_single_byte_flip_fails() {
        let key = [3u8; 32];
        let sealed = seal(&key, b"payload bytes", b"ad").unwrap();

        for i in 0..sealed.ciphertext.len() {
            let mut t = sealed.clone();
            t.ciphertext[i] ^= 0x01;
            assert!(matches!(open(&key, &t, b"ad"), Err(CryptoError::AuthFail)));
        }
        for i in 0..TAG_LEN {
            let mut t = sealed.clone();
            t.tag[i] ^= 0x01;
            assert!(matches!(open(&key, &t, b"ad"), Err(CryptoError::AuthFail)));
        }
        for i in 0..NONCE_LEN {
            let mut t = sealed.clone();
            t.nonce[i] ^= 0x01;
            assert!(matches!(open(&key, &t, b"ad"), Err(CryptoError::AuthFail)));
        }
    }
}
