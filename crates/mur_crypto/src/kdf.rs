//! Key derivation functions
//!
//! `hkdf_expand`            — HKDF-SHA256, generic expansion.
//! `kdf_rk`                 — root-key step of the DH ratchet.
//! `kdf_ck`                 — chain-key step (per-message key).
//! `store_key_from_password`— PBKDF2-HMAC-SHA256, derives the 32-byte key
//!                            that wraps records in the local key store.

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::error::CryptoError;

type HmacSha256 = Hmac<Sha256>;

/// Expand `ikm` (+ optional `salt`, `info`) into `output.len()` bytes.
pub fn hkdf_expand(
    ikm: &[u8],
    salt: Option<&[u8]>,
    info: &[u8],
    output: &mut [u8],
) -> Result<(), CryptoError> {
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    hk.expand(info, output)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))
}

/// KDF_RK: mix a DH output into the root key.
/// One 64-byte expansion with the previous root key as salt, split into
/// (new_root_key, chain_key).
pub fn kdf_rk(rk: &[u8; 32], dh_output: &[u8]) -> Result<([u8; 32], [u8; 32]), CryptoError> {
    let mut okm = Zeroizing::new([0u8; 64]);
    hkdf_expand(dh_output, Some(rk), b"rk", &mut *okm)?;

    let mut new_rk = [0u8; 32];
    let mut ck = [0u8; 32];
    new_rk.copy_from_slice(&okm[..32]);
    ck.copy_from_slice(&okm[32..]);
    Ok((new_rk, ck))
}

/// KDF_CK: advance a chain key and derive the message key for the current
/// counter. One-byte-tagged HMAC evaluations: 0x02 → next chain key,
/// 0x01 → message key.
pub fn kdf_ck(ck: &[u8; 32]) -> Result<([u8; 32], [u8; 32]), CryptoError> {
    let mut mac = HmacSha256::new_from_slice(ck)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    mac.update(&[0x02]);
    let next_ck: [u8; 32] = mac.finalize().into_bytes().into();

    let mut mac = HmacSha256::new_from_slice(ck)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    mac.update(&[0x01]);
    let mk: [u8; 32] = mac.finalize().into_bytes().into();

    Ok((next_ck, mk))
}

// ── Store key (PBKDF2) ───────────────────────────────────────────────────────

/// PBKDF2 iteration count for the at-rest store key.
pub const STORE_KDF_ITERATIONS: u32 = 210_000;

/// Fixed application-scoped salt for the store key derivation.
/// The store holds a sealed canary, so a wrong password fails closed.
pub const STORE_KDF_SALT: &[u8] = b"murmur-store-v1";

/// Derive the 32-byte store wrapping key from a user password.
pub fn store_key_from_password(password: &[u8]) -> Zeroizing<[u8; 32]> {
    let mut key = Zeroizing::new([0u8; 32]);
    pbkdf2_hmac::<Sha256>(password, STORE_KDF_SALT, STORE_KDF_ITERATIONS, &mut *key);
    key
}
