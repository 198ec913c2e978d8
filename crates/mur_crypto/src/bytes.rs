//! Byte-buffer helpers: CSPRNG fill, constant-time compare, secure wipe.

use rand::{rngs::OsRng, RngCore};
use zeroize::Zeroize;

use crate::error::CryptoError;

/// Fill `buf` from the operating system CSPRNG.
pub fn random_fill(buf: &mut [u8]) -> Result<(), CryptoError> {
    OsRng.try_fill_bytes(buf).map_err(|_| CryptoError::EntropyFail)
}

/// Fresh random fixed-size array.
pub fn random_array<const N: usize>() -> Result<[u8; N], CryptoError> {
    let mut out = [0u8; N];
    random_fill(&mut out)?;
    Ok(out)
}

/// Fresh random byte vector of length `n`.
pub fn random_bytes(n: usize) -> Result<Vec<u8>, CryptoError> {
    let mut out = vec![0u8; n];
    random_fill(&mut out)?;
    Ok(out)
}

/// Constant-time equality: length compare, then a full XOR fold over the
/// contents regardless of where they differ.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Overwrite `buf` with random bytes, then zero it, in that order.
/// Used before releasing buffers that held secret material.
pub fn wipe(buf: &mut [u8]) {
    // Best effort: if the CSPRNG is unavailable the zeroize pass still runs.
    let _ = random_fill(buf);
    buf.zeroize();
}
