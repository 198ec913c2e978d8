//! Plaintext framing and padding.
//!
//! Outbound plaintexts are framed with the canonical length prefix and,
//! depending on the mode, grown to a fixed size class before encryption,
//! so ciphertext length reveals the class rather than the message. The
//! fill is drawn from the CSPRNG, keeping padded frames incompressible.
//!
//! Size classes (bytes): 256, 512, 1024, 4096, 16384, 65536. A frame
//! larger than the top class travels at its natural size.

use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};

use crate::{
    error::ProtoError,
    wire::{Reader, Writer},
};

/// Padding policy for outbound plaintexts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaddingMode {
    /// Frame only, no fill.
    None,
    /// Grow each frame to its size class.
    #[default]
    Buckets,
    /// Grow every frame to the top class (64 KiB).
    Maximum,
}

/// Size classes a padded frame may occupy.
const SIZE_CLASSES: [usize; 6] = [256, 512, 1024, 4096, 16384, 65536];

fn target_len(frame_len: usize, mode: PaddingMode) -> usize {
    match mode {
        PaddingMode::None => frame_len,
        PaddingMode::Maximum => frame_len.max(SIZE_CLASSES[SIZE_CLASSES.len() - 1]),
        PaddingMode::Buckets => {
            for class in SIZE_CLASSES {
                if frame_len <= class {
                    return class;
                }
            }
            frame_len
        }
    }
}

/// Frame `plaintext` (length-prefixed) and grow it per `mode`.
pub fn pad(plaintext: &[u8], mode: PaddingMode) -> Vec<u8> {
    let mut w = Writer::with_capacity(4 + plaintext.len());
    w.put_lp(plaintext);
    let mut frame = w.into_bytes();

    let target = target_len(frame.len(), mode);
    if target > frame.len() {
        let body = frame.len();
        frame.resize(target, 0);
        OsRng.fill_bytes(&mut frame[body..]);
    }
    frame
}

/// Recover the plaintext from a decrypted frame, discarding any fill.
pub fn unpad(frame: &[u8]) -> Result<Vec<u8>, ProtoError> {
    let mut r = Reader::new(frame);
    let plaintext = r
        .take_lp()
        .map_err(|_| ProtoError::InvalidPadding("declared length exceeds frame".into()))?;
    Ok(plaintext.to_vec())
}
