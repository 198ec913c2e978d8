//! Outer message envelope — what the transport carries, opaquely.
//!
//! Version-1 wire layout (canonical, little-endian, u32 length prefixes):
//!
//! ```text
//! version:u8 | sender_user_id:lp
//! | dh_pub:32 | prev_chain_len:u32 | n:u32          (ratchet header)
//! | nonce:12 | ciphertext:lp | tag:16               (AEAD fields)
//! | init_present:u8
//! | [ sender_bundle:lp | ek_pub:32 | spk_id:u32
//!     | opk_present:u8 | [opk_id:u32] ]             (first message only)
//! | timestamp:u64 (ms since epoch, informational — NOT associated data)
//! ```
//!
//! The AEAD associated data is exactly the canonical ratchet header; the
//! outer sender id, init block and timestamp are authenticated only through
//! the bundle signature chain (trust on first use).

use mur_crypto::{
    aead::{Sealed, NONCE_LEN, TAG_LEN},
    ratchet::Header,
    x3dh::{BundleOneTime, PrekeyBundle, SessionInit},
};

use crate::{
    error::ProtoError,
    wire::{Reader, Writer},
};

pub const WIRE_VERSION: u8 = 1;

#[derive(Debug, Clone)]
pub struct Envelope {
    pub sender_user_id: String,
    pub header: Header,
    pub sealed: Sealed,
    pub init: Option<SessionInit>,
    pub timestamp_ms: u64,
}

impl Envelope {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::with_capacity(128 + self.sealed.ciphertext.len());
        w.put_u8(WIRE_VERSION);
        w.put_lp(self.sender_user_id.as_bytes());

        w.put_fixed(&self.header.dh_pub);
        w.put_u32(self.header.prev_chain_len);
        w.put_u32(self.header.n);

        w.put_fixed(&self.sealed.nonce);
        w.put_lp(&self.sealed.ciphertext);
        w.put_fixed(&self.sealed.tag);

        match &self.init {
            Some(init) => {
                w.put_u8(1);
                w.put_lp(&encode_bundle(&init.sender_bundle));
                w.put_fixed(&init.ek_pub);
                w.put_u32(init.spk_id);
                match init.opk_id {
                    Some(id) => {
                        w.put_u8(1);
                        w.put_u32(id);
                    }
                    None => w.put_u8(0),
                }
            }
            None => w.put_u8(0),
        }

        w.put_u64(self.timestamp_ms);
        w.into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtoError> {
        let mut r = Reader::new(bytes);

        let version = r.take_u8()?;
        if version != WIRE_VERSION {
            return Err(ProtoError::UnsupportedVersion(version));
        }

        let sender_user_id = String::from_utf8(r.take_lp()?.to_vec())
            .map_err(|_| ProtoError::Malformed("sender id is not UTF-8".into()))?;

        let header = Header {
            dh_pub: r.take_fixed::<32>()?,
            prev_chain_len: r.take_u32()?,
            n: r.take_u32()?,
        };

        let sealed = Sealed {
            nonce: r.take_fixed::<NONCE_LEN>()?,
            ciphertext: r.take_lp()?.to_vec(),
            tag: r.take_fixed::<TAG_LEN>()?,
        };

        let init = match r.take_u8()? {
            0 => None,
            1 => {
                let sender_bundle = decode_bundle(r.take_lp()?)?;
                let ek_pub = r.take_fixed::<32>()?;
                let spk_id = r.take_u32()?;
                let opk_id = match r.take_u8()? {
                    0 => None,
                    1 => Some(r.take_u32()?),
                    v => {
                        return Err(ProtoError::Malformed(format!(
                            "bad one-time-prekey flag {v}"
                        )))
                    }
                };
                Some(SessionInit { sender_bundle, ek_pub, spk_id, opk_id })
            }
            v => return Err(ProtoError::Malformed(format!("bad init flag {v}"))),
        };

        let timestamp_ms = r.take_u64()?;
        r.finish()?;

        Ok(Self { sender_user_id, header, sealed, init, timestamp_ms })
    }
}

// ── Bundle codec ─────────────────────────────────────────────────────────────

/// Wire form of a prekey bundle: the canonical signed bytes followed by the
/// length-prefixed outer signature. Decoding then re-encoding reproduces the
/// exact canonical bytes the signature covers.
pub fn encode_bundle(bundle: &PrekeyBundle) -> Vec<u8> {
    let mut w = Writer::new();
    w.put_fixed(&bundle.canonical_bytes());
    w.put_lp(&bundle.signature);
    w.into_bytes()
}

pub fn decode_bundle(bytes: &[u8]) -> Result<PrekeyBundle, ProtoError> {
    let mut r = Reader::new(bytes);

    let user_id = String::from_utf8(r.take_lp()?.to_vec())
        .map_err(|_| ProtoError::Malformed("bundle user id is not UTF-8".into()))?;
    let identity_pub = r.take_fixed::<32>()?;
    let spk_id = r.take_u32()?;
    let spk_pub = r.take_fixed::<32>()?;
    let spk_sig = r.take_lp()?.to_vec();
    let spk_created_at_ms = r.take_u64()? as i64;

    let one_time = match r.take_u8()? {
        0 => None,
        1 => Some(BundleOneTime {
            key_id: r.take_u32()?,
            public: r.take_fixed::<32>()?,
        }),
        v => return Err(ProtoError::Malformed(format!("bad bundle flag {v}"))),
    };

    let signature = r.take_lp()?.to_vec();
    r.finish()?;

    Ok(PrekeyBundle {
        user_id,
        identity_pub,
        spk_id,
        spk_pub,
        spk_sig,
        spk_created_at_ms,
        one_time,
        signature,
    })
}
