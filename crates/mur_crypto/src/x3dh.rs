//! X3DH-style asynchronous key agreement.
//!
//! The initiator fetches the peer's published prekey bundle:
//!   IK_B  (identity, Ed25519 public, converted to X25519 for DH)
//!   SPK_B (signed prekey, X25519) + IK_B signature over SPK_B
//!   OPK_B (optional one-time prekey, X25519)
//!
//! and generates ONE ephemeral X25519 keypair EK_A. DH calculations, all
//! with that single ephemeral:
//!
//!   DH1 = DH(IK_A, SPK_B)
//!   DH2 = DH(EK_A, IK_B)
//!   DH3 = DH(EK_A, SPK_B)
//!   DH4 = DH(EK_A, OPK_B)   [if the bundle carried one]
//!
//!   SK = HKDF(salt = 0*32, ikm = 0xFF*32 || DH1 || DH2 || DH3 [|| DH4],
//!             info = "X3DH shared secret")
//!
//! Non-negotiable:
//!   - Both bundle signatures are verified before any DH is computed.
//!   - The responder mirrors the exact DH order from its stored secrets.
//!   - Every DH output is wiped as soon as it has been absorbed.
//!
//! SK seeds the Double Ratchet as the initial root key.

use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::{Zeroize, Zeroizing};

use crate::{
    error::CryptoError,
    identity::{ed25519_pub_to_x25519, IdentityKeyPair},
    kdf,
    prekey::{OneTimePrekey, SignedPrekey},
};

const X3DH_INFO: &[u8] = b"X3DH shared secret";

// ── Prekey bundle ────────────────────────────────────────────────────────────

/// One-time prekey entry as it appears inside a published bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleOneTime {
    pub key_id: u32,
    pub public: [u8; 32],
}

/// Published by each user, consumed by session initiators. Immutable once
/// emitted: the outer `signature` covers the canonical serialisation of
/// every other field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrekeyBundle {
    pub user_id: String,
    /// Ed25519 identity public key.
    pub identity_pub: [u8; 32],
    pub spk_id: u32,
    pub spk_pub: [u8; 32],
    /// Ed25519 signature over the raw SPK public bytes.
    pub spk_sig: Vec<u8>,
    pub spk_created_at_ms: i64,
    pub one_time: Option<BundleOneTime>,
    /// Ed25519 signature over `canonical_bytes()`.
    pub signature: Vec<u8>,
}

fn put_lp(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(bytes);
}

impl PrekeyBundle {
    /// Assemble and sign a bundle from stored records.
    pub fn assemble(
        user_id: &str,
        identity: &IdentityKeyPair,
        spk: &SignedPrekey,
        one_time: Option<&OneTimePrekey>,
    ) -> Self {
        let mut bundle = Self {
            user_id: user_id.to_string(),
            identity_pub: identity.public().0,
            spk_id: spk.key_id,
            spk_pub: spk.public,
            spk_sig: spk.signature.clone(),
            spk_created_at_ms: spk.created_at_ms,
            one_time: one_time.map(|k| BundleOneTime { key_id: k.key_id, public: k.public }),
            signature: Vec::new(),
        };
        bundle.signature = identity.sign(&bundle.canonical_bytes());
        bundle
    }

    /// Canonical serialisation of everything the outer signature covers.
    /// Length-prefixed, fixed field order; same inputs → same bytes.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128 + self.user_id.len());
        put_lp(&mut out, self.user_id.as_bytes());
        out.extend_from_slice(&self.identity_pub);
        out.extend_from_slice(&self.spk_id.to_le_bytes());
        out.extend_from_slice(&self.spk_pub);
        put_lp(&mut out, &self.spk_sig);
        out.extend_from_slice(&(self.spk_created_at_ms as u64).to_le_bytes());
        match &self.one_time {
            Some(opk) => {
                out.push(1);
                out.extend_from_slice(&opk.key_id.to_le_bytes());
                out.extend_from_slice(&opk.public);
            }
            None => out.push(0),
        }
        out
    }

    /// Receiver-side verification: outer signature, SPK signature, SPK age.
    /// `max_age_ms` of zero or less disables the age check.
    pub fn verify(&self, now_ms: i64, max_age_ms: i64) -> Result<(), CryptoError> {
        IdentityKeyPair::verify(&self.identity_pub, &self.canonical_bytes(), &self.signature)
            .map_err(|_| CryptoError::BadBundle("outer signature invalid".into()))?;

        SignedPrekey::verify_signature(&self.identity_pub, &self.spk_pub, &self.spk_sig)
            .map_err(|_| CryptoError::BadBundle("signed-prekey signature invalid".into()))?;

        if max_age_ms > 0 {
            let age_ms = now_ms.saturating_sub(self.spk_created_at_ms);
            if age_ms > max_age_ms {
                return Err(CryptoError::BundleExpired {
                    age_days: age_ms / 86_400_000,
                });
            }
        }
        Ok(())
    }
}

// ── Session-init block ───────────────────────────────────────────────────────

/// Rides inline in the first envelope of a session so the responder can
/// reconstruct SK: the initiator's own signed bundle (identity trust on
/// first use), the ephemeral public key, and which of the responder's
/// prekeys were consumed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInit {
    pub sender_bundle: PrekeyBundle,
    pub ek_pub: [u8; 32],
    /// The responder's signed prekey this agreement ran against.
    pub spk_id: u32,
    /// The responder's one-time prekey this agreement consumed, if any.
    pub opk_id: Option<u32>,
}

/// Initiator-side result: the shared secret plus the init block for the
/// first envelope.
pub struct InitiatorOutput {
    pub shared_secret: Zeroizing<[u8; 32]>,
    pub init: SessionInit,
}

// ── Key agreement ────────────────────────────────────────────────────────────

fn derive_sk(
    dh1: &[u8; 32],
    dh2: &[u8; 32],
    dh3: &[u8; 32],
    dh4: Option<&[u8; 32]>,
) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    let mut ikm = Zeroizing::new(Vec::with_capacity(32 * 5));
    ikm.extend_from_slice(&[0xFFu8; 32]); // domain-separation pad
    ikm.extend_from_slice(dh1);
    ikm.extend_from_slice(dh2);
    ikm.extend_from_slice(dh3);
    if let Some(dh4) = dh4 {
        ikm.extend_from_slice(dh4);
    }

    let mut sk = Zeroizing::new([0u8; 32]);
    kdf::hkdf_expand(&ikm, Some(&[0u8; 32]), X3DH_INFO, &mut *sk)?;
    Ok(sk)
}

/// Initiate a session against a peer's verified bundle.
///
/// `own_bundle` is the initiator's currently published bundle; it is embedded
/// in the returned init block so the responder can authenticate the sender's
/// identity key on first contact. `peer_bundle` MUST have passed
/// [`PrekeyBundle::verify`] — this function verifies it again defensively.
pub fn initiate(
    identity: &IdentityKeyPair,
    own_bundle: PrekeyBundle,
    peer_bundle: &PrekeyBundle,
    now_ms: i64,
    bundle_max_age_ms: i64,
) -> Result<InitiatorOutput, CryptoError> {
    peer_bundle.verify(now_ms, bundle_max_age_ms)?;

    let ik_a = identity.x25519_secret();
    let ik_b = ed25519_pub_to_x25519(&peer_bundle.identity_pub)?;
    let spk_b = X25519Public::from(peer_bundle.spk_pub);

    let ek_a = StaticSecret::random_from_rng(OsRng);
    let ek_a_pub = X25519Public::from(&ek_a);

    let mut dh1 = ik_a.diffie_hellman(&spk_b).to_bytes();
    let mut dh2 = ek_a.diffie_hellman(&ik_b).to_bytes();
    let mut dh3 = ek_a.diffie_hellman(&spk_b).to_bytes();
    let mut dh4 = peer_bundle
        .one_time
        .as_ref()
        .map(|opk| ek_a.diffie_hellman(&X25519Public::from(opk.public)).to_bytes());

    let sk = derive_sk(&dh1, &dh2, &dh3, dh4.as_ref());
    dh1.zeroize();
    dh2.zeroize();
    dh3.zeroize();
    if let Some(dh4) = dh4.as_mut() {
        dh4.zeroize();
    }
    let sk = sk?;

    Ok(InitiatorOutput {
        shared_secret: sk,
        init: SessionInit {
            sender_bundle: own_bundle,
            ek_pub: ek_a_pub.to_bytes(),
            spk_id: peer_bundle.spk_id,
            opk_id: peer_bundle.one_time.as_ref().map(|opk| opk.key_id),
        },
    })
}

/// Responder side: mirror the DH set from stored secrets.
///
/// The caller is responsible for having verified `init.sender_bundle`
/// (signature chain) and for looking up `spk` / `opk` by the ids the init
/// block names.
pub fn respond(
    identity: &IdentityKeyPair,
    spk: &SignedPrekey,
    opk: Option<&OneTimePrekey>,
    init: &SessionInit,
) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    if init.opk_id.is_some() != opk.is_some() {
        return Err(CryptoError::BadBundle(
            "one-time prekey presence mismatch".into(),
        ));
    }

    let ek_a = X25519Public::from(init.ek_pub);
    let sender_ik = ed25519_pub_to_x25519(&init.sender_bundle.identity_pub)?;
    let ik_b = identity.x25519_secret();
    let spk_secret = spk.secret();

    // Mirror the initiator's order exactly (DH is commutative per pair):
    //   DH1 = IK_A × SPK_B, DH2 = EK_A × IK_B, DH3 = EK_A × SPK_B
    let mut dh1 = spk_secret.diffie_hellman(&sender_ik).to_bytes();
    let mut dh2 = ik_b.diffie_hellman(&ek_a).to_bytes();
    let mut dh3 = spk_secret.diffie_hellman(&ek_a).to_bytes();
    let mut dh4 = opk.map(|k| k.secret().diffie_hellman(&ek_a).to_bytes());

    let sk = derive_sk(&dh1, &dh2, &dh3, dh4.as_ref());
    dh1.zeroize();
    dh2.zeroize();
    dh3.zeroize();
    if let Some(dh4) = dh4.as_mut() {
        dh4.zeroize();
    }
    sk
}
