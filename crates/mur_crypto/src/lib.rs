//! mur_crypto — Murmur E2EE core cryptographic engine
//!
//! # Design principles
//! - NO custom crypto; all primitives come from audited Rust crates.
//! - Secret material is zeroized on drop; message keys are single-use.
//! - Public APIs take and return opaque newtypes to prevent misuse.
//!
//! # Module layout
//! - `identity` — long-term Ed25519 identity keys + X25519 conversion
//! - `prekey`   — signed and one-time X25519 prekey records
//! - `x3dh`     — asynchronous key agreement over published prekey bundles
//! - `ratchet`  — Double Ratchet with DH steps + skipped message keys
//! - `session`  — canonical session ids and the persisted session record
//! - `aead`     — ChaCha20-Poly1305 seal/open
//! - `kdf`      — HKDF / HMAC chain steps / PBKDF2 store key
//! - `bytes`    — CSPRNG, constant-time compare, secure wipe
//! - `error`    — unified error type

pub mod aead;
pub mod bytes;
pub mod error;
pub mod identity;
pub mod kdf;
pub mod prekey;
pub mod ratchet;
pub mod session;
pub mod x3dh;

pub use error::CryptoError;
