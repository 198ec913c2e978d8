//! mur_proto — wire types and canonical serialisation for the Murmur core
//!
//! All on-wire encodings are canonical length-prefixed binary: the same
//! inputs always produce the same bytes, which the bundle signature and
//! the envelope associated data depend on.
//!
//! # Modules
//! - `envelope` — the outer message envelope and the prekey-bundle codec
//! - `codec`    — plaintext padding (size buckets)
//! - `wire`     — length-prefixed reader/writer primitives
//! - `error`    — parse/padding errors

pub mod codec;
pub mod envelope;
pub mod error;
pub mod wire;

pub use codec::PaddingMode;
pub use envelope::Envelope;
pub use error::ProtoError;
