//! mur_core — protocol orchestration for the Murmur E2EE core
//!
//! Ties the engine together: X3DH session establishment, Double Ratchet
//! message processing, durable session state, and the two byte-oriented
//! external interfaces the transport layer consumes:
//!
//! ```text
//! encrypt_outbound(peer_user_id, plaintext) → envelope bytes
//! decrypt_inbound(envelope bytes)           → (sender_user_id, plaintext)
//! ```
//!
//! The transport is a dumb pipe; the prekey-bundle directory is an
//! untrusted publish/fetch interface ([`BundleDirectory`]). Everything
//! else — identity creation, prekey rotation and replenishment, session
//! lifecycle — hangs off [`ProtocolCore`].

pub mod config;
pub mod directory;
pub mod error;
pub mod protocol;

pub use config::CoreConfig;
pub use directory::{BundleDirectory, DirectoryError, MemoryDirectory};
pub use error::ProtocolError;
pub use protocol::ProtocolCore;

// The types callers need alongside the core.
pub use mur_crypto::session::SessionId;
pub use mur_proto::PaddingMode;
pub use mur_store::{Store, StoreError};
