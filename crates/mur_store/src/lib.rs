//! mur_store — durable key and session store for the Murmur core
//!
//! # Encryption strategy
//! SQLite does not natively encrypt, so encryption is application-level:
//! every record is an opaque blob, optionally sealed with
//! ChaCha20-Poly1305 under a key derived from the user's password via
//! PBKDF2-HMAC-SHA256. Only ids and ordering columns are plaintext, to
//! keep queries efficient.
//!
//! # Durability
//! WAL + `synchronous=FULL`: a returned write has been committed. Each
//! public operation is a single statement or a single transaction, so a
//! crash leaves every record wholly present or wholly absent.
//!
//! # Migration
//! SQLx migrations in `migrations/` run on open.

pub mod db;
pub mod error;
pub mod vault;

pub use db::Store;
pub use error::StoreError;
pub use vault::Vault;
