//! Prekey-bundle directory seam.
//!
//! The directory is an untrusted, out-of-scope collaborator: it moves
//! opaque bundle bytes around, and all verification happens locally after
//! fetch. The core only needs these two operations.

use std::collections::HashMap;
use std::sync::Mutex;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("Bundle directory unavailable: {0}")]
    Unavailable(String),
}

pub trait BundleDirectory: Send + Sync {
    fn publish_bundle(&self, user_id: &str, bundle: &[u8]) -> Result<(), DirectoryError>;

    /// `Ok(None)` means the directory has no bundle for this user.
    fn fetch_bundle(&self, user_id: &str) -> Result<Option<Vec<u8>>, DirectoryError>;
}

/// In-memory directory: the reference implementation, and the test double.
#[derive(Default)]
pub struct MemoryDirectory {
    bundles: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BundleDirectory for MemoryDirectory {
    fn publish_bundle(&self, user_id: &str, bundle: &[u8]) -> Result<(), DirectoryError> {
        let mut map = self
            .bundles
            .lock()
            .map_err(|_| DirectoryError::Unavailable("directory lock poisoned".into()))?;
        map.insert(user_id.to_string(), bundle.to_vec());
        Ok(())
    }

    fn fetch_bundle(&self, user_id: &str) -> Result<Option<Vec<u8>>, DirectoryError> {
        let map = self
            .bundles
            .lock()
            .map_err(|_| DirectoryError::Unavailable("directory lock poisoned".into()))?;
        Ok(map.get(user_id).cloned())
    }
}
