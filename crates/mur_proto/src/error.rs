use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("Unsupported envelope version {0}")]
    UnsupportedVersion(u8),

    #[error("Malformed wire data: {0}")]
    Malformed(String),

    #[error("Invalid padding: {0}")]
    InvalidPadding(String),
}
