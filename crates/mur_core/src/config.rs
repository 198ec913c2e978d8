//! Core tunables. One plain struct, carried explicitly by `ProtocolCore` —
//! no global configuration state.

use mur_proto::PaddingMode;

#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Skipped-message-key cache bound per session (FIFO eviction beyond).
    pub max_skipped: u32,
    /// Age after which cached skipped keys are pruned, in milliseconds.
    pub skipped_max_age_ms: i64,
    /// Maximum accepted age of a peer's signed prekey, in milliseconds.
    /// Zero disables the check.
    pub bundle_max_age_ms: i64,
    /// Plaintext padding policy for outbound messages.
    pub padding: PaddingMode,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            max_skipped: 1000,
            skipped_max_age_ms: 30 * 86_400_000,
            bundle_max_age_ms: 90 * 86_400_000,
            padding: PaddingMode::default(),
        }
    }
}
