//! Error taxonomy for the E2EE session engine.
//!
//! Variants correspond one-to-one with the kinds the session manager and
//! key manager surface to callers. Messages never include key material,
//! ciphertext, or plaintext — they are safe to log as-is.

/// Top-level result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Bad signature, AEAD open failure, skipped-key overflow, missing prekey.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// Malformed envelope, unknown required fields, base64 failure.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The peer appears to have re-initialized without a new X3DH bootstrap.
    #[error("peer reinitialized; await bootstrap")]
    PeerReset,

    /// A referenced prekey-id or session record is gone.
    #[error("state missing: {0}")]
    StateMissing(String),

    /// HTTP or stream I/O failed. Recoverable; caller should retry with backoff.
    #[error("transport error: {0}")]
    Transport(String),

    /// Vault or session file write/read failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// Caller input failed validation before any side effect occurred.
    #[error("validation error: {0}")]
    Validation(String),

    /// Vault password did not decrypt the stored ciphertext. The vault is
    /// left untouched; there is no silent-regenerate fallback.
    #[error("authentication failed: wrong vault password")]
    Auth,
}
