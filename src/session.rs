use crate::types::SenderDeviceKey;
use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Typed outcome of a failed decryption attempt, mirroring the error
/// codes the ratchet layer reports. Everything the recovery layer decides
/// hangs off these variants plus the contextual signals gathered around
/// the attempt.
#[derive(Debug, Error)]
pub enum DecryptError {
    #[error("no session for {0}")]
    NoSession(SenderDeviceKey),
    #[error("untrusted identity key for {0}")]
    UntrustedIdentity(SenderDeviceKey),
    #[error("missing prekey {0}")]
    MissingPreKey(u32),
    #[error("malformed ciphertext: {0}")]
    MalformedCiphertext(String),
    #[error("duplicate message (chain {chain}, counter {counter})")]
    DuplicateMessage { chain: u32, counter: u32 },
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),
    #[error("invalid key material: {0}")]
    InvalidKeyMaterial(String),
    #[error("underlying crypto error: {0}")]
    Crypto(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
#[error("session store failure: {0}")]
pub struct SessionError(#[from] pub anyhow::Error);

/// Narrow seam over the ratchet layer: decrypt, session presence and
/// freshness, and the reset that forces a fresh key exchange on next
/// contact. Calls may block on local cryptographic storage I/O.
#[async_trait]
pub trait SessionPort: Send + Sync {
    async fn decrypt(
        &self,
        ciphertext: &Bytes,
        sender: &SenderDeviceKey,
    ) -> Result<Bytes, DecryptError>;

    async fn has_session(&self, sender: &SenderDeviceKey) -> bool;

    /// Discards local ratchet state for the sender device.
    async fn reset_session(&self, sender: &SenderDeviceKey) -> Result<(), SessionError>;

    /// True if the session has not been rotated within the freshness
    /// policy.
    async fn is_session_stale(&self, sender: &SenderDeviceKey) -> bool;
}
