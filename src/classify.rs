use crate::session::DecryptError;
use crate::types::{FailureCause, MessageEnvelope};
use log::debug;

/// Contextual signals gathered around one failed decryption attempt.
/// Everything here is cheap to evaluate compared to interpreting
/// ambiguous cryptographic error codes.
#[derive(Debug, Clone, Copy)]
pub struct ClassifyContext {
    pub has_session: bool,
    pub session_stale: bool,
    /// A terminal record already exists for this envelope's dedup tuple.
    pub terminal_record_exists: bool,
    /// This sender/device pair has been seen before.
    pub previously_seen_sender: bool,
}

/// Maps one failed decryption attempt to exactly one [`FailureCause`].
#[derive(Debug, Clone, Copy)]
pub struct FailureClassifier {
    max_protocol_version: u8,
}

impl FailureClassifier {
    pub fn new(max_protocol_version: u8) -> Self {
        Self {
            max_protocol_version,
        }
    }

    /// First match wins, in a fixed order: unambiguous signals (duplicate
    /// detection, session presence, malformed fields, version) before
    /// ambiguous crypto error codes, so a message already resolved can
    /// never re-trigger recovery.
    pub fn classify(
        &self,
        envelope: &MessageEnvelope,
        error: &DecryptError,
        ctx: ClassifyContext,
    ) -> FailureCause {
        debug!(
            "classifying failure for {} (seen_sender={}, has_session={}): {error}",
            envelope.dedup_key(),
            ctx.previously_seen_sender,
            ctx.has_session
        );

        // Duplicate detection runs first: a message already resolved (or
        // permanently failed) must never re-trigger recovery, whatever
        // the current session state looks like.
        if ctx.terminal_record_exists {
            return FailureCause::DuplicateMessage;
        }
        if !ctx.has_session {
            return FailureCause::NoSession;
        }
        if ctx.session_stale && is_generic(error) {
            return FailureCause::SessionStale;
        }
        if matches!(error, DecryptError::UntrustedIdentity(_)) {
            return FailureCause::UntrustedIdentityKey;
        }
        if envelope.is_malformed() || matches!(error, DecryptError::MalformedCiphertext(_)) {
            return FailureCause::MalformedCiphertext;
        }
        if envelope.protocol_version > self.max_protocol_version
            || matches!(error, DecryptError::UnsupportedVersion(_))
        {
            return FailureCause::UnsupportedProtocolVersion;
        }
        if matches!(error, DecryptError::DuplicateMessage { .. }) {
            return FailureCause::DuplicateMessage;
        }
        if matches!(error, DecryptError::MissingPreKey(_)) {
            return FailureCause::MissingPreKey;
        }
        FailureCause::InvalidKeyMaterial
    }
}

// Error codes that carry no signal of their own; only these may be
// attributed to session staleness.
fn is_generic(error: &DecryptError) -> bool {
    matches!(
        error,
        DecryptError::InvalidKeyMaterial(_) | DecryptError::Crypto(_)
    )
}
