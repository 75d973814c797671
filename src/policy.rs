use crate::config::DEFAULT_MAX_RESEND_RETRIES;
use crate::types::FailureCause;

/// What the coordinator does about one classified failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    ResetSessionSilently,
    RequestResend,
    MarkPermanent,
    Ignore,
}

/// Pure mapping from cause and retry history to an action. No side
/// effects: identical `(cause, retry_count)` inputs always yield the
/// identical action.
#[derive(Debug, Clone, Copy)]
pub struct RecoveryPolicy {
    max_retries: u32,
}

impl RecoveryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn action_for(&self, cause: &FailureCause, retry_count: u32) -> RecoveryAction {
        match cause {
            // "Session merely stale" is not "message lost": the silent
            // path never produces a visible record.
            FailureCause::SessionStale => RecoveryAction::ResetSessionSilently,

            // Transient causes: the first request is not a retry, so the
            // budget covers the original request plus `max_retries`
            // further cycles.
            FailureCause::NoSession
            | FailureCause::InvalidKeyMaterial
            | FailureCause::MissingPreKey
            | FailureCause::MalformedCiphertext => {
                if retry_count <= self.max_retries {
                    RecoveryAction::RequestResend
                } else {
                    RecoveryAction::MarkPermanent
                }
            }

            // Never auto-resend across a trust or version boundary.
            FailureCause::UntrustedIdentityKey | FailureCause::UnsupportedProtocolVersion => {
                RecoveryAction::MarkPermanent
            }

            FailureCause::DuplicateMessage => RecoveryAction::Ignore,

            FailureCause::PermanentFailure => RecoveryAction::MarkPermanent,

            // IdentityChanged is recorded informationally by the
            // coordinator and never routed here; legacy causes exist only
            // in persisted data. Neither starts a recovery cycle.
            FailureCause::IdentityChanged | FailureCause::Legacy(_) => RecoveryAction::Ignore,
        }
    }
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RESEND_RETRIES)
    }
}
