use super::address::{ConversationId, DedupKey, RecordId, SenderDeviceKey};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};

/// Why a message could not be decrypted, or, for the informational
/// variants, what trust-state change occurred instead.
///
/// Persisted as a stable `u8` code point (see [`FailureCause::code`]) so
/// records written by older clients keep decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureCause {
    NoSession,
    UntrustedIdentityKey,
    InvalidKeyMaterial,
    MissingPreKey,
    MalformedCiphertext,
    DuplicateMessage,
    UnsupportedProtocolVersion,
    /// Not a decryption failure: the sender's identity key changed.
    /// Recorded informationally, never routed through the recovery policy.
    IdentityChanged,
    /// A session exists but has not rotated within the freshness policy.
    /// Handled by the silent-reset path; no visible record is persisted.
    SessionStale,
    /// The resend exchange timed out or was refused.
    PermanentFailure,
    /// Causes no longer producible by current logic, kept only because
    /// they may be persisted in legacy records. Display-only.
    Legacy(LegacyCause),
}

impl FailureCause {
    /// True for variants that describe a trust or history event rather
    /// than a recoverable decryption failure.
    pub fn is_informational(&self) -> bool {
        matches!(self, Self::IdentityChanged | Self::Legacy(_))
    }

    /// Stable persisted code point.
    pub fn code(&self) -> u8 {
        match self {
            Self::NoSession => 0,
            Self::UntrustedIdentityKey => 1,
            Self::InvalidKeyMaterial => 2,
            Self::MissingPreKey => 3,
            Self::MalformedCiphertext => 4,
            Self::DuplicateMessage => 5,
            Self::UnsupportedProtocolVersion => 6,
            Self::IdentityChanged => 7,
            Self::SessionStale => 8,
            Self::PermanentFailure => 9,
            Self::Legacy(legacy) => match legacy.kind() {
                LegacyCauseKind::ContactBlockOffer => 10,
                LegacyCauseKind::GroupCreationFailed => 11,
                LegacyCauseKind::SessionRefresh => 12,
            },
        }
    }

    /// Decodes a persisted code point. This is the only way a
    /// [`FailureCause::Legacy`] value comes into existence.
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::NoSession,
            1 => Self::UntrustedIdentityKey,
            2 => Self::InvalidKeyMaterial,
            3 => Self::MissingPreKey,
            4 => Self::MalformedCiphertext,
            5 => Self::DuplicateMessage,
            6 => Self::UnsupportedProtocolVersion,
            7 => Self::IdentityChanged,
            8 => Self::SessionStale,
            9 => Self::PermanentFailure,
            10 => Self::Legacy(LegacyCause::new(LegacyCauseKind::ContactBlockOffer)),
            11 => Self::Legacy(LegacyCause::new(LegacyCauseKind::GroupCreationFailed)),
            12 => Self::Legacy(LegacyCause::new(LegacyCauseKind::SessionRefresh)),
            _ => return None,
        })
    }
}

impl Serialize for FailureCause {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.code())
    }
}

impl<'de> Deserialize<'de> for FailureCause {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = u8::deserialize(deserializer)?;
        Self::from_code(code).ok_or_else(|| {
            de::Error::invalid_value(
                de::Unexpected::Unsigned(code.into()),
                &"a known failure cause code",
            )
        })
    }
}

/// Deprecated cause carried by records persisted by older versions. Has
/// no public constructor: new code cannot feed these back into the live
/// state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LegacyCause {
    kind: LegacyCauseKind,
}

impl LegacyCause {
    fn new(kind: LegacyCauseKind) -> Self {
        Self { kind }
    }

    pub fn kind(&self) -> LegacyCauseKind {
        self.kind
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum LegacyCauseKind {
    ContactBlockOffer,
    GroupCreationFailed,
    /// A legacy session reset performed in place of the resend protocol.
    SessionRefresh,
}

/// Lifecycle of one failure record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoveryState {
    Created,
    AwaitingResend,
    Resolved,
    PermanentlyFailed,
}

impl RecoveryState {
    /// Terminal states accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Resolved | Self::PermanentlyFailed)
    }
}

/// One decryption failure visible to the user, standing in for the
/// message until recovery resolves or permanently fails.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub id: RecordId,
    pub conversation_id: ConversationId,
    pub sender_device_key: SenderDeviceKey,
    /// Sender-assigned timestamp from the envelope. Preserved across
    /// reconciliation so the message keeps its conversation position.
    pub original_timestamp: u64,
    pub cause: FailureCause,
    pub recovery_state: RecoveryState,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    /// Recovered plaintext, present once a resend response reconciled
    /// the record.
    pub plaintext: Option<Bytes>,
}

impl FailureRecord {
    pub fn dedup_key(&self) -> DedupKey {
        DedupKey {
            conversation_id: self.conversation_id.clone(),
            sender_device_key: self.sender_device_key.clone(),
            original_timestamp: self.original_timestamp,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.recovery_state.is_terminal()
    }
}
