use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identifier of one conversation, assigned by the surrounding
/// client. Opaque to this subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationId(pub String);

impl ConversationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Sender identity plus device id, the unit a cryptographic session is
/// keyed by.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SenderDeviceKey {
    pub identity: String,
    pub device_id: u32,
}

impl SenderDeviceKey {
    pub fn new(identity: impl Into<String>, device_id: u32) -> Self {
        Self {
            identity: identity.into(),
            device_id,
        }
    }
}

impl fmt::Display for SenderDeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.identity, self.device_id)
    }
}

/// Identifies one logical message for recovery purposes. A duplicate
/// inbound ciphertext for the same tuple must never produce a second
/// non-terminal failure record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DedupKey {
    pub conversation_id: ConversationId,
    pub sender_device_key: SenderDeviceKey,
    pub original_timestamp: u64,
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.conversation_id, self.sender_device_key, self.original_timestamp
        )
    }
}

/// Stable unique id of a persisted failure record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordId(pub String);

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
