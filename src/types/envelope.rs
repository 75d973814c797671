use super::address::{ConversationId, DedupKey, SenderDeviceKey};
use bytes::Bytes;

/// One inbound ciphertext as handed to the recovery layer by the
/// transport, after payload-kind routing. Attachment, payment and
/// group-management payloads share the transport but never reach this
/// type.
#[derive(Debug, Clone)]
pub struct MessageEnvelope {
    pub conversation_id: ConversationId,
    pub sender_device_key: SenderDeviceKey,
    /// Sender-assigned timestamp, used for ordering and dedup.
    pub original_timestamp: u64,
    pub protocol_version: u8,
    pub ciphertext: Bytes,
}

impl MessageEnvelope {
    pub fn dedup_key(&self) -> DedupKey {
        DedupKey {
            conversation_id: self.conversation_id.clone(),
            sender_device_key: self.sender_device_key.clone(),
            original_timestamp: self.original_timestamp,
        }
    }

    /// Field-level sanity used by classification: a usable envelope names
    /// its sender and carries a non-zero timestamp and a payload.
    pub fn is_malformed(&self) -> bool {
        self.sender_device_key.identity.is_empty()
            || self.original_timestamp == 0
            || self.ciphertext.is_empty()
    }
}
