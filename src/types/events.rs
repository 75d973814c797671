use super::address::{ConversationId, SenderDeviceKey};
use super::record::FailureRecord;
use std::sync::Arc;
use tokio::sync::broadcast;

// The size of the broadcast channel buffer.
const CHANNEL_CAPACITY: usize = 100;

/// Notice that a sender's identity key changed. Carried on its own
/// channel so trust changes are never conflated with decryption failures.
#[derive(Debug, Clone)]
pub struct IdentityChangeNotice {
    pub conversation_id: ConversationId,
    pub sender_device_key: SenderDeviceKey,
    pub record: Arc<FailureRecord>,
}

/// Broadcast channels the conversation view subscribes to.
///
/// `failure_record_changed` fires on every persisted record transition;
/// `identity_changed` additionally fires for identity-key changes.
#[derive(Debug)]
pub struct RecoveryEvents {
    pub failure_record_changed: broadcast::Sender<Arc<FailureRecord>>,
    pub identity_changed: broadcast::Sender<Arc<IdentityChangeNotice>>,
}

impl RecoveryEvents {
    pub fn new() -> Self {
        Self {
            failure_record_changed: broadcast::channel(CHANNEL_CAPACITY).0,
            identity_changed: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    pub(crate) fn notify_record_changed(&self, record: &FailureRecord) {
        // A send error only means nobody is subscribed right now.
        let _ = self.failure_record_changed.send(Arc::new(record.clone()));
    }

    pub(crate) fn notify_identity_changed(&self, notice: IdentityChangeNotice) {
        let _ = self.identity_changed.send(Arc::new(notice));
    }
}

impl Default for RecoveryEvents {
    fn default() -> Self {
        Self::new()
    }
}
