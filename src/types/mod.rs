//! Data model for the recovery layer: addressing, failure records, inbound
//! envelopes, and the notification channels the conversation view consumes.

pub mod address;
pub mod envelope;
pub mod events;
pub mod record;

pub use address::{ConversationId, DedupKey, RecordId, SenderDeviceKey};
pub use envelope::MessageEnvelope;
pub use events::{IdentityChangeNotice, RecoveryEvents};
pub use record::{FailureCause, FailureRecord, LegacyCause, LegacyCauseKind, RecoveryState};
