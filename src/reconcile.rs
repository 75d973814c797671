use crate::error::RecoveryError;
use crate::session::SessionPort;
use crate::storage::{FailureStore, RecordMutation};
use crate::types::{FailureCause, FailureRecord, RecordId, RecoveryState, SenderDeviceKey};
use bytes::Bytes;
use log::{info, warn};
use std::sync::Arc;

/// Turns an accepted resend response into the recovered message, exactly
/// once per original failure.
pub struct Reconciler {
    session: Arc<dyn SessionPort>,
    store: Arc<dyn FailureStore>,
}

impl Reconciler {
    pub fn new(session: Arc<dyn SessionPort>, store: Arc<dyn FailureStore>) -> Self {
        Self { session, store }
    }

    /// Decrypts the recovered ciphertext under the (possibly refreshed)
    /// session and replaces the placeholder in place: same `id`, state
    /// `Resolved`, plaintext stored, `original_timestamp` untouched so
    /// the message keeps its conversation position.
    ///
    /// A second decryption failure here marks the record permanently
    /// failed instead of re-entering the resend cycle.
    pub async fn reconcile(
        &self,
        record_id: &RecordId,
        sender: &SenderDeviceKey,
        ciphertext: &Bytes,
    ) -> Result<FailureRecord, RecoveryError> {
        match self.session.decrypt(ciphertext, sender).await {
            Ok(plaintext) => {
                let updated = self
                    .store
                    .update_failure_record(
                        record_id,
                        RecordMutation::state(RecoveryState::Resolved).with_plaintext(plaintext),
                    )
                    .await?;
                info!("[rec:{record_id}] recovered message reconciled");
                Ok(updated)
            }
            Err(e) => {
                warn!("[rec:{record_id}] recovered ciphertext failed to decrypt: {e}");
                let updated = self
                    .store
                    .update_failure_record(
                        record_id,
                        RecordMutation::state(RecoveryState::PermanentlyFailed)
                            .with_cause(FailureCause::PermanentFailure),
                    )
                    .await?;
                Ok(updated)
            }
        }
    }
}
