//! The per-message recovery state machine and its driver.
//!
//! Each failed message runs `Created -> AwaitingResend -> Resolved |
//! PermanentlyFailed` independently. The coordinator owns the per-tuple
//! lock arena, the retry accounting, the cancellable resend-timeout
//! timers, and the responder side that serves peers' resend requests from
//! the recent-outbound cache.

use crate::classify::{ClassifyContext, FailureClassifier};
use crate::config::{HIGH_RETRY_COUNT_THRESHOLD, MAX_HONORED_RETRY_COUNT, RecoveryConfig};
use crate::error::RecoveryError;
use crate::policy::{RecoveryAction, RecoveryPolicy};
use crate::protocol::{
    ControlMessage, RefusalReason, RequestNonce, ResendPayload, ResendProtocolHandler,
    ResendRequest, ResendResponse,
};
use crate::reconcile::Reconciler;
use crate::session::{DecryptError, SessionPort};
use crate::storage::{FailureStore, RecordMutation};
use crate::transport::ControlTransport;
use crate::types::{
    ConversationId, DedupKey, FailureCause, FailureRecord, IdentityChangeNotice, MessageEnvelope,
    RecordId, RecoveryEvents, RecoveryState, SenderDeviceKey,
};
use bytes::Bytes;
use chrono::Utc;
use dashmap::DashMap;
use log::{debug, error, info, warn};
use moka::future::Cache;
use rand::RngCore;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;

/// What became of one inbound envelope.
#[derive(Debug)]
pub enum ProcessOutcome {
    /// Decryption succeeded; no recovery involved.
    Decrypted(Bytes),
    /// The session was silently reset; no visible record exists.
    SessionReset,
    /// A placeholder record was persisted and a resend request sent.
    ResendRequested(FailureRecord),
    /// The failure is not recoverable; a permanent record was persisted.
    MarkedPermanent(FailureRecord),
    /// Duplicate of a message already tracked or resolved; ignored.
    Duplicate,
}

// Why a resend cycle ended without recovered content.
#[derive(Debug, Clone, Copy)]
enum CycleEnd {
    TimedOut,
    Refused(RefusalReason),
}

struct ActiveRecovery {
    record_id: RecordId,
    cause: FailureCause,
    retry_count: u32,
    timer: JoinHandle<()>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct OutboundKey {
    peer: SenderDeviceKey,
    original_timestamp: u64,
}

pub struct RecoveryCoordinator {
    session: Arc<dyn SessionPort>,
    store: Arc<dyn FailureStore>,
    transport: Arc<dyn ControlTransport>,
    protocol: ResendProtocolHandler,
    reconciler: Reconciler,
    policy: RecoveryPolicy,
    classifier: FailureClassifier,
    events: RecoveryEvents,
    config: RecoveryConfig,

    /// Per-tuple lock arena: operations that create or transition a
    /// record for one logical message are serialized; distinct tuples
    /// never contend.
    tuple_locks: Cache<DedupKey, Arc<Mutex<()>>>,
    /// Live, non-terminal recoveries.
    active: DashMap<DedupKey, ActiveRecovery>,
    /// Outbound ciphertext kept resendable for peers' resend requests.
    recent_outbound: Cache<OutboundKey, Bytes>,
    /// Incoming requests already answered, keyed by requester and
    /// correlation fields.
    served_requests: Cache<String, ()>,
    /// Sender/device pairs seen before, feeding classification context.
    seen_senders: Cache<SenderDeviceKey, ()>,

    unique_id: String,
    id_counter: AtomicU64,
}

impl RecoveryCoordinator {
    pub fn new(
        session: Arc<dyn SessionPort>,
        store: Arc<dyn FailureStore>,
        transport: Arc<dyn ControlTransport>,
        config: RecoveryConfig,
    ) -> Arc<Self> {
        let mut id_bytes = [0u8; 4];
        rand::rng().fill_bytes(&mut id_bytes);

        Arc::new(Self {
            reconciler: Reconciler::new(Arc::clone(&session), Arc::clone(&store)),
            protocol: ResendProtocolHandler::new(config.request_validity),
            policy: RecoveryPolicy::new(config.max_retries),
            classifier: FailureClassifier::new(config.max_protocol_version),
            events: RecoveryEvents::new(),
            tuple_locks: Cache::builder().max_capacity(10_000).build(),
            active: DashMap::new(),
            recent_outbound: Cache::builder()
                .max_capacity(config.recent_message_capacity)
                .time_to_live(config.recent_message_ttl)
                .build(),
            served_requests: Cache::builder()
                .max_capacity(10_000)
                .time_to_live(config.request_validity)
                .build(),
            seen_senders: Cache::builder().max_capacity(10_000).build(),
            unique_id: hex::encode(id_bytes),
            id_counter: AtomicU64::new(0),
            session,
            store,
            transport,
            config,
        })
    }

    /// Main entry point for inbound ciphertext of this payload kind.
    pub async fn process_incoming(
        self: &Arc<Self>,
        envelope: &MessageEnvelope,
    ) -> Result<ProcessOutcome, RecoveryError> {
        let previously_seen = self
            .seen_senders
            .contains_key(&envelope.sender_device_key);
        self.seen_senders
            .insert(envelope.sender_device_key.clone(), ())
            .await;

        match self
            .session
            .decrypt(&envelope.ciphertext, &envelope.sender_device_key)
            .await
        {
            Ok(plaintext) => Ok(ProcessOutcome::Decrypted(plaintext)),
            Err(e) => {
                self.handle_decrypt_failure(envelope, e, previously_seen)
                    .await
            }
        }
    }

    /// Runs classification, policy and the first state-machine step for a
    /// decryption that already failed elsewhere.
    pub async fn handle_decrypt_failure(
        self: &Arc<Self>,
        envelope: &MessageEnvelope,
        decrypt_error: DecryptError,
        previously_seen_sender: bool,
    ) -> Result<ProcessOutcome, RecoveryError> {
        let key = envelope.dedup_key();

        // Session signals are gathered before the tuple lock: SessionPort
        // may block on cryptographic storage and must not serialize
        // unrelated tuples.
        let has_session = self.session.has_session(&envelope.sender_device_key).await;
        let session_stale = has_session
            && self
                .session
                .is_session_stale(&envelope.sender_device_key)
                .await;

        let lock = self.tuple_lock(&key).await;
        let guard = lock.lock().await;

        if self.active.contains_key(&key) {
            debug!("[msg:{key}] duplicate ciphertext while recovery in flight, ignoring");
            return Ok(ProcessOutcome::Duplicate);
        }
        let existing = self.store.find_failure_record(&key).await?;
        let terminal_record_exists = existing.as_ref().is_some_and(|r| r.is_terminal());
        if existing.as_ref().is_some_and(|r| !r.is_terminal()) {
            // A persisted non-terminal record without a live machine, e.g.
            // after a restart mid-recovery. Never create a second record.
            debug!("[msg:{key}] non-terminal record already persisted, ignoring duplicate");
            return Ok(ProcessOutcome::Duplicate);
        }

        let ctx = ClassifyContext {
            has_session,
            session_stale,
            terminal_record_exists,
            previously_seen_sender,
        };
        let cause = self.classifier.classify(envelope, &decrypt_error, ctx);
        let action = self.policy.action_for(&cause, 0);
        debug!("[msg:{key}] classified {cause:?} -> {action:?} ({decrypt_error})");

        if action == RecoveryAction::ResetSessionSilently {
            // Silent path: Created -> Resolved with no record persisted.
            // Release the tuple lock before the reset I/O.
            drop(guard);
            self.session
                .reset_session(&envelope.sender_device_key)
                .await?;
            info!(
                "[msg:{key}] stale session for {} reset silently",
                envelope.sender_device_key
            );
            return Ok(ProcessOutcome::SessionReset);
        }

        match action {
            RecoveryAction::Ignore => Ok(ProcessOutcome::Duplicate),
            RecoveryAction::RequestResend => {
                let record = self.start_resend_cycle(envelope, &key, cause).await?;
                Ok(ProcessOutcome::ResendRequested(record))
            }
            RecoveryAction::MarkPermanent => {
                let record =
                    self.new_record(envelope, cause, RecoveryState::PermanentlyFailed, 0);
                self.store.create_failure_record(&record).await?;
                self.events.notify_record_changed(&record);
                warn!(
                    "[msg:{key}] permanently failed on classification: {:?}",
                    record.cause
                );
                Ok(ProcessOutcome::MarkedPermanent(record))
            }
            RecoveryAction::ResetSessionSilently => unreachable!("handled above"),
        }
    }

    /// Entry point for the transport's inbound control-message callback.
    pub async fn handle_control_message(
        self: &Arc<Self>,
        from: &SenderDeviceKey,
        message: ControlMessage,
    ) -> Result<(), RecoveryError> {
        match message {
            ControlMessage::ResendRequest(request) => {
                self.handle_resend_request(from, request).await
            }
            ControlMessage::ResendResponse(response) => {
                self.handle_resend_response(response).await
            }
        }
    }

    /// Requester side: validates the response against the outstanding
    /// request and either reconciles the record or treats a refusal as an
    /// immediately failed cycle.
    pub async fn handle_resend_response(
        self: &Arc<Self>,
        response: ResendResponse,
    ) -> Result<(), RecoveryError> {
        // Exact correlation match or drop. Accepting removes the
        // outstanding entry, fencing out the timeout path for this cycle.
        let Some(key) = self.protocol.accept_response(&response) else {
            return Ok(());
        };
        if let Some(entry) = self.active.get(&key) {
            entry.timer.abort();
        }

        match response.payload {
            ResendPayload::Ciphertext(ciphertext) => {
                self.reconcile_response(&key, ciphertext).await
            }
            ResendPayload::Refusal(reason) => {
                info!("[msg:{key}] resend refused: {reason:?}");
                self.advance_after_failed_cycle(&key, CycleEnd::Refused(reason))
                    .await
            }
        }
    }

    /// Cancels an in-flight recovery, e.g. because the conversation was
    /// deleted: pending timer aborted, outstanding request dropped, no
    /// orphaned state. The persisted record itself belongs to the storage
    /// collaborator, which owns deletion.
    pub async fn cancel_recovery(&self, key: &DedupKey) {
        let lock = self.tuple_lock(key).await;
        let _guard = lock.lock().await;
        self.protocol.cancel(key);
        self.remove_active(key);
        debug!("[msg:{key}] recovery cancelled");
    }

    /// Records a sender identity-key change. Informational: the record is
    /// terminal from birth and no recovery cycle starts. An in-flight
    /// recovery for the same sender is deliberately left untouched.
    pub async fn record_identity_change(
        &self,
        conversation_id: ConversationId,
        sender: SenderDeviceKey,
    ) -> Result<FailureRecord, RecoveryError> {
        let record = FailureRecord {
            id: self.next_record_id(),
            conversation_id: conversation_id.clone(),
            sender_device_key: sender.clone(),
            original_timestamp: Utc::now().timestamp_millis() as u64,
            cause: FailureCause::IdentityChanged,
            recovery_state: RecoveryState::Resolved,
            retry_count: 0,
            created_at: Utc::now(),
            plaintext: None,
        };
        self.store.create_failure_record(&record).await?;
        self.events.notify_record_changed(&record);
        self.events.notify_identity_changed(IdentityChangeNotice {
            conversation_id,
            sender_device_key: sender,
            record: Arc::new(record.clone()),
        });
        Ok(record)
    }

    /// Caches outbound ciphertext so a peer's resend request can later be
    /// served from it. Called by the sending pipeline after each send.
    pub async fn cache_outbound_message(
        &self,
        to: &SenderDeviceKey,
        original_timestamp: u64,
        ciphertext: Bytes,
    ) {
        self.recent_outbound
            .insert(
                OutboundKey {
                    peer: to.clone(),
                    original_timestamp,
                },
                ciphertext,
            )
            .await;
    }

    pub fn subscribe_record_changes(&self) -> broadcast::Receiver<Arc<FailureRecord>> {
        self.events.failure_record_changed.subscribe()
    }

    pub fn subscribe_identity_changes(&self) -> broadcast::Receiver<Arc<IdentityChangeNotice>> {
        self.events.identity_changed.subscribe()
    }

    // ---- internals ----

    async fn tuple_lock(&self, key: &DedupKey) -> Arc<Mutex<()>> {
        self.tuple_locks
            .get_with(key.clone(), async { Arc::new(Mutex::new(())) })
            .await
    }

    fn next_record_id(&self) -> RecordId {
        RecordId(format!(
            "{}-{}",
            self.unique_id,
            self.id_counter.fetch_add(1, Ordering::SeqCst)
        ))
    }

    fn new_record(
        &self,
        envelope: &MessageEnvelope,
        cause: FailureCause,
        recovery_state: RecoveryState,
        retry_count: u32,
    ) -> FailureRecord {
        FailureRecord {
            id: self.next_record_id(),
            conversation_id: envelope.conversation_id.clone(),
            sender_device_key: envelope.sender_device_key.clone(),
            original_timestamp: envelope.original_timestamp,
            cause,
            recovery_state,
            retry_count,
            created_at: Utc::now(),
            plaintext: None,
        }
    }

    // Runs under the tuple lock. Persist first: a failed create must
    // leave no active entry, no outstanding request, no timer.
    async fn start_resend_cycle(
        self: &Arc<Self>,
        envelope: &MessageEnvelope,
        key: &DedupKey,
        cause: FailureCause,
    ) -> Result<FailureRecord, RecoveryError> {
        let record = self.new_record(envelope, cause.clone(), RecoveryState::AwaitingResend, 0);
        self.store.create_failure_record(&record).await?;

        let request = self.protocol.build_request(key, 0);
        let timer = self.spawn_timeout(key.clone(), request.nonce);
        self.active.insert(
            key.clone(),
            ActiveRecovery {
                record_id: record.id.clone(),
                cause,
                retry_count: 0,
                timer,
            },
        );
        self.events.notify_record_changed(&record);
        info!(
            "[msg:{key}] awaiting resend from {} (nonce {})",
            key.sender_device_key, request.nonce
        );

        self.send_request(key, request).await;
        Ok(record)
    }

    // A failed send is not fatal: the timeout timer drives the next cycle.
    async fn send_request(&self, key: &DedupKey, request: ResendRequest) {
        if let Err(e) = self
            .transport
            .send_control_message(&key.sender_device_key, ControlMessage::ResendRequest(request))
            .await
        {
            warn!("[msg:{key}] failed to send resend request: {e}");
        }
    }

    fn spawn_timeout(self: &Arc<Self>, key: DedupKey, nonce: RequestNonce) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        let timeout = self.config.resend_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            coordinator.handle_resend_timeout(&key, nonce).await;
        })
    }

    async fn handle_resend_timeout(self: &Arc<Self>, key: &DedupKey, nonce: RequestNonce) {
        // Fence: only the path that removes the outstanding entry may
        // transition the record. A response that already claimed it wins.
        if !self.protocol.take_if_current(key, nonce) {
            return;
        }
        if let Err(e) = self.advance_after_failed_cycle(key, CycleEnd::TimedOut).await {
            error!("[msg:{key}] failed to advance recovery after timeout: {e}");
        }
    }

    // One resend cycle ended without recovered content: bump the retry
    // count and let the policy pick the next move.
    async fn advance_after_failed_cycle(
        self: &Arc<Self>,
        key: &DedupKey,
        end: CycleEnd,
    ) -> Result<(), RecoveryError> {
        let lock = self.tuple_lock(key).await;
        let _guard = lock.lock().await;

        let (record_id, cause, retry_count) = match self.active.get(key) {
            Some(entry) => (
                entry.record_id.clone(),
                entry.cause.clone(),
                entry.retry_count + 1,
            ),
            None => return Ok(()),
        };
        if retry_count > HIGH_RETRY_COUNT_THRESHOLD {
            warn!("[msg:{key}] high retry count ({retry_count})");
        }

        match self.policy.action_for(&cause, retry_count) {
            RecoveryAction::RequestResend => {
                // Persist the new count before the machine advances.
                let updated = self
                    .store
                    .update_failure_record(
                        &record_id,
                        RecordMutation::default().with_retry_count(retry_count),
                    )
                    .await?;
                let request = self.protocol.build_request(key, retry_count);
                let timer = self.spawn_timeout(key.clone(), request.nonce);
                if let Some(mut entry) = self.active.get_mut(key) {
                    entry.retry_count = retry_count;
                    entry.timer = timer;
                } else {
                    timer.abort();
                    self.protocol.cancel(key);
                    return Ok(());
                }
                self.events.notify_record_changed(&updated);
                info!(
                    "[msg:{key}] resend cycle {retry_count} after {end:?} (nonce {})",
                    request.nonce
                );
                self.send_request(key, request).await;
            }
            _ => {
                let updated = self
                    .store
                    .update_failure_record(
                        &record_id,
                        RecordMutation::state(RecoveryState::PermanentlyFailed)
                            .with_retry_count(retry_count)
                            .with_cause(FailureCause::PermanentFailure),
                    )
                    .await?;
                self.remove_active(key);
                self.events.notify_record_changed(&updated);
                warn!("[msg:{key}] permanently failed after {retry_count} failed cycles ({end:?})");
            }
        }
        Ok(())
    }

    async fn reconcile_response(
        self: &Arc<Self>,
        key: &DedupKey,
        ciphertext: Bytes,
    ) -> Result<(), RecoveryError> {
        let record_id = match self.active.get(key) {
            Some(entry) => entry.record_id.clone(),
            None => return Ok(()),
        };

        // Decrypt happens outside the tuple lock; the outstanding-request
        // fence already keeps competing transitions out.
        let updated = self
            .reconciler
            .reconcile(&record_id, &key.sender_device_key, &ciphertext)
            .await?;

        let lock = self.tuple_lock(key).await;
        let _guard = lock.lock().await;
        self.remove_active(key);
        drop(_guard);

        self.events.notify_record_changed(&updated);
        Ok(())
    }

    // Responder side: serve a peer's resend request from the
    // recent-outbound cache, or refuse.
    async fn handle_resend_request(
        self: &Arc<Self>,
        from: &SenderDeviceKey,
        request: ResendRequest,
    ) -> Result<(), RecoveryError> {
        // Duplicate requests are answered once; the entry API avoids a
        // check-then-insert race.
        let served_key = format!("{}:{}:{}", from, request.original_timestamp, request.nonce);
        let entry = self.served_requests.entry(served_key.clone()).or_insert(()).await;
        if !entry.is_fresh() {
            debug!(
                "ignoring duplicate resend request from {from} t={}",
                request.original_timestamp
            );
            return Ok(());
        }

        let payload = if request.retry_count >= MAX_HONORED_RETRY_COUNT {
            warn!(
                "refusing resend for {from} t={}: retry {} exceeds honored maximum",
                request.original_timestamp, request.retry_count
            );
            ResendPayload::Refusal(RefusalReason::RetryLimit)
        } else {
            let outbound_key = OutboundKey {
                peer: from.clone(),
                original_timestamp: request.original_timestamp,
            };
            match self.recent_outbound.get(&outbound_key).await {
                Some(ciphertext) => ResendPayload::Ciphertext(ciphertext),
                None => {
                    info!(
                        "no cached ciphertext for resend request from {from} t={}",
                        request.original_timestamp
                    );
                    ResendPayload::Refusal(RefusalReason::MessageGone)
                }
            }
        };

        let response = ResendResponse {
            sender_device_key: request.sender_device_key,
            original_timestamp: request.original_timestamp,
            nonce: request.nonce,
            payload,
        };
        if let Err(e) = self
            .transport
            .send_control_message(from, ControlMessage::ResendResponse(response))
            .await
        {
            // Forget the served marker so a duplicate of this request can
            // be answered after the transport recovers.
            self.served_requests.invalidate(&served_key).await;
            return Err(e.into());
        }
        Ok(())
    }

    fn remove_active(&self, key: &DedupKey) {
        if let Some((_, active)) = self.active.remove(key) {
            active.timer.abort();
        }
    }
}
