use crate::config::RecoveryConfig;
use crate::coordinator::RecoveryCoordinator;
use crate::protocol::{ControlMessage, ResendRequest, ResendResponse};
use crate::session::{DecryptError, SessionError, SessionPort};
use crate::storage::{
    FailureStore, MemoryFailureStore, RecordMutation, Result as StorageResult, StorageError,
};
use crate::transport::{ControlTransport, TransportError};
use crate::types::{ConversationId, DedupKey, FailureRecord, MessageEnvelope, RecordId,
    SenderDeviceKey};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type DecryptOutcome = Box<dyn Fn() -> Result<Bytes, DecryptError> + Send>;

/// Scripted ratchet layer: decrypt outcomes are registered per ciphertext.
#[derive(Default)]
pub struct MockSessionPort {
    outcomes: Mutex<HashMap<Vec<u8>, DecryptOutcome>>,
    pub has_session: AtomicBool,
    pub session_stale: AtomicBool,
    pub resets: AtomicUsize,
    pub decrypt_calls: AtomicUsize,
}

impl MockSessionPort {
    pub fn new() -> Arc<Self> {
        let port = Arc::new(Self::default());
        port.has_session.store(true, Ordering::SeqCst);
        port
    }

    pub fn script_ok(&self, ciphertext: &[u8], plaintext: &'static [u8]) {
        self.outcomes
            .lock()
            .expect("Mutex should not be poisoned")
            .insert(
                ciphertext.to_vec(),
                Box::new(move || Ok(Bytes::from_static(plaintext))),
            );
    }

    pub fn script_err(
        &self,
        ciphertext: &[u8],
        make: impl Fn() -> DecryptError + Send + 'static,
    ) {
        self.outcomes
            .lock()
            .expect("Mutex should not be poisoned")
            .insert(ciphertext.to_vec(), Box::new(move || Err(make())));
    }
}

#[async_trait]
impl SessionPort for MockSessionPort {
    async fn decrypt(
        &self,
        ciphertext: &Bytes,
        _sender: &SenderDeviceKey,
    ) -> Result<Bytes, DecryptError> {
        self.decrypt_calls.fetch_add(1, Ordering::SeqCst);
        let outcomes = self.outcomes.lock().expect("Mutex should not be poisoned");
        match outcomes.get(ciphertext.as_ref()) {
            Some(outcome) => outcome(),
            None => Err(DecryptError::Crypto(anyhow::anyhow!(
                "unscripted ciphertext"
            ))),
        }
    }

    async fn has_session(&self, _sender: &SenderDeviceKey) -> bool {
        self.has_session.load(Ordering::SeqCst)
    }

    async fn reset_session(&self, _sender: &SenderDeviceKey) -> Result<(), SessionError> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn is_session_stale(&self, _sender: &SenderDeviceKey) -> bool {
        self.session_stale.load(Ordering::SeqCst)
    }
}

/// Transport that records every outgoing control message.
#[derive(Default)]
pub struct MockTransport {
    sent: Mutex<Vec<(SenderDeviceKey, ControlMessage)>>,
    pub fail_sends: AtomicBool,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().expect("Mutex should not be poisoned").len()
    }

    pub fn sent_requests(&self) -> Vec<ResendRequest> {
        self.sent
            .lock()
            .expect("Mutex should not be poisoned")
            .iter()
            .filter_map(|(_, message)| match message {
                ControlMessage::ResendRequest(request) => Some(request.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn sent_responses(&self) -> Vec<ResendResponse> {
        self.sent
            .lock()
            .expect("Mutex should not be poisoned")
            .iter()
            .filter_map(|(_, message)| match message {
                ControlMessage::ResendResponse(response) => Some(response.clone()),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl ControlTransport for MockTransport {
    async fn send_control_message(
        &self,
        to: &SenderDeviceKey,
        message: ControlMessage,
    ) -> Result<(), TransportError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        self.sent
            .lock()
            .expect("Mutex should not be poisoned")
            .push((to.clone(), message));
        Ok(())
    }
}

/// Store wrapper whose creates can be made to fail, for the
/// persistence-failure paths.
pub struct FlakyStore {
    inner: MemoryFailureStore,
    pub fail_creates: AtomicBool,
}

impl FlakyStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryFailureStore::new(),
            fail_creates: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl FailureStore for FlakyStore {
    async fn create_failure_record(&self, record: &FailureRecord) -> StorageResult<()> {
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(StorageError::Backend(anyhow::anyhow!(
                "injected create failure"
            )));
        }
        self.inner.create_failure_record(record).await
    }

    async fn update_failure_record(
        &self,
        id: &RecordId,
        mutation: RecordMutation,
    ) -> StorageResult<FailureRecord> {
        self.inner.update_failure_record(id, mutation).await
    }

    async fn find_failure_record(&self, key: &DedupKey) -> StorageResult<Option<FailureRecord>> {
        self.inner.find_failure_record(key).await
    }
}

pub fn sender(identity: &str, device_id: u32) -> SenderDeviceKey {
    SenderDeviceKey::new(identity, device_id)
}

pub fn envelope(conversation: &str, from: &SenderDeviceKey, ts: u64) -> MessageEnvelope {
    MessageEnvelope {
        conversation_id: ConversationId::new(conversation),
        sender_device_key: from.clone(),
        original_timestamp: ts,
        protocol_version: 3,
        ciphertext: Bytes::from_static(b"ciphertext-under-test"),
    }
}

/// Short timers so timeout scenarios run in test time.
pub fn fast_config() -> RecoveryConfig {
    RecoveryConfig {
        resend_timeout: Duration::from_millis(40),
        ..RecoveryConfig::default()
    }
}

pub struct Harness {
    pub coordinator: Arc<RecoveryCoordinator>,
    pub session: Arc<MockSessionPort>,
    pub transport: Arc<MockTransport>,
    pub store: Arc<MemoryFailureStore>,
}

pub fn harness(config: RecoveryConfig) -> Harness {
    let _ = env_logger::builder().is_test(true).try_init();
    let session = MockSessionPort::new();
    let transport = MockTransport::new();
    let store = Arc::new(MemoryFailureStore::new());
    let coordinator = RecoveryCoordinator::new(
        session.clone(),
        store.clone(),
        transport.clone(),
        config,
    );
    Harness {
        coordinator,
        session,
        transport,
        store,
    }
}

/// Polls until the condition holds or the deadline passes.
pub async fn wait_for(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("condition not met within deadline");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
