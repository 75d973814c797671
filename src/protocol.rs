//! Control messages of the resend protocol and the outstanding-request
//! table that correlates responses to the requests they answer.

use crate::types::{DedupKey, SenderDeviceKey};
use bytes::Bytes;
use dashmap::DashMap;
use log::{debug, warn};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

/// Correlation nonce binding a resend response to the request it answers.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestNonce([u8; 16]);

impl RequestNonce {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand::rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Debug for RequestNonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RequestNonce({})", hex::encode(self.0))
    }
}

impl fmt::Display for RequestNonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Why a responder declined to resend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefusalReason {
    /// The responder no longer holds the original ciphertext.
    MessageGone,
    /// The requester exceeded the retry budget the responder honors.
    RetryLimit,
    Unspecified,
}

/// Asks the original sender to resend one message that failed to decrypt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResendRequest {
    pub sender_device_key: SenderDeviceKey,
    pub original_timestamp: u64,
    pub nonce: RequestNonce,
    /// Failed cycles the requester has been through for this message.
    /// Responders refuse once this crosses the honored maximum.
    pub retry_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResendPayload {
    Ciphertext(Bytes),
    Refusal(RefusalReason),
}

/// Answer to a [`ResendRequest`], echoing its correlation fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResendResponse {
    pub sender_device_key: SenderDeviceKey,
    pub original_timestamp: u64,
    pub nonce: RequestNonce,
    pub payload: ResendPayload,
}

/// Kind-discriminated control message as handed to and by the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControlMessage {
    ResendRequest(ResendRequest),
    ResendResponse(ResendResponse),
}

// Responses carry no conversation id, so outstanding requests are keyed
// by the wire-visible correlation fields and the full dedup tuple is
// recovered from the entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CorrelationKey {
    sender_device_key: SenderDeviceKey,
    original_timestamp: u64,
}

impl CorrelationKey {
    fn of(key: &DedupKey) -> Self {
        Self {
            sender_device_key: key.sender_device_key.clone(),
            original_timestamp: key.original_timestamp,
        }
    }
}

#[derive(Debug, Clone)]
struct OutstandingRequest {
    dedup_key: DedupKey,
    nonce: RequestNonce,
    issued_at: Instant,
}

/// Builds outgoing resend requests and validates incoming responses
/// against the outstanding-request table.
///
/// Accepting a response removes its entry atomically, so the timeout path
/// and the response path can never both act on the same request: whichever
/// takes the entry performs the transition, the other becomes a no-op.
pub struct ResendProtocolHandler {
    outstanding: DashMap<CorrelationKey, OutstandingRequest>,
    validity_window: Duration,
}

impl ResendProtocolHandler {
    pub fn new(validity_window: Duration) -> Self {
        Self {
            outstanding: DashMap::new(),
            validity_window,
        }
    }

    /// Issues a fresh nonce bound to the tuple and records the request as
    /// outstanding, superseding any earlier request for the same tuple.
    pub fn build_request(&self, key: &DedupKey, retry_count: u32) -> ResendRequest {
        let nonce = RequestNonce::generate();
        self.outstanding.insert(
            CorrelationKey::of(key),
            OutstandingRequest {
                dedup_key: key.clone(),
                nonce,
                issued_at: Instant::now(),
            },
        );
        ResendRequest {
            sender_device_key: key.sender_device_key.clone(),
            original_timestamp: key.original_timestamp,
            nonce,
            retry_count,
        }
    }

    /// Accepts the response iff `(sender_device_key, original_timestamp,
    /// nonce)` exactly matches an outstanding request still inside its
    /// validity window, removing the entry. Everything else is a protocol
    /// anomaly: dropped, logged, never fatal.
    pub fn accept_response(&self, response: &ResendResponse) -> Option<DedupKey> {
        let key = CorrelationKey {
            sender_device_key: response.sender_device_key.clone(),
            original_timestamp: response.original_timestamp,
        };
        let now = Instant::now();
        let removed = self.outstanding.remove_if(&key, |_, outstanding| {
            outstanding.nonce == response.nonce
                && now.duration_since(outstanding.issued_at) <= self.validity_window
        });
        match removed {
            Some((_, outstanding)) => {
                debug!(
                    "accepted resend response for {} (nonce {})",
                    outstanding.dedup_key, response.nonce
                );
                Some(outstanding.dedup_key)
            }
            None => {
                warn!(
                    "dropping resend response from {} t={} (nonce {}): no matching outstanding request",
                    response.sender_device_key, response.original_timestamp, response.nonce
                );
                None
            }
        }
    }

    /// Timeout-path fence: removes the outstanding entry iff it still
    /// carries the given nonce. Returns false when a response (or a newer
    /// request) already claimed it.
    pub fn take_if_current(&self, key: &DedupKey, nonce: RequestNonce) -> bool {
        self.outstanding
            .remove_if(&CorrelationKey::of(key), |_, outstanding| {
                outstanding.nonce == nonce && outstanding.dedup_key == *key
            })
            .is_some()
    }

    /// Drops any outstanding request for the tuple.
    pub fn cancel(&self, key: &DedupKey) {
        self.outstanding.remove(&CorrelationKey::of(key));
    }

    pub fn has_outstanding(&self, key: &DedupKey) -> bool {
        self.outstanding.contains_key(&CorrelationKey::of(key))
    }
}
