use std::time::Duration;

/// Resend retries beyond the original request, per failed message.
pub const DEFAULT_MAX_RESEND_RETRIES: u32 = 1;

/// How long to wait for a resend response before the timeout path runs.
pub const DEFAULT_RESEND_TIMEOUT: Duration = Duration::from_secs(60);

/// How long an issued request nonce stays acceptable.
pub const DEFAULT_REQUEST_VALIDITY: Duration = Duration::from_secs(5 * 60);

/// Retry counts above this are logged as anomalous.
pub const HIGH_RETRY_COUNT_THRESHOLD: u32 = 3;

/// Incoming resend requests whose own retry counter reaches this are
/// refused outright rather than served.
pub const MAX_HONORED_RETRY_COUNT: u32 = 5;

/// Highest envelope protocol version this client decrypts.
pub const MAX_SUPPORTED_PROTOCOL_VERSION: u8 = 3;

/// How long outbound ciphertext stays resendable for peers' requests.
pub const DEFAULT_RECENT_MESSAGE_TTL: Duration = Duration::from_secs(10 * 60);

const DEFAULT_RECENT_MESSAGE_CAPACITY: u64 = 1024;

/// Tunables for the recovery coordinator.
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    pub max_retries: u32,
    pub resend_timeout: Duration,
    pub request_validity: Duration,
    pub max_protocol_version: u8,
    pub recent_message_ttl: Duration,
    pub recent_message_capacity: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RESEND_RETRIES,
            resend_timeout: DEFAULT_RESEND_TIMEOUT,
            request_validity: DEFAULT_REQUEST_VALIDITY,
            max_protocol_version: MAX_SUPPORTED_PROTOCOL_VERSION,
            recent_message_ttl: DEFAULT_RECENT_MESSAGE_TTL,
            recent_message_capacity: DEFAULT_RECENT_MESSAGE_CAPACITY,
        }
    }
}
