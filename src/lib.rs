//! Decryption-failure classification and session recovery for an
//! end-to-end encrypted messaging client.
//!
//! When inbound ciphertext cannot be decrypted under the locally held
//! session, this crate decides what happened, what to do about it, and how
//! to durably record the outcome:
//! - `classify`: maps a failed attempt plus contextual signals to one cause
//! - `policy`: pure cause + retry history -> recovery action
//! - `coordinator`: the per-message state machine, timers and retry counts
//! - `protocol`: resend-request/response control messages and correlation
//! - `reconcile`: replaces the placeholder record with recovered content
//!
//! Cryptography, durable storage and the wire transport are collaborators
//! behind the `session`, `storage` and `transport` seams.

pub mod classify;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod policy;
pub mod protocol;
pub mod reconcile;
pub mod session;
pub mod storage;
pub mod transport;
pub mod types;

#[cfg(test)]
mod test_utils;

pub use config::RecoveryConfig;
pub use coordinator::{ProcessOutcome, RecoveryCoordinator};
pub use error::RecoveryError;
pub use policy::{RecoveryAction, RecoveryPolicy};
pub use types::{FailureCause, FailureRecord, MessageEnvelope, RecoveryState};
