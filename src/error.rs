use crate::session::SessionError;
use crate::storage::StorageError;
use crate::transport::TransportError;
use thiserror::Error;

/// Failure of one recovery operation. Storage errors are fatal for the
/// operation that hit them: the in-memory state machine is never advanced
/// past a state whose persistence failed.
#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Session(#[from] SessionError),
}
