use crate::protocol::ControlMessage;
use crate::types::SenderDeviceKey;
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport is not connected")]
    NotConnected,
    #[error("send failed: {0}")]
    Send(#[from] anyhow::Error),
}

/// Outbound half of the control-message transport. Inbound delivery is a
/// plain call into
/// [`RecoveryCoordinator::handle_control_message`](crate::coordinator::RecoveryCoordinator::handle_control_message).
/// The wire encoding of control messages belongs to the transport
/// protocol definition, not this crate.
#[async_trait]
pub trait ControlTransport: Send + Sync {
    async fn send_control_message(
        &self,
        to: &SenderDeviceKey,
        message: ControlMessage,
    ) -> Result<(), TransportError>;
}
