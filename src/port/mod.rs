use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

pub mod channel;
pub mod framed;

pub use channel::{channel_port_pair, ChannelPort};
pub use framed::{FrameTransport, FramedPort};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PortError {
    #[error("port disconnected")]
    Disconnected,
}

pub type PortResult<T> = std::result::Result<T, PortError>;

/// Minimum viable contract of a message-passing transport, modeled on the
/// worker-like `postMessage` surface.
///
/// Values delivered by `recv` are untyped: the transport may be shared with
/// unrelated traffic, and admission filtering happens above this layer.
#[async_trait]
pub trait Port: Send + Sync + 'static {
    /// Queue a message for delivery to the peer. Non-blocking.
    fn post(&self, message: Value) -> PortResult<()>;

    /// Next inbound value. `None` means the transport is gone for good.
    async fn recv(&self) -> Option<Value>;

    /// Force-terminate the peer, where the transport supports it.
    fn terminate(&self) {}
}
