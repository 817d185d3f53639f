use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::Mutex;

use crate::port::{Port, PortError, PortResult};

/// In-process [`Port`] half backed by unbounded channels.
///
/// Delivery is FIFO and asynchronous: a posted message is observed by the
/// peer's `recv`, never synchronously during `post`.
pub struct ChannelPort {
    tx: mpsc::UnboundedSender<Value>,
    rx: Mutex<mpsc::UnboundedReceiver<Value>>,
}

/// Create a connected pair of in-process ports.
pub fn channel_port_pair() -> (ChannelPort, ChannelPort) {
    let (tx_a, rx_a) = mpsc::unbounded_channel();
    let (tx_b, rx_b) = mpsc::unbounded_channel();
    (
        ChannelPort {
            tx: tx_a,
            rx: Mutex::new(rx_b),
        },
        ChannelPort {
            tx: tx_b,
            rx: Mutex::new(rx_a),
        },
    )
}

#[async_trait]
impl Port for ChannelPort {
    fn post(&self, message: Value) -> PortResult<()> {
        self.tx.send(message).map_err(|_| PortError::Disconnected)
    }

    async fn recv(&self) -> Option<Value> {
        self.rx.lock().await.recv().await
    }
}

impl std::fmt::Debug for ChannelPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelPort").finish()
    }
}
