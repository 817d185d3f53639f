use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::warn;

use crate::port::{Port, PortError, PortResult};

/// Byte-frame transport contract for stream-shaped backends.
///
/// One frame carries one whole message; framing itself (length prefixes,
/// datagram boundaries) is the backend's concern.
#[async_trait]
pub trait FrameTransport: Send + Sync + 'static {
    async fn send_frame(&self, frame: Bytes) -> PortResult<()>;

    /// Next inbound frame. `None` means the transport is gone.
    async fn recv_frame(&self) -> Option<Bytes>;
}

/// Adapts a [`FrameTransport`] into a [`Port`] by carrying each message as
/// a JSON-encoded frame.
///
/// `post` must not block, so outbound frames go through a queue drained by
/// a writer task; the task exits when the adapter is dropped or the
/// transport rejects a frame.
pub struct FramedPort<T: FrameTransport> {
    inner: Arc<T>,
    outbound: mpsc::UnboundedSender<Bytes>,
}

impl<T: FrameTransport> FramedPort<T> {
    pub fn new(transport: T) -> Self {
        let inner = Arc::new(transport);
        let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();

        let writer = inner.clone();
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if writer.send_frame(frame).await.is_err() {
                    break;
                }
            }
        });

        Self {
            inner,
            outbound: tx,
        }
    }
}

#[async_trait]
impl<T: FrameTransport> Port for FramedPort<T> {
    fn post(&self, message: Value) -> PortResult<()> {
        let frame = serde_json::to_vec(&message).map_err(|_| PortError::Disconnected)?;
        self.outbound
            .send(Bytes::from(frame))
            .map_err(|_| PortError::Disconnected)
    }

    async fn recv(&self) -> Option<Value> {
        loop {
            let frame = self.inner.recv_frame().await?;
            match serde_json::from_slice(&frame) {
                Ok(value) => return Some(value),
                Err(err) => {
                    // not ours to fail on; skip and keep reading
                    warn!(error = %err, "dropping undecodable frame");
                }
            }
        }
    }
}

impl<T: FrameTransport> std::fmt::Debug for FramedPort<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramedPort").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::Mutex;

    struct MemFrames {
        tx: mpsc::UnboundedSender<Bytes>,
        rx: Mutex<mpsc::UnboundedReceiver<Bytes>>,
    }

    fn mem_frame_pair() -> (MemFrames, MemFrames) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        (
            MemFrames {
                tx: tx_a,
                rx: Mutex::new(rx_b),
            },
            MemFrames {
                tx: tx_b,
                rx: Mutex::new(rx_a),
            },
        )
    }

    #[async_trait]
    impl FrameTransport for MemFrames {
        async fn send_frame(&self, frame: Bytes) -> PortResult<()> {
            self.tx.send(frame).map_err(|_| PortError::Disconnected)
        }

        async fn recv_frame(&self) -> Option<Bytes> {
            self.rx.lock().await.recv().await
        }
    }

    #[tokio::test]
    async fn test_framed_round_trip() {
        let (a, b) = mem_frame_pair();
        let port_a = FramedPort::new(a);
        let port_b = FramedPort::new(b);

        port_a.post(json!({"x": [1, 2, 3]})).unwrap();
        assert_eq!(port_b.recv().await.unwrap(), json!({"x": [1, 2, 3]}));

        port_b.post(json!("reply")).unwrap();
        assert_eq!(port_a.recv().await.unwrap(), json!("reply"));
    }

    #[tokio::test]
    async fn test_bad_frames_are_skipped() {
        let (a, b) = mem_frame_pair();
        a.send_frame(Bytes::from_static(b"not json")).await.unwrap();

        let port_a = FramedPort::new(a);
        let port_b = FramedPort::new(b);
        port_a.post(json!(42)).unwrap();

        // the garbage frame is dropped, the valid one comes through
        assert_eq!(port_b.recv().await.unwrap(), json!(42));
    }
}
