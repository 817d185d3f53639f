use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::debug;

use crate::close::{CloseController, CloseSubscription};
use crate::error::{BusError, BusResult};
use crate::handshake::{self, Role, DEFAULT_TIMEOUT};
use crate::message::{Payload, FUNC_CLOSE, FUNC_HANDSHAKE};
use crate::port::{Port, PortResult};

/// Side effect applied when an endpoint closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClosePolicy {
    /// No transport side effect.
    #[default]
    None,
    /// Force-terminate the underlying transport (worker-backed peers).
    Terminate,
    /// Tell the peer to close via the reserved close message, for peers
    /// that can only be informed, not terminated (window-backed peers).
    NotifyPeer,
}

/// Options for establishing an endpoint.
#[derive(Debug, Clone, Default)]
pub struct EndOptions {
    /// Time allowed for the handshake; `None` means the 60 second default.
    pub timeout: Option<Duration>,
    pub close_policy: ClosePolicy,
}

type SendFn = Box<dyn Fn(&Payload) -> PortResult<()> + Send + Sync>;

struct EndInner {
    send_fn: SendFn,
    closer: CloseController,
}

/// One side's live handle to an established connection.
///
/// Cloning yields another handle to the same endpoint.
#[derive(Clone)]
pub struct End {
    inner: Arc<EndInner>,
}

impl End {
    /// Send a payload to the peer. After `close`, this fails with `Closed`
    /// without touching the transport.
    pub fn send(&self, payload: &Payload) -> BusResult<()> {
        if self.inner.closer.is_closed() {
            return Err(BusError::closed());
        }
        (self.inner.send_fn)(payload).map_err(|_| BusError::closed())
    }

    /// Close this endpoint. Idempotent; subscribers run exactly once.
    pub fn close(&self) {
        self.inner.closer.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closer.is_closed()
    }

    /// Subscribe to the close event. See [`CloseController::on_close`].
    pub fn on_close(&self, callback: impl FnOnce() + Send + 'static) -> CloseSubscription {
        self.inner.closer.on_close(callback)
    }

    pub(crate) fn closer(&self) -> &CloseController {
        &self.inner.closer
    }
}

impl std::fmt::Debug for End {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("End")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// An established endpoint plus the stream of admitted inbound payloads.
pub struct Established {
    pub end: End,
    pub(crate) inbox: mpsc::UnboundedReceiver<Payload>,
}

/// Wrap a transport into an [`End`], running the handshake first.
///
/// Once established, a single intake task owns the transport's receive
/// side and demultiplexes: stray hellos are ignored, a peer close request
/// closes the endpoint, and everything else admitted by the wire filter
/// lands in the inbox. The task exits when the endpoint closes or the
/// transport goes away.
pub async fn establish<P: Port>(port: P, role: Role, options: EndOptions) -> BusResult<Established> {
    let port: Arc<dyn Port> = Arc::new(port);
    let timeout = options.timeout.unwrap_or(DEFAULT_TIMEOUT);

    handshake::run(&*port, role, timeout).await?;

    let closer = CloseController::new();
    match options.close_policy {
        ClosePolicy::None => {}
        ClosePolicy::Terminate => {
            let port = port.clone();
            let _ = closer.on_close(move || port.terminate());
        }
        ClosePolicy::NotifyPeer => {
            // posts to the port directly: the endpoint is already flagged
            // closed when subscribers run, so End::send would refuse
            let port = port.clone();
            let _ = closer.on_close(move || {
                let _ = port.post(Payload::close_request().to_wire());
            });
        }
    }

    let (tx, rx) = mpsc::unbounded_channel();
    let pump_port = port.clone();
    let pump_closer = closer.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = pump_closer.closed() => break,
                value = pump_port.recv() => {
                    let Some(value) = value else {
                        // transport gone, treat as peer-initiated close
                        pump_closer.close();
                        break;
                    };
                    let Some(payload) = Payload::from_wire(&value) else {
                        continue;
                    };
                    if payload.is_internal() {
                        if payload.function_id == FUNC_HANDSHAKE {
                            // stray retries in flight are expected
                            continue;
                        }
                        if payload.function_id == FUNC_CLOSE {
                            pump_closer.close();
                            break;
                        }
                    }
                    if tx.send(payload).is_err() {
                        debug!("inbox dropped, stopping intake");
                        break;
                    }
                }
            }
        }
    });

    let send_port = port;
    let end = End {
        inner: Arc::new(EndInner {
            send_fn: Box::new(move |payload| send_port.post(payload.to_wire())),
            closer,
        }),
    };

    Ok(Established { end, inbox: rx })
}

/// Two cross-wired in-context endpoints sharing one close controller, for
/// sides that turn out to live in the same process. No handshake is
/// needed; closing either end closes both. The observable contract is
/// identical to a transport-backed endpoint.
pub fn linked_pair() -> (Established, Established) {
    let closer = CloseController::new();
    let (tx_a, rx_a) = mpsc::unbounded_channel();
    let (tx_b, rx_b) = mpsc::unbounded_channel();

    let make = |tx: mpsc::UnboundedSender<Payload>, inbox: mpsc::UnboundedReceiver<Payload>| {
        Established {
            end: End {
                inner: Arc::new(EndInner {
                    send_fn: Box::new(move |payload: &Payload| {
                        tx.send(payload.clone())
                            .map_err(|_| crate::port::PortError::Disconnected)
                    }),
                    closer: closer.clone(),
                }),
            },
            inbox,
        }
    };

    // a's sends land in b's inbox and vice versa
    let a = make(tx_b, rx_a);
    let b = make(tx_a, rx_b);
    (a, b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::{channel_port_pair, PortError};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicBool, Ordering};

    async fn establish_pair() -> (Established, Established) {
        let (a, b) = channel_port_pair();
        let (a, b) = tokio::join!(
            establish(a, Role::Active, EndOptions::default()),
            establish(b, Role::Passive, EndOptions::default()),
        );
        (a.unwrap(), b.unwrap())
    }

    #[tokio::test]
    async fn test_send_reaches_peer_inbox() {
        let (a, mut b) = establish_pair().await;
        let payload = Payload::request("demo", 100, 32, vec![json!(1)]);
        a.end.send(&payload).unwrap();
        assert_eq!(b.inbox.recv().await.unwrap(), payload);
    }

    #[tokio::test]
    async fn test_send_after_close_fails_closed_without_io() {
        let (a, mut b) = establish_pair().await;
        a.end.close();
        a.end.close();

        let err = a
            .end
            .send(&Payload::request("demo", 100, 32, vec![]))
            .unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::Closed);

        // nothing may arrive: the pump stopped and the send never posted
        let recv = tokio::time::timeout(Duration::from_millis(50), b.inbox.recv()).await;
        assert!(matches!(recv, Ok(None) | Err(_)));
    }

    #[tokio::test]
    async fn test_close_subscribers_fire_once() {
        let (a, _b) = establish_pair().await;
        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let c = count.clone();
        let _sub = a.end.on_close(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        a.end.close();
        a.end.close();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_notify_peer_policy_closes_other_side() {
        let (a, b) = channel_port_pair();
        let options = EndOptions {
            timeout: None,
            close_policy: ClosePolicy::NotifyPeer,
        };
        let (a, b) = tokio::join!(
            establish(a, Role::Active, options),
            establish(b, Role::Passive, EndOptions::default()),
        );
        let a = a.unwrap();
        let mut b = b.unwrap();

        a.end.close();
        // the peer's intake sees the close request and closes its end
        assert!(b.inbox.recv().await.is_none());
        assert!(b.end.is_closed());
    }

    struct TerminatingPort {
        inner: crate::port::ChannelPort,
        terminated: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Port for TerminatingPort {
        fn post(&self, message: Value) -> Result<(), PortError> {
            self.inner.post(message)
        }

        async fn recv(&self) -> Option<Value> {
            self.inner.recv().await
        }

        fn terminate(&self) {
            self.terminated.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_terminate_policy_terminates_port() {
        let (a, b) = channel_port_pair();
        let terminated = Arc::new(AtomicBool::new(false));
        let port = TerminatingPort {
            inner: a,
            terminated: terminated.clone(),
        };
        let options = EndOptions {
            timeout: None,
            close_policy: ClosePolicy::Terminate,
        };
        let (a, _b) = tokio::join!(
            establish(port, Role::Active, options),
            establish(b, Role::Passive, EndOptions::default()),
        );
        let a = a.unwrap();

        a.end.close();
        assert!(terminated.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_linked_pair_close_is_shared() {
        let (a, mut b) = linked_pair();
        let payload = Payload::request("demo", 101, 33, vec![json!("hi")]);
        a.end.send(&payload).unwrap();
        assert_eq!(b.inbox.recv().await.unwrap(), payload);

        b.end.close();
        assert!(a.end.is_closed());
        let err = a.end.send(&payload).unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::Closed);
    }
}
