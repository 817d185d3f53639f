use std::time::Duration;

use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

use crate::error::{BusError, BusResult, ErrorCode};
use crate::message::{Payload, FUNC_CLOSE, FUNC_HANDSHAKE, HELLO_MESSAGE_ID};
use crate::port::Port;

/// Which side of the connection this endpoint plays during establishment.
///
/// The active side initiates the handshake and the protocol agreement; the
/// passive side is purely reactive. Exactly one side of a connection must
/// be active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Active,
    Passive,
}

/// Default time allowed for handshake and for protocol agreement.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

const FAST_RETRY: Duration = Duration::from_millis(50);
const FAST_RETRIES: u32 = 20;
const SLOW_RETRY: Duration = Duration::from_secs(1);

const WARN_AFTER: [Duration; 3] = [
    Duration::from_secs(1),
    Duration::from_secs(5),
    Duration::from_secs(10),
];

/// Run the hello exchange until both sides are confirmed live.
///
/// Returns once this side considers the handshake established. Stray
/// hellos still in flight afterwards are expected and ignored by the
/// intake pump.
pub(crate) async fn run(port: &dyn Port, role: Role, timeout: Duration) -> BusResult<()> {
    let start = Instant::now();
    let deadline = start + timeout;
    match role {
        Role::Active => run_active(port, start, deadline).await,
        Role::Passive => run_passive(port, deadline).await,
    }
}

fn post_hello(port: &dyn Port) -> BusResult<()> {
    port.post(Payload::hello().to_wire())
        .map_err(|_| BusError::closed())
}

/// What an inbound value means to the handshake loop.
enum Inbound {
    Hello,
    CloseRequest,
    Other,
}

fn classify(value: &serde_json::Value) -> Inbound {
    let Some(payload) = Payload::from_wire(value) else {
        return Inbound::Other;
    };
    if !payload.is_internal() {
        // user traffic cannot legitimately arrive before establishment
        debug!(
            protocol = %payload.protocol,
            "ignoring non-control message during handshake"
        );
        return Inbound::Other;
    }
    match payload.function_id {
        FUNC_HANDSHAKE => {
            if payload.message_id == HELLO_MESSAGE_ID {
                Inbound::Hello
            } else {
                warn!(
                    message_id = payload.message_id,
                    "unknown handshake message id"
                );
                Inbound::Other
            }
        }
        FUNC_CLOSE => Inbound::CloseRequest,
        _ => Inbound::Other,
    }
}

/// Fire hellos on an interval (fast at first, then slow) until the peer
/// answers, warning at escalating thresholds while still unestablished.
async fn run_active(port: &dyn Port, start: Instant, deadline: Instant) -> BusResult<()> {
    let mut attempts: u32 = 0;
    let mut next_retry = Instant::now();
    let mut warn_index = 0;

    loop {
        // warnings past the deadline can never fire; park them behind it
        let next_warn = WARN_AFTER
            .get(warn_index)
            .map(|delay| start + *delay)
            .unwrap_or(deadline + Duration::from_secs(1));

        tokio::select! {
            _ = sleep_until(next_retry) => {
                post_hello(port)?;
                attempts += 1;
                let interval = if attempts < FAST_RETRIES { FAST_RETRY } else { SLOW_RETRY };
                next_retry = Instant::now() + interval;
            }
            _ = sleep_until(next_warn) => {
                warn!(
                    elapsed_secs = WARN_AFTER[warn_index].as_secs(),
                    "connection has not been established yet"
                );
                warn_index += 1;
            }
            _ = sleep_until(deadline) => {
                return Err(BusError::new(ErrorCode::HandshakeTimeout));
            }
            value = port.recv() => {
                match value {
                    None => return Err(BusError::closed()),
                    Some(value) => match classify(&value) {
                        Inbound::Hello => return Ok(()),
                        Inbound::CloseRequest => return Err(BusError::closed()),
                        Inbound::Other => {}
                    },
                }
            }
        }
    }
}

/// Wait for a hello, answer it, and consider the handshake established.
async fn run_passive(port: &dyn Port, deadline: Instant) -> BusResult<()> {
    loop {
        tokio::select! {
            _ = sleep_until(deadline) => {
                return Err(BusError::new(ErrorCode::HandshakeTimeout));
            }
            value = port.recv() => {
                match value {
                    None => return Err(BusError::closed()),
                    Some(value) => match classify(&value) {
                        Inbound::Hello => {
                            post_hello(port)?;
                            return Ok(());
                        }
                        Inbound::CloseRequest => return Err(BusError::closed()),
                        Inbound::Other => {}
                    },
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::INTERNAL_PROTOCOL;
    use crate::port::channel_port_pair;
    use serde_json::json;

    #[tokio::test]
    async fn test_handshake_both_roles() {
        let (a, b) = channel_port_pair();
        let active = tokio::spawn(async move {
            let result = run(&a, Role::Active, DEFAULT_TIMEOUT).await;
            (a, result)
        });
        let passive = tokio::spawn(async move {
            let result = run(&b, Role::Passive, DEFAULT_TIMEOUT).await;
            (b, result)
        });

        let (_, active_result) = active.await.unwrap();
        let (_, passive_result) = passive.await.unwrap();
        active_result.unwrap();
        passive_result.unwrap();
    }

    #[tokio::test]
    async fn test_active_times_out_without_peer() {
        let (a, _b) = channel_port_pair();
        let result = run(&a, Role::Active, Duration::from_millis(200)).await;
        assert_eq!(result.unwrap_err().code, ErrorCode::HandshakeTimeout);
    }

    #[tokio::test]
    async fn test_passive_times_out_without_peer() {
        let (a, _b) = channel_port_pair();
        let result = run(&a, Role::Passive, Duration::from_millis(200)).await;
        assert_eq!(result.unwrap_err().code, ErrorCode::HandshakeTimeout);
    }

    #[tokio::test]
    async fn test_delayed_passive_listener_still_succeeds() {
        let (a, b) = channel_port_pair();
        let active = tokio::spawn(async move { run(&a, Role::Active, DEFAULT_TIMEOUT).await });

        // the active side has been retrying into a queue for a while
        tokio::time::sleep(Duration::from_millis(300)).await;
        run(&b, Role::Passive, DEFAULT_TIMEOUT).await.unwrap();

        active.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_foreign_traffic_is_ignored_while_waiting() {
        let (a, b) = channel_port_pair();
        b.post(json!({"someone": "else"})).unwrap();
        b.post(json!({"s": INTERNAL_PROTOCOL, "p": INTERNAL_PROTOCOL, "m": 7, "f": FUNC_HANDSHAKE, "d": null}))
            .unwrap();

        let active = tokio::spawn(async move { run(&a, Role::Active, DEFAULT_TIMEOUT).await });
        run(&b, Role::Passive, DEFAULT_TIMEOUT).await.unwrap();
        active.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_close_request_aborts_handshake() {
        let (a, b) = channel_port_pair();
        b.post(Payload::close_request().to_wire()).unwrap();
        let result = run(&a, Role::Passive, DEFAULT_TIMEOUT).await;
        assert_eq!(result.unwrap_err().code, ErrorCode::Closed);
    }
}
