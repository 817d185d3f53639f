use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{error, warn};

use crate::close::CloseSubscription;
use crate::end::{End, Established};
use crate::error::{BusError, BusResult, ErrorCode};
use crate::handshake::Role;
use crate::message::{
    FunctionId, Payload, FUNC_PROTOCOL, INTERNAL_PROTOCOL, PROTOCOL_AGREE, PROTOCOL_DISAGREE,
    PROTOCOL_QUERY,
};
use crate::sender::{BusSender, PendingCalls, ProtocolSender};

/// Receives calls the peer makes on one protocol.
///
/// Generated receiver stubs implement this as a dispatch table keyed by
/// function id. `Ok(None)` means the method produced no result; the caller
/// is then answered with a `NoReturn` error.
#[async_trait]
pub trait ProtocolHandler: Send + Sync + 'static {
    async fn dispatch(
        &self,
        function_id: FunctionId,
        args: Vec<Value>,
    ) -> BusResult<Option<Value>>;
}

/// Placeholder handler for one-directional protocols: this side sends but
/// never serves, so any inbound call is answered with an error.
pub struct StubHandler;

#[async_trait]
impl ProtocolHandler for StubHandler {
    async fn dispatch(&self, _function_id: FunctionId, _args: Vec<Value>) -> BusResult<Option<Value>> {
        Err(BusError::new(ErrorCode::UnexpectedStubCall))
    }
}

/// One protocol's registration: its name, the pair of interface names
/// (this side's, then the peer's), and the inbound call handler.
pub struct ProtocolBinding {
    pub protocol: String,
    pub interfaces: (String, String),
    pub handler: Arc<dyn ProtocolHandler>,
}

impl ProtocolBinding {
    pub fn new(
        protocol: impl Into<String>,
        local_interface: impl Into<String>,
        remote_interface: impl Into<String>,
        handler: impl ProtocolHandler,
    ) -> Self {
        Self {
            protocol: protocol.into(),
            interfaces: (local_interface.into(), remote_interface.into()),
            handler: Arc::new(handler),
        }
    }
}

/// The set of protocols one side expects to speak over a connection.
#[derive(Default)]
pub struct BusConfig {
    bindings: Vec<ProtocolBinding>,
}

impl BusConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn protocol(
        mut self,
        name: impl Into<String>,
        local_interface: impl Into<String>,
        remote_interface: impl Into<String>,
        handler: impl ProtocolHandler,
    ) -> Self {
        self.bindings
            .push(ProtocolBinding::new(name, local_interface, remote_interface, handler));
        self
    }

    pub fn binding(mut self, binding: ProtocolBinding) -> Self {
        self.bindings.push(binding);
        self
    }
}

/// Canonical agreement line for one binding. Both sides must produce the
/// same string for a correctly paired protocol, so the direction encoding
/// is swapped by role.
fn query_line(role: Role, binding: &ProtocolBinding) -> String {
    let (local, remote) = (&binding.interfaces.0, &binding.interfaces.1);
    match role {
        Role::Active => format!("{}:{}->{}", binding.protocol, local, remote),
        Role::Passive => format!("{}:{}->{}", binding.protocol, remote, local),
    }
}

fn disagree_error(received: &[String], expected: &[String]) -> BusError {
    BusError::with_message(
        ErrorCode::ProtocolDisagree,
        format!(
            "received: {}, expected: {}",
            received.join(", "),
            expected.join(", ")
        ),
    )
}

struct Router {
    end: End,
    query: Vec<String>,
    handlers: HashMap<String, Arc<dyn ProtocolHandler>>,
    pending: Arc<PendingCalls>,
    agreement: Mutex<Option<oneshot::Sender<BusResult<()>>>>,
}

impl Router {
    /// First resolution wins; close, timeout and replies all funnel here.
    fn resolve_agreement(&self, result: BusResult<()>) {
        if let Some(tx) = self.agreement.lock().take() {
            let _ = tx.send(result);
        }
    }

    fn on_closed(&self) {
        self.end.close();
        self.resolve_agreement(Err(BusError::closed()));
        self.pending.drain_with(BusError::closed());
    }

    fn handle(self: &Arc<Self>, payload: Payload) {
        if payload.is_internal() {
            if payload.function_id == FUNC_PROTOCOL {
                self.handle_protocol_exchange(payload);
            } else {
                warn!(
                    function_id = payload.function_id,
                    "unknown internal message"
                );
            }
            return;
        }

        let Some(handler) = self.handlers.get(&payload.protocol).cloned() else {
            self.handle_unknown_protocol(payload);
            return;
        };

        if payload.is_response() {
            self.handle_response(payload);
        } else {
            self.spawn_request(handler, payload);
        }
    }

    /// Protocol agreement. A query may be re-received after agreement
    /// (e.g. a retried query that crossed the reply); comparing again and
    /// re-answering is harmless because resolution happens at most once.
    fn handle_protocol_exchange(&self, payload: Payload) {
        let received: Vec<String> =
            serde_json::from_value(payload.data).unwrap_or_default();
        match payload.message_id {
            PROTOCOL_QUERY => {
                let agree = received == self.query;
                let reply_id = if agree { PROTOCOL_AGREE } else { PROTOCOL_DISAGREE };
                let sent = self.end.send(&Payload::protocol_exchange(reply_id, &self.query));
                if agree {
                    self.resolve_agreement(sent);
                } else {
                    self.resolve_agreement(Err(disagree_error(&received, &self.query)));
                }
            }
            PROTOCOL_AGREE => self.resolve_agreement(Ok(())),
            _ => self.resolve_agreement(Err(disagree_error(&received, &self.query))),
        }
    }

    fn handle_unknown_protocol(&self, payload: Payload) {
        if payload.is_response() {
            warn!(
                protocol = %payload.protocol,
                "dropping response for unknown protocol"
            );
            return;
        }
        // answer requests so the caller does not hang; the reply echoes
        // the offending protocol so their correlation resolves
        let reply = Payload::return_error(
            &payload.protocol,
            payload.message_id,
            &BusError::new(ErrorCode::UnknownProtocol),
        );
        if self.end.send(&reply).is_err() {
            self.end.close();
        }
    }

    fn handle_response(&self, payload: Payload) {
        let result = if payload.function_id == crate::message::FUNC_RETURN {
            Ok(payload.data)
        } else {
            Err(decode_wire_error(payload.data))
        };
        if !self.pending.resolve(payload.message_id, result) {
            warn!(
                message_id = payload.message_id,
                "response for unknown message id"
            );
        }
    }

    /// Run the handler in its own task so the routing loop keeps draining
    /// while calls are in flight. A panicking handler is the analog of an
    /// uncaught exception and is reported to the caller as `Catch`.
    fn spawn_request(self: &Arc<Self>, handler: Arc<dyn ProtocolHandler>, payload: Payload) {
        let router = self.clone();
        tokio::spawn(async move {
            let Payload {
                protocol,
                message_id,
                function_id,
                data,
            } = payload;

            let reply = match data {
                Value::Array(args) => {
                    let outcome =
                        tokio::spawn(async move { handler.dispatch(function_id, args).await })
                            .await;
                    match outcome {
                        Ok(Ok(Some(value))) => Payload::return_value(&protocol, message_id, value),
                        Ok(Ok(None)) => Payload::return_error(
                            &protocol,
                            message_id,
                            &BusError::new(ErrorCode::NoReturn),
                        ),
                        Ok(Err(err)) => Payload::return_error(&protocol, message_id, &err),
                        Err(join_err) => Payload::return_error(
                            &protocol,
                            message_id,
                            &BusError::with_message(ErrorCode::Catch, panic_text(join_err)),
                        ),
                    }
                }
                _ => {
                    warn!(protocol = %protocol, "request data is not an argument list");
                    Payload::return_error(
                        &protocol,
                        message_id,
                        &BusError::new(ErrorCode::InvalidRequestData),
                    )
                }
            };

            if let Err(err) = router.end.send(&reply) {
                // the transport is gone; this connection is done
                warn!(error = %err, "failed to send response, closing");
                router.end.close();
            }
        });
    }
}

fn decode_wire_error(data: Value) -> BusError {
    serde_json::from_value(data)
        .unwrap_or_else(|_| BusError::fail("malformed error payload from peer"))
}

fn panic_text(join_err: tokio::task::JoinError) -> String {
    if join_err.is_panic() {
        let payload = join_err.into_panic();
        if let Some(text) = payload.downcast_ref::<&str>() {
            (*text).to_string()
        } else if let Some(text) = payload.downcast_ref::<String>() {
            text.clone()
        } else {
            "handler panicked".to_string()
        }
    } else {
        "handler task cancelled".to_string()
    }
}

/// A live, negotiated connection: the endpoint handle plus one sender per
/// registered protocol.
#[derive(Clone)]
pub struct BusConnection {
    end: End,
    senders: HashMap<String, ProtocolSender>,
}

impl BusConnection {
    /// The sender for a registered protocol.
    pub fn sender(&self, protocol: &str) -> BusResult<ProtocolSender> {
        self.senders
            .get(protocol)
            .cloned()
            .ok_or_else(|| {
                BusError::with_message(ErrorCode::UnknownProtocol, protocol.to_string())
            })
    }

    pub fn close(&self) {
        self.end.close();
    }

    pub fn is_closed(&self) -> bool {
        self.end.is_closed()
    }

    pub fn on_close(&self, callback: impl FnOnce() + Send + 'static) -> CloseSubscription {
        self.end.on_close(callback)
    }
}

impl std::fmt::Debug for BusConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusConnection")
            .field("closed", &self.is_closed())
            .field("protocols", &self.senders.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Negotiate the protocol set over an established endpoint and activate
/// call routing.
///
/// `agreement_timeout` bounds the negotiation; `call_timeout` is the
/// per-call timeout installed into the senders (`None` disables it).
pub(crate) async fn attach(
    role: Role,
    established: Established,
    config: BusConfig,
    agreement_timeout: Duration,
    call_timeout: Option<Duration>,
) -> BusResult<BusConnection> {
    let Established { end, mut inbox } = established;

    let mut handlers: HashMap<String, Arc<dyn ProtocolHandler>> = HashMap::new();
    let mut names: HashSet<String> = HashSet::new();
    let mut query = Vec::with_capacity(config.bindings.len());
    for binding in &config.bindings {
        if binding.protocol == INTERNAL_PROTOCOL {
            end.close();
            return Err(BusError::with_message(
                ErrorCode::DuplicateProtocol,
                format!("protocol name is reserved: {}", binding.protocol),
            ));
        }
        if !names.insert(binding.protocol.clone()) {
            end.close();
            return Err(BusError::with_message(
                ErrorCode::DuplicateProtocol,
                format!("duplicate protocol: {}", binding.protocol),
            ));
        }
        handlers.insert(binding.protocol.clone(), binding.handler.clone());
        query.push(query_line(role, binding));
    }
    // registration order is arbitrary and must not affect agreement
    query.sort();

    let pending = Arc::new(PendingCalls::new());
    let (agree_tx, agree_rx) = oneshot::channel();
    let router = Arc::new(Router {
        end: end.clone(),
        query,
        handlers,
        pending: pending.clone(),
        agreement: Mutex::new(Some(agree_tx)),
    });

    let loop_router = router.clone();
    let loop_closer = end.closer().clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                // drain already-delivered traffic before observing close,
                // so a disagree reply is not masked by the peer closing
                biased;
                payload = inbox.recv() => match payload {
                    Some(payload) => loop_router.handle(payload),
                    None => {
                        loop_router.on_closed();
                        break;
                    }
                },
                _ = loop_closer.closed() => {
                    loop_router.on_closed();
                    break;
                }
            }
        }
    });

    if role == Role::Active {
        if let Err(err) = end.send(&Payload::protocol_exchange(PROTOCOL_QUERY, &router.query)) {
            error!("failed to query protocols, communication not established");
            end.close();
            return Err(err);
        }
    }

    let agreement = match tokio::time::timeout(agreement_timeout, agree_rx).await {
        Err(_) => Err(BusError::timeout()),
        Ok(Err(_)) => Err(BusError::closed()),
        Ok(Ok(result)) => result,
    };
    if let Err(err) = agreement {
        error!(error = %err, "failed to agree on protocols, communication not established");
        end.close();
        return Err(err);
    }

    let sender = Arc::new(BusSender::new(end.clone(), pending, call_timeout));
    let senders = config
        .bindings
        .iter()
        .map(|binding| {
            (
                binding.protocol.clone(),
                ProtocolSender::new(sender.clone(), binding.protocol.clone()),
            )
        })
        .collect();

    Ok(BusConnection { end, senders })
}
