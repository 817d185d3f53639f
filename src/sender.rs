use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::end::End;
use crate::error::{BusError, BusResult};
use crate::message::{FunctionId, MessageId, Payload, FIRST_CALL_MESSAGE_ID, MAX_MESSAGE_ID};

type Resolver = oneshot::Sender<BusResult<Value>>;

struct PendingState {
    next_id: MessageId,
    entries: HashMap<MessageId, Resolver>,
}

/// Table of calls awaiting responses, keyed by message id.
///
/// An entry leaves the table exactly once: response arrival, timeout, or
/// close drain, whichever happens first. The later events find nothing and
/// become no-ops.
pub(crate) struct PendingCalls {
    state: Mutex<PendingState>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PendingState {
                next_id: FIRST_CALL_MESSAGE_ID,
                entries: HashMap::new(),
            }),
        }
    }

    /// Allocate a free message id and register a resolver under it.
    ///
    /// Ids count up from the reserved range and wrap at the 32-bit signed
    /// boundary. A still-pending id is skipped; a full table (every id in
    /// flight) fails rather than overwriting.
    pub fn allocate(&self) -> BusResult<(MessageId, oneshot::Receiver<BusResult<Value>>)> {
        let mut state = self.state.lock();
        let mut id = Self::bump(&mut state);
        if state.entries.contains_key(&id) {
            let initial = id;
            loop {
                id = Self::bump(&mut state);
                if id == initial {
                    return Err(BusError::fail("no available message id"));
                }
                if !state.entries.contains_key(&id) {
                    break;
                }
            }
        }
        let (tx, rx) = oneshot::channel();
        state.entries.insert(id, tx);
        Ok((id, rx))
    }

    fn bump(state: &mut PendingState) -> MessageId {
        if state.next_id >= MAX_MESSAGE_ID {
            state.next_id = FIRST_CALL_MESSAGE_ID;
        }
        let id = state.next_id;
        state.next_id += 1;
        id
    }

    /// Resolve and remove the entry for `id`. Returns false when no entry
    /// exists, e.g. for a late response after a timeout already fired.
    pub fn resolve(&self, id: MessageId, result: BusResult<Value>) -> bool {
        let resolver = self.state.lock().entries.remove(&id);
        match resolver {
            Some(resolver) => {
                let _ = resolver.send(result);
                true
            }
            None => false,
        }
    }

    /// Drop the entry for `id` without resolving it (timeout path; the
    /// caller already produced its own error).
    pub fn remove(&self, id: MessageId) -> bool {
        self.state.lock().entries.remove(&id).is_some()
    }

    /// Resolve every in-flight call with `error`. Used when the connection
    /// closes so no caller is left awaiting forever.
    pub fn drain_with(&self, error: BusError) {
        let entries = std::mem::take(&mut self.state.lock().entries);
        for (_, resolver) in entries {
            let _ = resolver.send(Err(error.clone()));
        }
    }

    #[cfg(test)]
    pub fn set_next_id(&self, id: MessageId) {
        self.state.lock().next_id = id;
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }
}

/// Shared call transmitter for one bus.
pub(crate) struct BusSender {
    end: End,
    pending: Arc<PendingCalls>,
    call_timeout: Option<Duration>,
}

impl BusSender {
    pub fn new(end: End, pending: Arc<PendingCalls>, call_timeout: Option<Duration>) -> Self {
        Self {
            end,
            pending,
            call_timeout,
        }
    }

    /// Transmit one call and await its correlated response.
    ///
    /// The resolver is registered before the request is posted, so a
    /// response arriving immediately still finds its entry.
    pub async fn send(
        &self,
        protocol: &str,
        function_id: FunctionId,
        args: Vec<Value>,
    ) -> BusResult<Value> {
        let (id, rx) = self.pending.allocate()?;
        let payload = Payload::request(protocol, id, function_id, args);
        if let Err(err) = self.end.send(&payload) {
            self.pending.remove(id);
            return Err(err);
        }

        match self.call_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(BusError::closed()),
                Err(_) => {
                    // remove first so a late response finds nothing
                    self.pending.remove(id);
                    Err(BusError::timeout())
                }
            },
            None => rx.await.unwrap_or_else(|_| Err(BusError::closed())),
        }
    }
}

/// User-facing sender bound to one protocol.
///
/// Generated method stubs wrap this, tagging each outgoing call with the
/// protocol name and a fresh correlation id.
#[derive(Clone)]
pub struct ProtocolSender {
    sender: Arc<BusSender>,
    protocol: String,
}

impl ProtocolSender {
    pub(crate) fn new(sender: Arc<BusSender>, protocol: String) -> Self {
        Self { sender, protocol }
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// Call a remote method and await its return value.
    pub async fn call(&self, function_id: FunctionId, args: Vec<Value>) -> BusResult<Value> {
        self.sender.send(&self.protocol, function_id, args).await
    }

    /// Call a remote method, discarding the success payload so stray
    /// values never leak to call sites expecting nothing.
    pub async fn call_void(&self, function_id: FunctionId, args: Vec<Value>) -> BusResult<()> {
        self.sender.send(&self.protocol, function_id, args).await?;
        Ok(())
    }
}

impl std::fmt::Debug for ProtocolSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolSender")
            .field("protocol", &self.protocol)
            .finish()
    }
}
