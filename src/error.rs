use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable error codes shared by both sides of a connection.
///
/// These cross the wire as the payload of return-error messages, so the
/// string form of each code must never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Generic internal failure, e.g. message id space exhaustion.
    Fail,
    /// A call or the protocol agreement did not complete in time.
    Timeout,
    /// The handshake did not complete in time.
    HandshakeTimeout,
    /// The endpoint was closed, or a send was attempted after close.
    Closed,
    /// The two sides declared different protocol sets.
    ProtocolDisagree,
    /// Two bindings registered the same protocol name.
    DuplicateProtocol,
    /// An inbound message referenced a protocol this side never registered.
    UnknownProtocol,
    /// An inbound request payload was not a usable argument list.
    InvalidRequestData,
    /// A function id was not recognized by the handler.
    UnknownFunction,
    /// The handler produced no result where one was required.
    NoReturn,
    /// The remote handler panicked; the message carries the panic text.
    Catch,
    /// The stub handler of a one-directional protocol was invoked.
    UnexpectedStubCall,
    /// Transport setup was attempted outside a worker context.
    NotWorkerContext,
    /// Transport setup was attempted outside a window context.
    NotWindowContext,
    /// The window has no owner (not a popup or embedded frame).
    NoOwnerForWindow,
    /// The window's origin could not be determined.
    NoOriginForWindow,
    /// A transport URL failed to parse.
    InvalidUrl,
}

/// Error surfaced by every fallible bus operation.
///
/// RPC call sites always receive one of these inside a [`BusResult`], never
/// a panic or an untyped failure.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{code:?}{}", .message.as_deref().map(|m| format!(": {m}")).unwrap_or_default())]
pub struct BusError {
    pub code: ErrorCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl BusError {
    pub fn new(code: ErrorCode) -> Self {
        Self {
            code,
            message: None,
        }
    }

    pub fn with_message(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: Some(message.into()),
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self::with_message(ErrorCode::Fail, message)
    }

    pub fn closed() -> Self {
        Self::new(ErrorCode::Closed)
    }

    pub fn timeout() -> Self {
        Self::new(ErrorCode::Timeout)
    }
}

impl From<ErrorCode> for BusError {
    fn from(code: ErrorCode) -> Self {
        Self::new(code)
    }
}

pub type BusResult<T> = std::result::Result<T, BusError>;
