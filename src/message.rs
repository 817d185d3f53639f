use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::BusError;

/// Marker carried in the `s` field of every wire message, and the reserved
/// subchannel for control traffic. User protocols must not use this name.
pub const INTERNAL_PROTOCOL: &str = "xbus";

/// Function id of a success response.
pub const FUNC_RETURN: u32 = 0;
/// Function id of an error response.
pub const FUNC_RETURN_ERROR: u32 = 1;
/// Function id of a handshake hello. The message id carries the hello kind.
pub const FUNC_HANDSHAKE: u32 = 2;
/// Function id of a close request from the peer.
pub const FUNC_CLOSE: u32 = 3;
/// Function id of the protocol agreement exchange. The message id encodes
/// query (0), agree (1) or disagree (2).
pub const FUNC_PROTOCOL: u32 = 4;

/// Function ids 0..=31 are reserved for control use.
pub const FIRST_USER_FUNCTION_ID: u32 = 32;

/// Message id of a handshake hello.
pub const HELLO_MESSAGE_ID: u32 = 1;
/// Agreement message ids.
pub const PROTOCOL_QUERY: u32 = 0;
pub const PROTOCOL_AGREE: u32 = 1;
pub const PROTOCOL_DISAGREE: u32 = 2;

/// Message ids 0..=99 are reserved; correlation ids for user calls start
/// here and wrap at [`MAX_MESSAGE_ID`] to stay representable as a 32-bit
/// signed integer on any transport.
pub const FIRST_CALL_MESSAGE_ID: u32 = 100;
pub const MAX_MESSAGE_ID: u32 = 0x7fff_ffff;

pub type MessageId = u32;
pub type FunctionId = u32;

/// One unit of traffic on the bus.
///
/// The wire form is `{s, p, m, f, d}` where `s` is the fixed
/// [`INTERNAL_PROTOCOL`] marker distinguishing this library's traffic from
/// unrelated users of the same transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    /// Subchannel: [`INTERNAL_PROTOCOL`] or a user protocol name.
    #[serde(rename = "p")]
    pub protocol: String,
    /// Correlates a request to its response.
    #[serde(rename = "m")]
    pub message_id: MessageId,
    /// Method being invoked, or the response/control discriminator.
    #[serde(rename = "f")]
    pub function_id: FunctionId,
    /// Arbitrary transferable data.
    #[serde(rename = "d")]
    pub data: Value,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    s: &'static str,
    #[serde(flatten)]
    payload: &'a Payload,
}

impl Payload {
    pub fn new(
        protocol: impl Into<String>,
        message_id: MessageId,
        function_id: FunctionId,
        data: Value,
    ) -> Self {
        Self {
            protocol: protocol.into(),
            message_id,
            function_id,
            data,
        }
    }

    pub fn hello() -> Self {
        Self::new(
            INTERNAL_PROTOCOL,
            HELLO_MESSAGE_ID,
            FUNC_HANDSHAKE,
            Value::from("hello"),
        )
    }

    pub fn close_request() -> Self {
        Self::new(INTERNAL_PROTOCOL, 0, FUNC_CLOSE, Value::Null)
    }

    pub fn protocol_exchange(message_id: MessageId, query: &[String]) -> Self {
        Self::new(
            INTERNAL_PROTOCOL,
            message_id,
            FUNC_PROTOCOL,
            Value::from(query.to_vec()),
        )
    }

    pub fn request(
        protocol: impl Into<String>,
        message_id: MessageId,
        function_id: FunctionId,
        args: Vec<Value>,
    ) -> Self {
        Self::new(protocol, message_id, function_id, Value::Array(args))
    }

    pub fn return_value(protocol: impl Into<String>, message_id: MessageId, value: Value) -> Self {
        Self::new(protocol, message_id, FUNC_RETURN, value)
    }

    pub fn return_error(
        protocol: impl Into<String>,
        message_id: MessageId,
        error: &BusError,
    ) -> Self {
        let data = serde_json::to_value(error).unwrap_or(Value::Null);
        Self::new(protocol, message_id, FUNC_RETURN_ERROR, data)
    }

    /// True for success and error responses, false for requests and control.
    pub fn is_response(&self) -> bool {
        self.function_id == FUNC_RETURN || self.function_id == FUNC_RETURN_ERROR
    }

    pub fn is_internal(&self) -> bool {
        self.protocol == INTERNAL_PROTOCOL
    }

    /// Encode for transmission, stamping the subchannel marker.
    pub fn to_wire(&self) -> Value {
        serde_json::to_value(WireMessage {
            s: INTERNAL_PROTOCOL,
            payload: self,
        })
        .unwrap_or(Value::Null)
    }

    /// Admission filter: accept only well-formed messages carrying our
    /// marker. Anything else may belong to another library sharing the
    /// transport and is ignored without logging.
    pub fn from_wire(value: &Value) -> Option<Payload> {
        let obj = value.as_object()?;
        if obj.get("s")?.as_str()? != INTERNAL_PROTOCOL {
            return None;
        }
        let protocol = obj.get("p")?.as_str()?;
        if protocol.is_empty() {
            return None;
        }
        let message_id = obj.get("m")?.as_u64()?;
        let function_id = obj.get("f")?.as_u64()?;
        if message_id > MAX_MESSAGE_ID as u64 || function_id > u32::MAX as u64 {
            return None;
        }
        let data = obj.get("d")?.clone();
        Some(Payload {
            protocol: protocol.to_string(),
            message_id: message_id as u32,
            function_id: function_id as u32,
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_round_trip() {
        let payload = Payload::request("demo", 100, 32, vec![json!(1), json!("x")]);
        let wire = payload.to_wire();
        assert_eq!(wire["s"], INTERNAL_PROTOCOL);
        assert_eq!(wire["p"], "demo");
        assert_eq!(wire["m"], 100);
        assert_eq!(wire["f"], 32);

        let back = Payload::from_wire(&wire).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn test_admission_rejects_foreign_traffic() {
        assert!(Payload::from_wire(&json!("just a string")).is_none());
        assert!(Payload::from_wire(&json!({"type": "other-library"})).is_none());
        assert!(Payload::from_wire(&json!({"s": "not-ours", "p": "demo", "m": 1, "f": 0, "d": null})).is_none());
        // missing data field
        assert!(Payload::from_wire(&json!({"s": INTERNAL_PROTOCOL, "p": "demo", "m": 1, "f": 0})).is_none());
        // empty protocol
        assert!(Payload::from_wire(&json!({"s": INTERNAL_PROTOCOL, "p": "", "m": 1, "f": 0, "d": null})).is_none());
        // message id outside the representable range
        assert!(Payload::from_wire(
            &json!({"s": INTERNAL_PROTOCOL, "p": "demo", "m": 0x8000_0000u64, "f": 0, "d": null})
        )
        .is_none());
    }

    #[test]
    fn test_hello_shape() {
        let wire = Payload::hello().to_wire();
        assert_eq!(wire["p"], INTERNAL_PROTOCOL);
        assert_eq!(wire["m"], HELLO_MESSAGE_ID);
        assert_eq!(wire["f"], FUNC_HANDSHAKE);
    }

    #[test]
    fn test_return_error_carries_code() {
        let err = BusError::with_message(crate::error::ErrorCode::Catch, "boom");
        let payload = Payload::return_error("demo", 105, &err);
        assert_eq!(payload.function_id, FUNC_RETURN_ERROR);
        let back: BusError = serde_json::from_value(payload.data).unwrap();
        assert_eq!(back, err);
    }

    #[test]
    fn test_control_ids_stay_in_reserved_range() {
        for id in [FUNC_RETURN, FUNC_RETURN_ERROR, FUNC_HANDSHAKE, FUNC_CLOSE, FUNC_PROTOCOL] {
            assert!(id < FIRST_USER_FUNCTION_ID);
        }
        assert!(HELLO_MESSAGE_ID < FIRST_CALL_MESSAGE_ID);
        assert!(PROTOCOL_DISAGREE < FIRST_CALL_MESSAGE_ID);
    }

    #[test]
    fn test_response_discriminator() {
        assert!(Payload::return_value("demo", 100, Value::Null).is_response());
        assert!(!Payload::request("demo", 100, 32, vec![]).is_response());
        assert!(!Payload::hello().is_response());
    }
}
