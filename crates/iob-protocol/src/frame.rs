//! Frame envelope shared by both connection roles.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ProtocolError;

/// Stable error codes carried by error responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Unauthorized,
    Forbidden,
    NotFound,
    Timeout,
    Malformed,
    InvalidTransition,
    Unavailable,
    /// The call is not valid for this connection's role or state.
    Unsupported,
    Internal,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Forbidden => "FORBIDDEN",
            Self::NotFound => "NOT_FOUND",
            Self::Timeout => "TIMEOUT",
            Self::Malformed => "MALFORMED",
            Self::InvalidTransition => "INVALID_TRANSITION",
            Self::Unavailable => "UNAVAILABLE",
            Self::Unsupported => "UNSUPPORTED",
            Self::Internal => "INTERNAL",
        };
        f.write_str(s)
    }
}

/// Body of an error response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
}

/// One WebSocket text frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Frame {
    /// Request expecting a response with the same id.
    Call {
        id: u64,
        payload: serde_json::Value,
    },

    /// Fire-and-forget message.
    Send { payload: serde_json::Value },

    /// Reply to a call.
    Response {
        id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorBody>,
    },
}

impl Frame {
    /// Builds a call frame around a typed payload.
    pub fn call<T: Serialize>(id: u64, payload: &T) -> Result<Self, ProtocolError> {
        Ok(Self::Call {
            id,
            payload: serde_json::to_value(payload).map_err(ProtocolError::payload)?,
        })
    }

    /// Builds a send frame around a typed payload.
    pub fn send<T: Serialize>(payload: &T) -> Result<Self, ProtocolError> {
        Ok(Self::Send {
            payload: serde_json::to_value(payload).map_err(ProtocolError::payload)?,
        })
    }

    /// Builds a successful response.
    pub fn ok(id: u64, result: serde_json::Value) -> Self {
        Self::Response {
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Builds an error response.
    pub fn err(id: u64, code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Response {
            id,
            result: None,
            error: Some(ErrorBody {
                code,
                message: message.into(),
            }),
        }
    }

    /// Parses a frame from one line of JSON text.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::MalformedFrame(e.to_string()))
    }

    /// Serializes the frame to JSON text.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::MalformedFrame(e.to_string()))
    }

    /// Decodes the payload of a call or send into a message enum.
    ///
    /// Returns `None` for responses.
    pub fn payload<T: DeserializeOwned>(&self) -> Option<Result<T, ProtocolError>> {
        match self {
            Self::Call { payload, .. } | Self::Send { payload } => Some(
                serde_json::from_value(payload.clone()).map_err(ProtocolError::payload),
            ),
            Self::Response { .. } => None,
        }
    }

    /// Method name of a call or send payload, for logging and counters.
    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Call { payload, .. } | Self::Send { payload } => {
                payload.get("method").and_then(|m| m.as_str())
            }
            Self::Response { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{HostRequest, TransactionRef};
    use crate::ClientEvent;
    use iob_core::TransactionId;
    use serde_json::json;

    #[test]
    fn test_call_frame_shape() {
        let frame = Frame::call(7, &HostRequest::BeginHostShutdown).unwrap();
        let json = frame.encode().unwrap();
        assert!(json.contains("\"kind\":\"call\""));
        assert!(json.contains("\"id\":7"));
        assert!(json.contains("\"method\":\"BEGIN_HOST_SHUTDOWN\""));
    }

    #[test]
    fn test_error_response_omits_result() {
        let frame = Frame::err(3, ErrorCode::Forbidden, "not yours");
        let value: serde_json::Value = serde_json::from_str(&frame.encode().unwrap()).unwrap();
        assert_eq!(value["error"]["code"], "FORBIDDEN");
        assert!(value.get("result").is_none());
    }

    #[test]
    fn test_decode_send_payload() {
        let text = r#"{"kind":"send","payload":{"method":"CLIENT_USURPED","params":{"transaction_id":"tx-1"}}}"#;
        let frame = Frame::decode(text).unwrap();
        assert_eq!(frame.method(), Some("CLIENT_USURPED"));

        let event: ClientEvent = frame.payload().unwrap().unwrap();
        assert_eq!(
            event,
            ClientEvent::ClientUsurped(TransactionRef {
                transaction_id: TransactionId::new("tx-1")
            })
        );
    }

    #[test]
    fn test_unknown_method_is_malformed_payload() {
        let frame = Frame::Send {
            payload: json!({"method": "SELF_DESTRUCT"}),
        };
        let result: Result<HostRequest, _> = frame.payload().unwrap();
        assert!(matches!(result, Err(ProtocolError::MalformedPayload(_))));
    }

    #[test]
    fn test_garbage_is_malformed_frame() {
        assert!(matches!(
            Frame::decode("not json"),
            Err(ProtocolError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_response_has_no_payload() {
        let frame = Frame::ok(1, json!(true));
        assert!(frame.payload::<HostRequest>().is_none());
        assert!(frame.method().is_none());
    }
}
