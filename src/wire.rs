//! CDP wire frame types and validation.
//!
//! A frame is one JSON object per WebSocket text message. Three shapes
//! cross the wire: a client-sent command, a relay-sent response, and an
//! event (sent by the relay to clients, or received from the extension).
//! Unknown fields are preserved via `extra` so a forwarded command round
//! trips byte-for-byte aside from id remapping.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// CDP wire error codes (spec §7).
pub mod codes {
    /// Frame failed structural validation.
    pub const INVALID_REQUEST: i32 = -32600;
    /// No synthesize/rewrite/forward rule for this method.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Params failed shape validation.
    pub const INVALID_PARAMS: i32 = -32602;
    /// No page session available to rewrite/forward against.
    pub const NO_SESSION: i32 = -32000;
    /// Extension link was down.
    pub const EXTENSION_DISCONNECTED: i32 = -32001;
}

/// A command frame sent by a CDP client (or, after id remapping, by the
/// relay to the extension).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandFrame {
    pub id: u64,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(rename = "sessionId", default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A response frame sent by the relay to a CDP client, or received from the
/// extension in reply to a forwarded command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<CdpErrorObject>,
    #[serde(rename = "sessionId", default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl ResponseFrame {
    #[must_use]
    pub fn ok(id: u64, result: Value) -> Self {
        Self { id, result: Some(result), error: None, session_id: None }
    }

    #[must_use]
    pub fn err(id: u64, code: i32, message: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(CdpErrorObject { code, message: message.into(), data: None }),
            session_id: None,
        }
    }

    #[must_use]
    pub fn from_error(id: u64, err: &Error) -> Self {
        let (code, message) = err.to_cdp_error();
        Self::err(id, code, message)
    }

    #[must_use]
    pub fn with_session(mut self, session_id: Option<String>) -> Self {
        self.session_id = session_id;
        self
    }
}

/// The `error` object inside a `ResponseFrame`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CdpErrorObject {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// An event frame: method + params, optionally scoped to a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventFrame {
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(rename = "sessionId", default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl EventFrame {
    #[must_use]
    pub fn new(method: impl Into<String>, params: Value, session_id: Option<String>) -> Self {
        Self { method: method.into(), params, session_id }
    }
}

/// Envelope used on the extension link to distinguish forwarded CDP traffic
/// from relay-to-extension/extension-to-relay lifecycle metadata (attach,
/// detach, target info changes). Mirrors the `forwardCDPCommand` /
/// `forwardCDPEvent` convention of the naive single-mutex relay this module
/// generalizes, but tagged rather than nested under a fixed method name so
/// both directions share one envelope type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ExtensionEnvelope {
    /// A CDP command or response destined for / arriving from a page target.
    Cdp {
        #[serde(rename = "sessionId", default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        payload: Value,
    },
    /// Relay lifecycle metadata: target attach/detach/info-changed, or a log line.
    Meta { payload: Value },
}

/// Parse and validate a command frame received from a client.
///
/// Per spec §4.1: the frame must be a JSON object, `id` must be present and
/// a positive integer, and `method` must be a non-empty string containing
/// exactly one `.` separating two non-empty segments (`Domain.method`).
pub fn decode_command(raw: &str) -> Result<CommandFrame> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|e| Error::invalid_request(format!("malformed JSON: {e}")))?;

    if !value.is_object() {
        return Err(Error::invalid_request("frame must be a JSON object"));
    }

    let frame: CommandFrame = serde_json::from_value(value)
        .map_err(|e| Error::invalid_request(format!("malformed command frame: {e}")))?;

    if frame.id == 0 {
        return Err(Error::invalid_request("id must be a positive integer"));
    }

    if split_method(&frame.method).is_none() {
        return Err(Error::invalid_request(format!(
            "method must be of the form Domain.method, got {:?}",
            frame.method
        )));
    }

    Ok(frame)
}

/// Split a CDP method name into `(domain, method)`, requiring both halves to
/// be non-empty and exactly one separating dot.
#[must_use]
pub fn split_method(method: &str) -> Option<(&str, &str)> {
    let mut parts = method.splitn(2, '.');
    let domain = parts.next()?;
    let rest = parts.next()?;
    if domain.is_empty() || rest.is_empty() || rest.contains('.') {
        return None;
    }
    Some((domain, rest))
}

/// Serialize any wire frame to a JSON string for sending over a WebSocket.
pub fn encode<T: Serialize>(frame: &T) -> Result<String> {
    serde_json::to_string(frame).map_err(Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_valid_command() {
        let frame = decode_command(r#"{"id":1,"method":"Target.getTargets"}"#).unwrap();
        assert_eq!(frame.id, 1);
        assert_eq!(frame.method, "Target.getTargets");
        assert!(frame.session_id.is_none());
    }

    #[test]
    fn decode_preserves_unknown_fields() {
        let frame =
            decode_command(r#"{"id":1,"method":"Network.getCookies","extraField":42}"#).unwrap();
        assert_eq!(frame.extra.get("extraField").unwrap(), 42);
    }

    #[test]
    fn decode_rejects_zero_id() {
        let err = decode_command(r#"{"id":0,"method":"Target.getTargets"}"#).unwrap_err();
        assert_eq!(err.to_cdp_error().0, codes::INVALID_REQUEST);
    }

    #[test]
    fn decode_rejects_missing_dot() {
        let err = decode_command(r#"{"id":1,"method":"getTargets"}"#).unwrap_err();
        assert_eq!(err.to_cdp_error().0, codes::INVALID_REQUEST);
    }

    #[test]
    fn decode_rejects_non_object() {
        let err = decode_command("[1,2,3]").unwrap_err();
        assert_eq!(err.to_cdp_error().0, codes::INVALID_REQUEST);
    }

    #[test]
    fn split_method_rejects_extra_dots() {
        assert!(split_method("A.b.c").is_none());
        assert_eq!(split_method("Target.getTargets"), Some(("Target", "getTargets")));
    }

    #[test]
    fn response_ok_round_trips() {
        let resp = ResponseFrame::ok(7, serde_json::json!({"a": 1}));
        let encoded = encode(&resp).unwrap();
        assert!(encoded.contains("\"id\":7"));
        assert!(!encoded.contains("\"error\""));
    }
}
