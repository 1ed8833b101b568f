//! Unified error type for the relay, and its mapping onto CDP wire codes.

use thiserror::Error;

use crate::wire::codes;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type. Every row of the error-handling table has one
/// variant; `to_cdp_error` is the single place that turns one of these into
/// a wire-level CDP error object.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error (bind failure, process spawn failure, file logging setup).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// WebSocket transport error (handshake, frame, close).
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// HTTP client/server error used by discovery, lifecycle and wait.
    #[error("HTTP error: {0}")]
    Http(String),

    /// A frame failed wire validation.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A browser-scope command has no synthesize/rewrite/forward rule.
    #[error("method not found: {0}")]
    MethodNotFound(String),

    /// A command's params failed shape validation for its disposition.
    #[error("invalid params: {0}")]
    InvalidParams(String),

    /// A rewrite or forward needed a page session and none was available.
    #[error("no page session available: {0}")]
    NoSession(String),

    /// The extension link was down when a forward was attempted.
    #[error("extension disconnected")]
    ExtensionDisconnected,

    /// The extension returned a CDP protocol-level error for a forwarded command.
    #[error("CDP error ({code}): {message}")]
    Cdp { code: i32, message: String },

    /// JSON (de)serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The lifecycle supervisor found the configured port already bound by a
    /// process that does not answer the version probe.
    #[error("port already in use: {0}")]
    PortInUse(String),

    /// A freshly spawned relay process did not become ready in time.
    #[error("timed out waiting for relay to become ready on port {port}")]
    StartTimeout { port: u16 },

    /// The extension wait utility's deadline elapsed before the extension
    /// connected and reported at least one page.
    #[error("extension not connected on port {port}")]
    ExtensionNotConnected { port: u16 },

    /// Configuration was missing or malformed.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl Error {
    /// Build a WebSocket error from any displayable message.
    pub fn websocket<S: Into<String>>(msg: S) -> Self {
        Error::WebSocket(msg.into())
    }

    /// Build an HTTP error from any displayable message.
    pub fn http<S: Into<String>>(msg: S) -> Self {
        Error::Http(msg.into())
    }

    /// Build an invalid-request error from any displayable message.
    pub fn invalid_request<S: Into<String>>(msg: S) -> Self {
        Error::InvalidRequest(msg.into())
    }

    /// Build a method-not-found error from any displayable message.
    pub fn method_not_found<S: Into<String>>(msg: S) -> Self {
        Error::MethodNotFound(msg.into())
    }

    /// Build an invalid-params error from any displayable message.
    pub fn invalid_params<S: Into<String>>(msg: S) -> Self {
        Error::InvalidParams(msg.into())
    }

    /// Build a no-session error from any displayable message.
    pub fn no_session<S: Into<String>>(msg: S) -> Self {
        Error::NoSession(msg.into())
    }

    /// Build a configuration error from any displayable message.
    pub fn configuration<S: Into<String>>(msg: S) -> Self {
        Error::Configuration(msg.into())
    }

    /// Map this error onto the CDP wire error-code table.
    #[must_use]
    pub fn to_cdp_error(&self) -> (i32, String) {
        match self {
            Error::InvalidRequest(msg) => (codes::INVALID_REQUEST, msg.clone()),
            Error::MethodNotFound(msg) => (codes::METHOD_NOT_FOUND, msg.clone()),
            Error::InvalidParams(msg) => (codes::INVALID_PARAMS, msg.clone()),
            Error::NoSession(msg) => (codes::NO_SESSION, msg.clone()),
            Error::ExtensionDisconnected => (codes::EXTENSION_DISCONNECTED, self.to_string()),
            Error::Cdp { code, message } => (*code, message.clone()),
            other => (codes::INVALID_REQUEST, other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_request_maps_to_32600() {
        let err = Error::invalid_request("bad frame");
        assert_eq!(err.to_cdp_error().0, -32600);
    }

    #[test]
    fn method_not_found_maps_to_32601() {
        let err = Error::method_not_found("Foo.bar");
        assert_eq!(err.to_cdp_error().0, -32601);
    }

    #[test]
    fn no_session_maps_to_32000() {
        let err = Error::no_session("no attached target");
        assert_eq!(err.to_cdp_error().0, -32000);
    }

    #[test]
    fn extension_disconnected_maps_to_32001() {
        let err = Error::ExtensionDisconnected;
        assert_eq!(err.to_cdp_error().0, -32001);
    }
}
