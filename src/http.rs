//! HTTP discovery surface: version probe, target list, extension status.
//! Implemented directly against `hyper` + `http-body-util` rather than
//! pulling in a web framework for four routes.

use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::{Method, Request, Response, StatusCode};
use serde_json::json;

use crate::registry::SessionRegistry;
use crate::server::CLIENT_ROOT;

pub type HttpResponse = Response<Full<Bytes>>;

/// `clientId` used in the `webSocketDebuggerUrl` handed back by
/// `/json/version` when no client has connected yet to derive one from.
const DEFAULT_CLIENT_ID: &str = "default";

/// Try to answer `req` as one of the discovery routes. Returns `None` if the
/// request doesn't match any of them, so the caller can fall through to the
/// WebSocket upgrade handler.
pub async fn handle(
    req: &Request<Incoming>,
    registry: &Arc<SessionRegistry>,
    extension_connected: bool,
    version: &str,
) -> Option<HttpResponse> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/version") => Some(json(StatusCode::OK, json!({ "version": version }))),

        (&Method::GET, "/json/version") => {
            let host = req
                .headers()
                .get(hyper::header::HOST)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("127.0.0.1");
            Some(json(
                StatusCode::OK,
                json!({
                    "Browser": format!("cdp-relay/{version}"),
                    "Protocol-Version": "1.3",
                    "webSocketDebuggerUrl": format!("ws://{host}/{CLIENT_ROOT}/{DEFAULT_CLIENT_ID}"),
                }),
            ))
        }

        (&Method::GET, "/json/list") => {
            let targets = registry.list_targets().await;
            Some(json(StatusCode::OK, json!(targets)))
        }

        (&Method::GET, "/extension-status") => {
            let snapshot = registry.snapshot(extension_connected).await;
            Some(json(StatusCode::OK, serde_json::to_value(snapshot).unwrap_or(json!({}))))
        }

        _ => None,
    }
}

fn json(status: StatusCode, value: serde_json::Value) -> HttpResponse {
    let body = serde_json::to_vec(&value).unwrap_or_default();
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(body)))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn json_response_shape() {
        let body = json(StatusCode::OK, json!({"a": 1}));
        assert_eq!(body.status(), StatusCode::OK);
        assert_eq!(body.headers().get("content-type").unwrap(), "application/json");
    }

    // `hyper::body::Incoming` has no public constructor outside a real
    // connection, so route matching against a live request is exercised by
    // the black-box integration tests that drive a real server instead.
}
