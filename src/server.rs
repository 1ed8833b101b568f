//! Binds the relay's single listening port and routes every inbound
//! connection to the HTTP discovery surface, the extension WebSocket, or a
//! client WebSocket.
//!
//! A tiny hand-rolled router sits in front of a `hyper` HTTP/1.1 connection:
//! WebSocket upgrade requests are recognized by their `Connection`/`Upgrade`
//! headers, accepted via `hyper::upgrade::on`, and handed to
//! `client_link::run` / `extension_link::run`; everything else falls through
//! to `http::handle`.

use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{CONNECTION, UPGRADE};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;
use tracing::{info, warn};

use crate::client_link::{self, ClientRegistry};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::extension_link;
use crate::http as discovery;
use crate::registry::SessionRegistry;
use crate::router::Router;

/// Path segment the extension's WebSocket upgrades against.
pub const EXTENSION_PATH: &str = "/extension";
/// Path prefix under which clients upgrade, followed by their own `clientId`.
pub const CLIENT_ROOT: &str = "cdp";

/// The byte stream every upgraded connection runs its WebSocket over.
pub type ConnIo = TokioIo<hyper::upgrade::Upgraded>;

#[derive(Clone)]
struct ServerState {
    router: Arc<Router>,
    config: Arc<Config>,
}

/// Bind `config.host:config.port` and serve the relay until the process is
/// killed. Binding the port is the first thing the relay does on startup,
/// so the supervisor's "is it running" check can treat a live port as
/// equivalent to "is the expected version being served".
pub async fn run(config: Config) -> Result<()> {
    let listener = bind(&config).await?;
    serve(listener, config).await
}

/// Bind the configured address, separated from `serve` so tests can bind an
/// ephemeral port (`0`), read back the assigned port, and only then start
/// accepting connections.
pub async fn bind(config: &Config) -> Result<TcpListener> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .map_err(|e| Error::configuration(format!("invalid bind address: {e}")))?;
    let listener = TcpListener::bind(addr).await.map_err(|e| Error::PortInUse(e.to_string()))?;
    info!(%addr, version = env!("CARGO_PKG_VERSION"), "relay listening");
    Ok(listener)
}

/// Accept connections on an already-bound `listener` until the process is
/// killed.
pub async fn serve(listener: TcpListener, config: Config) -> Result<()> {
    let registry = Arc::new(SessionRegistry::new());
    let clients = ClientRegistry::new();
    let router = Router::new(registry, clients);
    let state = ServerState { router: router.clone(), config: Arc::new(config) };

    spawn_cleanup_task(router);

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_connection(stream, peer, state).await {
                warn!(%peer, error = %e, "connection ended with error");
            }
        });
    }
}

async fn serve_connection(stream: TcpStream, peer: SocketAddr, state: ServerState) -> Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req: Request<Incoming>| {
        let state = state.clone();
        async move { Ok::<_, Infallible>(route(req, peer, state).await) }
    });

    ConnBuilder::new(TokioExecutor::new())
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| Error::websocket(e.to_string()))
}

async fn route(mut req: Request<Incoming>, peer: SocketAddr, state: ServerState) -> discovery::HttpResponse {
    if !is_authorized(&req, peer, &state.config) {
        return respond(StatusCode::FORBIDDEN, "forbidden: loopback or a valid auth token is required");
    }

    let path = req.uri().path().to_string();

    if is_websocket_upgrade(&req) {
        let Some(switching) = websocket_accept_response(&req) else {
            return respond(StatusCode::BAD_REQUEST, "missing Sec-WebSocket-Key");
        };

        if path == EXTENSION_PATH {
            let router = state.router.clone();
            tokio::spawn(async move {
                match hyper::upgrade::on(&mut req).await {
                    Ok(upgraded) => {
                        let ws = WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;
                        extension_link::run(ws, router).await;
                    }
                    Err(e) => warn!(error = %e, "extension upgrade failed"),
                }
            });
            return switching;
        }

        if let Some(client_id) = path.strip_prefix(&format!("/{CLIENT_ROOT}/")) {
            if is_valid_client_id(client_id) {
                let client_id = client_id.to_string();
                let router = state.router.clone();
                tokio::spawn(async move {
                    match hyper::upgrade::on(&mut req).await {
                        Ok(upgraded) => {
                            let ws =
                                WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;
                            let clients = router.clients().clone();
                            client_link::run(client_id, ws, router, clients).await;
                        }
                        Err(e) => warn!(error = %e, "client upgrade failed"),
                    }
                });
                return switching;
            }
            return respond(StatusCode::BAD_REQUEST, "invalid clientId");
        }

        return respond(StatusCode::NOT_FOUND, "unknown upgrade path");
    }

    let extension_connected = state.router.extension_connected().await;
    match discovery::handle(&req, state.router.registry(), extension_connected, env!("CARGO_PKG_VERSION")).await {
        Some(response) => response,
        None => respond(StatusCode::NOT_FOUND, "not found"),
    }
}

/// Spec §6: non-loopback connections are refused unless a token is
/// configured and the caller supplies a matching one (header or query
/// parameter), compared in constant time.
fn is_authorized(req: &Request<Incoming>, peer: SocketAddr, config: &Config) -> bool {
    if is_loopback(peer.ip()) {
        return true;
    }
    let Some(expected) = &config.auth_token else { return false };
    match extract_token(req) {
        Some(supplied) => constant_time_eq(supplied.as_bytes(), expected.as_bytes()),
        None => false,
    }
}

fn is_loopback(ip: IpAddr) -> bool {
    ip.is_loopback()
}

fn extract_token(req: &Request<Incoming>) -> Option<String> {
    if let Some(header) = req.headers().get("x-relay-token") {
        return header.to_str().ok().map(str::to_string);
    }
    if let Some(auth) = req.headers().get(hyper::header::AUTHORIZATION) {
        if let Ok(value) = auth.to_str() {
            if let Some(token) = value.strip_prefix("Bearer ") {
                return Some(token.to_string());
            }
        }
    }
    let query = req.uri().query()?;
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == "token").then(|| value.to_string())
    })
}

/// Constant-time byte comparison: no early exit on the first mismatching
/// byte, so a timing attack cannot recover the token one byte at a time.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

fn is_websocket_upgrade(req: &Request<Incoming>) -> bool {
    let has_connection_upgrade = req
        .headers()
        .get(CONNECTION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.to_ascii_lowercase().split(',').any(|token| token.trim() == "upgrade"));
    let has_upgrade_websocket = req
        .headers()
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
    has_connection_upgrade && has_upgrade_websocket
}

fn websocket_accept_response(req: &Request<Incoming>) -> Option<discovery::HttpResponse> {
    let key = req.headers().get("sec-websocket-key")?;
    let accept = tokio_tungstenite::tungstenite::handshake::derive_accept_key(key.as_bytes());
    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(CONNECTION, "Upgrade")
        .header(UPGRADE, "websocket")
        .header("Sec-WebSocket-Accept", accept)
        .body(Full::new(Bytes::new()))
        .ok()
}

/// Periodically log target/session/pending counts. Client and extension
/// disconnects already reap their own pending entries eagerly, so this task
/// only surfaces anything that looks stuck.
fn spawn_cleanup_task(router: Arc<Router>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(300));
        loop {
            interval.tick().await;
            let targets = router.registry().target_count().await;
            let sessions = router.registry().session_count().await;
            match router.extension_pending_snapshot().await {
                Some((pending, Some(age))) if age.num_seconds() > 60 => {
                    warn!(targets, sessions, pending, oldest_pending_secs = age.num_seconds(), "relay state");
                }
                Some((pending, _)) => info!(targets, sessions, pending, "relay state"),
                None => info!(targets, sessions, "relay state (no extension connected)"),
            }
        }
    });
}

/// Spec §6: clients may use any `clientId` of 1-64 printable characters.
fn is_valid_client_id(id: &str) -> bool {
    !id.is_empty() && id.len() <= 64 && id.chars().all(|c| c.is_ascii_graphic() || c == ' ')
}

fn respond(status: StatusCode, message: &str) -> discovery::HttpResponse {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(serde_json::json!({ "error": message }).to_string())))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_rejects_different_lengths() {
        assert!(!constant_time_eq(b"short", b"longer-token"));
    }

    #[test]
    fn constant_time_eq_accepts_equal_bytes() {
        assert!(constant_time_eq(b"matching-token", b"matching-token"));
    }

    #[test]
    fn client_id_validation() {
        assert!(is_valid_client_id("abc-123"));
        assert!(!is_valid_client_id(""));
        assert!(!is_valid_client_id(&"x".repeat(65)));
    }

    #[test]
    fn loopback_detection() {
        assert!(is_loopback("127.0.0.1".parse().unwrap()));
        assert!(is_loopback("::1".parse().unwrap()));
        assert!(!is_loopback("10.0.0.5".parse().unwrap()));
    }
}
