//! Shared black-box test helpers: spin up a real relay on an ephemeral
//! loopback port and drive it with real WebSocket connections, matching the
//! teacher's `tests/e2e_test.rs` / `tests/mock_chrome.rs` pattern of
//! exercising the real stack rather than a mocked transport.

use std::net::SocketAddr;
use std::time::Duration;

use cdp_relay::config::Config;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

pub type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Start a relay on an ephemeral loopback port and return its address. The
/// server task is leaked for the test's lifetime (process exit reclaims
/// it), matching how short-lived integration tests in this style are
/// written elsewhere in the retrieval pack.
pub async fn spawn_relay() -> SocketAddr {
    let config = Config { port: 0, ..Config::default() };
    let listener = cdp_relay::server::bind(&config).await.expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(cdp_relay::server::serve(listener, config));
    addr
}

pub async fn connect_client(addr: SocketAddr, client_id: &str) -> Ws {
    let url = format!("ws://{addr}/cdp/{client_id}");
    let (ws, _) = tokio_tungstenite::connect_async(url).await.expect("client connect");
    ws
}

pub async fn connect_extension(addr: SocketAddr) -> Ws {
    let url = format!("ws://{addr}/extension");
    let (ws, _) = tokio_tungstenite::connect_async(url).await.expect("extension connect");
    ws
}

pub async fn send(ws: &mut Ws, value: Value) {
    ws.send(Message::Text(value.to_string().into())).await.expect("send frame");
}

/// Receive and parse the next text frame, skipping ping/pong control frames.
pub async fn recv(ws: &mut Ws) -> Value {
    loop {
        match tokio::time::timeout(Duration::from_secs(5), ws.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => return serde_json::from_str(&text).expect("json frame"),
            Ok(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => continue,
            Ok(Some(Ok(other))) => panic!("unexpected frame: {other:?}"),
            Ok(Some(Err(e))) => panic!("websocket error: {e}"),
            Ok(None) => panic!("connection closed while waiting for a frame"),
            Err(_) => panic!("timed out waiting for a frame"),
        }
    }
}

/// Drive the extension side of an attach handshake: send a `meta` attach
/// frame for `target_id`/`session_id` and return once it has been sent.
pub async fn extension_attach(ext: &mut Ws, target_id: &str, session_id: &str, url: &str, title: &str) {
    send(
        ext,
        json!({
            "type": "meta",
            "payload": {
                "kind": "attached",
                "targetId": target_id,
                "sessionId": session_id,
                "url": url,
                "title": title,
            }
        }),
    )
    .await;
}

/// Read the next `cdp`-tagged envelope the extension receives (a forwarded
/// command), returning its relay-assigned id, method, params and sessionId.
pub async fn recv_extension_command(ext: &mut Ws) -> (u64, String, Value, Option<String>) {
    let envelope = recv(ext).await;
    assert_eq!(envelope["type"], "cdp");
    let payload = &envelope["payload"];
    (
        payload["id"].as_u64().expect("command id"),
        payload["method"].as_str().expect("command method").to_string(),
        payload["params"].clone(),
        envelope["sessionId"].as_str().map(str::to_string),
    )
}

/// Reply to a forwarded command as the extension would.
pub async fn extension_reply(ext: &mut Ws, id: u64, result: Value) {
    send(ext, json!({ "type": "cdp", "payload": { "id": id, "result": result } })).await;
}
