//! The single inbound WebSocket connection from the browser extension.
//!
//! A pending-commands map keyed by a relay-assigned `u64` id, a oneshot per
//! pending request, and a single writer half shared behind a mutex so
//! `send_command`-style callers never race each other onto the socket.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::StreamExt;
use futures::SinkExt;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::warn;

use crate::client_link::WsStream;
use crate::error::{Error, Result};
use crate::router::Router;
use crate::wire::{EventFrame, ExtensionEnvelope};

struct Pending {
    sender: oneshot::Sender<Result<Value>>,
    /// Spec §3: pending requests carry a creation timestamp. Exposed via
    /// `oldest_pending_age` for the periodic cleanup task's diagnostics.
    created_at: DateTime<Utc>,
}

struct Inner {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, Pending>>,
    outbound: mpsc::Sender<Message>,
    connected: AtomicBool,
    closed_tx: watch::Sender<bool>,
}

/// A handle to the current extension connection. Cloning is cheap; all
/// clones refer to the same underlying socket writer and pending table.
#[derive(Clone)]
pub struct ExtensionLink {
    inner: Arc<Inner>,
}

impl ExtensionLink {
    /// Construct a link around an outbound mailbox. The caller owns the
    /// actual WebSocket split: the reader loop feeds `handle_inbound`, and
    /// a separate writer task drains `outbound_rx` onto the socket.
    #[must_use]
    pub fn new(outbound: mpsc::Sender<Message>) -> Self {
        let (closed_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                next_id: AtomicU64::new(1),
                pending: Mutex::new(HashMap::new()),
                outbound,
                connected: AtomicBool::new(true),
                closed_tx,
            }),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    /// Whether `self` and `other` refer to the same underlying connection,
    /// used by the server to tell whether a finishing connection task is
    /// still the router's active extension (and so should clear it) or has
    /// already been superseded by a replacement.
    #[must_use]
    pub fn is_same(&self, other: &ExtensionLink) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Subscribe to this link's closed signal. Fires once `close()` has been
    /// called, whether because the socket dropped or a replacement extension
    /// connected.
    pub fn subscribe_closed(&self) -> watch::Receiver<bool> {
        self.inner.closed_tx.subscribe()
    }

    /// Send a CDP command to the extension and await its reply. Allocates a
    /// fresh relay-scoped id so concurrent forwards from many clients never
    /// collide with each other on the extension's own wire.
    pub async fn request(&self, method: &str, params: Value, session_id: Option<String>) -> Result<Value> {
        if !self.is_connected() {
            return Err(Error::ExtensionDisconnected);
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.inner.pending.lock().await;
            pending.insert(id, Pending { sender: tx, created_at: Utc::now() });
        }

        let envelope = ExtensionEnvelope::Cdp {
            session_id,
            payload: serde_json::json!({ "id": id, "method": method, "params": params }),
        };
        let text = serde_json::to_string(&envelope)?;
        if self.inner.outbound.send(Message::Text(text.into())).await.is_err() {
            self.fail_pending(id).await;
            return Err(Error::ExtensionDisconnected);
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::ExtensionDisconnected),
        }
    }

    async fn fail_pending(&self, id: u64) {
        let mut pending = self.inner.pending.lock().await;
        pending.remove(&id);
    }

    /// Resolve a pending request carried in a response envelope from the
    /// extension. `result` carries `Ok` for a successful CDP result or `Err`
    /// with the protocol error the extension reported.
    pub async fn resolve(&self, id: u64, result: Result<Value>) {
        let waiter = {
            let mut pending = self.inner.pending.lock().await;
            pending.remove(&id)
        };
        match waiter {
            Some(p) => {
                let _ = p.sender.send(result);
            }
            None => warn!(id, "reply for unknown or already-resolved pending request"),
        }
    }

    /// Mark the link closed and fail every outstanding pending request with
    /// `ExtensionDisconnected`.
    pub async fn close(&self) {
        self.inner.connected.store(false, Ordering::Release);
        let _ = self.inner.closed_tx.send(true);
        let mut pending = self.inner.pending.lock().await;
        for (id, waiter) in pending.drain() {
            warn!(id, "dropping pending request: extension disconnected");
            let _ = waiter.sender.send(Err(Error::ExtensionDisconnected));
        }
    }

    pub async fn pending_count(&self) -> usize {
        self.inner.pending.lock().await.len()
    }

    /// Age of the oldest still-outstanding pending request, if any. Used by
    /// the periodic cleanup task to log about forwards that have been
    /// in-flight unusually long. Never force-cancels one, forwards carry no
    /// intrinsic deadline, this only surfaces the fact.
    pub async fn oldest_pending_age(&self) -> Option<chrono::Duration> {
        let pending = self.inner.pending.lock().await;
        pending.values().map(|p| Utc::now() - p.created_at).max()
    }
}

/// Parse the JSON text of an inbound extension message into its envelope.
pub fn parse_extension_message(raw: &str) -> Result<ExtensionEnvelope> {
    serde_json::from_str(raw).map_err(|e| Error::invalid_request(format!("malformed extension frame: {e}")))
}

/// Drive one accepted extension WebSocket end to end: register it as the
/// router's active extension (replacing and closing any prior one), pump
/// inbound frames until the socket closes, then clear it back out if it is
/// still the active link.
pub async fn run<S: WsStream>(ws: WebSocketStream<S>, router: Arc<Router>) {
    let (mut sink, mut source) = ws.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Message>(256);
    let link = ExtensionLink::new(outbound_tx);
    let mut closed_rx = link.subscribe_closed();

    if let Some(previous) = router.replace_extension(link.clone()).await {
        previous.close().await;
        broadcast_clear(&router).await;
    }

    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                changed = closed_rx.changed() => {
                    if changed.is_err() || *closed_rx.borrow() {
                        let _ = send_close(&mut sink, "extension replaced").await;
                        break;
                    }
                }
                message = outbound_rx.recv() => {
                    match message {
                        Some(message) => {
                            if sink.send(message).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        }
    });

    while let Some(message) = source.next().await {
        match message {
            Ok(Message::Text(text)) => handle_extension_frame(&text, &router, &link).await,
            Ok(Message::Close(_)) => break,
            Ok(Message::Ping(_) | Message::Pong(_) | Message::Binary(_) | Message::Frame(_)) => continue,
            Err(e) => {
                warn!(error = %e, "extension socket error");
                break;
            }
        }
    }

    link.close().await;
    if router.clear_extension_if_current(&link).await {
        broadcast_clear(&router).await;
    }
    let _ = writer.await;
}

/// Tear down every known target/session and tell their subscribers, used
/// both when the extension link closes outright and when a replacement
/// connects: the registry gets reseeded from the new extension's own attach
/// reports, so it is simply cleared here.
async fn broadcast_clear(router: &Arc<Router>) {
    for outcome in router.registry().clear().await {
        let event = EventFrame::new(
            "Target.detachedFromTarget",
            json!({ "sessionId": outcome.session_id }),
            None,
        );
        router.clients().send_to_many(&outcome.subscribers, &event).await;
    }
}

async fn handle_extension_frame(raw: &str, router: &Arc<Router>, link: &ExtensionLink) {
    let envelope = match parse_extension_message(raw) {
        Ok(e) => e,
        Err(e) => {
            warn!(error = %e, "malformed extension frame, dropping");
            return;
        }
    };

    match envelope {
        ExtensionEnvelope::Cdp { session_id, payload } => {
            if let Some(id) = payload.get("id").and_then(Value::as_u64) {
                let result = if let Some(err) = payload.get("error") {
                    let code = err.get("code").and_then(Value::as_i64).unwrap_or(-32000) as i32;
                    let message =
                        err.get("message").and_then(Value::as_str).unwrap_or("extension error").to_string();
                    Err(Error::Cdp { code, message })
                } else {
                    Ok(payload.get("result").cloned().unwrap_or(Value::Null))
                };
                link.resolve(id, result).await;
            } else if let Some(method) = payload.get("method").and_then(Value::as_str) {
                let params = payload.get("params").cloned().unwrap_or(Value::Null);
                let event = EventFrame::new(method, params, session_id);
                fan_out_event(router, &event).await;
            }
        }
        ExtensionEnvelope::Meta { payload } => handle_meta(router, payload).await,
    }
}

async fn fan_out_event(router: &Arc<Router>, event: &EventFrame) {
    match &event.session_id {
        Some(session_id) => {
            let subscribers = router.registry().subscribers_of(session_id).await;
            router.clients().send_to_many(&subscribers, event).await;
        }
        None => {
            let all = router.clients().all_client_ids().await;
            router.clients().send_to_many(&all, event).await;
        }
    }
}

/// Target lifecycle notifications the extension pushes unprompted: attach,
/// detach, and info (title/url) changes. A target is created when the
/// extension reports attachment and destroyed when it reports detachment.
async fn handle_meta(router: &Arc<Router>, payload: Value) {
    let kind = payload.get("kind").and_then(Value::as_str).unwrap_or_default();
    match kind {
        "attached" => {
            let (Some(target_id), Some(session_id)) = (
                payload.get("targetId").and_then(Value::as_str),
                payload.get("sessionId").and_then(Value::as_str),
            ) else {
                warn!("attached meta frame missing targetId/sessionId");
                return;
            };
            let url = payload.get("url").and_then(Value::as_str).unwrap_or_default().to_string();
            let title = payload.get("title").and_then(Value::as_str).unwrap_or_default().to_string();
            router.registry().attach(target_id, session_id, url.clone(), title.clone()).await;

            let target_info =
                json!({ "targetId": target_id, "type": "page", "title": title, "url": url, "attached": true });
            let event = EventFrame::new(
                "Target.attachedToTarget",
                json!({ "sessionId": session_id, "targetInfo": target_info, "waitingForDebugger": false }),
                None,
            );
            for client_id in router.registry().auto_attach_clients().await {
                router.registry().subscribe(&client_id, session_id).await;
                router.clients().send_to(&client_id, &event).await;
            }
        }
        "detached" => {
            let Some(target_id) = payload.get("targetId").and_then(Value::as_str) else {
                warn!("detached meta frame missing targetId");
                return;
            };
            if let Some(outcome) = router.registry().detach(target_id).await {
                let event = EventFrame::new(
                    "Target.detachedFromTarget",
                    json!({ "sessionId": outcome.session_id }),
                    None,
                );
                router.clients().send_to_many(&outcome.subscribers, &event).await;
            }
        }
        "infoChanged" => {
            let Some(target_id) = payload.get("targetId").and_then(Value::as_str) else {
                warn!("infoChanged meta frame missing targetId");
                return;
            };
            let url = payload.get("url").and_then(Value::as_str).unwrap_or_default().to_string();
            let title = payload.get("title").and_then(Value::as_str).unwrap_or_default().to_string();
            router.registry().update_target_info(target_id, url.clone(), title.clone()).await;
            if let Some(session_id) = router.registry().session_for_target(target_id).await {
                let subscribers = router.registry().subscribers_of(&session_id).await;
                let target_info =
                    json!({ "targetId": target_id, "type": "page", "title": title, "url": url, "attached": true });
                let event = EventFrame::new(
                    "Target.targetInfoChanged",
                    json!({ "targetInfo": target_info }),
                    None,
                );
                router.clients().send_to_many(&subscribers, &event).await;
            }
        }
        other => warn!(kind = other, "unknown meta kind from extension"),
    }
}

/// Send a raw already-serialized writer-loop close handshake; exposed so
/// `server.rs` can use the same `SinkExt::send` path for the graceful
/// close of a replaced extension connection.
pub async fn send_close<S>(mut sink: S, reason: &'static str) -> Result<()>
where
    S: futures::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    use tokio_tungstenite::tungstenite::protocol::{frame::coding::CloseCode, CloseFrame};
    sink.send(Message::Close(Some(CloseFrame {
        code: CloseCode::Policy,
        reason: reason.into(),
    })))
    .await
    .map_err(|e| Error::websocket(e.to_string()))
}
