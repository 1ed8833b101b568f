//! Per-client inbound WebSocket actors.
//!
//! Each CDP client gets its own reader task (parses frames, hands them to
//! the router, never blocks on the extension round trip) and a writer task
//! that drains a bounded mailbox. Command-reply ordering is
//! preserved without serializing the reader: dispatch futures are pushed
//! onto an unbounded *order* queue in arrival order, and a dedicated pump
//! task awaits them one at a time before handing the resolved frame to the
//! writer, so a slow forward can never let a later command's reply jump
//! the queue.

use std::collections::HashMap;
use std::sync::Arc;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::protocol::{frame::coding::CloseCode, CloseFrame};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use crate::registry::ClientId;
use crate::router::{DispatchFuture, Router};
use crate::wire;

/// Mailbox capacity before a client is considered non-responsive and its
/// link is closed: bounded-mailbox overflow is treated as a policy close.
const MAILBOX_CAPACITY: usize = 256;

/// The underlying byte stream a client's WebSocket runs over. Production
/// connections are upgraded `hyper` connections (`server::ConnIo`); tests
/// drive a raw `TcpStream` instead. Either works since only the split
/// sink/source halves are ever touched here.
pub trait WsStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> WsStream for T {}

enum CloseReason {
    MailboxOverflow,
    /// This `clientId` was claimed by a newer connection (spec §4.5:
    /// last-writer-wins for duplicate `clientId`s).
    Superseded,
}

impl CloseReason {
    fn wire_reason(&self) -> &'static str {
        match self {
            CloseReason::MailboxOverflow => "client mailbox overflow",
            CloseReason::Superseded => "clientId superseded by a newer connection",
        }
    }
}

/// A registered client's outbound handles, held by `ClientRegistry` so other
/// components (event fan-out, extension-disconnect teardown) can reach it
/// without going through the client's own reader/writer tasks.
#[derive(Clone)]
pub struct ClientHandle {
    frames: mpsc::Sender<Message>,
    control: mpsc::UnboundedSender<CloseReason>,
}

impl ClientHandle {
    /// Best-effort delivery of an event frame. On mailbox overflow the
    /// client link is closed rather than silently dropping frames forever.
    pub fn send_event(&self, frame: &wire::EventFrame) {
        let Ok(text) = wire::encode(frame) else { return };
        if self.frames.try_send(Message::Text(text.into())).is_err() {
            warn!("client mailbox full, closing link");
            let _ = self.control.send(CloseReason::MailboxOverflow);
        }
    }

}

/// Tracks every currently-connected client's outbound handle.
#[derive(Clone, Default)]
pub struct ClientRegistry {
    inner: Arc<Mutex<HashMap<ClientId, ClientHandle>>>,
}

impl ClientRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client, replacing any prior connection under the same id
    /// (last-writer-wins). Returns the handle that was displaced,
    /// if any, so the caller can tell it to close.
    pub async fn register(&self, client_id: ClientId, handle: ClientHandle) -> Option<ClientHandle> {
        self.inner.lock().await.insert(client_id, handle)
    }

    pub async fn unregister(&self, client_id: &ClientId) {
        self.inner.lock().await.remove(client_id);
    }

    pub async fn get(&self, client_id: &ClientId) -> Option<ClientHandle> {
        self.inner.lock().await.get(client_id).cloned()
    }

    pub async fn send_to(&self, client_id: &ClientId, frame: &wire::EventFrame) {
        if let Some(handle) = self.get(client_id).await {
            handle.send_event(frame);
        }
    }

    pub async fn send_to_many(&self, client_ids: &[ClientId], frame: &wire::EventFrame) {
        let inner = self.inner.lock().await;
        for id in client_ids {
            if let Some(handle) = inner.get(id) {
                handle.send_event(frame);
            }
        }
    }

    /// Every currently-connected client id, used to broadcast session-less
    /// (browser-scope) events from the extension to everyone.
    pub async fn all_client_ids(&self) -> Vec<ClientId> {
        self.inner.lock().await.keys().cloned().collect()
    }
}

type WsSink<S> = SplitSink<WebSocketStream<S>, Message>;
type WsSource<S> = SplitStream<WebSocketStream<S>>;

/// Drive one client connection end to end: register it, spawn its writer
/// and reply-pump tasks, read frames until the socket closes, then tear
/// down its subscriptions.
pub async fn run<S: WsStream>(
    client_id: ClientId,
    ws: WebSocketStream<S>,
    router: Arc<Router>,
    clients: ClientRegistry,
) {
    let (sink, mut source) = ws.split();
    let (frames_tx, frames_rx) = mpsc::channel::<Message>(MAILBOX_CAPACITY);
    let (control_tx, control_rx) = mpsc::unbounded_channel::<CloseReason>();
    let (order_tx, order_rx) = mpsc::unbounded_channel::<DispatchFuture>();

    let handle = ClientHandle { frames: frames_tx.clone(), control: control_tx };
    if let Some(displaced) = clients.register(client_id.clone(), handle).await {
        let _ = displaced.control.send(CloseReason::Superseded);
    }

    let writer = tokio::spawn(run_writer(sink, frames_rx, control_rx));
    let pump = tokio::spawn(run_reply_pump(order_rx, frames_tx.clone()));

    read_loop(&client_id, &mut source, &router, &order_tx).await;

    drop(order_tx);
    let _ = pump.await;
    drop(frames_tx);
    let _ = writer.await;

    clients.unregister(&client_id).await;
    router.registry().remove_client(&client_id).await;
    info!(client_id = %client_id, "client link closed");
}

async fn read_loop<S: WsStream>(
    client_id: &ClientId,
    source: &mut WsSource<S>,
    router: &Arc<Router>,
    order_tx: &mpsc::UnboundedSender<DispatchFuture>,
) {
    while let Some(message) = source.next().await {
        let message = match message {
            Ok(m) => m,
            Err(e) => {
                debug!(client_id = %client_id, error = %e, "client socket error");
                break;
            }
        };
        let raw = match message {
            Message::Text(t) => t.to_string(),
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) | Message::Binary(_) | Message::Frame(_) => continue,
        };

        match wire::decode_command(&raw) {
            Ok(frame) => {
                let fut = router.clone().make_dispatch(client_id.clone(), frame);
                if order_tx.send(fut).is_err() {
                    break;
                }
            }
            Err(err) => {
                if let Some(id) = extract_id(&raw) {
                    let reply = wire::ResponseFrame::from_error(id, &err);
                    let fut = Box::pin(async move { crate::router::DispatchOutcome { reply, extra_events: Vec::new() } });
                    if order_tx.send(fut).is_err() {
                        break;
                    }
                } else {
                    warn!(client_id = %client_id, "dropping unparsable frame with no id");
                }
            }
        }
    }
}

fn extract_id(raw: &str) -> Option<u64> {
    let value: Value = serde_json::from_str(raw).ok()?;
    value.get("id")?.as_u64()
}

async fn run_reply_pump(mut order_rx: mpsc::UnboundedReceiver<DispatchFuture>, frames_tx: mpsc::Sender<Message>) {
    while let Some(fut) = order_rx.recv().await {
        let outcome = fut.await;
        let Ok(text) = wire::encode(&outcome.reply) else { continue };
        if frames_tx.send(Message::Text(text.into())).await.is_err() {
            break;
        }
        for event in outcome.extra_events {
            let Ok(text) = wire::encode(&event) else { continue };
            if frames_tx.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    }
}

async fn run_writer<S: WsStream>(
    mut sink: WsSink<S>,
    mut frames_rx: mpsc::Receiver<Message>,
    mut control_rx: mpsc::UnboundedReceiver<CloseReason>,
) {
    loop {
        tokio::select! {
            biased;
            reason = control_rx.recv() => {
                if let Some(reason) = reason {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code: CloseCode::Policy,
                            reason: reason.wire_reason().into(),
                        })))
                        .await;
                }
                break;
            }
            message = frames_rx.recv() => {
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
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_id_reads_top_level_id() {
        assert_eq!(extract_id(r#"{"id":5,"method":"X"}"#), Some(5));
        assert_eq!(extract_id("not json"), None);
        assert_eq!(extract_id(r#"{"method":"X"}"#), None);
    }
}
