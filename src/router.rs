//! Command router: decides whether a client command is synthesized,
//! rewritten, forwarded, or rejected.
//!
//! Dispatch is one `match` table over `(domain, method, sessionId)` rather
//! than runtime-constructed closures, extended with the cookie rewrite
//! table, id-namespace-free forwarding (the extension link already
//! allocates its own ids), and the setAutoAttach / setDiscoverTargets
//! synthetic-event replay.

use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{json, Value};

use crate::client_link::ClientRegistry;
use crate::error::{Error, Result};
use crate::extension_link::ExtensionLink;
use crate::registry::{ClientId, SessionRegistry};
use crate::wire::{self, CommandFrame, EventFrame, ResponseFrame};

/// What a dispatched command resolved to: the reply to send back to the
/// originating client, plus any events that must be delivered to that same
/// client immediately after the reply (e.g. the `Target.attachedToTarget`
/// replay following `setDiscoverTargets`).
pub struct DispatchOutcome {
    pub reply: ResponseFrame,
    pub extra_events: Vec<EventFrame>,
}

/// A boxed future resolving to a `DispatchOutcome`. Pushing these onto an
/// ordering queue (see `client_link::run`) is what lets the reader keep
/// reading while a forward is in flight without losing reply ordering.
pub type DispatchFuture = BoxFuture<'static, DispatchOutcome>;

/// Shared state and logic for routing commands from any client to either a
/// synthesized answer, the extension, or a rejection.
pub struct Router {
    registry: Arc<SessionRegistry>,
    extension: tokio::sync::RwLock<Option<ExtensionLink>>,
    clients: ClientRegistry,
    version: &'static str,
}

impl Router {
    #[must_use]
    pub fn new(registry: Arc<SessionRegistry>, clients: ClientRegistry) -> Arc<Self> {
        Arc::new(Self {
            registry,
            extension: tokio::sync::RwLock::new(None),
            clients,
            version: env!("CARGO_PKG_VERSION"),
        })
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn clients(&self) -> &ClientRegistry {
        &self.clients
    }

    pub async fn set_extension(&self, link: Option<ExtensionLink>) {
        *self.extension.write().await = link;
    }

    /// Install `link` as the active extension, returning whatever was
    /// previously installed (if anything) so the caller can close it (spec
    /// §4.4: a second extension accept closes the first).
    pub async fn replace_extension(&self, link: ExtensionLink) -> Option<ExtensionLink> {
        self.extension.write().await.replace(link)
    }

    /// Clear the active extension slot, but only if it is still exactly the
    /// given link. A connection task that lost a race against a
    /// replacement must not clobber the new one. Returns whether it cleared.
    pub async fn clear_extension_if_current(&self, link: &ExtensionLink) -> bool {
        let mut guard = self.extension.write().await;
        if guard.as_ref().is_some_and(|current| current.is_same(link)) {
            *guard = None;
            true
        } else {
            false
        }
    }

    pub async fn extension_connected(&self) -> bool {
        self.extension.read().await.as_ref().is_some_and(ExtensionLink::is_connected)
    }

    /// `(pending count, oldest pending age)` of the active extension link,
    /// for the periodic cleanup task's diagnostics. `None` if no extension
    /// is connected.
    pub async fn extension_pending_snapshot(&self) -> Option<(usize, Option<chrono::Duration>)> {
        let link = self.extension.read().await.clone()?;
        Some((link.pending_count().await, link.oldest_pending_age().await))
    }

    async fn extension(&self) -> Result<ExtensionLink> {
        self.extension.read().await.clone().ok_or(Error::ExtensionDisconnected)
    }

    /// Build the future that, when awaited, computes the full response for
    /// one client command. Building it never blocks; all awaiting happens
    /// later in the caller's reply pump.
    pub fn make_dispatch(self: Arc<Self>, client_id: ClientId, frame: CommandFrame) -> DispatchFuture {
        Box::pin(async move { self.dispatch(client_id, frame).await })
    }

    async fn dispatch(&self, client_id: ClientId, frame: CommandFrame) -> DispatchOutcome {
        let id = frame.id;
        let session_id = frame.session_id.clone();
        match self.route(&client_id, &frame).await {
            Ok(outcome) => outcome,
            Err(err) => DispatchOutcome {
                reply: ResponseFrame::from_error(id, &err).with_session(session_id),
                extra_events: Vec::new(),
            },
        }
    }

    async fn route(&self, client_id: &ClientId, frame: &CommandFrame) -> Result<DispatchOutcome> {
        let (domain, method) = wire::split_method(&frame.method)
            .ok_or_else(|| Error::invalid_request(format!("malformed method {:?}", frame.method)))?;
        let params = frame.params.clone().unwrap_or(Value::Null);

        match (domain, method, frame.session_id.as_deref()) {
            ("Browser", "getVersion", _) => self.synthesize(frame, self.browser_version()),

            ("Target", "getTargets", _) => {
                let result = self.registry.get_targets_result().await;
                self.synthesize(frame, result)
            }

            ("Target", "setDiscoverTargets", _) => {
                let discover = params.get("discover").and_then(Value::as_bool).unwrap_or(false);
                let reply = self.synthesize(frame, json!({}))?;
                if discover {
                    self.registry.enable_auto_attach(client_id).await;
                    let extra_events = self.replay_attached_events(client_id).await;
                    Ok(DispatchOutcome { reply: reply.reply, extra_events })
                } else {
                    Ok(reply)
                }
            }

            ("Target", "setAutoAttach", _) => {
                self.registry.enable_auto_attach(client_id).await;
                let reply = self.synthesize(frame, json!({}))?;
                let extra_events = self.replay_attached_events(client_id).await;
                Ok(DispatchOutcome { reply: reply.reply, extra_events })
            }

            ("Target", "attachToTarget", _) => {
                let target_id = params
                    .get("targetId")
                    .and_then(Value::as_str)
                    .ok_or_else(|| Error::invalid_params("attachToTarget requires targetId"))?;
                let session_id = self
                    .registry
                    .session_for_target(target_id)
                    .await
                    .ok_or_else(|| Error::no_session(format!("target {target_id} not attached")))?;
                self.registry.subscribe(client_id, &session_id).await;
                self.synthesize(frame, json!({ "sessionId": session_id }))
            }

            ("Target", "getTargetInfo", _) => {
                let target = self.resolve_target_info(&params, frame.session_id.as_deref()).await?;
                self.synthesize(frame, json!({ "targetInfo": target }))
            }

            ("Storage", "getCookies", _) => {
                self.forward_rewritten(frame, "Network.getCookies", json!({ "urls": [] })).await
            }

            ("Storage", "setCookies", _) => {
                let mut rewritten = params.clone();
                if let Some(obj) = rewritten.as_object_mut() {
                    obj.remove("browserContextId");
                }
                self.forward_rewritten(frame, "Network.setCookies", rewritten).await
            }

            ("Storage", "clearCookies", _) => self.clear_cookies(frame).await,

            ("Browser", "setDownloadBehavior", _) => self.synthesize(frame, json!({})),

            ("Target", "createTarget", _) | ("Target", "closeTarget", _) => {
                self.forward_verbatim(frame).await
            }

            (_, _, Some(_)) => self.forward_verbatim(frame).await,

            (_, _, None) => Err(Error::method_not_found(format!(
                "no browser-scope rule for {}",
                frame.method
            ))),
        }
    }

    /// Subscribe `client_id` to every existing target's session and build
    /// the `Target.attachedToTarget` replay both `setDiscoverTargets` and
    /// `setAutoAttach` send immediately after their (empty) reply. Calling
    /// this repeatedly is idempotent: it just re-subscribes and re-replays
    /// the same prefix, since subscription is a set and the event list is
    /// rebuilt from the current registry each time.
    async fn replay_attached_events(&self, client_id: &ClientId) -> Vec<EventFrame> {
        let targets = self.registry.list_targets().await;
        let mut events = Vec::with_capacity(targets.len());
        for target in targets {
            if let Some(session_id) = self.registry.session_for_target(&target.target_id).await {
                self.registry.subscribe(client_id, &session_id).await;
                events.push(EventFrame::new(
                    "Target.attachedToTarget",
                    json!({
                        "sessionId": session_id,
                        "targetInfo": target_info_json(&target),
                        "waitingForDebugger": false,
                    }),
                    None,
                ));
            }
        }
        events
    }

    fn synthesize(&self, frame: &CommandFrame, result: Value) -> Result<DispatchOutcome> {
        Ok(DispatchOutcome {
            reply: ResponseFrame::ok(frame.id, result).with_session(frame.session_id.clone()),
            extra_events: Vec::new(),
        })
    }

    async fn forward_verbatim(&self, frame: &CommandFrame) -> Result<DispatchOutcome> {
        let link = self.extension().await?;
        if let Some(session_id) = &frame.session_id {
            if !self.registry.session_exists(session_id).await {
                return Err(Error::no_session(format!("unknown sessionId {session_id}")));
            }
        }
        let result = link
            .request(&frame.method, frame.params.clone().unwrap_or(Value::Null), frame.session_id.clone())
            .await?;
        self.synthesize(frame, result)
    }

    /// Forward under a different method name, keeping the client's id and
    /// sessionId on the reply (the "rewrite" disposition for a single-step
    /// translation with no page-level counterpart method name).
    async fn forward_rewritten(&self, frame: &CommandFrame, method: &str, params: Value) -> Result<DispatchOutcome> {
        let link = self.extension().await?;
        let session_id = self.pick_session(frame.session_id.as_deref()).await?;
        let result = link.request(method, params, Some(session_id)).await?;
        self.synthesize(frame, result)
    }

    /// `Storage.clearCookies` has no one-shot extension equivalent: read the
    /// current cookies, then issue one `Network.deleteCookies` per cookie.
    /// Zero cookies means zero extension calls. If any deletion fails after
    /// at least one succeeded, the overall command still succeeds (partial
    /// progress is not reported as failure); if the read itself fails, or
    /// the *first* deletion fails with none having succeeded, that error is
    /// surfaced (see DESIGN.md for the reasoning).
    async fn clear_cookies(&self, frame: &CommandFrame) -> Result<DispatchOutcome> {
        let link = self.extension().await?;
        let session_id = self.pick_session(frame.session_id.as_deref()).await?;

        let cookies =
            link.request("Network.getCookies", json!({ "urls": [] }), Some(session_id.clone())).await?;
        let list = cookies.get("cookies").and_then(Value::as_array).cloned().unwrap_or_default();

        let mut succeeded = 0usize;
        let mut first_error = None;
        for cookie in &list {
            let params = json!({
                "name": cookie.get("name"),
                "domain": cookie.get("domain"),
                "path": cookie.get("path"),
                "partitionKey": cookie.get("partitionKey"),
            });
            match link.request("Network.deleteCookies", params, Some(session_id.clone())).await {
                Ok(_) => succeeded += 1,
                Err(e) if first_error.is_none() => first_error = Some(e),
                Err(_) => {}
            }
        }

        // Continue past individual failures; surface the first one only if
        // nothing got through at all.
        if succeeded == 0 {
            if let Some(err) = first_error {
                let (code, message) = err.to_cdp_error();
                return Err(Error::Cdp { code, message: format!("clearCookies: {message}") });
            }
        }

        self.synthesize(frame, json!({}))
    }

    /// Resolve the target session a browser-scope rewrite should run
    /// against: the command's own sessionId if set, else the
    /// earliest-attached target.
    async fn pick_session(&self, session_id: Option<&str>) -> Result<String> {
        if let Some(session_id) = session_id {
            if self.registry.session_exists(session_id).await {
                return Ok(session_id.to_string());
            }
            return Err(Error::no_session(format!("unknown sessionId {session_id}")));
        }
        self.registry.earliest_session().await.ok_or_else(|| Error::no_session("no attached page targets"))
    }

    async fn resolve_target_info(&self, params: &Value, session_id: Option<&str>) -> Result<Value> {
        if let Some(target_id) = params.get("targetId").and_then(Value::as_str) {
            let targets = self.registry.list_targets().await;
            if let Some(t) = targets.into_iter().find(|t| t.target_id == target_id) {
                return Ok(target_info_json(&t));
            }
            return Err(Error::no_session(format!("target {target_id} not found")));
        }
        if let Some(session_id) = session_id {
            if let Some(target_id) = self.registry.target_for_session(session_id).await {
                let targets = self.registry.list_targets().await;
                if let Some(t) = targets.into_iter().find(|t| t.target_id == target_id) {
                    return Ok(target_info_json(&t));
                }
            }
        }
        self.registry
            .list_targets()
            .await
            .into_iter()
            .next()
            .map(|t| target_info_json(&t))
            .ok_or_else(|| Error::no_session("no attached page targets"))
    }

    fn browser_version(&self) -> Value {
        json!({
            "protocolVersion": "1.3",
            "product": format!("cdp-relay/{}", self.version),
            "userAgent": format!("cdp-relay/{}", self.version),
            "jsVersion": "",
        })
    }
}

fn target_info_json(target: &crate::registry::TargetInfo) -> Value {
    serde_json::to_value(target).unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn frame(id: u64, method: &str, params: Value, session_id: Option<&str>) -> CommandFrame {
        CommandFrame {
            id,
            method: method.to_string(),
            params: Some(params),
            session_id: session_id.map(str::to_string),
            extra: serde_json::Map::new(),
        }
    }

    #[tokio::test]
    async fn browser_get_version_is_synthesized() {
        let registry = Arc::new(SessionRegistry::new());
        let router = Router::new(registry, ClientRegistry::new());
        let outcome = router.dispatch("c1".to_string(), frame(1, "Browser.getVersion", Value::Null, None)).await;
        assert!(outcome.reply.error.is_none());
        assert!(outcome.reply.result.unwrap().get("protocolVersion").is_some());
    }

    #[tokio::test]
    async fn forward_without_extension_returns_extension_disconnected() {
        let registry = Arc::new(SessionRegistry::new());
        registry.attach("t1", "s1", "http://a".into(), "A".into()).await;
        let router = Router::new(registry, ClientRegistry::new());
        let outcome = router
            .dispatch("c1".to_string(), frame(1, "Page.navigate", json!({"url":"http://x"}), Some("s1")))
            .await;
        let err = outcome.reply.error.unwrap();
        assert_eq!(err.code, wire::codes::EXTENSION_DISCONNECTED);
    }

    #[tokio::test]
    async fn unknown_session_is_rejected_with_no_session() {
        let registry = Arc::new(SessionRegistry::new());
        let router = Router::new(registry, ClientRegistry::new());
        let (tx, _rx) = mpsc::channel(8);
        router.set_extension(Some(ExtensionLink::new(tx))).await;
        let outcome = router
            .dispatch("c1".to_string(), frame(1, "Page.navigate", json!({"url":"http://x"}), Some("bogus")))
            .await;
        let err = outcome.reply.error.unwrap();
        assert_eq!(err.code, wire::codes::NO_SESSION);
    }

    #[tokio::test]
    async fn unmapped_browser_scope_command_is_rejected() {
        let registry = Arc::new(SessionRegistry::new());
        let router = Router::new(registry, ClientRegistry::new());
        let outcome = router.dispatch("c1".to_string(), frame(1, "Foo.bar", Value::Null, None)).await;
        let err = outcome.reply.error.unwrap();
        assert_eq!(err.code, wire::codes::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn set_auto_attach_replays_existing_targets() {
        let registry = Arc::new(SessionRegistry::new());
        registry.attach("t1", "s1", "http://a".into(), "A".into()).await;
        let router = Router::new(registry, ClientRegistry::new());
        let outcome = router
            .dispatch("c1".to_string(), frame(1, "Target.setAutoAttach", json!({"autoAttach": true}), None))
            .await;
        assert_eq!(outcome.extra_events.len(), 1);
        assert_eq!(outcome.extra_events[0].method, "Target.attachedToTarget");
    }

    #[tokio::test]
    async fn set_discover_targets_also_replays_attached_to_target() {
        let registry = Arc::new(SessionRegistry::new());
        registry.attach("t1", "s1", "http://a".into(), "A".into()).await;
        let router = Router::new(registry, ClientRegistry::new());
        let outcome = router
            .dispatch("c1".to_string(), frame(1, "Target.setDiscoverTargets", json!({"discover": true}), None))
            .await;
        assert!(outcome.reply.result.as_ref().unwrap().as_object().unwrap().is_empty());
        assert_eq!(outcome.extra_events.len(), 1);
        assert_eq!(outcome.extra_events[0].method, "Target.attachedToTarget");
        assert_eq!(outcome.extra_events[0].params["sessionId"], "s1");
    }

    #[tokio::test]
    async fn set_discover_targets_false_replays_nothing() {
        let registry = Arc::new(SessionRegistry::new());
        registry.attach("t1", "s1", "http://a".into(), "A".into()).await;
        let router = Router::new(registry, ClientRegistry::new());
        let outcome = router
            .dispatch("c1".to_string(), frame(1, "Target.setDiscoverTargets", json!({"discover": false}), None))
            .await;
        assert!(outcome.extra_events.is_empty());
    }
}
