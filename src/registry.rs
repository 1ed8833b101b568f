//! Session registry: tracks targets, sessions, and which clients are
//! subscribed to which session's events.
//!
//! A single lock guards a handful of `HashMap`s behind an async-friendly API
//! that never holds the guard across an `.await`; targets and sessions are
//! modeled arena-by-id rather than as an `Arc` graph.

use std::collections::{HashMap, HashSet};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;

pub type ClientId = String;

/// A page-level debugging target, as reported by the extension.
#[derive(Debug, Clone)]
pub struct Target {
    pub target_id: String,
    pub url: String,
    pub title: String,
    pub target_type: String,
    /// Monotonic attach order, used to break ties when listing targets and
    /// to pick "the earliest-attached target" for browser-scope rewrites.
    pub attach_seq: u64,
}

/// An active CDP session bound to exactly one target.
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: String,
    pub target_id: String,
}

/// A point-in-time view of the registry, as served by `GET /json/list` and
/// the extension-status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ExtensionStatusSnapshot {
    pub connected: bool,
    pub page_count: usize,
    pub pages: Vec<TargetInfo>,
}

/// The public shape of a target, as it appears in `Target.getTargets`
/// results and HTTP discovery responses.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetInfo {
    pub target_id: String,
    #[serde(rename = "type")]
    pub target_type: String,
    pub title: String,
    pub url: String,
    pub attached: bool,
}

#[derive(Default)]
struct Inner {
    targets: HashMap<String, Target>,
    sessions: HashMap<String, Session>,
    target_session: HashMap<String, String>,
    subscribers: HashMap<String, HashSet<ClientId>>,
    auto_attach_clients: HashSet<ClientId>,
    attach_seq: u64,
}

/// Holds the full set of targets/sessions/subscriptions. All mutating
/// operations take the single internal lock for a small, synchronous
/// critical section and never `.await` while holding it.
pub struct SessionRegistry {
    inner: Mutex<Inner>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Emitted to subscribers when a session is torn down, so the caller can
/// fan out `Target.detachedFromTarget`.
pub struct DetachOutcome {
    pub session_id: String,
    pub subscribers: Vec<ClientId>,
}

impl SessionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self { inner: Mutex::new(Inner::default()) }
    }

    /// Record that the extension attached a target, assigning it the given
    /// (browser-authoritative) session id. Idempotent: re-attaching a target
    /// that already has a session returns the existing session id.
    pub async fn attach(&self, target_id: &str, session_id: &str, url: String, title: String) {
        let mut inner = self.inner.lock().await;
        if inner.target_session.contains_key(target_id) {
            return;
        }
        inner.attach_seq += 1;
        let seq = inner.attach_seq;
        inner.targets.insert(
            target_id.to_string(),
            Target {
                target_id: target_id.to_string(),
                url,
                title,
                target_type: "page".to_string(),
                attach_seq: seq,
            },
        );
        inner.sessions.insert(
            session_id.to_string(),
            Session { session_id: session_id.to_string(), target_id: target_id.to_string() },
        );
        inner.target_session.insert(target_id.to_string(), session_id.to_string());
    }

    /// Record that the extension detached a target. Returns the removed
    /// session id and the clients that were subscribed to it, if any.
    pub async fn detach(&self, target_id: &str) -> Option<DetachOutcome> {
        let mut inner = self.inner.lock().await;
        let session_id = inner.target_session.remove(target_id)?;
        inner.targets.remove(target_id);
        inner.sessions.remove(&session_id);
        let subscribers = inner
            .subscribers
            .remove(&session_id)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default();
        Some(DetachOutcome { session_id, subscribers })
    }

    /// Update title/url for a target already known to the registry.
    pub async fn update_target_info(&self, target_id: &str, url: String, title: String) {
        let mut inner = self.inner.lock().await;
        if let Some(target) = inner.targets.get_mut(target_id) {
            target.url = url;
            target.title = title;
        }
    }

    pub async fn session_for_target(&self, target_id: &str) -> Option<String> {
        let inner = self.inner.lock().await;
        inner.target_session.get(target_id).cloned()
    }

    pub async fn target_for_session(&self, session_id: &str) -> Option<String> {
        let inner = self.inner.lock().await;
        inner.sessions.get(session_id).map(|s| s.target_id.clone())
    }

    pub async fn session_exists(&self, session_id: &str) -> bool {
        let inner = self.inner.lock().await;
        inner.sessions.contains_key(session_id)
    }

    /// The earliest-attached target with an open session, used by
    /// browser-scope rewrites that need to pick a single target: earliest
    /// attach order, ties broken by `targetId`.
    pub async fn earliest_session(&self) -> Option<String> {
        let inner = self.inner.lock().await;
        let mut targets: Vec<&Target> = inner.targets.values().collect();
        targets.sort_by(|a, b| a.attach_seq.cmp(&b.attach_seq).then(a.target_id.cmp(&b.target_id)));
        let target_id = &targets.first()?.target_id;
        inner.target_session.get(target_id).cloned()
    }

    pub async fn subscribe(&self, client_id: &ClientId, session_id: &str) {
        let mut inner = self.inner.lock().await;
        inner.subscribers.entry(session_id.to_string()).or_default().insert(client_id.clone());
    }

    pub async fn unsubscribe(&self, client_id: &ClientId, session_id: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(set) = inner.subscribers.get_mut(session_id) {
            set.remove(client_id);
        }
    }

    /// Remove a client from every subscription and the auto-attach set, for
    /// use when its connection closes.
    pub async fn remove_client(&self, client_id: &ClientId) {
        let mut inner = self.inner.lock().await;
        for set in inner.subscribers.values_mut() {
            set.remove(client_id);
        }
        inner.auto_attach_clients.remove(client_id);
    }

    pub async fn subscribers_of(&self, session_id: &str) -> Vec<ClientId> {
        let inner = self.inner.lock().await;
        inner.subscribers.get(session_id).map(|s| s.iter().cloned().collect()).unwrap_or_default()
    }

    pub async fn enable_auto_attach(&self, client_id: &ClientId) {
        let mut inner = self.inner.lock().await;
        inner.auto_attach_clients.insert(client_id.clone());
    }

    pub async fn auto_attach_clients(&self) -> Vec<ClientId> {
        let inner = self.inner.lock().await;
        inner.auto_attach_clients.iter().cloned().collect()
    }

    /// List every known target, ordered by attach order (ties by targetId),
    /// annotated with whether it currently has an attached session.
    pub async fn list_targets(&self) -> Vec<TargetInfo> {
        let inner = self.inner.lock().await;
        let mut targets: Vec<&Target> = inner.targets.values().collect();
        targets.sort_by(|a, b| a.attach_seq.cmp(&b.attach_seq).then(a.target_id.cmp(&b.target_id)));
        targets
            .into_iter()
            .map(|t| TargetInfo {
                target_id: t.target_id.clone(),
                target_type: t.target_type.clone(),
                title: t.title.clone(),
                url: t.url.clone(),
                attached: true,
            })
            .collect()
    }

    pub async fn snapshot(&self, extension_connected: bool) -> ExtensionStatusSnapshot {
        let pages = self.list_targets().await;
        ExtensionStatusSnapshot {
            connected: extension_connected,
            page_count: pages.len(),
            pages,
        }
    }

    pub async fn target_count(&self) -> usize {
        let inner = self.inner.lock().await;
        inner.targets.len()
    }

    pub async fn session_count(&self) -> usize {
        let inner = self.inner.lock().await;
        inner.sessions.len()
    }

    /// Tear down every target/session/subscription, e.g. because the
    /// extension link closed. Returns the removed sessions and their
    /// subscribers so the caller can fan out detach events.
    pub async fn clear(&self) -> Vec<DetachOutcome> {
        let mut inner = self.inner.lock().await;
        let sessions: Vec<String> = inner.sessions.keys().cloned().collect();
        let mut outcomes = Vec::with_capacity(sessions.len());
        for session_id in sessions {
            let subscribers =
                inner.subscribers.remove(&session_id).map(|s| s.into_iter().collect()).unwrap_or_default();
            outcomes.push(DetachOutcome { session_id, subscribers });
        }
        inner.targets.clear();
        inner.sessions.clear();
        inner.target_session.clear();
        outcomes
    }

    /// The `Target.getTargets` projection used by the router's synthesize path.
    pub async fn get_targets_result(&self) -> Value {
        let infos = self.list_targets().await;
        serde_json::json!({ "targetInfos": infos })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn attach_is_idempotent() {
        let reg = SessionRegistry::new();
        reg.attach("t1", "s1", "http://a".into(), "A".into()).await;
        reg.attach("t1", "s2", "http://b".into(), "B".into()).await;
        assert_eq!(reg.session_for_target("t1").await, Some("s1".to_string()));
        assert_eq!(reg.session_count().await, 1);
    }

    #[tokio::test]
    async fn detach_returns_subscribers() {
        let reg = SessionRegistry::new();
        reg.attach("t1", "s1", "http://a".into(), "A".into()).await;
        reg.subscribe(&"c1".to_string(), "s1").await;
        reg.subscribe(&"c2".to_string(), "s1").await;
        let outcome = reg.detach("t1").await.unwrap();
        assert_eq!(outcome.session_id, "s1");
        assert_eq!(outcome.subscribers.len(), 2);
        assert!(reg.detach("t1").await.is_none());
    }

    #[tokio::test]
    async fn list_targets_orders_by_attach_seq() {
        let reg = SessionRegistry::new();
        reg.attach("t2", "s2", "http://b".into(), "B".into()).await;
        reg.attach("t1", "s1", "http://a".into(), "A".into()).await;
        let listed = reg.list_targets().await;
        assert_eq!(listed[0].target_id, "t2");
        assert_eq!(listed[1].target_id, "t1");
    }

    #[tokio::test]
    async fn clear_tears_down_everything() {
        let reg = SessionRegistry::new();
        reg.attach("t1", "s1", "http://a".into(), "A".into()).await;
        reg.subscribe(&"c1".to_string(), "s1").await;
        let outcomes = reg.clear().await;
        assert_eq!(outcomes.len(), 1);
        assert_eq!(reg.target_count().await, 0);
        assert_eq!(reg.session_count().await, 0);
    }

    #[tokio::test]
    async fn remove_client_clears_subscriptions_and_auto_attach() {
        let reg = SessionRegistry::new();
        let client = "c1".to_string();
        reg.attach("t1", "s1", "http://a".into(), "A".into()).await;
        reg.subscribe(&client, "s1").await;
        reg.enable_auto_attach(&client).await;
        reg.remove_client(&client).await;
        assert!(reg.subscribers_of("s1").await.is_empty());
        assert!(reg.auto_attach_clients().await.is_empty());
    }
}
