//! Typed index of live WebSocket sessions.
//!
//! Connections are registered after authentication and removed on socket
//! close. Three lookups are maintained: by connection id, by population and
//! by agent id. The registry owns the write half of each connection's
//! outbound channel; the connection's writer task drains the read half to
//! the socket sink, so all sends to one peer are serialized through a single
//! writer and on-the-wire order per connection is well defined.
//!
//! Agent ids are population-scoped-unique: registering a second connection
//! with an agent id that is already live closes the older session with 4002
//! before the new one takes the slot.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::auth::Principal;
use crate::protocol::{close, AgentType, MessageType};

/// Outbound channel depth per connection. A full channel means the peer is
/// not draining; sends fail and the router treats the attempt as undelivered.
pub const OUTBOUND_CHANNEL_CAP: usize = 256;

// ─── Connection ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Population {
    Agent,
    Dashboard,
}

/// Frame handed to a connection's writer task.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// A pre-serialized single message. The type travels alongside so the
    /// batcher can decide whether to coalesce without re-parsing.
    Message {
        kind: MessageType,
        json: Arc<str>,
    },
    /// WebSocket pong in reply to a protocol-level ping.
    Pong(Vec<u8>),
    Close {
        code: u16,
        reason: String,
    },
}

/// Dashboard stream subscriptions. Default is none: a dashboard sees nothing
/// until its `dashboard:init` or a `dashboard:subscribe` opts in.
#[derive(Debug, Default)]
pub struct Subscriptions {
    pub all: bool,
    pub agent_ids: HashSet<String>,
}

/// One live authenticated session.
pub struct Connection {
    pub id: String,
    pub population: Population,
    /// Set for the Agent population only.
    pub agent_id: Option<String>,
    pub agent_type: Option<AgentType>,
    pub capabilities: Vec<String>,
    pub created_at: DateTime<Utc>,

    principal: Mutex<Principal>,
    token_expires_at: Mutex<DateTime<Utc>>,
    last_activity: Mutex<Instant>,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    messages_in: AtomicU64,
    messages_out: AtomicU64,
    subscriptions: Mutex<Subscriptions>,
    outbound: mpsc::Sender<Outbound>,
}

impl Connection {
    /// Build a connection and the receiver half of its outbound channel.
    /// The caller spawns the writer task that drains the receiver.
    pub fn new(
        population: Population,
        principal: Principal,
        token_expires_at: DateTime<Utc>,
    ) -> (Arc<Self>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_CHANNEL_CAP);
        let conn = Arc::new(Self {
            id: uuid::Uuid::new_v4().to_string(),
            population,
            agent_id: None,
            agent_type: None,
            capabilities: Vec::new(),
            created_at: Utc::now(),
            principal: Mutex::new(principal),
            token_expires_at: Mutex::new(token_expires_at),
            last_activity: Mutex::new(Instant::now()),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            messages_in: AtomicU64::new(0),
            messages_out: AtomicU64::new(0),
            subscriptions: Mutex::new(Subscriptions::default()),
            outbound: tx,
        });
        (conn, rx)
    }

    /// Agent-population variant of [`Connection::new`].
    pub fn new_agent(
        principal: Principal,
        token_expires_at: DateTime<Utc>,
        agent_id: String,
        agent_type: AgentType,
        capabilities: Vec<String>,
    ) -> (Arc<Self>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_CHANNEL_CAP);
        let conn = Arc::new(Self {
            id: uuid::Uuid::new_v4().to_string(),
            population: Population::Agent,
            agent_id: Some(agent_id),
            agent_type: Some(agent_type),
            capabilities,
            created_at: Utc::now(),
            principal: Mutex::new(principal),
            token_expires_at: Mutex::new(token_expires_at),
            last_activity: Mutex::new(Instant::now()),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            messages_in: AtomicU64::new(0),
            messages_out: AtomicU64::new(0),
            subscriptions: Mutex::new(Subscriptions::default()),
            outbound: tx,
        });
        (conn, rx)
    }

    /// Queue a pre-serialized message for this peer.
    ///
    /// Returns `false` when the outbound channel is full or the writer task
    /// is gone — the caller records a delivery failure, never blocks.
    pub fn send(&self, kind: MessageType, json: Arc<str>) -> bool {
        let len = json.len() as u64;
        match self.outbound.try_send(Outbound::Message { kind, json }) {
            Ok(()) => {
                self.bytes_out.fetch_add(len, Ordering::Relaxed);
                self.messages_out.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(conn = %self.id, "outbound channel full — dropping frame");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Answer a protocol-level ping.
    pub fn pong(&self, data: Vec<u8>) {
        let _ = self.outbound.try_send(Outbound::Pong(data));
    }

    /// Ask the writer task to close the socket with `code`.
    pub fn close(&self, code: u16, reason: &str) {
        let _ = self.outbound.try_send(Outbound::Close {
            code,
            reason: reason.to_string(),
        });
    }

    pub fn record_activity(&self, bytes: u64) {
        *self.last_activity.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
        self.bytes_in.fetch_add(bytes, Ordering::Relaxed);
        self.messages_in.fetch_add(1, Ordering::Relaxed);
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .elapsed()
    }

    pub fn principal(&self) -> Principal {
        self.principal
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Replace the session identity after a successful token refresh.
    pub fn set_principal(&self, principal: Principal, expires_at: DateTime<Utc>) {
        *self.principal.lock().unwrap_or_else(|e| e.into_inner()) = principal;
        *self
            .token_expires_at
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = expires_at;
    }

    pub fn token_expires_at(&self) -> DateTime<Utc> {
        *self
            .token_expires_at
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            messages_in: self.messages_in.load(Ordering::Relaxed),
            messages_out: self.messages_out.load(Ordering::Relaxed),
        }
    }

    // ── Subscriptions (dashboards) ──────────────────────────────────────────

    pub fn set_subscriptions(&self, all: bool, agent_ids: impl IntoIterator<Item = String>) {
        let mut subs = self
            .subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        subs.all = all;
        subs.agent_ids = agent_ids.into_iter().collect();
    }

    pub fn subscribe(&self, agent_id: Option<&str>, all: bool) {
        let mut subs = self
            .subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if all {
            subs.all = true;
        }
        if let Some(id) = agent_id {
            subs.agent_ids.insert(id.to_string());
        }
    }

    pub fn unsubscribe(&self, agent_id: Option<&str>, all: bool) {
        let mut subs = self
            .subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if all {
            subs.all = false;
            subs.agent_ids.clear();
        }
        if let Some(id) = agent_id {
            subs.agent_ids.remove(id);
        }
    }

    pub fn is_subscribed_to(&self, agent_id: &str) -> bool {
        let subs = self
            .subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        subs.all || subs.agent_ids.contains(agent_id)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectionStats {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub messages_in: u64,
    pub messages_out: u64,
}

// ─── Registry ────────────────────────────────────────────────────────────────

/// Emitted on every unregister; the refresh manager drops pending exchanges
/// and the orchestrator marks agents offline from this.
#[derive(Debug, Clone)]
pub struct DisconnectEvent {
    pub connection_id: String,
    pub agent_id: Option<String>,
}

#[derive(Default)]
struct Inner {
    by_id: HashMap<String, Arc<Connection>>,
    /// agent_id → connection_id, Agent population only.
    agents: HashMap<String, String>,
}

pub struct ConnectionRegistry {
    inner: RwLock<Inner>,
    /// Silence beyond `2 × heartbeat` marks a connection unhealthy.
    heartbeat: Duration,
    disconnects: broadcast::Sender<DisconnectEvent>,
}

impl ConnectionRegistry {
    pub fn new(heartbeat: Duration) -> Self {
        let (disconnects, _) = broadcast::channel(256);
        Self {
            inner: RwLock::new(Inner::default()),
            heartbeat,
            disconnects,
        }
    }

    /// Register an authenticated connection.
    ///
    /// For agents, a live session with the same agent id is preempted: it is
    /// closed with 4002 and removed before the new session takes the slot.
    /// Returns the preempted connection, if any.
    pub fn register(&self, conn: Arc<Connection>) -> Option<Arc<Connection>> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());

        let preempted = conn.agent_id.as_ref().and_then(|agent_id| {
            let old_id = inner.agents.get(agent_id).cloned()?;
            inner.by_id.remove(&old_id)
        });
        if let Some(old) = &preempted {
            debug!(
                agent = conn.agent_id.as_deref().unwrap_or(""),
                old_conn = %old.id,
                new_conn = %conn.id,
                "agent session superseded"
            );
            old.close(close::SUPERSEDED, "superseded by newer agent session");
        }

        if let Some(agent_id) = &conn.agent_id {
            inner.agents.insert(agent_id.clone(), conn.id.clone());
        }
        inner.by_id.insert(conn.id.clone(), conn);
        preempted
    }

    /// Remove a connection and fire the disconnect hook.
    pub fn unregister(&self, connection_id: &str) -> Option<Arc<Connection>> {
        let removed = {
            let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
            let conn = inner.by_id.remove(connection_id)?;
            if let Some(agent_id) = &conn.agent_id {
                // Only clear the agent slot if this connection still owns it;
                // a preempted session must not evict its successor.
                if inner.agents.get(agent_id) == Some(&conn.id) {
                    inner.agents.remove(agent_id);
                }
            }
            Some(conn)
        };
        if let Some(conn) = &removed {
            let _ = self.disconnects.send(DisconnectEvent {
                connection_id: conn.id.clone(),
                agent_id: conn.agent_id.clone(),
            });
        }
        removed
    }

    pub fn subscribe_disconnects(&self) -> broadcast::Receiver<DisconnectEvent> {
        self.disconnects.subscribe()
    }

    pub fn get(&self, connection_id: &str) -> Option<Arc<Connection>> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .by_id
            .get(connection_id)
            .cloned()
    }

    /// Snapshot of one population.
    pub fn by_population(&self, population: Population) -> Vec<Arc<Connection>> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .by_id
            .values()
            .filter(|c| c.population == population)
            .cloned()
            .collect()
    }

    /// Snapshot of every live connection.
    pub fn all(&self) -> Vec<Arc<Connection>> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .by_id
            .values()
            .cloned()
            .collect()
    }

    pub fn by_agent(&self, agent_id: &str) -> Option<Arc<Connection>> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let conn_id = inner.agents.get(agent_id)?;
        inner.by_id.get(conn_id).cloned()
    }

    pub fn record_activity(&self, connection_id: &str, bytes: u64) {
        if let Some(conn) = self.get(connection_id) {
            conn.record_activity(bytes);
        }
    }

    /// Health = registered ∧ last activity within twice the heartbeat interval.
    pub fn is_healthy(&self, connection_id: &str) -> bool {
        match self.get(connection_id) {
            Some(conn) => self.is_conn_healthy(&conn),
            None => false,
        }
    }

    pub fn is_conn_healthy(&self, conn: &Connection) -> bool {
        conn.idle_for() <= self.heartbeat * 2
    }

    /// Connections silent for `3 × heartbeat`, due to be closed GoingAway.
    pub fn overdue(&self) -> Vec<Arc<Connection>> {
        let cutoff = self.heartbeat * 3;
        self.all()
            .into_iter()
            .filter(|c| c.idle_for() > cutoff)
            .collect()
    }

    pub fn count(&self, population: Population) -> usize {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .by_id
            .values()
            .filter(|c| c.population == population)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Role;

    fn principal() -> Principal {
        Principal {
            user_id: "u-1".to_string(),
            email: "dev@example.com".to_string(),
            role: Role::Operator,
        }
    }

    fn far_expiry() -> DateTime<Utc> {
        Utc::now() + chrono::Duration::hours(1)
    }

    fn registry() -> ConnectionRegistry {
        ConnectionRegistry::new(Duration::from_secs(30))
    }

    #[tokio::test]
    async fn register_and_lookup_by_agent() {
        let reg = registry();
        let (conn, _rx) = Connection::new_agent(
            principal(),
            far_expiry(),
            "A1".to_string(),
            AgentType::Claude,
            vec![],
        );
        assert!(reg.register(conn.clone()).is_none());
        let found = reg.by_agent("A1").expect("agent indexed");
        assert_eq!(found.id, conn.id);
        assert_eq!(reg.count(Population::Agent), 1);
    }

    #[tokio::test]
    async fn duplicate_agent_id_preempts_older_session() {
        let reg = registry();
        let (old, mut old_rx) = Connection::new_agent(
            principal(),
            far_expiry(),
            "A1".to_string(),
            AgentType::Claude,
            vec![],
        );
        let (new, _new_rx) = Connection::new_agent(
            principal(),
            far_expiry(),
            "A1".to_string(),
            AgentType::Claude,
            vec![],
        );
        reg.register(old.clone());
        let preempted = reg.register(new.clone()).expect("old session preempted");
        assert_eq!(preempted.id, old.id);

        // The old writer receives a 4002 close frame.
        match old_rx.recv().await.expect("close frame") {
            Outbound::Close { code, .. } => assert_eq!(code, close::SUPERSEDED),
            other => panic!("expected Close, got {other:?}"),
        }
        // New session owns the slot.
        assert_eq!(reg.by_agent("A1").expect("slot").id, new.id);
        assert_eq!(reg.count(Population::Agent), 1);
    }

    #[tokio::test]
    async fn unregister_fires_disconnect_hook() {
        let reg = registry();
        let mut hook = reg.subscribe_disconnects();
        let (conn, _rx) = Connection::new_agent(
            principal(),
            far_expiry(),
            "A1".to_string(),
            AgentType::Mock,
            vec![],
        );
        reg.register(conn.clone());
        reg.unregister(&conn.id);
        let event = hook.recv().await.expect("disconnect event");
        assert_eq!(event.connection_id, conn.id);
        assert_eq!(event.agent_id.as_deref(), Some("A1"));
        assert!(reg.by_agent("A1").is_none());
    }

    #[tokio::test]
    async fn preempted_unregister_keeps_successor_slot() {
        let reg = registry();
        let (old, _o) = Connection::new_agent(
            principal(),
            far_expiry(),
            "A1".to_string(),
            AgentType::Claude,
            vec![],
        );
        let (new, _n) = Connection::new_agent(
            principal(),
            far_expiry(),
            "A1".to_string(),
            AgentType::Claude,
            vec![],
        );
        reg.register(old.clone());
        reg.register(new.clone());
        // Late unregister from the preempted session's socket-close path.
        reg.unregister(&old.id);
        assert_eq!(reg.by_agent("A1").expect("slot intact").id, new.id);
    }

    #[tokio::test]
    async fn health_follows_activity() {
        let reg = ConnectionRegistry::new(Duration::from_millis(10));
        let (conn, _rx) = Connection::new(Population::Dashboard, principal(), far_expiry());
        reg.register(conn.clone());
        assert!(reg.is_healthy(&conn.id));
        tokio::time::sleep(Duration::from_millis(35)).await;
        assert!(!reg.is_healthy(&conn.id), "silent past 2× heartbeat");
        assert_eq!(reg.overdue().len(), 1, "silent past 3× heartbeat");
        reg.record_activity(&conn.id, 16);
        assert!(reg.is_healthy(&conn.id));
        let stats = conn.stats();
        assert_eq!(stats.messages_in, 1);
        assert_eq!(stats.bytes_in, 16);
    }

    #[tokio::test]
    async fn send_fails_when_writer_gone() {
        let (conn, rx) = Connection::new(Population::Dashboard, principal(), far_expiry());
        drop(rx);
        assert!(!conn.send(MessageType::Ping, Arc::from("{}")));
    }

    #[tokio::test]
    async fn subscription_default_is_none() {
        let (conn, _rx) = Connection::new(Population::Dashboard, principal(), far_expiry());
        assert!(!conn.is_subscribed_to("A1"));
        conn.subscribe(Some("A1"), false);
        assert!(conn.is_subscribed_to("A1"));
        assert!(!conn.is_subscribed_to("A2"));
        conn.subscribe(None, true);
        assert!(conn.is_subscribed_to("A2"));
        conn.unsubscribe(None, true);
        assert!(!conn.is_subscribed_to("A1"), "unsubscribe all clears the set");
    }
}
