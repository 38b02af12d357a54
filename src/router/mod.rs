//! Outbound message router.
//!
//! Every server-originated message becomes an [`Envelope`]: the wire frame
//! serialized once, plus routing metadata (target class, optional filter
//! predicate, priority 0–10, retry bookkeeping). Envelopes enter a bounded
//! queue; a processing tick drains them in descending priority order, FIFO
//! within a tier, and fans each one out to the resolved set of live,
//! healthy connections.
//!
//! Guarantees: at-least-once delivery attempt per eligible connection;
//! per-(connection, priority) FIFO, because every send to one peer goes
//! through that peer's single writer; no ordering across connections.
//! An envelope that reaches zero receivers is rescheduled with exponential
//! backoff `min(2^(attempt-1) s, 30 s)` and dropped after `retry_attempts`
//! failures. Inserting into a full queue evicts the lowest-priority oldest
//! envelope.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use crate::config::RouterConfig;
use crate::protocol::{MessageType, WireMessage};
use crate::registry::{Connection, ConnectionRegistry, Population};

pub const MAX_PRIORITY: u8 = 10;

/// Predicate applied to candidate connections after target resolution.
pub type Filter = Arc<dyn Fn(&Connection) -> bool + Send + Sync>;

// ─── Envelope ────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub enum Target {
    Agent(String),
    AllAgents,
    Dashboards,
    Connection(String),
    /// Both populations — emergency broadcast.
    Everyone,
}

pub struct Envelope {
    pub id: String,
    pub kind: MessageType,
    /// Serialized once at enqueue; shared with every target's writer.
    pub json: Arc<str>,
    pub target: Target,
    pub filter: Option<Filter>,
    pub priority: u8,
    pub attempts: u32,
    pub created_at: Instant,
    pub scheduled_at: Instant,
}

/// Retry delay: `min(2^(attempt-1) s, 30 s)`.
fn retry_backoff(attempt: u32) -> Duration {
    let secs = 1u64 << (attempt.saturating_sub(1)).min(5);
    Duration::from_secs(secs.min(30))
}

// ─── Stats ───────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct RouterStats {
    enqueued: AtomicU64,
    delivered: AtomicU64,
    dropped_timeout: AtomicU64,
    dropped_failed: AtomicU64,
    evicted: AtomicU64,
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct RouterStatsSnapshot {
    pub enqueued: u64,
    pub delivered: u64,
    pub dropped_timeout: u64,
    pub dropped_failed: u64,
    pub evicted: u64,
}

impl RouterStats {
    fn snapshot(&self) -> RouterStatsSnapshot {
        RouterStatsSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped_timeout: self.dropped_timeout.load(Ordering::Relaxed),
            dropped_failed: self.dropped_failed.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
        }
    }
}

// ─── Queue ───────────────────────────────────────────────────────────────────

/// Key orders the map ascending by (inverted priority, insertion sequence):
/// the first entry is the highest-priority oldest envelope.
type QueueKey = (u8, u64);

#[derive(Default)]
struct QueueInner {
    ready: BTreeMap<QueueKey, Envelope>,
    /// Retries waiting for their `scheduled_at`.
    delayed: Vec<Envelope>,
    seq: u64,
}

impl QueueInner {
    fn len(&self) -> usize {
        self.ready.len() + self.delayed.len()
    }

    fn insert_ready(&mut self, envelope: Envelope) {
        let key = (MAX_PRIORITY - envelope.priority, self.seq);
        self.seq += 1;
        self.ready.insert(key, envelope);
    }

    /// Remove the lowest-priority oldest envelope to make room.
    fn evict_lowest(&mut self) -> Option<Envelope> {
        let (&(lowest_tier, _), _) = self.ready.last_key_value()?;
        let key = *self
            .ready
            .range((lowest_tier, 0)..)
            .next()
            .map(|(k, _)| k)?;
        self.ready.remove(&key)
    }
}

// ─── Router ──────────────────────────────────────────────────────────────────

pub struct MessageRouter {
    registry: Arc<ConnectionRegistry>,
    config: RouterConfig,
    inner: Mutex<QueueInner>,
    notify: Notify,
    stats: RouterStats,
}

impl MessageRouter {
    pub fn new(registry: Arc<ConnectionRegistry>, config: RouterConfig) -> Self {
        Self {
            registry,
            config,
            inner: Mutex::new(QueueInner::default()),
            notify: Notify::new(),
            stats: RouterStats::default(),
        }
    }

    // ── Public send surface ─────────────────────────────────────────────────

    pub fn to_agent(&self, agent_id: &str, kind: MessageType, payload: Value, priority: u8) {
        self.enqueue(kind, payload, Target::Agent(agent_id.to_string()), None, priority);
    }

    pub fn to_all_agents(&self, kind: MessageType, payload: Value, priority: u8) {
        self.enqueue(kind, payload, Target::AllAgents, None, priority);
    }

    pub fn to_dashboards(
        &self,
        kind: MessageType,
        payload: Value,
        priority: u8,
        filter: Option<Filter>,
    ) {
        self.enqueue(kind, payload, Target::Dashboards, filter, priority);
    }

    pub fn to_connection(&self, connection_id: &str, kind: MessageType, payload: Value, priority: u8) {
        self.enqueue(
            kind,
            payload,
            Target::Connection(connection_id.to_string()),
            None,
            priority,
        );
    }

    /// Fan an emergency payload to both populations at top priority.
    pub fn emergency_broadcast(&self, payload: Value) {
        self.enqueue(
            MessageType::EmergencyStop,
            payload,
            Target::Everyone,
            None,
            MAX_PRIORITY,
        );
    }

    fn enqueue(
        &self,
        kind: MessageType,
        payload: Value,
        target: Target,
        filter: Option<Filter>,
        priority: u8,
    ) {
        let message = WireMessage::new(kind, payload);
        let envelope = Envelope {
            id: message.id.clone(),
            kind,
            json: Arc::from(message.to_json()),
            target,
            filter,
            priority: priority.min(MAX_PRIORITY),
            attempts: 0,
            created_at: Instant::now(),
            scheduled_at: Instant::now(),
        };

        {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            if inner.len() >= self.config.queue_cap {
                if let Some(victim) = inner.evict_lowest() {
                    self.stats.evicted.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        envelope = %victim.id,
                        priority = victim.priority,
                        "router queue full — evicted lowest-priority envelope"
                    );
                }
            }
            inner.insert_ready(envelope);
        }
        self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
        self.notify.notify_one();
    }

    // ── Processing loop ─────────────────────────────────────────────────────

    /// Tick loop. Runs until the process exits; envelope processing never
    /// holds the queue lock across a send.
    pub async fn run(self: Arc<Self>) {
        let tick = Duration::from_millis(self.config.tick_ms);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(tick) => {}
                _ = self.notify.notified() => {}
            }
            self.process_once();
        }
    }

    /// One drain pass: promote due retries, then deliver up to
    /// `drain_per_tick` envelopes in priority order. Exposed for tests and
    /// driven by [`MessageRouter::run`] in production.
    pub fn process_once(&self) {
        let now = Instant::now();
        let batch: Vec<Envelope> = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

            // Promote retries whose backoff has elapsed.
            let mut still_delayed = Vec::with_capacity(inner.delayed.len());
            for envelope in std::mem::take(&mut inner.delayed) {
                if envelope.scheduled_at <= now {
                    inner.insert_ready(envelope);
                } else {
                    still_delayed.push(envelope);
                }
            }
            inner.delayed = still_delayed;

            let mut batch = Vec::new();
            while batch.len() < self.config.drain_per_tick {
                match inner.ready.pop_first() {
                    Some((_, envelope)) => batch.push(envelope),
                    None => break,
                }
            }
            batch
        };

        for envelope in batch {
            self.deliver(envelope, now);
        }
    }

    fn deliver(&self, mut envelope: Envelope, now: Instant) {
        let timeout = Duration::from_millis(self.config.message_timeout_ms);
        if now.duration_since(envelope.created_at) > timeout {
            self.stats.dropped_timeout.fetch_add(1, Ordering::Relaxed);
            debug!(envelope = %envelope.id, kind = ?envelope.kind, "dropped expired envelope");
            return;
        }

        let targets = self.resolve_targets(&envelope);
        let mut received = 0usize;
        for conn in &targets {
            if conn.send(envelope.kind, Arc::clone(&envelope.json)) {
                received += 1;
            }
        }

        if received > 0 {
            trace!(
                envelope = %envelope.id,
                kind = ?envelope.kind,
                targets = received,
                "delivered"
            );
            self.stats.delivered.fetch_add(1, Ordering::Relaxed);
            return;
        }

        // Zero receivers: back off and retry against live targets only.
        envelope.attempts += 1;
        if envelope.attempts > self.config.retry_attempts {
            self.stats.dropped_failed.fetch_add(1, Ordering::Relaxed);
            warn!(
                envelope = %envelope.id,
                kind = ?envelope.kind,
                attempts = envelope.attempts,
                "delivery failed — no live targets"
            );
            return;
        }
        envelope.scheduled_at = now + retry_backoff(envelope.attempts);
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .delayed
            .push(envelope);
    }

    fn resolve_targets(&self, envelope: &Envelope) -> Vec<Arc<Connection>> {
        let candidates: Vec<Arc<Connection>> = match &envelope.target {
            Target::Agent(agent_id) => self.registry.by_agent(agent_id).into_iter().collect(),
            Target::AllAgents => self.registry.by_population(Population::Agent),
            Target::Dashboards => self.registry.by_population(Population::Dashboard),
            Target::Connection(id) => self.registry.get(id).into_iter().collect(),
            Target::Everyone => self.registry.all(),
        };
        candidates
            .into_iter()
            .filter(|conn| self.registry.is_conn_healthy(conn))
            .filter(|conn| match &envelope.filter {
                Some(f) => f(conn),
                None => true,
            })
            .collect()
    }

    // ── Introspection ───────────────────────────────────────────────────────

    pub fn stats(&self) -> RouterStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn queue_len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    #[cfg(test)]
    fn delayed_len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .delayed
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Principal, Role};
    use crate::registry::Outbound;
    use chrono::Utc;
    use tokio::sync::mpsc;

    fn principal() -> Principal {
        Principal {
            user_id: "u-1".to_string(),
            email: "dev@example.com".to_string(),
            role: Role::Operator,
        }
    }

    fn test_registry() -> Arc<ConnectionRegistry> {
        Arc::new(ConnectionRegistry::new(Duration::from_secs(30)))
    }

    fn test_router(registry: Arc<ConnectionRegistry>, config: RouterConfig) -> MessageRouter {
        MessageRouter::new(registry, config)
    }

    fn dashboard(registry: &ConnectionRegistry) -> (Arc<Connection>, mpsc::Receiver<Outbound>) {
        let (conn, rx) = Connection::new(
            Population::Dashboard,
            principal(),
            Utc::now() + chrono::Duration::hours(1),
        );
        registry.register(conn.clone());
        (conn, rx)
    }

    fn agent(
        registry: &ConnectionRegistry,
        agent_id: &str,
    ) -> (Arc<Connection>, mpsc::Receiver<Outbound>) {
        let (conn, rx) = Connection::new_agent(
            principal(),
            Utc::now() + chrono::Duration::hours(1),
            agent_id.to_string(),
            crate::protocol::AgentType::Mock,
            vec![],
        );
        registry.register(conn.clone());
        (conn, rx)
    }

    fn recv_kinds(rx: &mut mpsc::Receiver<Outbound>) -> Vec<MessageType> {
        let mut kinds = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            if let Outbound::Message { kind, .. } = frame {
                kinds.push(kind);
            }
        }
        kinds
    }

    #[tokio::test]
    async fn drains_in_priority_order_fifo_within_tier() {
        let registry = test_registry();
        let router = test_router(registry.clone(), RouterConfig::default());
        let (_conn, mut rx) = dashboard(&registry);

        router.to_dashboards(MessageType::QueueUpdate, serde_json::json!({"n": 1}), 2, None);
        router.to_dashboards(MessageType::AgentStatus, serde_json::json!({"n": 2}), 2, None);
        router.to_dashboards(MessageType::CommandStatus, serde_json::json!({"n": 3}), 9, None);
        router.process_once();

        let kinds = recv_kinds(&mut rx);
        assert_eq!(
            kinds,
            vec![
                MessageType::CommandStatus, // priority 9 overtakes
                MessageType::QueueUpdate,   // then FIFO within priority 2
                MessageType::AgentStatus,
            ]
        );
    }

    #[tokio::test]
    async fn full_queue_evicts_lowest_priority_oldest() {
        let registry = test_registry();
        let config = RouterConfig {
            queue_cap: 2,
            ..RouterConfig::default()
        };
        let router = test_router(registry.clone(), config);
        let (_conn, mut rx) = dashboard(&registry);

        router.to_dashboards(MessageType::QueueUpdate, serde_json::json!({"n": 1}), 1, None);
        router.to_dashboards(MessageType::AgentStatus, serde_json::json!({"n": 2}), 5, None);
        // Queue full — the priority-1 envelope is the victim.
        router.to_dashboards(MessageType::CommandStatus, serde_json::json!({"n": 3}), 5, None);
        router.process_once();

        let kinds = recv_kinds(&mut rx);
        assert_eq!(kinds, vec![MessageType::AgentStatus, MessageType::CommandStatus]);
        assert_eq!(router.stats().evicted, 1);
    }

    #[tokio::test]
    async fn zero_targets_retries_then_drops() {
        let registry = test_registry();
        let config = RouterConfig {
            retry_attempts: 1,
            ..RouterConfig::default()
        };
        let router = test_router(registry.clone(), config);

        router.to_agent("A-offline", MessageType::CommandRequest, serde_json::json!({}), 5);
        router.process_once();
        assert_eq!(router.delayed_len(), 1, "first failure reschedules");

        // Backoff for attempt 1 is one second.
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        router.process_once();
        assert_eq!(router.delayed_len(), 0);
        assert_eq!(router.stats().dropped_failed, 1, "second failure drops");
    }

    #[tokio::test]
    async fn retry_succeeds_once_target_appears() {
        let registry = test_registry();
        let router = test_router(registry.clone(), RouterConfig::default());

        router.to_agent("A1", MessageType::CommandRequest, serde_json::json!({}), 5);
        router.process_once();
        assert_eq!(router.delayed_len(), 1);

        let (_conn, mut rx) = agent(&registry, "A1");
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        router.process_once();
        assert_eq!(recv_kinds(&mut rx), vec![MessageType::CommandRequest]);
        assert_eq!(router.stats().delivered, 1);
    }

    #[tokio::test]
    async fn expired_envelope_is_dropped() {
        let registry = test_registry();
        let config = RouterConfig {
            message_timeout_ms: 10,
            ..RouterConfig::default()
        };
        let router = test_router(registry.clone(), config);
        let (_conn, mut rx) = dashboard(&registry);

        router.to_dashboards(MessageType::QueueUpdate, serde_json::json!({}), 5, None);
        tokio::time::sleep(Duration::from_millis(30)).await;
        router.process_once();

        assert!(recv_kinds(&mut rx).is_empty());
        assert_eq!(router.stats().dropped_timeout, 1);
    }

    #[tokio::test]
    async fn filter_excludes_connections() {
        let registry = test_registry();
        let router = test_router(registry.clone(), RouterConfig::default());
        let (subscribed, mut sub_rx) = dashboard(&registry);
        let (_other, mut other_rx) = dashboard(&registry);
        subscribed.subscribe(Some("A1"), false);

        let filter: Filter = Arc::new(|conn: &Connection| conn.is_subscribed_to("A1"));
        router.to_dashboards(
            MessageType::TerminalStream,
            serde_json::json!({"content": "hi"}),
            5,
            Some(filter),
        );
        router.process_once();

        assert_eq!(recv_kinds(&mut sub_rx).len(), 1);
        assert!(recv_kinds(&mut other_rx).is_empty());
    }

    #[tokio::test]
    async fn emergency_reaches_both_populations() {
        let registry = test_registry();
        let router = test_router(registry.clone(), RouterConfig::default());
        let (_dash, mut dash_rx) = dashboard(&registry);
        let (_agent, mut agent_rx) = agent(&registry, "A1");

        router.emergency_broadcast(serde_json::json!({"reason": "operator"}));
        router.process_once();

        assert_eq!(recv_kinds(&mut dash_rx), vec![MessageType::EmergencyStop]);
        assert_eq!(recv_kinds(&mut agent_rx), vec![MessageType::EmergencyStop]);
    }

    #[test]
    fn backoff_caps_at_thirty_seconds() {
        assert_eq!(retry_backoff(1), Duration::from_secs(1));
        assert_eq!(retry_backoff(2), Duration::from_secs(2));
        assert_eq!(retry_backoff(3), Duration::from_secs(4));
        assert_eq!(retry_backoff(10), Duration::from_secs(30));
    }

    #[test]
    fn priority_clamped_to_max() {
        let registry = test_registry();
        let router = test_router(registry, RouterConfig::default());
        router.to_dashboards(MessageType::QueueUpdate, serde_json::json!({}), 99, None);
        let inner = router.inner.lock().unwrap();
        let (&(tier, _), _) = inner.ready.first_key_value().expect("queued");
        assert_eq!(tier, 0, "priority 99 clamps to 10 (tier 0)");
    }
}
