//! Ingress rate limiting.
//!
//! Every connection is tracked on three axes — per-minute, per-hour and a
//! short burst window — using sliding-window counters. Message types with a
//! per-type override (high-volume `terminal:output`, human-paced
//! `command:request`) use their own per-minute window in place of the general
//! one; the hourly and burst axes always apply. An optional global
//! per-minute ceiling applies in aggregate across all connections.
//!
//! A violation starts a penalty window during which every message is
//! rejected with a retry-after. Repeated violations within the rolling
//! violation window escalate to a policy disconnect (close code 1008).

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;

use crate::config::RateLimitConfig;

// ─── Sliding window ──────────────────────────────────────────────────────────

/// A sliding-window counter.
///
/// Each entry stores a timestamp; counting evicts entries older than the
/// window before summing. Windows are millisecond-granular so the burst axis
/// (N messages within W ms) shares the implementation.
pub struct SlidingWindow {
    window: Duration,
    max_count: u64,
    events: VecDeque<DateTime<Utc>>,
}

impl SlidingWindow {
    pub fn new(window: Duration, max_count: u64) -> Self {
        Self {
            window,
            max_count,
            events: VecDeque::new(),
        }
    }

    /// Discard events older than the window boundary.
    fn evict(&mut self, now: DateTime<Utc>) {
        let cutoff = now - self.window;
        while self.events.front().is_some_and(|t| *t <= cutoff) {
            self.events.pop_front();
        }
    }

    pub fn record_event(&mut self, at: DateTime<Utc>) {
        self.evict(at);
        self.events.push_back(at);
    }

    /// Count events within the current window.
    pub fn count_in_window(&mut self, now: DateTime<Utc>) -> u64 {
        self.evict(now);
        self.events.len() as u64
    }

    /// Returns `true` if the count in the current window has reached `max_count`.
    pub fn is_limited(&mut self, now: DateTime<Utc>) -> bool {
        self.count_in_window(now) >= self.max_count
    }

    /// Time until the oldest event in the window expires.
    ///
    /// Returns `None` if the window is not currently limited.
    pub fn time_until_reset(&mut self, now: DateTime<Utc>) -> Option<Duration> {
        if !self.is_limited(now) {
            return None;
        }
        self.events.front().map(|oldest| *oldest + self.window - now)
    }

    /// `true` when the window holds no events (sweep candidate).
    pub fn is_empty(&mut self, now: DateTime<Utc>) -> bool {
        self.count_in_window(now) == 0
    }
}

// ─── Decision ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    /// Rejected; client may retry after the given delay.
    Limited { retry_after_ms: u64 },
    /// Too many violations — the connection must be closed with 1008.
    Disconnect,
}

// ─── Per-connection state ────────────────────────────────────────────────────

struct ConnState {
    minute: SlidingWindow,
    hour: SlidingWindow,
    burst: SlidingWindow,
    /// Windows for message types with a configured override.
    per_type: HashMap<String, SlidingWindow>,
    violations: VecDeque<DateTime<Utc>>,
    penalty_until: Option<DateTime<Utc>>,
}

impl ConnState {
    fn new(cfg: &RateLimitConfig) -> Self {
        Self {
            minute: SlidingWindow::new(Duration::seconds(60), cfg.messages_per_minute),
            hour: SlidingWindow::new(Duration::seconds(3600), cfg.messages_per_hour),
            burst: SlidingWindow::new(
                Duration::milliseconds(cfg.burst_window_ms as i64),
                cfg.burst_size,
            ),
            per_type: HashMap::new(),
            violations: VecDeque::new(),
            penalty_until: None,
        }
    }
}

// ─── Limiter ─────────────────────────────────────────────────────────────────

pub struct RateLimiter {
    config: RateLimitConfig,
    global: Mutex<Option<SlidingWindow>>,
    conns: Mutex<HashMap<String, ConnState>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let global = if config.global_per_minute > 0 {
            Some(SlidingWindow::new(
                Duration::seconds(60),
                config.global_per_minute,
            ))
        } else {
            None
        };
        Self {
            config,
            global: Mutex::new(global),
            conns: Mutex::new(HashMap::new()),
        }
    }

    /// Admission check for one inbound message. Records the message when
    /// allowed; records a violation and starts the penalty window when not.
    pub async fn check(&self, conn_id: &str, message_type: &str) -> RateDecision {
        self.check_at(conn_id, message_type, Utc::now()).await
    }

    pub async fn check_at(
        &self,
        conn_id: &str,
        message_type: &str,
        now: DateTime<Utc>,
    ) -> RateDecision {
        // Global ceiling first: rejecting here is not a per-connection
        // violation, the client did nothing wrong.
        {
            let mut global = self.global.lock().await;
            if let Some(window) = global.as_mut() {
                if window.is_limited(now) {
                    let retry = window
                        .time_until_reset(now)
                        .map(|d| d.num_milliseconds().max(0) as u64)
                        .unwrap_or(1_000);
                    return RateDecision::Limited {
                        retry_after_ms: retry,
                    };
                }
            }
        }

        let mut conns = self.conns.lock().await;
        let state = conns
            .entry(conn_id.to_string())
            .or_insert_with(|| ConnState::new(&self.config));

        // Active penalty: reject without stacking a fresh violation.
        if let Some(until) = state.penalty_until {
            if now < until {
                let retry = (until - now).num_milliseconds().max(0) as u64;
                return RateDecision::Limited {
                    retry_after_ms: retry,
                };
            }
            state.penalty_until = None;
        }

        let type_limit = self.config.per_type_per_minute.get(message_type).copied();

        let limited_retry = {
            // Burst and hourly axes always apply; the per-minute axis is the
            // type override when one exists.
            if state.burst.is_limited(now) {
                state
                    .burst
                    .time_until_reset(now)
                    .map(|d| d.num_milliseconds().max(0) as u64)
            } else if state.hour.is_limited(now) {
                state
                    .hour
                    .time_until_reset(now)
                    .map(|d| d.num_milliseconds().max(0) as u64)
            } else if let Some(max) = type_limit {
                let window = state
                    .per_type
                    .entry(message_type.to_string())
                    .or_insert_with(|| SlidingWindow::new(Duration::seconds(60), max));
                if window.is_limited(now) {
                    window
                        .time_until_reset(now)
                        .map(|d| d.num_milliseconds().max(0) as u64)
                } else {
                    None
                }
            } else if state.minute.is_limited(now) {
                state
                    .minute
                    .time_until_reset(now)
                    .map(|d| d.num_milliseconds().max(0) as u64)
            } else {
                None
            }
        };

        if let Some(window_retry) = limited_retry {
            // Violation: start the penalty window and check for escalation.
            let violation_cutoff =
                now - Duration::seconds(self.config.violation_window_secs as i64);
            while state
                .violations
                .front()
                .is_some_and(|t| *t <= violation_cutoff)
            {
                state.violations.pop_front();
            }
            state.violations.push_back(now);
            if state.violations.len() as u32 >= self.config.max_violations {
                return RateDecision::Disconnect;
            }

            let penalty_ms = self.config.penalty_secs * 1_000;
            state.penalty_until = Some(now + Duration::milliseconds(penalty_ms as i64));
            return RateDecision::Limited {
                retry_after_ms: window_retry.max(penalty_ms),
            };
        }

        // Allowed — record on every axis that applies.
        state.burst.record_event(now);
        state.hour.record_event(now);
        if let Some(max) = type_limit {
            state
                .per_type
                .entry(message_type.to_string())
                .or_insert_with(|| SlidingWindow::new(Duration::seconds(60), max))
                .record_event(now);
        } else {
            state.minute.record_event(now);
        }
        drop(conns);

        if let Some(window) = self.global.lock().await.as_mut() {
            window.record_event(now);
        }

        RateDecision::Allowed
    }

    /// Drop all state for a closed connection.
    pub async fn remove_connection(&self, conn_id: &str) {
        self.conns.lock().await.remove(conn_id);
    }

    /// Periodic sweep: drop per-type windows that have gone idle so
    /// connections that briefly streamed output do not hold counters forever.
    pub async fn sweep(&self) {
        let now = Utc::now();
        let mut conns = self.conns.lock().await;
        for state in conns.values_mut() {
            state.per_type.retain(|_, window| !window.is_empty(now));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> RateLimitConfig {
        let mut cfg = RateLimitConfig {
            messages_per_minute: 5,
            messages_per_hour: 100,
            burst_size: 3,
            burst_window_ms: 100,
            global_per_minute: 0,
            penalty_secs: 10,
            max_violations: 3,
            violation_window_secs: 300,
            per_type_per_minute: HashMap::new(),
        };
        cfg.per_type_per_minute
            .insert("terminal:output".to_string(), 50);
        cfg
    }

    #[tokio::test]
    async fn allows_under_limit() {
        let limiter = RateLimiter::new(test_config());
        let now = Utc::now();
        for i in 0..3 {
            // Spread beyond the burst window.
            let at = now + Duration::milliseconds(i * 200);
            assert_eq!(
                limiter.check_at("c1", "ping", at).await,
                RateDecision::Allowed
            );
        }
    }

    #[tokio::test]
    async fn minute_window_limits_then_penalises() {
        let limiter = RateLimiter::new(test_config());
        let now = Utc::now();
        // 5 allowed, spaced past the burst window.
        for i in 0..5 {
            let at = now + Duration::milliseconds(i * 200);
            assert_eq!(
                limiter.check_at("c1", "ping", at).await,
                RateDecision::Allowed
            );
        }
        let at = now + Duration::milliseconds(1_200);
        match limiter.check_at("c1", "ping", at).await {
            RateDecision::Limited { retry_after_ms } => {
                assert!(retry_after_ms > 0, "retry-after must be positive");
            }
            other => panic!("expected Limited, got {other:?}"),
        }
        // Still penalised shortly after, without a new violation.
        let at = at + Duration::seconds(1);
        assert!(matches!(
            limiter.check_at("c1", "ping", at).await,
            RateDecision::Limited { .. }
        ));
    }

    #[tokio::test]
    async fn window_slides_open_again() {
        let limiter = RateLimiter::new(test_config());
        let now = Utc::now();
        for i in 0..5 {
            let at = now + Duration::milliseconds(i * 200);
            limiter.check_at("c1", "ping", at).await;
        }
        // Past the minute window and any penalty.
        let later = now + Duration::seconds(75);
        assert_eq!(
            limiter.check_at("c1", "ping", later).await,
            RateDecision::Allowed
        );
    }

    #[tokio::test]
    async fn burst_axis_trips_before_minute() {
        let limiter = RateLimiter::new(test_config());
        let now = Utc::now();
        for _ in 0..3 {
            assert_eq!(
                limiter.check_at("c1", "ping", now).await,
                RateDecision::Allowed
            );
        }
        assert!(matches!(
            limiter.check_at("c1", "ping", now).await,
            RateDecision::Limited { .. }
        ));
    }

    #[tokio::test]
    async fn per_type_override_replaces_minute_axis() {
        let limiter = RateLimiter::new(test_config());
        let now = Utc::now();
        // 20 terminal:output messages — over the general per-minute cap of 5
        // but under the 50/min override. Spaced past the burst window.
        for i in 0..20 {
            let at = now + Duration::milliseconds(i * 200);
            assert_eq!(
                limiter.check_at("c1", "terminal:output", at).await,
                RateDecision::Allowed,
                "message {i} should pass under the type override"
            );
        }
    }

    #[tokio::test]
    async fn repeated_violations_disconnect() {
        let mut cfg = test_config();
        cfg.penalty_secs = 0;
        let limiter = RateLimiter::new(cfg);
        let now = Utc::now();
        for i in 0..5 {
            let at = now + Duration::milliseconds(i * 200);
            limiter.check_at("c1", "ping", at).await;
        }
        // Each check past the cap is a fresh violation (no penalty gap).
        let mut decision = RateDecision::Allowed;
        for i in 0..3 {
            let at = now + Duration::milliseconds(1_200 + i * 200);
            decision = limiter.check_at("c1", "ping", at).await;
        }
        assert_eq!(decision, RateDecision::Disconnect);
    }

    #[tokio::test]
    async fn connections_are_independent() {
        let limiter = RateLimiter::new(test_config());
        let now = Utc::now();
        for i in 0..5 {
            let at = now + Duration::milliseconds(i * 200);
            limiter.check_at("c1", "ping", at).await;
        }
        assert_eq!(
            limiter
                .check_at("c2", "ping", now + Duration::milliseconds(1_200))
                .await,
            RateDecision::Allowed
        );
    }

    #[tokio::test]
    async fn global_ceiling_applies_across_connections() {
        let mut cfg = test_config();
        cfg.global_per_minute = 4;
        let limiter = RateLimiter::new(cfg);
        let now = Utc::now();
        for i in 0..4 {
            let at = now + Duration::milliseconds(i * 200);
            let conn = format!("c{i}");
            assert_eq!(
                limiter.check_at(&conn, "ping", at).await,
                RateDecision::Allowed
            );
        }
        assert!(matches!(
            limiter
                .check_at("c9", "ping", now + Duration::milliseconds(900))
                .await,
            RateDecision::Limited { .. }
        ));
    }
}
