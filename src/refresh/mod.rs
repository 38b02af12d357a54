//! In-band token rotation for live sessions.
//!
//! Each authenticated connection's access token carries an expiry. On a
//! periodic check, sessions whose token has less than `refresh_threshold`
//! left are sent `auth:refresh-needed`. The client answers with either a
//! fresh access token (verified and swapped in, `auth:refresh-success`) or
//! a refresh token (exchanged through the verifier, the new access token
//! returned as `auth:new-token`). No reply within `response_timeout` counts
//! as a failed attempt; after `max_refresh_attempts` the session is closed
//! with 4001. A successful refresh resets the attempt counter.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::auth::{AuthError, AuthVerifier};
use crate::config::RefreshConfig;
use crate::protocol::{close, MessageType, RefreshResponsePayload, WireMessage};
use crate::registry::{Connection, ConnectionRegistry, Population};

/// Cadence of the internal tick; expiry checks run every
/// `refresh_interval` on top of it, timeout checks every tick.
const TICK: std::time::Duration = std::time::Duration::from_secs(5);

#[derive(Default)]
struct SessionState {
    /// When `auth:refresh-needed` was sent, if an exchange is in flight.
    pending_since: Option<Instant>,
    attempts: u32,
}

pub struct RefreshManager {
    auth: Arc<AuthVerifier>,
    registry: Arc<ConnectionRegistry>,
    config: RefreshConfig,
    sessions: Mutex<HashMap<String, SessionState>>,
}

impl RefreshManager {
    pub fn new(
        auth: Arc<AuthVerifier>,
        registry: Arc<ConnectionRegistry>,
        config: RefreshConfig,
    ) -> Self {
        Self {
            auth,
            registry,
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, SessionState>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn send(conn: &Connection, kind: MessageType, payload: serde_json::Value) {
        let msg = WireMessage::new(kind, payload);
        conn.send(kind, Arc::from(msg.to_json()));
    }

    // ── Periodic checks ─────────────────────────────────────────────────────

    /// Ask every session whose token is close to expiry for a refresh.
    pub fn check_expiries(&self) {
        let threshold = chrono::Duration::seconds(self.config.refresh_threshold_secs as i64);
        let now = Utc::now();
        for conn in self.registry.all() {
            let remaining = conn.token_expires_at() - now;
            if remaining >= threshold {
                continue;
            }
            let mut sessions = self.lock();
            let state = sessions.entry(conn.id.clone()).or_default();
            if state.pending_since.is_some() {
                continue;
            }
            state.pending_since = Some(Instant::now());
            drop(sessions);
            debug!(
                conn = %conn.id,
                remaining_secs = remaining.num_seconds(),
                "access token near expiry — requesting refresh"
            );
            let payload = crate::protocol::RefreshNeededPayload {
                expires_in_secs: remaining.num_seconds(),
            };
            Self::send(
                &conn,
                MessageType::RefreshNeeded,
                serde_json::to_value(payload).unwrap_or_default(),
            );
        }
    }

    /// Fail exchanges that have waited longer than `response_timeout`;
    /// close sessions that have exhausted their attempts.
    pub fn check_timeouts(&self) {
        let timeout = std::time::Duration::from_secs(self.config.response_timeout_secs);
        let mut expired: Vec<String> = Vec::new();
        {
            let mut sessions = self.lock();
            for (conn_id, state) in sessions.iter_mut() {
                if state
                    .pending_since
                    .is_some_and(|since| since.elapsed() >= timeout)
                {
                    state.pending_since = None;
                    state.attempts += 1;
                    expired.push(conn_id.clone());
                }
            }
        }
        for conn_id in expired {
            self.fail_attempt(&conn_id, "refresh response timed out");
        }
    }

    fn fail_attempt(&self, conn_id: &str, why: &str) {
        let attempts = {
            let sessions = self.lock();
            sessions.get(conn_id).map(|s| s.attempts).unwrap_or(0)
        };
        let Some(conn) = self.registry.get(conn_id) else {
            return;
        };
        if attempts >= self.config.max_refresh_attempts {
            warn!(conn = %conn_id, attempts, "token refresh exhausted — closing session");
            conn.close(close::TOKEN_EXPIRED, "token expired");
            self.lock().remove(conn_id);
        } else {
            debug!(conn = %conn_id, attempts, why, "token refresh attempt failed");
        }
    }

    // ── Client responses ────────────────────────────────────────────────────

    /// Apply a client's `auth:refresh-response`.
    pub fn handle_response(
        &self,
        conn: &Arc<Connection>,
        payload: RefreshResponsePayload,
    ) -> Result<(), AuthError> {
        let result = self.apply_response(conn, payload);
        match &result {
            Ok(()) => {
                let mut sessions = self.lock();
                let state = sessions.entry(conn.id.clone()).or_default();
                state.pending_since = None;
                state.attempts = 0;
                info!(conn = %conn.id, "session token refreshed");
            }
            Err(err) => {
                {
                    let mut sessions = self.lock();
                    let state = sessions.entry(conn.id.clone()).or_default();
                    state.pending_since = None;
                    state.attempts += 1;
                }
                self.fail_attempt(&conn.id, &err.to_string());
            }
        }
        result
    }

    fn apply_response(
        &self,
        conn: &Arc<Connection>,
        payload: RefreshResponsePayload,
    ) -> Result<(), AuthError> {
        if let Some(access_token) = payload.access_token.as_deref() {
            let (principal, expires_at) = self.auth.validate(access_token)?;
            conn.set_principal(principal, expires_at);
            Self::send(conn, MessageType::RefreshSuccess, json!({}));
            return Ok(());
        }

        if let Some(refresh_token) = payload.refresh_token.as_deref() {
            let (access_token, expires_in) = self.auth.refresh(refresh_token)?;
            let (principal, expires_at) = self.auth.validate(&access_token)?;
            conn.set_principal(principal, expires_at);
            // Agents get the dedicated `token:refresh` push; dashboards the
            // `auth:new-token` reply. Same payload shape either way.
            let kind = match conn.population {
                Population::Agent => MessageType::TokenRefresh,
                Population::Dashboard => MessageType::NewToken,
            };
            let payload = crate::protocol::TokenRefreshPayload {
                access_token,
                expires_in_secs: expires_in,
            };
            Self::send(conn, kind, serde_json::to_value(payload).unwrap_or_default());
            return Ok(());
        }

        Err(AuthError::InvalidToken)
    }

    /// Forget a closed session.
    pub fn forget(&self, conn_id: &str) {
        self.lock().remove(conn_id);
    }

    // ── Driver ──────────────────────────────────────────────────────────────

    /// Background loop: timeout checks every tick, expiry checks every
    /// `refresh_interval`. Also drains registry disconnects.
    pub fn start(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let mut disconnects = self.registry.subscribe_disconnects();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICK);
            let expiry_every = std::time::Duration::from_secs(manager.config.refresh_interval_secs);
            let mut last_expiry_check = Instant::now();
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        manager.check_timeouts();
                        if last_expiry_check.elapsed() >= expiry_every {
                            last_expiry_check = Instant::now();
                            manager.check_expiries();
                        }
                    }
                    event = disconnects.recv() => {
                        if let Ok(event) = event {
                            manager.forget(&event.connection_id);
                        }
                    }
                }
            }
        });
    }
}
