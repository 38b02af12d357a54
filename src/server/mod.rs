//! WebSocket session layer.
//!
//! One TCP listener serves three things on the same port: a plain HTTP
//! `GET /health` endpoint (peek-based detection, no WS library needed on the
//! probe side), the `/ws/agent` upgrade and the `/ws/dashboard` upgrade.
//! Each accepted socket gets its own reader task (this module's connection
//! handler) and writer task (outbound channel → batcher → sink), so all
//! sends to one peer are serialized.

mod connection;

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::protocol::{close, MessageType, ServerHeartbeatPayload, WireMessage};
use crate::AppContext;

/// Max new WebSocket connections per IP per minute.
const MAX_CONNECTIONS_PER_MIN: usize = 10;

// ─── Connection admission ────────────────────────────────────────────────────

/// Per-IP connection rate tracker.
struct ConnectionRateLimiter {
    /// Map of IP -> connection timestamps within the last minute.
    connections: HashMap<IpAddr, Vec<Instant>>,
}

impl ConnectionRateLimiter {
    fn new() -> Self {
        Self {
            connections: HashMap::new(),
        }
    }

    /// Returns `true` if the connection should be allowed.
    fn check_and_record(&mut self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let one_min_ago = now - std::time::Duration::from_secs(60);

        let timestamps = self.connections.entry(ip).or_default();
        timestamps.retain(|t| *t > one_min_ago);

        if timestamps.len() >= MAX_CONNECTIONS_PER_MIN {
            return false;
        }
        timestamps.push(now);
        true
    }
}

// ─── Server ──────────────────────────────────────────────────────────────────

pub async fn run(ctx: Arc<AppContext>) -> Result<()> {
    let addr = format!("0.0.0.0:{}", ctx.config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "control plane listening (WebSocket + HTTP health on same port)");

    start_heartbeat(ctx.clone());
    start_retention(ctx.clone());
    start_ratelimit_sweep(ctx.clone());

    // Per-IP connection rate limiter (shared across all accept iterations).
    let conn_limiter = Arc::new(Mutex::new(ConnectionRateLimiter::new()));

    // Graceful shutdown: resolve on SIGTERM (Unix) or Ctrl-C (all platforms).
    let shutdown = make_shutdown_future();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown => {
                info!("shutdown signal received — draining queues and stopping");
                let grace = std::time::Duration::from_secs(ctx.config.queue.shutdown_grace_secs);
                let cancelled = ctx.queues.shutdown_all(grace).await;
                if cancelled > 0 {
                    warn!(cancelled, "commands force-cancelled at shutdown");
                }
                for conn in ctx.registry.all() {
                    conn.close(close::GOING_AWAY, "server shutting down");
                }
                break;
            }

            conn = listener.accept() => {
                let (stream, peer) = match conn {
                    Ok(c) => c,
                    Err(e) => {
                        error!(err = %e, "accept error");
                        continue;
                    }
                };

                {
                    let mut limiter = conn_limiter.lock().await;
                    if !limiter.check_and_record(peer.ip()) {
                        warn!(peer = %peer, "connection rate limit exceeded — rejecting");
                        drop(stream);
                        continue;
                    }
                }

                debug!(peer = %peer, "new connection");
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    if let Err(e) = connection::handle(stream, ctx).await {
                        debug!(peer = %peer, err = %e, "connection ended with error");
                    }
                });
            }
        }
    }

    info!("control plane stopped");
    Ok(())
}

/// Returns a future that resolves when a shutdown signal is received.
///
/// On Unix we listen for SIGTERM *and* Ctrl-C.
/// On other platforms we listen for Ctrl-C only.
async fn make_shutdown_future() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}

// ─── Health endpoint ─────────────────────────────────────────────────────────

/// Respond to an HTTP `GET /health` request with a JSON status document.
pub(crate) async fn handle_health_check(
    mut stream: tokio::net::TcpStream,
    ctx: &AppContext,
) -> Result<()> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    // Consume the request headers (stack buffer — we don't inspect the body).
    let mut req_buf = [0u8; 256];
    let _ = stream.read(&mut req_buf).await;

    let mut system = sysinfo::System::new();
    system.refresh_memory();

    let body = json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime": ctx.started_at.elapsed().as_secs(),
        "agents": ctx.registry.count(crate::registry::Population::Agent),
        "dashboards": ctx.registry.count(crate::registry::Population::Dashboard),
        "router": ctx.router.stats(),
        "routerQueue": ctx.router.queue_len(),
        "emergencyActive": ctx.orchestrator.emergency_active(),
        "memoryUsedMb": system.used_memory() / (1024 * 1024),
        "port": ctx.config.port,
    });
    let body_str = body.to_string();
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body_str.len(),
        body_str
    );
    stream.write_all(response.as_bytes()).await?;
    Ok(())
}

// ─── Background workers ──────────────────────────────────────────────────────

/// Heartbeat discipline: emit `server:heartbeat` every interval; close
/// connections silent for three intervals with GoingAway. (Two intervals of
/// silence already excludes them from routing via the health check.)
fn start_heartbeat(ctx: Arc<AppContext>) {
    tokio::spawn(async move {
        let period = std::time::Duration::from_secs(ctx.config.heartbeat_secs);
        let mut interval = tokio::time::interval(period);
        interval.tick().await; // skip the immediate first tick
        loop {
            interval.tick().await;
            let payload = ServerHeartbeatPayload {
                server_time: chrono::Utc::now().timestamp_millis(),
                next_ping_expected_ms: period.as_millis() as u64,
            };
            let msg = WireMessage::new(
                MessageType::ServerHeartbeat,
                serde_json::to_value(&payload).unwrap_or_default(),
            );
            let json: Arc<str> = Arc::from(msg.to_json());
            for conn in ctx.registry.all() {
                conn.send(MessageType::ServerHeartbeat, Arc::clone(&json));
            }
            for conn in ctx.registry.overdue() {
                warn!(conn = %conn.id, idle_secs = conn.idle_for().as_secs(), "closing silent connection");
                conn.close(close::GOING_AWAY, "heartbeat timeout");
            }
        }
    });
}

/// Hourly retention sweep over stored traces and terminal output.
fn start_retention(ctx: Arc<AppContext>) {
    let days = ctx.config.retention_days;
    if days == 0 {
        return;
    }
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(3_600));
        interval.tick().await;
        loop {
            interval.tick().await;
            let cutoff = chrono::Utc::now() - chrono::Duration::days(days as i64);
            match ctx.storage.delete_traces_older_than(cutoff).await {
                Ok(0) => {}
                Ok(n) => info!(deleted = n, "retention: old trace entries removed"),
                Err(e) => warn!(err = %e, "retention: trace sweep failed"),
            }
            match ctx.storage.delete_outputs_older_than(cutoff).await {
                Ok(0) => {}
                Ok(n) => info!(deleted = n, "retention: old terminal output removed"),
                Err(e) => warn!(err = %e, "retention: terminal output sweep failed"),
            }
        }
    });
}

/// Minutely cleanup of idle per-type rate-limit counters.
fn start_ratelimit_sweep(ctx: Arc<AppContext>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
        interval.tick().await;
        loop {
            interval.tick().await;
            ctx.rate_limiter.sweep().await;
        }
    });
}
