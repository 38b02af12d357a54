//! Per-connection handshake, read loop and writer task.
//!
//! Upgrade path selects the population (`/ws/agent`, `/ws/dashboard`). The
//! bearer token arrives either as `?token=` on the upgrade URL or inside the
//! first message (`agent:connect` / `dashboard:connect`) within the
//! handshake window; agents always send `agent:connect` first because it
//! carries their identity. Unauthenticated sockets are answered with
//! `ERROR UNAUTHORIZED` and closed 4001.

use std::sync::{Arc, Mutex as StdMutex};

use anyhow::{Context as _, Result};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async_with_config, WebSocketStream};
use tracing::{debug, warn};

use crate::batch::Batcher;
use crate::protocol::{
    close, AgentConnectPayload, BatchEnvelope, DashboardConnectPayload, ErrorCode, ErrorPayload,
    MessageType, WireMessage, HANDSHAKE_WINDOW_SECS,
};
use crate::ratelimit::RateDecision;
use crate::registry::{Connection, Outbound, Population};
use crate::AppContext;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsStream = SplitStream<WebSocketStream<TcpStream>>;

struct UpgradeInfo {
    path: String,
    token: Option<String>,
}

fn token_from_query(query: &str) -> Option<String> {
    query
        .split('&')
        .find_map(|pair| pair.strip_prefix("token="))
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}

pub(crate) async fn handle(stream: TcpStream, ctx: Arc<AppContext>) -> Result<()> {
    // Peek to route plain HTTP health probes off the shared port. Checking
    // 12 bytes prevents false matches on paths like "GET /healthz".
    let mut peek_buf = [0u8; 12];
    let n = stream.peek(&mut peek_buf).await.unwrap_or(0);
    if n >= 12 && &peek_buf[..12] == b"GET /health " {
        return super::handle_health_check(stream, &ctx).await;
    }

    let upgrade: Arc<StdMutex<Option<UpgradeInfo>>> = Arc::new(StdMutex::new(None));
    let upgrade_cb = Arc::clone(&upgrade);
    let callback = move |req: &Request, resp: Response| {
        let path = req.uri().path().to_string();
        if path != "/ws/agent" && path != "/ws/dashboard" {
            let mut err = ErrorResponse::new(Some("unknown endpoint".to_string()));
            *err.status_mut() = StatusCode::NOT_FOUND;
            return Err(err);
        }
        let token = req.uri().query().and_then(token_from_query);
        *upgrade_cb.lock().unwrap_or_else(|e| e.into_inner()) = Some(UpgradeInfo { path, token });
        Ok(resp)
    };

    let ws_config = WebSocketConfig {
        max_message_size: Some(16 * 1024 * 1024), // 16 MB
        max_frame_size: Some(4 * 1024 * 1024),    // 4 MB per frame
        ..Default::default()
    };
    let ws = accept_hdr_async_with_config(stream, callback, Some(ws_config)).await?;
    let (mut sink, mut stream) = ws.split();

    let info = upgrade
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .take()
        .context("upgrade info missing after handshake")?;
    let population = if info.path == "/ws/agent" {
        Population::Agent
    } else {
        Population::Dashboard
    };

    let Some((conn, outbound_rx)) =
        authenticate(&ctx, population, info.token, &mut sink, &mut stream).await?
    else {
        return Ok(());
    };

    // Writer task owns the sink from here on; all sends flow through the
    // connection's outbound channel.
    let batch_config = ctx.config.batch.clone();
    let writer = tokio::spawn(write_loop(outbound_rx, sink, batch_config));

    conn.send(
        MessageType::Ack,
        Arc::from(
            WireMessage::new(
                MessageType::Ack,
                json!({ "connected": true, "connectionId": conn.id }),
            )
            .to_json(),
        ),
    );

    read_loop(&ctx, &conn, population, &mut stream).await;

    // Teardown: the registry hook fans out to the refresh manager and the
    // orchestrator's offline watch. Dropping the connection closes its
    // outbound channel; the writer drains what is queued (including any
    // close frame) and exits on its own.
    ctx.registry.unregister(&conn.id);
    ctx.rate_limiter.remove_connection(&conn.id).await;
    ctx.refresh.forget(&conn.id);
    drop(conn);
    let _ = tokio::time::timeout(std::time::Duration::from_secs(5), writer).await;
    Ok(())
}

// ─── Handshake ───────────────────────────────────────────────────────────────

/// Authenticate the socket within the handshake window.
///
/// Returns the registered connection, or `None` when the socket was refused
/// (the error reply and close frame have already been written).
async fn authenticate(
    ctx: &AppContext,
    population: Population,
    query_token: Option<String>,
    sink: &mut WsSink,
    stream: &mut WsStream,
) -> Result<Option<(Arc<Connection>, mpsc::Receiver<Outbound>)>> {
    let window = std::time::Duration::from_secs(HANDSHAKE_WINDOW_SECS);

    match population {
        Population::Agent => {
            // Agents always open with `agent:connect` — it carries identity
            // and capabilities even when the token came in the URL.
            let Some(first) = first_message(stream, window).await else {
                return reject(ctx, sink, "no agent:connect within handshake window").await;
            };
            if first.kind != MessageType::AgentConnect {
                return reject(ctx, sink, "expected agent:connect").await;
            }
            let payload: AgentConnectPayload = match first.parse_payload() {
                Ok(p) => p,
                Err(_) => return reject(ctx, sink, "malformed agent:connect payload").await,
            };
            let token = query_token.or_else(|| payload.token.clone());
            let Some(token) = token else {
                return reject(ctx, sink, "missing token").await;
            };
            let (principal, expires_at) = match ctx.auth.validate(&token) {
                Ok(ok) => ok,
                Err(e) => return reject(ctx, sink, &e.to_string()).await,
            };

            let (conn, rx) = Connection::new_agent(
                principal,
                expires_at,
                payload.agent_id.clone(),
                payload.agent_type,
                payload.capabilities.clone(),
            );
            ctx.registry.register(conn.clone());
            ctx.orchestrator.on_agent_connected(&conn, &payload).await;
            Ok(Some((conn, rx)))
        }
        Population::Dashboard => {
            let token = match query_token {
                Some(token) => token,
                None => {
                    let Some(first) = first_message(stream, window).await else {
                        return reject(ctx, sink, "no dashboard:connect within handshake window").await;
                    };
                    if first.kind != MessageType::DashboardConnect {
                        return reject(ctx, sink, "expected dashboard:connect").await;
                    }
                    match first.parse_payload::<DashboardConnectPayload>() {
                        Ok(p) => p.token,
                        Err(_) => {
                            return reject(ctx, sink, "malformed dashboard:connect payload").await
                        }
                    }
                }
            };
            let (principal, expires_at) = match ctx.auth.validate(&token) {
                Ok(ok) => ok,
                Err(e) => return reject(ctx, sink, &e.to_string()).await,
            };
            let (conn, rx) = Connection::new(Population::Dashboard, principal, expires_at);
            ctx.registry.register(conn.clone());
            Ok(Some((conn, rx)))
        }
    }
}

async fn first_message(
    stream: &mut WsStream,
    window: std::time::Duration,
) -> Option<WireMessage> {
    let frame = tokio::time::timeout(window, stream.next()).await.ok()??;
    match frame {
        Ok(Message::Text(text)) => WireMessage::parse(&text).ok(),
        _ => None,
    }
}

async fn reject(
    ctx: &AppContext,
    sink: &mut WsSink,
    why: &str,
) -> Result<Option<(Arc<Connection>, mpsc::Receiver<Outbound>)>> {
    debug!(why, "rejecting unauthenticated connection");
    let _ = ctx
        .storage
        .insert_audit(None, "auth_failure", &json!({ "reason": why }))
        .await;
    let error = ErrorPayload::new(ErrorCode::Unauthorized, why, false).into_message();
    let _ = sink.send(Message::Text(error.to_json())).await;
    let _ = sink
        .send(Message::Close(Some(CloseFrame {
            code: CloseCode::from(close::TOKEN_EXPIRED),
            reason: "unauthorized".into(),
        })))
        .await;
    Ok(None)
}

// ─── Read loop ───────────────────────────────────────────────────────────────

async fn read_loop(
    ctx: &AppContext,
    conn: &Arc<Connection>,
    population: Population,
    stream: &mut WsStream,
) {
    'outer: while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                conn.record_activity(text.len() as u64);

                match WireMessage::parse(&text) {
                    Ok(msg) => {
                        if !process_message(ctx, conn, population, &msg).await {
                            break;
                        }
                    }
                    // A batch envelope is not a WireMessage; unwrap and
                    // admit each inner message on its own merits.
                    Err(e) => match serde_json::from_str::<BatchEnvelope>(&text) {
                        Ok(batch) if batch.kind == MessageType::Batch => {
                            for msg in &batch.messages {
                                if !process_message(ctx, conn, population, msg).await {
                                    break 'outer;
                                }
                            }
                        }
                        _ => reply_error(
                            conn,
                            ErrorPayload::new(ErrorCode::InvalidMessage, e.to_string(), true),
                        ),
                    },
                }
            }
            Ok(Message::Ping(data)) => conn.pong(data),
            Ok(Message::Close(_)) | Err(_) => break,
            _ => {}
        }
    }
}

/// Rate-limit admission plus dispatch for one inbound message.
/// Returns `false` when the connection must close (policy violation).
async fn process_message(
    ctx: &AppContext,
    conn: &Arc<Connection>,
    population: Population,
    msg: &WireMessage,
) -> bool {
    match ctx.rate_limiter.check(&conn.id, msg.kind.as_str()).await {
        RateDecision::Allowed => {}
        RateDecision::Limited { retry_after_ms } => {
            reply_error(
                conn,
                ErrorPayload::new(ErrorCode::RateLimited, "rate limit exceeded", true)
                    .with_retry_after(retry_after_ms),
            );
            return true;
        }
        RateDecision::Disconnect => {
            warn!(conn = %conn.id, "repeated rate violations — closing");
            let _ = ctx
                .storage
                .insert_audit(
                    Some(&conn.principal().user_id),
                    "policy_close",
                    &json!({ "connectionId": conn.id, "reason": "rate limit violations" }),
                )
                .await;
            conn.close(close::POLICY, "rate limit violations");
            return false;
        }
    }

    dispatch(ctx, conn, population, msg).await;
    true
}

async fn dispatch(
    ctx: &AppContext,
    conn: &Arc<Connection>,
    population: Population,
    msg: &WireMessage,
) {
    match msg.kind {
        MessageType::Ping => {
            let pong = WireMessage::new(MessageType::Pong, msg.payload.clone());
            conn.send(MessageType::Pong, Arc::from(pong.to_json()));
        }
        MessageType::Pong | MessageType::Ack => {}
        MessageType::RefreshResponse => match msg.parse_payload() {
            Ok(payload) => {
                // Failures are tracked (and escalated) by the manager.
                let _ = ctx.refresh.handle_response(conn, payload);
            }
            Err(e) => reply_error(
                conn,
                ErrorPayload::new(ErrorCode::InvalidMessage, e.to_string(), true),
            ),
        },
        _ => match population {
            Population::Agent => ctx.orchestrator.handle_agent_message(conn, msg).await,
            Population::Dashboard => ctx.orchestrator.handle_dashboard_message(conn, msg).await,
        },
    }
}

fn reply_error(conn: &Connection, error: ErrorPayload) {
    let msg = error.into_message();
    conn.send(MessageType::Error, Arc::from(msg.to_json()));
}

// ─── Writer task ─────────────────────────────────────────────────────────────

/// Drain the outbound channel to the socket, batching high-volume stream
/// types. Partial batches flush `batch_interval` after their first message.
async fn write_loop(mut rx: mpsc::Receiver<Outbound>, mut sink: WsSink, config: crate::config::BatchConfig) {
    let mut batcher = Batcher::new(config);
    let flush_after = batcher.interval();
    let mut flush_at: Option<tokio::time::Instant> = None;

    loop {
        tokio::select! {
            frame = rx.recv() => {
                match frame {
                    Some(Outbound::Message { kind, json }) => {
                        for out in batcher.push(kind, json) {
                            if sink.send(Message::Text(out)).await.is_err() {
                                return;
                            }
                        }
                        flush_at = if batcher.has_pending() {
                            Some(flush_at.unwrap_or_else(|| tokio::time::Instant::now() + flush_after))
                        } else {
                            None
                        };
                    }
                    Some(Outbound::Pong(data)) => {
                        if sink.send(Message::Pong(data)).await.is_err() {
                            return;
                        }
                    }
                    Some(Outbound::Close { code, reason }) => {
                        if let Some(out) = batcher.flush() {
                            let _ = sink.send(Message::Text(out)).await;
                        }
                        let _ = sink
                            .send(Message::Close(Some(CloseFrame {
                                code: CloseCode::from(code),
                                reason: reason.into(),
                            })))
                            .await;
                        return;
                    }
                    None => {
                        if let Some(out) = batcher.flush() {
                            let _ = sink.send(Message::Text(out)).await;
                        }
                        return;
                    }
                }
            }
            _ = tokio::time::sleep_until(flush_at.unwrap_or_else(tokio::time::Instant::now)), if flush_at.is_some() => {
                if let Some(out) = batcher.flush() {
                    if sink.send(Message::Text(out)).await.is_err() {
                        return;
                    }
                }
                flush_at = None;
            }
        }
    }
}
