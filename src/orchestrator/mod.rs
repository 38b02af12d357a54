//! Command lifecycle orchestration.
//!
//! The orchestrator is the glue between the session layer and the core
//! components: it validates dashboard requests, persists and enqueues
//! commands, dispatches queued work to idle agents, translates agent acks /
//! output / completions into dashboard broadcasts, and owns the emergency
//! stop. Component events flow in over typed channels (queue events,
//! collector events, registry disconnects) and out through the router.
//!
//! Command state transitions follow a strict DAG — Pending → Queued →
//! Executing → {Completed, Failed, Cancelled}, with Executing → Queued as
//! the retry edge — enforced here and mirrored in storage, which never
//! rewrites a terminal row.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::json;
use tracing::{debug, info, warn};

use crate::protocol::{
    AgentActivity, AgentConnectPayload, AgentControlPayload, AgentErrorPayload, AgentStatusKind,
    AgentStatusPayload, AgentType, CommandAckPayload, CommandCompletePayload, CommandState,
    CommandStatusPayload, ControlAction, EmergencyStopPayload, ErrorCode, ErrorPayload,
    HealthMetrics, InterruptPayload, MessageType, QueueFullPayload, QueueUpdatePayload,
    QueuedCommandSummary, SubmitCommandPayload, TerminalOutputPayload, WireMessage,
};
use crate::queue::{
    CommandSpec, CompletionOutcome, QueueEvent, QueueManager, QueueSnapshot,
};
use crate::redact::redact_str;
use crate::registry::{Connection, ConnectionRegistry};
use crate::router::{Filter, MessageRouter};
use crate::storage::Storage;
use crate::trace::{CollectorEvent, TraceCollector};

/// Broadcast priorities on the router's 0–10 scale.
mod prio {
    pub const STREAM: u8 = 3;
    pub const STATUS: u8 = 5;
    pub const COMMAND_STATUS: u8 = 6;
    pub const DISPATCH: u8 = 7;
    pub const CONTROL: u8 = 9;
}

/// Default grace period for a non-forced interrupt.
const DEFAULT_INTERRUPT_TIMEOUT: Duration = Duration::from_secs(5);
/// Repeated emergency triggers inside this window are coalesced.
const EMERGENCY_COALESCE: Duration = Duration::from_secs(1);
/// Dispatcher scan cadence (covers delayed jobs and retry backoffs).
const DISPATCH_TICK: Duration = Duration::from_millis(250);
/// Newest terminal output rows kept per command.
const TERMINAL_KEEP_PER_COMMAND: u32 = 1_000;

// ─── Agent runtime state ─────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct AgentRuntime {
    agent_type: AgentType,
    status: AgentStatusKind,
    activity: AgentActivity,
    health: Option<HealthMetrics>,
    current_command: Option<String>,
}

struct EmergencyState {
    active: bool,
    last_trigger: Option<Instant>,
}

// ─── Orchestrator ────────────────────────────────────────────────────────────

pub struct Orchestrator {
    registry: Arc<ConnectionRegistry>,
    router: Arc<MessageRouter>,
    queues: Arc<QueueManager>,
    storage: Arc<Storage>,
    collector: Arc<TraceCollector>,
    agents: Mutex<HashMap<String, AgentRuntime>>,
    emergency: Mutex<EmergencyState>,
    dispatch_enabled: AtomicBool,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        router: Arc<MessageRouter>,
        queues: Arc<QueueManager>,
        storage: Arc<Storage>,
        collector: Arc<TraceCollector>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            router,
            queues,
            storage,
            collector,
            agents: Mutex::new(HashMap::new()),
            emergency: Mutex::new(EmergencyState {
                active: false,
                last_trigger: None,
            }),
            dispatch_enabled: AtomicBool::new(true),
        })
    }

    fn agents_lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, AgentRuntime>> {
        self.agents.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn reply(conn: &Connection, kind: MessageType, payload: serde_json::Value) {
        let msg = WireMessage::new(kind, payload);
        conn.send(kind, Arc::from(msg.to_json()));
    }

    fn reply_error(conn: &Connection, error: ErrorPayload) {
        let msg = error.into_message();
        conn.send(MessageType::Error, Arc::from(msg.to_json()));
    }

    /// Filter selecting dashboards subscribed to one agent's streams.
    fn subscribed_to(agent_id: &str) -> Filter {
        let agent_id = agent_id.to_string();
        Arc::new(move |conn: &Connection| conn.is_subscribed_to(&agent_id))
    }

    // ── Agent session lifecycle ─────────────────────────────────────────────

    /// Called by the session layer once an agent connection is registered.
    pub async fn on_agent_connected(&self, conn: &Arc<Connection>, payload: &AgentConnectPayload) {
        let agent_id = payload.agent_id.clone();
        {
            let mut agents = self.agents_lock();
            agents.insert(
                agent_id.clone(),
                AgentRuntime {
                    agent_type: payload.agent_type,
                    status: AgentStatusKind::Online,
                    activity: AgentActivity::Idle,
                    health: None,
                    current_command: None,
                },
            );
        }
        let user_id = conn.principal().user_id;
        let type_str = serde_json::to_value(payload.agent_type)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        if let Err(e) = self
            .storage
            .upsert_agent(&agent_id, &user_id, &type_str, "online")
            .await
        {
            warn!(agent = %agent_id, err = %e, "failed to persist agent connect");
        }
        info!(agent = %agent_id, agent_type = %type_str, "agent online");
        self.broadcast_agent_status(&agent_id);
        // Work may already be waiting from a previous session.
        self.try_dispatch(&agent_id).await;
    }

    pub async fn on_agent_disconnected(&self, agent_id: &str) {
        {
            let mut agents = self.agents_lock();
            if let Some(runtime) = agents.get_mut(agent_id) {
                runtime.status = AgentStatusKind::Offline;
                runtime.activity = AgentActivity::Idle;
            }
        }
        if let Err(e) = self.storage.set_agent_status(agent_id, "offline").await {
            warn!(agent = %agent_id, err = %e, "failed to persist agent disconnect");
        }
        info!(agent = %agent_id, "agent offline");
        self.broadcast_agent_status(agent_id);
    }

    fn broadcast_agent_status(&self, agent_id: &str) {
        let Some(payload) = self.agent_status_payload(agent_id) else {
            return;
        };
        self.router.to_dashboards(
            MessageType::AgentStatus,
            serde_json::to_value(payload).unwrap_or_default(),
            prio::STATUS,
            Some(Self::subscribed_to(agent_id)),
        );
    }

    fn agent_status_payload(&self, agent_id: &str) -> Option<AgentStatusPayload> {
        let agents = self.agents_lock();
        let runtime = agents.get(agent_id)?;
        let queued = self
            .queues
            .get(agent_id)
            .map(|q| q.snapshot().queue_size)
            .unwrap_or(0);
        Some(AgentStatusPayload {
            agent_id: agent_id.to_string(),
            agent_type: Some(runtime.agent_type),
            status: runtime.status,
            activity: runtime.activity,
            health: runtime.health.clone(),
            current_command: runtime.current_command.clone(),
            queued,
        })
    }

    /// Current status payloads for every known agent (dashboard init sync).
    pub fn agent_statuses(&self) -> Vec<AgentStatusPayload> {
        let ids: Vec<String> = self.agents_lock().keys().cloned().collect();
        ids.iter()
            .filter_map(|id| self.agent_status_payload(id))
            .collect()
    }

    // ── Inbound: agent messages ─────────────────────────────────────────────

    pub async fn handle_agent_message(&self, conn: &Arc<Connection>, msg: &WireMessage) {
        let Some(agent_id) = conn.agent_id.clone() else {
            return;
        };
        match msg.kind {
            MessageType::AgentHeartbeat => {
                let health: HealthMetrics = msg.parse_payload().unwrap_or_default();
                {
                    let mut agents = self.agents_lock();
                    if let Some(runtime) = agents.get_mut(&agent_id) {
                        runtime.health = Some(health);
                        runtime.status = AgentStatusKind::Online;
                    }
                }
                if let Err(e) = self.storage.set_agent_status(&agent_id, "online").await {
                    debug!(agent = %agent_id, err = %e, "heartbeat persist failed");
                }
                self.broadcast_agent_status(&agent_id);
            }
            MessageType::CommandAck => match msg.parse_payload::<CommandAckPayload>() {
                Ok(ack) => self.handle_ack(&agent_id, ack).await,
                Err(e) => Self::reply_error(
                    conn,
                    ErrorPayload::new(ErrorCode::InvalidMessage, e.to_string(), true),
                ),
            },
            MessageType::TerminalOutput => match msg.parse_payload::<TerminalOutputPayload>() {
                Ok(output) => self.handle_terminal_output(&agent_id, output).await,
                Err(e) => Self::reply_error(
                    conn,
                    ErrorPayload::new(ErrorCode::InvalidMessage, e.to_string(), true),
                ),
            },
            MessageType::TraceEvent => match msg.parse_payload() {
                Ok(event) => {
                    if let Err(e) = self.collector.ingest(&agent_id, event).await {
                        Self::reply_error(
                            conn,
                            ErrorPayload::new(ErrorCode::InvalidMessage, e.to_string(), true),
                        );
                    }
                }
                Err(e) => Self::reply_error(
                    conn,
                    ErrorPayload::new(ErrorCode::InvalidMessage, e.to_string(), true),
                ),
            },
            MessageType::CommandComplete => match msg.parse_payload::<CommandCompletePayload>() {
                Ok(complete) => self.handle_complete(&agent_id, complete).await,
                Err(e) => Self::reply_error(
                    conn,
                    ErrorPayload::new(ErrorCode::InvalidMessage, e.to_string(), true),
                ),
            },
            MessageType::AgentError => {
                let err: AgentErrorPayload = match msg.parse_payload() {
                    Ok(err) => err,
                    Err(_) => return,
                };
                warn!(
                    agent = %agent_id,
                    error_type = %err.error_type,
                    recoverable = err.recoverable,
                    "agent reported error"
                );
                if !err.recoverable {
                    let mut agents = self.agents_lock();
                    if let Some(runtime) = agents.get_mut(&agent_id) {
                        runtime.status = AgentStatusKind::Error;
                    }
                }
                self.broadcast_agent_status(&agent_id);
            }
            _ => {
                debug!(agent = %agent_id, kind = ?msg.kind, "unexpected agent message type");
            }
        }
    }

    async fn handle_ack(&self, agent_id: &str, ack: CommandAckPayload) {
        let _ = self
            .storage
            .insert_audit(
                None,
                "command_ack",
                &json!({ "commandId": ack.command_id, "agentId": agent_id, "status": ack.status }),
            )
            .await;
        self.broadcast_command_status(
            &ack.command_id,
            agent_id,
            CommandState::Executing,
            ack.queue_position,
            None,
            None,
        );
    }

    async fn handle_terminal_output(&self, agent_id: &str, output: TerminalOutputPayload) {
        let (content, _) = redact_str(&output.content);
        if let Err(e) = self
            .storage
            .insert_terminal_output(&output.command_id, agent_id, output.stream_type, &content)
            .await
        {
            warn!(command = %output.command_id, err = %e, "terminal output persist failed");
        } else if let Err(e) = self
            .storage
            .prune_terminal_outputs(&output.command_id, TERMINAL_KEEP_PER_COMMAND)
            .await
        {
            debug!(command = %output.command_id, err = %e, "terminal output prune failed");
        }
        let stream = crate::protocol::TerminalStreamPayload {
            command_id: output.command_id,
            agent_id: agent_id.to_string(),
            stream_type: output.stream_type,
            content,
            ansi_codes: output.ansi_codes,
            sequence: output.sequence,
        };
        self.router.to_dashboards(
            MessageType::TerminalStream,
            serde_json::to_value(stream).unwrap_or_default(),
            prio::STREAM,
            Some(Self::subscribed_to(agent_id)),
        );
    }

    async fn handle_complete(&self, agent_id: &str, complete: CommandCompletePayload) {
        let Some(queue) = self.queues.get(agent_id) else {
            return;
        };
        let success = complete.status == CommandState::Completed;
        let outcome =
            queue.complete_executing(&complete.command_id, success, complete.error.clone());

        {
            let mut agents = self.agents_lock();
            if let Some(runtime) = agents.get_mut(agent_id) {
                runtime.activity = AgentActivity::Idle;
                runtime.current_command = None;
            }
        }

        match outcome {
            CompletionOutcome::Completed(job) => {
                if let Err(e) = self
                    .storage
                    .update_command_status(&job.spec.command_id, CommandState::Completed, None, None)
                    .await
                {
                    warn!(command = %job.spec.command_id, err = %e, "completion persist failed");
                }
                info!(
                    command = %job.spec.command_id,
                    agent = %agent_id,
                    execution_ms = complete.execution_time_ms.unwrap_or(0),
                    "command completed"
                );
                self.broadcast_command_status(
                    &job.spec.command_id,
                    agent_id,
                    CommandState::Completed,
                    None,
                    complete.exit_code,
                    None,
                );
            }
            CompletionOutcome::Retrying(job) => {
                if let Err(e) = self
                    .storage
                    .update_command_status(
                        &job.spec.command_id,
                        CommandState::Queued,
                        None,
                        job.failure_reason.as_deref(),
                    )
                    .await
                {
                    warn!(command = %job.spec.command_id, err = %e, "retry persist failed");
                }
                self.broadcast_command_status(
                    &job.spec.command_id,
                    agent_id,
                    CommandState::Queued,
                    None,
                    None,
                    job.failure_reason.as_deref(),
                );
            }
            CompletionOutcome::Failed(job) => {
                if let Err(e) = self
                    .storage
                    .update_command_status(
                        &job.spec.command_id,
                        CommandState::Failed,
                        None,
                        job.failure_reason.as_deref(),
                    )
                    .await
                {
                    warn!(command = %job.spec.command_id, err = %e, "failure persist failed");
                }
                self.collector.evict(&job.spec.command_id);
                self.broadcast_command_status(
                    &job.spec.command_id,
                    agent_id,
                    CommandState::Failed,
                    None,
                    complete.exit_code,
                    job.failure_reason.as_deref(),
                );
            }
            CompletionOutcome::Ignored => {
                debug!(
                    command = %complete.command_id,
                    agent = %agent_id,
                    "late or unknown completion ignored"
                );
                return;
            }
        }
        self.broadcast_agent_status(agent_id);
        self.try_dispatch(agent_id).await;
    }

    // ── Inbound: dashboard messages ─────────────────────────────────────────

    pub async fn handle_dashboard_message(&self, conn: &Arc<Connection>, msg: &WireMessage) {
        match msg.kind {
            MessageType::DashboardInit => {
                let init: crate::protocol::DashboardInitPayload = match msg.parse_payload() {
                    Ok(init) => init,
                    Err(e) => {
                        return Self::reply_error(
                            conn,
                            ErrorPayload::new(ErrorCode::InvalidMessage, e.to_string(), true),
                        );
                    }
                };
                conn.set_subscriptions(init.all, init.subscriptions);
                // Initial state sync: every known agent's status, routed to
                // this connection only.
                for status in self.agent_statuses() {
                    self.router.to_connection(
                        &conn.id,
                        MessageType::AgentStatus,
                        serde_json::to_value(status).unwrap_or_default(),
                        prio::STATUS,
                    );
                }
            }
            MessageType::DashboardSubscribe => {
                if let Ok(sub) = msg.parse_payload::<crate::protocol::SubscribePayload>() {
                    conn.subscribe(sub.agent_id.as_deref(), sub.all);
                }
            }
            MessageType::DashboardUnsubscribe => {
                if let Ok(sub) = msg.parse_payload::<crate::protocol::SubscribePayload>() {
                    conn.unsubscribe(sub.agent_id.as_deref(), sub.all);
                }
            }
            MessageType::CommandRequest => match msg.parse_payload::<SubmitCommandPayload>() {
                Ok(request) => self.handle_command_request(conn, request).await,
                Err(e) => Self::reply_error(
                    conn,
                    ErrorPayload::new(ErrorCode::InvalidMessage, e.to_string(), true),
                ),
            },
            MessageType::CommandInterrupt => match msg.parse_payload::<InterruptPayload>() {
                Ok(interrupt) => self.handle_interrupt(conn, interrupt).await,
                Err(e) => Self::reply_error(
                    conn,
                    ErrorPayload::new(ErrorCode::InvalidMessage, e.to_string(), true),
                ),
            },
            MessageType::EmergencyStopRequest => {
                let principal = conn.principal();
                if !principal.role.can_control() {
                    return Self::reply_error(
                        conn,
                        ErrorPayload::new(
                            ErrorCode::Unauthorized,
                            "emergency stop requires operator access",
                            true,
                        ),
                    );
                }
                let reason = msg
                    .parse_payload::<crate::protocol::EmergencyStopRequestPayload>()
                    .ok()
                    .and_then(|p| p.reason)
                    .unwrap_or_else(|| "triggered from dashboard".to_string());
                self.trigger_emergency(&principal.user_id, &reason).await;
            }
            _ => {
                debug!(conn = %conn.id, kind = ?msg.kind, "unexpected dashboard message type");
            }
        }
    }

    async fn handle_command_request(&self, conn: &Arc<Connection>, request: SubmitCommandPayload) {
        let agent_id = request.agent_id.clone();

        // Validate the target before writing any state.
        let known = self.agents_lock().contains_key(&agent_id);
        if !known {
            return Self::reply_error(
                conn,
                ErrorPayload::new(
                    ErrorCode::AgentNotFound,
                    format!("agent {agent_id} is not registered"),
                    true,
                ),
            );
        }
        let online = self.registry.by_agent(&agent_id).is_some();
        if !online {
            return Self::reply_error(
                conn,
                ErrorPayload::new(
                    ErrorCode::AgentOffline,
                    format!("agent {agent_id} is offline"),
                    true,
                ),
            );
        }

        let command_id = request
            .command_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let priority = request.priority.unwrap_or(50);
        let user_id = conn.principal().user_id;

        let spec = CommandSpec {
            command_id: command_id.clone(),
            agent_id: agent_id.clone(),
            user_id: user_id.clone(),
            content: request.content.clone(),
            command_type: request.command_type.clone(),
            constraints: request.constraints.clone(),
        };
        let queue = self.queues.queue(&agent_id);
        let delay = request.delay_ms.map(Duration::from_millis);
        let outcome = match queue.enqueue(spec, priority, delay) {
            Ok(outcome) => outcome,
            Err(e) => {
                return Self::reply_error(
                    conn,
                    ErrorPayload::new(ErrorCode::QueueFull, e.to_string(), true),
                );
            }
        };
        if outcome.is_merged() {
            // Idempotent resubmission: acknowledge, change nothing.
            Self::reply(conn, MessageType::Ack, json!({ "commandId": command_id }));
            return;
        }

        let created = match self
            .storage
            .insert_command(
                &command_id,
                &user_id,
                &agent_id,
                &request.content,
                request.command_type.as_deref(),
                outcome.job().priority,
            )
            .await
        {
            Ok(created) => created,
            Err(e) => {
                warn!(command = %command_id, err = %e, "command persist failed");
                queue.remove(&command_id);
                return Self::reply_error(
                    conn,
                    ErrorPayload::new(ErrorCode::Internal, "internal error", true),
                );
            }
        };
        if !created {
            // A row with this id already ran to completion in an earlier
            // session; honour idempotency and drop the fresh job.
            queue.remove(&command_id);
            Self::reply(conn, MessageType::Ack, json!({ "commandId": command_id }));
            return;
        }
        let _ = self
            .storage
            .insert_audit(
                Some(&user_id),
                "command_request",
                &json!({ "commandId": command_id, "agentId": agent_id, "priority": priority }),
            )
            .await;

        self.broadcast_command_status(
            &command_id,
            &agent_id,
            CommandState::Pending,
            None,
            None,
            None,
        );
        let position = queue.position(&command_id);
        if let Err(e) = self
            .storage
            .update_command_status(&command_id, CommandState::Queued, position, None)
            .await
        {
            warn!(command = %command_id, err = %e, "queued persist failed");
        }
        self.broadcast_command_status(
            &command_id,
            &agent_id,
            CommandState::Queued,
            position,
            None,
            None,
        );
        Self::reply(conn, MessageType::Ack, json!({ "commandId": command_id }));
        self.try_dispatch(&agent_id).await;
    }

    async fn handle_interrupt(&self, conn: &Arc<Connection>, interrupt: InterruptPayload) {
        let Some(queue) = self.queues.find_command(&interrupt.command_id) else {
            return Self::reply_error(
                conn,
                ErrorPayload::new(
                    ErrorCode::NotActive,
                    format!("command {} is not active", interrupt.command_id),
                    true,
                ),
            );
        };
        let reason = interrupt
            .reason
            .clone()
            .unwrap_or_else(|| "interrupted from dashboard".to_string());
        let timeout = interrupt
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_INTERRUPT_TIMEOUT);
        let agent_id = queue.agent_id.clone();

        // Tell the agent to stop regardless of queue state — a queued
        // command costs it nothing, an executing one should abort.
        let cancel = crate::protocol::CommandCancelPayload {
            command_id: interrupt.command_id.clone(),
            reason: reason.clone(),
            force: interrupt.force,
        };
        self.router.to_agent(
            &agent_id,
            MessageType::CommandCancel,
            serde_json::to_value(cancel).unwrap_or_default(),
            prio::CONTROL,
        );

        match queue
            .interrupt(&interrupt.command_id, &reason, interrupt.force, timeout)
            .await
        {
            Ok(job) if job.state == CommandState::Cancelled => {
                if let Err(e) = self
                    .storage
                    .update_command_status(
                        &job.spec.command_id,
                        CommandState::Cancelled,
                        None,
                        job.failure_reason.as_deref(),
                    )
                    .await
                {
                    warn!(command = %job.spec.command_id, err = %e, "cancel persist failed");
                }
                let _ = self
                    .storage
                    .insert_audit(
                        Some(&conn.principal().user_id),
                        "command_interrupt",
                        &json!({
                            "commandId": job.spec.command_id,
                            "agentId": agent_id,
                            "force": interrupt.force,
                            "reason": job.failure_reason,
                        }),
                    )
                    .await;
                self.collector.evict(&job.spec.command_id);
                {
                    let mut agents = self.agents_lock();
                    if let Some(runtime) = agents.get_mut(&agent_id) {
                        if runtime.current_command.as_deref() == Some(job.spec.command_id.as_str()) {
                            runtime.activity = AgentActivity::Idle;
                            runtime.current_command = None;
                        }
                    }
                }
                self.broadcast_command_status(
                    &job.spec.command_id,
                    &agent_id,
                    CommandState::Cancelled,
                    None,
                    None,
                    job.failure_reason.as_deref(),
                );
                self.try_dispatch(&agent_id).await;
            }
            Ok(_) => {
                // Finished gracefully during the grace period; the agent's
                // own completion already drove the broadcasts.
            }
            Err(e) => Self::reply_error(
                conn,
                ErrorPayload::new(ErrorCode::NotActive, e.to_string(), true),
            ),
        }
    }

    // ── Dispatch ────────────────────────────────────────────────────────────

    /// Hand the highest-priority ready command to the agent, if it is idle.
    pub async fn try_dispatch(&self, agent_id: &str) {
        if !self.dispatch_enabled.load(Ordering::Relaxed) {
            return;
        }
        let Some(conn) = self.registry.by_agent(agent_id) else {
            return;
        };
        if !self.registry.is_conn_healthy(&conn) {
            return;
        }
        let Some(queue) = self.queues.get(agent_id) else {
            return;
        };
        let Some(job) = queue.take_next_ready() else {
            return;
        };

        {
            let mut agents = self.agents_lock();
            if let Some(runtime) = agents.get_mut(agent_id) {
                runtime.activity = AgentActivity::Processing;
                runtime.current_command = Some(job.spec.command_id.clone());
            }
        }
        if let Err(e) = self
            .storage
            .update_command_status(&job.spec.command_id, CommandState::Executing, None, None)
            .await
        {
            warn!(command = %job.spec.command_id, err = %e, "executing persist failed");
        }
        info!(
            command = %job.spec.command_id,
            agent = %agent_id,
            priority = job.priority,
            attempt = job.attempt_count,
            "dispatching command"
        );

        let request = crate::protocol::CommandRequestPayload {
            command_id: job.spec.command_id.clone(),
            content: job.spec.content.clone(),
            command_type: job.spec.command_type.clone(),
            priority: job.priority,
            constraints: job.spec.constraints.clone(),
            context: None,
        };
        self.router.to_agent(
            agent_id,
            MessageType::CommandRequest,
            serde_json::to_value(request).unwrap_or_default(),
            prio::DISPATCH,
        );
        self.broadcast_command_status(
            &job.spec.command_id,
            agent_id,
            CommandState::Executing,
            None,
            None,
            None,
        );
        self.broadcast_agent_status(agent_id);
    }

    /// Periodic dispatch scan: picks up delayed jobs and retry backoffs.
    pub fn start_dispatcher(self: &Arc<Self>) {
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(DISPATCH_TICK);
            loop {
                interval.tick().await;
                let agent_ids: Vec<String> = orchestrator
                    .queues
                    .all()
                    .iter()
                    .map(|q| q.agent_id.clone())
                    .collect();
                for agent_id in agent_ids {
                    orchestrator.try_dispatch(&agent_id).await;
                }
            }
        });
    }

    // ── Emergency stop ──────────────────────────────────────────────────────

    /// Cancel everything in flight and broadcast `emergency:stop` to every
    /// live connection. Idempotent: triggers within the coalesce window are
    /// dropped. Dispatch stays disabled until [`Orchestrator::clear_emergency`].
    pub async fn trigger_emergency(&self, triggered_by: &str, reason: &str) {
        {
            let mut state = self.emergency.lock().unwrap_or_else(|e| e.into_inner());
            if state
                .last_trigger
                .is_some_and(|at| at.elapsed() < EMERGENCY_COALESCE)
            {
                debug!("emergency stop coalesced");
                return;
            }
            state.active = true;
            state.last_trigger = Some(Instant::now());
        }
        self.dispatch_enabled.store(false, Ordering::Relaxed);

        let mut cancelled = Vec::new();
        for queue in self.queues.all() {
            cancelled.extend(queue.cancel_all("emergency stop"));
        }
        for job in &cancelled {
            if let Err(e) = self
                .storage
                .update_command_status(
                    &job.spec.command_id,
                    CommandState::Cancelled,
                    None,
                    Some("emergency stop"),
                )
                .await
            {
                warn!(command = %job.spec.command_id, err = %e, "emergency cancel persist failed");
            }
            self.collector.evict(&job.spec.command_id);
            self.broadcast_command_status(
                &job.spec.command_id,
                &job.spec.agent_id,
                CommandState::Cancelled,
                None,
                None,
                Some("emergency stop"),
            );
        }

        let agent_conns = self.registry.by_population(crate::registry::Population::Agent);
        let agents_stopped = agent_conns.len();
        {
            let mut agents = self.agents_lock();
            for runtime in agents.values_mut() {
                runtime.activity = AgentActivity::Idle;
                runtime.current_command = None;
            }
        }
        let control = AgentControlPayload {
            action: ControlAction::Stop,
            reason: reason.to_string(),
            graceful: false,
            timeout_ms: None,
        };
        self.router.to_all_agents(
            MessageType::AgentControl,
            serde_json::to_value(control).unwrap_or_default(),
            prio::CONTROL,
        );

        let payload = EmergencyStopPayload {
            triggered_by: triggered_by.to_string(),
            reason: reason.to_string(),
            agents_stopped,
            commands_cancelled: cancelled.len(),
        };
        warn!(
            triggered_by = %triggered_by,
            reason = %reason,
            agents = agents_stopped,
            commands = cancelled.len(),
            "EMERGENCY STOP"
        );
        self.router
            .emergency_broadcast(serde_json::to_value(payload).unwrap_or_default());
        let _ = self
            .storage
            .insert_audit(
                Some(triggered_by),
                "emergency_stop",
                &json!({
                    "reason": reason,
                    "agentsStopped": agents_stopped,
                    "commandsCancelled": cancelled.len(),
                }),
            )
            .await;
    }

    /// Re-enable dispatch after an emergency stop has been investigated.
    pub fn clear_emergency(&self) {
        {
            let mut state = self.emergency.lock().unwrap_or_else(|e| e.into_inner());
            state.active = false;
        }
        self.dispatch_enabled.store(true, Ordering::Relaxed);
        info!("emergency stop cleared — dispatch re-enabled");
    }

    pub fn emergency_active(&self) -> bool {
        self.emergency
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .active
    }

    // ── Event channel consumers ─────────────────────────────────────────────

    /// Consume queue events (positions, rejections) into broadcasts.
    pub fn start_queue_events(
        self: &Arc<Self>,
        mut rx: tokio::sync::mpsc::UnboundedReceiver<QueueEvent>,
    ) {
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    QueueEvent::PositionsChanged(snapshot) => {
                        orchestrator.broadcast_queue_update(&snapshot);
                    }
                    QueueEvent::Full {
                        agent_id,
                        command_id,
                        max_queue_size,
                    } => {
                        let payload = QueueFullPayload {
                            agent_id: agent_id.clone(),
                            command_id,
                            max_queue_size,
                        };
                        orchestrator.router.to_dashboards(
                            MessageType::QueueFull,
                            serde_json::to_value(payload).unwrap_or_default(),
                            prio::STATUS,
                            Some(Self::subscribed_to(&agent_id)),
                        );
                    }
                }
            }
        });
    }

    fn broadcast_queue_update(&self, snapshot: &QueueSnapshot) {
        let payload = QueueUpdatePayload {
            agent_id: snapshot.agent_id.clone(),
            queue_size: snapshot.queue_size,
            executing: snapshot.executing.clone(),
            queued: snapshot
                .queued
                .iter()
                .map(|q| QueuedCommandSummary {
                    command_id: q.command_id.clone(),
                    priority: q.priority,
                    position: q.position,
                })
                .collect(),
        };
        self.router.to_dashboards(
            MessageType::QueueUpdate,
            serde_json::to_value(payload).unwrap_or_default(),
            prio::STATUS,
            Some(Self::subscribed_to(&snapshot.agent_id)),
        );
    }

    /// Consume collector events into trace stream broadcasts.
    pub fn start_collector_events(
        self: &Arc<Self>,
        mut rx: tokio::sync::mpsc::UnboundedReceiver<CollectorEvent>,
    ) {
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    CollectorEvent::TraceAdded { agent_id, event } => {
                        orchestrator.router.to_dashboards(
                            MessageType::TraceStream,
                            serde_json::to_value(event).unwrap_or_default(),
                            prio::STREAM,
                            Some(Self::subscribed_to(&agent_id)),
                        );
                    }
                    CollectorEvent::CommandCompleted {
                        command_id,
                        agent_id,
                        stats,
                    } => {
                        orchestrator.router.to_dashboards(
                            MessageType::TraceStream,
                            json!({
                                "commandId": command_id,
                                "aggregation": stats,
                            }),
                            prio::STATUS,
                            Some(Self::subscribed_to(&agent_id)),
                        );
                    }
                }
            }
        });
    }

    /// Mark agents offline when their session drops.
    pub fn start_disconnect_watch(self: &Arc<Self>) {
        let orchestrator = Arc::clone(self);
        let mut disconnects = self.registry.subscribe_disconnects();
        tokio::spawn(async move {
            while let Ok(event) = disconnects.recv().await {
                if let Some(agent_id) = event.agent_id {
                    // Preemption also unregisters the old session; only mark
                    // offline if no successor holds the slot.
                    if orchestrator.registry.by_agent(&agent_id).is_none() {
                        orchestrator.on_agent_disconnected(&agent_id).await;
                    }
                }
            }
        });
    }

    // ── Shared helpers ──────────────────────────────────────────────────────

    fn broadcast_command_status(
        &self,
        command_id: &str,
        agent_id: &str,
        status: CommandState,
        queue_position: Option<u32>,
        exit_code: Option<i32>,
        failure_reason: Option<&str>,
    ) {
        let payload = CommandStatusPayload {
            command_id: command_id.to_string(),
            agent_id: agent_id.to_string(),
            status,
            queue_position,
            exit_code,
            failure_reason: failure_reason.map(str::to_string),
        };
        self.router.to_dashboards(
            MessageType::CommandStatus,
            serde_json::to_value(payload).unwrap_or_default(),
            prio::COMMAND_STATUS,
            Some(Self::subscribed_to(agent_id)),
        );
    }
}
