//! Wire protocol shared by agents and dashboards.
//!
//! Every frame on the wire is a [`WireMessage`]: a flat envelope carrying the
//! protocol version, a message type discriminator, a unique id, a millisecond
//! timestamp and a free-form JSON payload. Typed payload structs live beside
//! the envelope; handlers decode the payload they expect with
//! [`WireMessage::parse_payload`] and reply with `ERROR INVALID_MESSAGE` on
//! mismatch rather than dropping the connection.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const PROTOCOL_VERSION: &str = "1.0.0";

/// Handshake window: a connection that has not authenticated within this many
/// seconds of the upgrade is closed.
pub const HANDSHAKE_WINDOW_SECS: u64 = 5;

// ─── Close codes ──────────────────────────────────────────────────────────────

pub mod close {
    /// Normal closure.
    pub const NORMAL: u16 = 1000;
    /// Peer went away / missed heartbeats.
    pub const GOING_AWAY: u16 = 1001;
    /// Policy violation (rate limiting, auth abuse).
    pub const POLICY: u16 = 1008;
    /// Internal server error.
    pub const INTERNAL: u16 = 1011;
    /// Access token expired and refresh failed.
    pub const TOKEN_EXPIRED: u16 = 4001;
    /// Agent connection superseded by a newer session with the same agent id.
    pub const SUPERSEDED: u16 = 4002;
}

// ─── Message types ────────────────────────────────────────────────────────────

/// Every message type in the catalogue.
///
/// Wire values are lowercase `category:action` strings. The same type may be
/// legal in more than one direction (`ping`, `ack`); direction checks are the
/// dispatcher's job, not the parser's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    // Agent → server
    #[serde(rename = "agent:connect")]
    AgentConnect,
    #[serde(rename = "agent:heartbeat")]
    AgentHeartbeat,
    #[serde(rename = "agent:error")]
    AgentError,
    #[serde(rename = "command:ack")]
    CommandAck,
    #[serde(rename = "command:complete")]
    CommandComplete,
    #[serde(rename = "terminal:output")]
    TerminalOutput,
    #[serde(rename = "trace:event")]
    TraceEvent,

    // Server → agent
    #[serde(rename = "command:request")]
    CommandRequest,
    #[serde(rename = "command:cancel")]
    CommandCancel,
    #[serde(rename = "agent:control")]
    AgentControl,
    #[serde(rename = "token:refresh")]
    TokenRefresh,

    // Server → both populations
    #[serde(rename = "server:heartbeat")]
    ServerHeartbeat,

    // Server → dashboard
    #[serde(rename = "agent:status")]
    AgentStatus,
    #[serde(rename = "command:status")]
    CommandStatus,
    #[serde(rename = "terminal:stream")]
    TerminalStream,
    #[serde(rename = "trace:stream")]
    TraceStream,
    #[serde(rename = "queue:update")]
    QueueUpdate,
    #[serde(rename = "queue:full")]
    QueueFull,
    #[serde(rename = "emergency:stop")]
    EmergencyStop,

    // Dashboard → server
    #[serde(rename = "dashboard:connect")]
    DashboardConnect,
    #[serde(rename = "dashboard:init")]
    DashboardInit,
    #[serde(rename = "dashboard:subscribe")]
    DashboardSubscribe,
    #[serde(rename = "dashboard:unsubscribe")]
    DashboardUnsubscribe,
    #[serde(rename = "command:interrupt")]
    CommandInterrupt,
    #[serde(rename = "emergency:stop-request")]
    EmergencyStopRequest,

    // Token refresh exchange (server ↔ client, in-band)
    #[serde(rename = "auth:refresh-needed")]
    RefreshNeeded,
    #[serde(rename = "auth:refresh-response")]
    RefreshResponse,
    #[serde(rename = "auth:refresh-success")]
    RefreshSuccess,
    #[serde(rename = "auth:new-token")]
    NewToken,

    // Bidirectional control
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "pong")]
    Pong,
    #[serde(rename = "ack")]
    Ack,
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "batch")]
    Batch,
}

impl MessageType {
    /// High-volume stream types that may be coalesced into batch envelopes.
    pub fn is_batchable(self) -> bool {
        matches!(
            self,
            MessageType::TerminalStream
                | MessageType::TraceStream
                | MessageType::AgentStatus
                | MessageType::QueueUpdate
        )
    }

    /// The wire string for this type (the serde rename value).
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::AgentConnect => "agent:connect",
            MessageType::AgentHeartbeat => "agent:heartbeat",
            MessageType::AgentError => "agent:error",
            MessageType::CommandAck => "command:ack",
            MessageType::CommandComplete => "command:complete",
            MessageType::TerminalOutput => "terminal:output",
            MessageType::TraceEvent => "trace:event",
            MessageType::CommandRequest => "command:request",
            MessageType::CommandCancel => "command:cancel",
            MessageType::AgentControl => "agent:control",
            MessageType::TokenRefresh => "token:refresh",
            MessageType::ServerHeartbeat => "server:heartbeat",
            MessageType::AgentStatus => "agent:status",
            MessageType::CommandStatus => "command:status",
            MessageType::TerminalStream => "terminal:stream",
            MessageType::TraceStream => "trace:stream",
            MessageType::QueueUpdate => "queue:update",
            MessageType::QueueFull => "queue:full",
            MessageType::EmergencyStop => "emergency:stop",
            MessageType::DashboardConnect => "dashboard:connect",
            MessageType::DashboardInit => "dashboard:init",
            MessageType::DashboardSubscribe => "dashboard:subscribe",
            MessageType::DashboardUnsubscribe => "dashboard:unsubscribe",
            MessageType::CommandInterrupt => "command:interrupt",
            MessageType::EmergencyStopRequest => "emergency:stop-request",
            MessageType::RefreshNeeded => "auth:refresh-needed",
            MessageType::RefreshResponse => "auth:refresh-response",
            MessageType::RefreshSuccess => "auth:refresh-success",
            MessageType::NewToken => "auth:new-token",
            MessageType::Ping => "ping",
            MessageType::Pong => "pong",
            MessageType::Ack => "ack",
            MessageType::Error => "error",
            MessageType::Batch => "batch",
        }
    }
}

// ─── Envelope ─────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unsupported protocol version {0:?}")]
    BadVersion(String),
    #[error("missing or invalid payload field: {0}")]
    BadPayload(String),
}

/// The flat wire envelope. `payload` stays as raw JSON until a handler that
/// knows the expected shape decodes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    pub version: String,
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub id: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    #[serde(default)]
    pub payload: Value,
}

impl WireMessage {
    /// Build a new outbound message with a fresh ulid and the current time.
    pub fn new(kind: MessageType, payload: Value) -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            kind,
            id: ulid::Ulid::new().to_string(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            payload,
        }
    }

    /// Parse an inbound text frame. Only the major version is checked: a
    /// `1.x` client talks to a `1.y` server.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let msg: WireMessage = serde_json::from_str(text)?;
        let major = msg.version.split('.').next().unwrap_or("");
        let ours = PROTOCOL_VERSION.split('.').next().unwrap_or("");
        if major != ours {
            return Err(ProtocolError::BadVersion(msg.version));
        }
        Ok(msg)
    }

    /// Decode the payload into a typed struct.
    pub fn parse_payload<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| ProtocolError::BadPayload(e.to_string()))
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

// ─── Batch envelope ───────────────────────────────────────────────────────────

/// Decoded batch envelope. Encoding is done by [`encode_batch`] from
/// pre-serialized message strings so each inner message is serialized once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchEnvelope {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub messages: Vec<WireMessage>,
    pub count: usize,
    pub timestamp: i64,
}

/// Assemble a batch envelope from already-serialized single messages.
///
/// The parts must each be a complete JSON object (the output of
/// [`WireMessage::to_json`]); joining them verbatim keeps the envelope valid
/// without re-serializing the inner messages.
pub fn encode_batch(parts: &[std::sync::Arc<str>]) -> String {
    let mut out = String::with_capacity(64 + parts.iter().map(|p| p.len() + 1).sum::<usize>());
    out.push_str("{\"type\":\"batch\",\"messages\":[");
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(part);
    }
    out.push_str("],\"count\":");
    out.push_str(&parts.len().to_string());
    out.push_str(",\"timestamp\":");
    out.push_str(&chrono::Utc::now().timestamp_millis().to_string());
    out.push('}');
    out
}

// ─── Error payloads ───────────────────────────────────────────────────────────

/// Stable error codes reported to clients. Internal failures are always
/// surfaced as the opaque `INTERNAL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidMessage,
    Unauthorized,
    RateLimited,
    AgentNotFound,
    AgentOffline,
    QueueFull,
    NotActive,
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
    pub recoverable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl ErrorPayload {
    pub fn new(code: ErrorCode, message: impl Into<String>, recoverable: bool) -> Self {
        Self {
            code,
            message: message.into(),
            recoverable,
            retry_after_ms: None,
        }
    }

    pub fn with_retry_after(mut self, ms: u64) -> Self {
        self.retry_after_ms = Some(ms);
        self
    }

    pub fn into_message(self) -> WireMessage {
        WireMessage::new(
            MessageType::Error,
            serde_json::to_value(self).unwrap_or_default(),
        )
    }
}

// ─── Domain enums ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentType {
    Claude,
    Gemini,
    Codex,
    Mock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatusKind {
    Online,
    Connecting,
    Offline,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentActivity {
    Idle,
    Processing,
    Queued,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandState {
    Pending,
    Queued,
    Executing,
    Completed,
    Failed,
    Cancelled,
}

impl CommandState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CommandState::Completed | CommandState::Failed | CommandState::Cancelled
        )
    }

    /// Legal transitions form a DAG; `Executing → Queued` is the retry
    /// re-enqueue edge.
    pub fn can_transition_to(self, next: CommandState) -> bool {
        use CommandState::*;
        matches!(
            (self, next),
            (Pending, Queued)
                | (Pending, Cancelled)
                | (Queued, Executing)
                | (Queued, Cancelled)
                | (Executing, Completed)
                | (Executing, Failed)
                | (Executing, Cancelled)
                | (Executing, Queued)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CommandState::Pending => "pending",
            CommandState::Queued => "queued",
            CommandState::Executing => "executing",
            CommandState::Completed => "completed",
            CommandState::Failed => "failed",
            CommandState::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceKind {
    LlmPrompt,
    ToolCall,
    Response,
}

impl TraceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TraceKind::LlmPrompt => "llm_prompt",
            TraceKind::ToolCall => "tool_call",
            TraceKind::Response => "response",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlAction {
    Stop,
    Restart,
    Pause,
    Resume,
}

// ─── Payloads: agent → server ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConnectPayload {
    pub agent_id: String,
    pub agent_type: AgentType,
    pub version: String,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Bearer token when not supplied as `?token=` on the upgrade URL.
    #[serde(default)]
    pub token: Option<String>,
}

/// Health metrics snapshot reported with every agent heartbeat.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthMetrics {
    #[serde(default)]
    pub cpu_percent: f32,
    #[serde(default)]
    pub memory_mb: u64,
    #[serde(default)]
    pub uptime_secs: u64,
    #[serde(default)]
    pub commands_processed: u64,
    #[serde(default)]
    pub avg_response_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    Received,
    Queued,
    Executing,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandAckPayload {
    pub command_id: String,
    pub status: AckStatus,
    #[serde(default)]
    pub queue_position: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalOutputPayload {
    pub command_id: String,
    pub stream_type: StreamKind,
    pub content: String,
    #[serde(default)]
    pub ansi_codes: bool,
    /// Per-command monotonic sequence assigned by the agent.
    pub sequence: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceEventPayload {
    pub trace_id: String,
    pub command_id: String,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(rename = "type")]
    pub kind: TraceKind,
    pub name: String,
    #[serde(default)]
    pub content: Value,
    /// Milliseconds since the Unix epoch.
    pub started_at: i64,
    #[serde(default)]
    pub completed_at: Option<i64>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub tokens_used: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandCompletePayload {
    pub command_id: String,
    /// `completed` or `failed`.
    pub status: CommandState,
    #[serde(default)]
    pub execution_time_ms: Option<u64>,
    #[serde(default)]
    pub tokens_used: Option<u64>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentErrorPayload {
    pub error_type: String,
    pub message: String,
    pub recoverable: bool,
}

// ─── Payloads: server → agent ─────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandConstraints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_limit_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_budget: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRequestPayload {
    pub command_id: String,
    pub content: String,
    #[serde(rename = "type", default)]
    pub command_type: Option<String>,
    pub priority: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraints: Option<CommandConstraints>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandCancelPayload {
    pub command_id: String,
    pub reason: String,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentControlPayload {
    pub action: ControlAction,
    pub reason: String,
    #[serde(default)]
    pub graceful: bool,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRefreshPayload {
    pub access_token: String,
    pub expires_in_secs: u64,
}

// ─── Payloads: server → dashboard ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerHeartbeatPayload {
    pub server_time: i64,
    pub next_ping_expected_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatusPayload {
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_type: Option<AgentType>,
    pub status: AgentStatusKind,
    pub activity: AgentActivity,
    #[serde(default)]
    pub health: Option<HealthMetrics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_command: Option<String>,
    #[serde(default)]
    pub queued: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandStatusPayload {
    pub command_id: String,
    pub agent_id: String,
    pub status: CommandState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalStreamPayload {
    pub command_id: String,
    pub agent_id: String,
    pub stream_type: StreamKind,
    pub content: String,
    #[serde(default)]
    pub ansi_codes: bool,
    pub sequence: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedCommandSummary {
    pub command_id: String,
    pub priority: u8,
    pub position: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueUpdatePayload {
    pub agent_id: String,
    pub queue_size: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executing: Option<String>,
    #[serde(default)]
    pub queued: Vec<QueuedCommandSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueFullPayload {
    pub agent_id: String,
    pub command_id: String,
    pub max_queue_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmergencyStopPayload {
    pub triggered_by: String,
    pub reason: String,
    pub agents_stopped: usize,
    pub commands_cancelled: usize,
}

// ─── Payloads: dashboard → server ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardConnectPayload {
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardInitPayload {
    pub user_id: String,
    /// Agent ids this dashboard wants streams for. Empty means none — the
    /// dashboard must subscribe explicitly (or pass `all`).
    #[serde(default)]
    pub subscriptions: Vec<String>,
    #[serde(default)]
    pub all: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribePayload {
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub all: bool,
}

/// Dashboard request to run a command on one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitCommandPayload {
    /// Client-supplied stable id; resubmission with the same id is merged.
    #[serde(default)]
    pub command_id: Option<String>,
    pub agent_id: String,
    pub content: String,
    #[serde(rename = "type", default)]
    pub command_type: Option<String>,
    #[serde(default)]
    pub priority: Option<u8>,
    #[serde(default)]
    pub delay_ms: Option<u64>,
    #[serde(default)]
    pub constraints: Option<CommandConstraints>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterruptPayload {
    pub command_id: String,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmergencyStopRequestPayload {
    #[serde(default)]
    pub reason: Option<String>,
}

// ─── Payloads: token refresh exchange ─────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshNeededPayload {
    /// Seconds until the current access token expires.
    pub expires_in_secs: i64,
}

/// Client reply to `auth:refresh-needed` — exactly one of the two fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshResponsePayload {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trip() {
        let msg = WireMessage::new(
            MessageType::Ping,
            serde_json::json!({ "nonce": 7 }),
        );
        let text = msg.to_json();
        let parsed = WireMessage::parse(&text).expect("parse");
        assert_eq!(parsed.kind, MessageType::Ping);
        assert_eq!(parsed.id, msg.id);
        assert_eq!(parsed.payload["nonce"], 7);
    }

    #[test]
    fn rejects_wrong_major_version() {
        let mut msg = WireMessage::new(MessageType::Ping, Value::Null);
        msg.version = "2.0.0".to_string();
        let text = msg.to_json();
        assert!(matches!(
            WireMessage::parse(&text),
            Err(ProtocolError::BadVersion(_))
        ));
    }

    #[test]
    fn wire_names_match_serde_renames() {
        for kind in [
            MessageType::AgentConnect,
            MessageType::CommandRequest,
            MessageType::TerminalStream,
            MessageType::RefreshNeeded,
            MessageType::Batch,
        ] {
            let json = serde_json::to_value(kind).expect("serialize");
            assert_eq!(json.as_str(), Some(kind.as_str()));
        }
    }

    #[test]
    fn batch_encode_round_trips() {
        let a = WireMessage::new(MessageType::TerminalStream, serde_json::json!({"seq": 1}));
        let b = WireMessage::new(MessageType::TraceStream, serde_json::json!({"seq": 2}));
        let parts = [
            std::sync::Arc::<str>::from(a.to_json()),
            std::sync::Arc::<str>::from(b.to_json()),
        ];
        let encoded = encode_batch(&parts);
        let batch: BatchEnvelope = serde_json::from_str(&encoded).expect("decode");
        assert_eq!(batch.kind, MessageType::Batch);
        assert_eq!(batch.count, 2);
        assert_eq!(batch.messages.len(), 2);
        assert_eq!(batch.messages[0].id, a.id);
        assert_eq!(batch.messages[1].kind, MessageType::TraceStream);
    }

    #[test]
    fn command_state_dag() {
        use CommandState::*;
        assert!(Pending.can_transition_to(Queued));
        assert!(Queued.can_transition_to(Executing));
        assert!(Executing.can_transition_to(Queued), "retry re-enqueue");
        assert!(!Completed.can_transition_to(Executing));
        assert!(!Pending.can_transition_to(Executing), "no state skipping");
        for terminal in [Completed, Failed, Cancelled] {
            for next in [Pending, Queued, Executing, Completed, Failed, Cancelled] {
                assert!(!terminal.can_transition_to(next), "terminal is immutable");
            }
        }
    }

    #[test]
    fn error_payload_serializes_code() {
        let err = ErrorPayload::new(ErrorCode::AgentOffline, "agent A1 is offline", true);
        let v = serde_json::to_value(&err).expect("serialize");
        assert_eq!(v["code"], "AGENT_OFFLINE");
        assert_eq!(v["recoverable"], true);
    }
}
