use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::error;

const DEFAULT_PORT: u16 = 4400;
const DEFAULT_HEARTBEAT_SECS: u64 = 30;
const DEFAULT_RETENTION_DAYS: u32 = 30;

// ─── TOML config file ─────────────────────────────────────────────────────────

/// `{data_dir}/config.toml` — all fields are optional overrides.
/// Priority: CLI / env var  >  TOML  >  built-in default.
#[derive(Deserialize, Default)]
struct TomlConfig {
    /// WebSocket server port (default: 4400).
    port: Option<u16>,
    /// Log level filter string, e.g. "debug", "info,fleetd=trace" (default: "info").
    log: Option<String>,
    /// Server heartbeat interval in seconds (default: 30).
    heartbeat_secs: Option<u64>,
    /// HS256 secret for access/refresh tokens. Omit to use the generated
    /// per-install secret at `{data_dir}/jwt_secret`.
    jwt_secret: Option<String>,
    /// How many days of terminal output and trace history to keep (0 = never prune).
    retention_days: Option<u32>,
    router: Option<RouterConfig>,
    queue: Option<QueueConfig>,
    rate_limit: Option<RateLimitConfig>,
    batch: Option<BatchConfig>,
    refresh: Option<RefreshConfig>,
    trace: Option<TraceConfig>,
}

fn load_toml(data_dir: &Path) -> Option<TomlConfig> {
    let path = data_dir.join("config.toml");
    let contents = std::fs::read_to_string(&path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config.toml — using defaults");
            None
        }
    }
}

// ─── Component tunables ───────────────────────────────────────────────────────

/// Message router tunables (`[router]` in config.toml).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Bounded envelope queue size. Inserting into a full queue evicts the
    /// lowest-priority oldest envelope.
    pub queue_cap: usize,
    /// Processing tick in milliseconds.
    pub tick_ms: u64,
    /// Max envelopes drained per tick.
    pub drain_per_tick: usize,
    /// Delivery retries before an envelope is dropped as delivery-failed.
    pub retry_attempts: u32,
    /// Envelopes older than this are dropped without a send attempt.
    pub message_timeout_ms: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            queue_cap: 10_000,
            tick_ms: 100,
            drain_per_tick: 500,
            retry_attempts: 3,
            message_timeout_ms: 30_000,
        }
    }
}

/// Per-agent command queue tunables (`[queue]`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Max pending commands per agent; enqueue beyond this is rejected.
    pub max_queue_size: usize,
    /// Default attempt budget when the command carries no max_retries constraint.
    pub max_attempts: u32,
    /// Completed jobs retained for metrics and audit.
    pub keep_completed: usize,
    /// Failed jobs retained for metrics and audit.
    pub keep_failed: usize,
    /// Grace period for executing jobs during shutdown, in seconds.
    pub shutdown_grace_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 100,
            max_attempts: 3,
            keep_completed: 50,
            keep_failed: 25,
            shutdown_grace_secs: 30,
        }
    }
}

/// Ingress rate limiting (`[rate_limit]`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Per-connection messages per minute.
    pub messages_per_minute: u64,
    /// Per-connection messages per hour.
    pub messages_per_hour: u64,
    /// Burst: max messages within `burst_window_ms`.
    pub burst_size: u64,
    pub burst_window_ms: u64,
    /// Aggregate ceiling across all connections, per minute (0 = unlimited).
    pub global_per_minute: u64,
    /// Penalty window applied after a violation, in seconds.
    pub penalty_secs: u64,
    /// Violations within `violation_window_secs` that trigger a policy close.
    pub max_violations: u32,
    pub violation_window_secs: u64,
    /// Per-message-type per-minute overrides, e.g. `"terminal:output" = 1200`.
    pub per_type_per_minute: std::collections::HashMap<String, u64>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        let mut per_type = std::collections::HashMap::new();
        // Terminal output is the high-volume stream; command submission is
        // human-paced and capped low.
        per_type.insert("terminal:output".to_string(), 1200);
        per_type.insert("trace:event".to_string(), 1200);
        per_type.insert("command:request".to_string(), 30);
        Self {
            messages_per_minute: 300,
            messages_per_hour: 10_000,
            burst_size: 50,
            burst_window_ms: 1_000,
            global_per_minute: 0,
            penalty_secs: 10,
            max_violations: 5,
            violation_window_secs: 300,
            per_type_per_minute: per_type,
        }
    }
}

/// Outbound batching (`[batch]`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Message count that forces an immediate flush.
    pub max_batch_size: usize,
    /// Serialized byte size that forces an immediate flush.
    pub max_batch_bytes: usize,
    /// Timer flush interval for partial batches, in milliseconds.
    pub batch_interval_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 25,
            max_batch_bytes: 64 * 1024,
            batch_interval_ms: 100,
        }
    }
}

/// In-band token refresh (`[refresh]`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
    /// How often each session's token expiry is checked, in seconds.
    pub refresh_interval_secs: u64,
    /// Remaining validity below which a refresh is requested, in seconds.
    pub refresh_threshold_secs: u64,
    /// How long to wait for the client's refresh response, in seconds.
    pub response_timeout_secs: u64,
    /// Failed attempts before the session is closed with TokenExpired.
    pub max_refresh_attempts: u32,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: 60,
            refresh_threshold_secs: 300,
            response_timeout_secs: 30,
            max_refresh_attempts: 3,
        }
    }
}

/// Trace collector thresholds (`[trace]`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TraceConfig {
    /// Max parent-chain depth accepted on ingest.
    pub max_trace_depth: usize,
    /// In-memory events kept per command; oldest dropped beyond this.
    pub max_traces_per_command: usize,
    /// A command with no new events for this long is completion-checked.
    pub idle_complete_secs: u64,
    pub slow_trace_ms: u64,
    pub very_slow_trace_ms: u64,
    /// Token count above which a node is flagged high-token.
    pub high_token_usage: u64,
    /// Max nodes in a flamegraph/timeline export.
    pub max_export_size: usize,
    pub max_export_depth: usize,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            max_trace_depth: 10,
            max_traces_per_command: 1_000,
            idle_complete_secs: 30,
            slow_trace_ms: 5_000,
            very_slow_trace_ms: 15_000,
            high_token_usage: 10_000,
            max_export_size: 5_000,
            max_export_depth: 20,
        }
    }
}

// ─── FleetConfig ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct FleetConfig {
    pub port: u16,
    pub data_dir: PathBuf,
    pub log: String,
    /// Server heartbeat interval; silence for 2× marks a connection
    /// unhealthy, 3× closes it.
    pub heartbeat_secs: u64,
    /// Explicit JWT secret. None means use (or create) `{data_dir}/jwt_secret`.
    pub jwt_secret: Option<String>,
    pub retention_days: u32,
    pub router: RouterConfig,
    pub queue: QueueConfig,
    pub rate_limit: RateLimitConfig,
    pub batch: BatchConfig,
    pub refresh: RefreshConfig,
    pub trace: TraceConfig,
}

impl FleetConfig {
    /// Resolve the effective configuration.
    ///
    /// `port`, `data_dir` and `log` come from CLI flags (clap reads the
    /// `FLEETD_*` env vars itself); everything else is TOML-or-default.
    pub fn resolve(port: Option<u16>, data_dir: Option<PathBuf>, log: Option<String>) -> Self {
        let data_dir = data_dir.unwrap_or_else(default_data_dir);
        let toml = load_toml(&data_dir).unwrap_or_default();

        let jwt_secret = std::env::var("FLEETD_JWT_SECRET")
            .ok()
            .filter(|s| !s.is_empty())
            .or(toml.jwt_secret);

        Self {
            port: port.or(toml.port).unwrap_or(DEFAULT_PORT),
            log: log.or(toml.log).unwrap_or_else(|| "info".to_string()),
            heartbeat_secs: toml.heartbeat_secs.unwrap_or(DEFAULT_HEARTBEAT_SECS),
            jwt_secret,
            retention_days: toml.retention_days.unwrap_or(DEFAULT_RETENTION_DAYS),
            router: toml.router.unwrap_or_default(),
            queue: toml.queue.unwrap_or_default(),
            rate_limit: toml.rate_limit.unwrap_or_default(),
            batch: toml.batch.unwrap_or_default(),
            refresh: toml.refresh.unwrap_or_default(),
            trace: toml.trace.unwrap_or_default(),
            data_dir,
        }
    }
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            data_dir: default_data_dir(),
            log: "info".to_string(),
            heartbeat_secs: DEFAULT_HEARTBEAT_SECS,
            jwt_secret: None,
            retention_days: DEFAULT_RETENTION_DAYS,
            router: RouterConfig::default(),
            queue: QueueConfig::default(),
            rate_limit: RateLimitConfig::default(),
            batch: BatchConfig::default(),
            refresh: RefreshConfig::default(),
            trace: TraceConfig::default(),
        }
    }
}

/// `~/.fleetd` unless overridden.
fn default_data_dir() -> PathBuf {
    if let Some(home) = std::env::var_os("HOME") {
        return PathBuf::from(home).join(".fleetd");
    }
    PathBuf::from(".fleetd")
}
