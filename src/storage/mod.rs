//! SQLite persistence for agents, commands, terminal output, traces and the
//! audit log.
//!
//! WAL mode, schema applied idempotently at startup from
//! `migrations/*.sql`. The router never touches storage on its hot path;
//! writers are the orchestrator (command lifecycle, audit) and the trace
//! collector (trace ingest).

use anyhow::{Context as _, Result};
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteConnectOptions, Row, SqlitePool};
use std::{path::Path, str::FromStr};
use uuid::Uuid;

use crate::protocol::{CommandState, StreamKind, TraceEventPayload, TraceKind};

/// Default timeout for individual SQLite queries.
/// Prevents hung queries from blocking the control plane indefinitely.
const QUERY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Execute a future with the standard query timeout.
async fn with_timeout<T>(fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(QUERY_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!(
            "database query timed out after {}s",
            QUERY_TIMEOUT.as_secs()
        )),
    }
}

// ─── Rows ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AgentRow {
    pub id: String,
    pub user_id: String,
    pub name: String,
    #[sqlx(rename = "type")]
    pub agent_type: String,
    pub status: String,
    pub last_ping: Option<String>,
    pub metadata: Option<String>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CommandRow {
    pub id: String,
    pub user_id: String,
    pub agent_id: String,
    pub content: String,
    #[sqlx(rename = "type")]
    pub command_type: Option<String>,
    pub priority: i64,
    pub status: String,
    pub queue_position: Option<i64>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub failure_reason: Option<String>,
    pub metadata: Option<String>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TraceRow {
    pub id: String,
    pub command_id: String,
    pub agent_id: String,
    pub parent_id: Option<String>,
    #[sqlx(rename = "type")]
    pub trace_type: String,
    pub name: String,
    pub content: Option<String>,
    /// Milliseconds since the Unix epoch.
    pub started_at: i64,
    pub completed_at: Option<i64>,
    pub duration_ms: Option<i64>,
    pub tokens_used: Option<i64>,
}

impl TraceRow {
    /// Rebuild the wire payload shape from a stored row.
    pub fn to_payload(&self) -> TraceEventPayload {
        let kind = match self.trace_type.as_str() {
            "llm_prompt" => TraceKind::LlmPrompt,
            "tool_call" => TraceKind::ToolCall,
            _ => TraceKind::Response,
        };
        TraceEventPayload {
            trace_id: self.id.clone(),
            command_id: self.command_id.clone(),
            agent_id: Some(self.agent_id.clone()),
            parent_id: self.parent_id.clone(),
            kind,
            name: self.name.clone(),
            content: self
                .content
                .as_deref()
                .and_then(|c| serde_json::from_str(c).ok())
                .unwrap_or_default(),
            started_at: self.started_at,
            completed_at: self.completed_at,
            duration_ms: self.duration_ms.map(|d| d as u64),
            tokens_used: self.tokens_used.map(|t| t as u64),
        }
    }
}

// ─── Storage ─────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    pub async fn new(data_dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(data_dir).await?;
        let db_path = data_dir.join("fleetd.db");
        let opts =
            SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", db_path.display()))?
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                .create_if_missing(true);

        let pool = SqlitePool::connect_with(opts).await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    async fn migrate(pool: &SqlitePool) -> Result<()> {
        for sql in [include_str!("migrations/001_init.sql")] {
            for stmt in sql.split(';') {
                let stmt = stmt.trim();
                if !stmt.is_empty() {
                    sqlx::query(stmt).execute(pool).await?;
                }
            }
        }
        Ok(())
    }

    // ─── Agents ─────────────────────────────────────────────────────────────

    pub async fn upsert_agent(
        &self,
        agent_id: &str,
        user_id: &str,
        agent_type: &str,
        status: &str,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        with_timeout(async {
            sqlx::query(
                r#"
                INSERT INTO agents (id, user_id, name, type, status, last_ping)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT (id) DO UPDATE SET
                    user_id   = excluded.user_id,
                    type      = excluded.type,
                    status    = excluded.status,
                    last_ping = excluded.last_ping
                "#,
            )
            .bind(agent_id)
            .bind(user_id)
            .bind(agent_id)
            .bind(agent_type)
            .bind(status)
            .bind(&now)
            .execute(&self.pool)
            .await
            .context("upsert agent")?;
            Ok(())
        })
        .await
    }

    pub async fn set_agent_status(&self, agent_id: &str, status: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        with_timeout(async {
            sqlx::query("UPDATE agents SET status = ?, last_ping = ? WHERE id = ?")
                .bind(status)
                .bind(&now)
                .bind(agent_id)
                .execute(&self.pool)
                .await
                .context("set agent status")?;
            Ok(())
        })
        .await
    }

    pub async fn get_agent(&self, agent_id: &str) -> Result<Option<AgentRow>> {
        with_timeout(async {
            let row = sqlx::query_as::<_, AgentRow>("SELECT * FROM agents WHERE id = ?")
                .bind(agent_id)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row)
        })
        .await
    }

    // ─── Commands ───────────────────────────────────────────────────────────

    /// Insert a new command row. A row with the same id already present is
    /// left untouched (idempotent resubmission); returns `false` in that case.
    pub async fn insert_command(
        &self,
        command_id: &str,
        user_id: &str,
        agent_id: &str,
        content: &str,
        command_type: Option<&str>,
        priority: u8,
    ) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        with_timeout(async {
            let result = sqlx::query(
                r#"
                INSERT INTO commands (id, user_id, agent_id, content, type, priority, status, created_at)
                VALUES (?, ?, ?, ?, ?, ?, 'pending', ?)
                ON CONFLICT (id) DO NOTHING
                "#,
            )
            .bind(command_id)
            .bind(user_id)
            .bind(agent_id)
            .bind(content)
            .bind(command_type)
            .bind(priority as i64)
            .bind(&now)
            .execute(&self.pool)
            .await
            .context("insert command")?;
            Ok(result.rows_affected() > 0)
        })
        .await
    }

    /// Persist a status transition. Sets `started_at` on Executing and
    /// `completed_at` on terminal states; terminal rows are never rewritten.
    pub async fn update_command_status(
        &self,
        command_id: &str,
        status: CommandState,
        queue_position: Option<u32>,
        failure_reason: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let started_at = matches!(status, CommandState::Executing).then(|| now.clone());
        let completed_at = status.is_terminal().then(|| now.clone());
        with_timeout(async {
            sqlx::query(
                r#"
                UPDATE commands SET
                    status          = ?,
                    queue_position  = ?,
                    started_at      = COALESCE(?, started_at),
                    completed_at    = COALESCE(?, completed_at),
                    failure_reason  = COALESCE(?, failure_reason)
                WHERE id = ? AND status NOT IN ('completed', 'failed', 'cancelled')
                "#,
            )
            .bind(status.as_str())
            .bind(queue_position.map(|p| p as i64))
            .bind(started_at)
            .bind(completed_at)
            .bind(failure_reason)
            .bind(command_id)
            .execute(&self.pool)
            .await
            .context("update command status")?;
            Ok(())
        })
        .await
    }

    pub async fn get_command(&self, command_id: &str) -> Result<Option<CommandRow>> {
        with_timeout(async {
            let row = sqlx::query_as::<_, CommandRow>("SELECT * FROM commands WHERE id = ?")
                .bind(command_id)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row)
        })
        .await
    }

    // ─── Terminal output ────────────────────────────────────────────────────

    pub async fn insert_terminal_output(
        &self,
        command_id: &str,
        agent_id: &str,
        stream: StreamKind,
        content: &str,
    ) -> Result<()> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        let stream = match stream {
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        };
        with_timeout(async {
            sqlx::query(
                r#"
                INSERT INTO terminal_outputs (id, command_id, agent_id, type, content, timestamp)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&id)
            .bind(command_id)
            .bind(agent_id)
            .bind(stream)
            .bind(content)
            .bind(&now)
            .execute(&self.pool)
            .await
            .context("insert terminal output")?;
            Ok(())
        })
        .await
    }

    /// Keep only the newest `keep` rows for one command.
    pub async fn prune_terminal_outputs(&self, command_id: &str, keep: u32) -> Result<u64> {
        with_timeout(async {
            let result = sqlx::query(
                r#"
                DELETE FROM terminal_outputs
                WHERE command_id = ? AND id NOT IN (
                    SELECT id FROM terminal_outputs
                    WHERE command_id = ?
                    ORDER BY timestamp DESC
                    LIMIT ?
                )
                "#,
            )
            .bind(command_id)
            .bind(command_id)
            .bind(keep as i64)
            .execute(&self.pool)
            .await
            .context("prune terminal outputs")?;
            Ok(result.rows_affected())
        })
        .await
    }

    // ─── Traces ─────────────────────────────────────────────────────────────

    pub async fn insert_trace(&self, event: &TraceEventPayload, agent_id: &str) -> Result<()> {
        let content = serde_json::to_string(&event.content).unwrap_or_default();
        with_timeout(async {
            sqlx::query(
                r#"
                INSERT INTO trace_entries
                    (id, command_id, agent_id, parent_id, type, name, content,
                     started_at, completed_at, duration_ms, tokens_used)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (id) DO UPDATE SET
                    completed_at = excluded.completed_at,
                    duration_ms  = excluded.duration_ms,
                    tokens_used  = excluded.tokens_used
                "#,
            )
            .bind(&event.trace_id)
            .bind(&event.command_id)
            .bind(agent_id)
            .bind(&event.parent_id)
            .bind(event.kind.as_str())
            .bind(&event.name)
            .bind(&content)
            .bind(event.started_at)
            .bind(event.completed_at)
            .bind(event.duration_ms.map(|d| d as i64))
            .bind(event.tokens_used.map(|t| t as i64))
            .execute(&self.pool)
            .await
            .context("insert trace entry")?;
            Ok(())
        })
        .await
    }

    pub async fn get_trace(&self, trace_id: &str) -> Result<Option<TraceRow>> {
        with_timeout(async {
            let row = sqlx::query_as::<_, TraceRow>("SELECT * FROM trace_entries WHERE id = ?")
                .bind(trace_id)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row)
        })
        .await
    }

    pub async fn traces_for_command(&self, command_id: &str) -> Result<Vec<TraceRow>> {
        with_timeout(async {
            let rows = sqlx::query_as::<_, TraceRow>(
                "SELECT * FROM trace_entries WHERE command_id = ? ORDER BY started_at ASC",
            )
            .bind(command_id)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        })
        .await
    }

    /// Delete trace entries started before `cutoff`. Returns the count.
    pub async fn delete_traces_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        with_timeout(async {
            let result = sqlx::query("DELETE FROM trace_entries WHERE started_at < ?")
                .bind(cutoff.timestamp_millis())
                .execute(&self.pool)
                .await
                .context("delete old traces")?;
            Ok(result.rows_affected())
        })
        .await
    }

    pub async fn delete_outputs_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        with_timeout(async {
            let result = sqlx::query("DELETE FROM terminal_outputs WHERE timestamp < ?")
                .bind(cutoff.to_rfc3339())
                .execute(&self.pool)
                .await
                .context("delete old terminal outputs")?;
            Ok(result.rows_affected())
        })
        .await
    }

    // ─── Audit log ──────────────────────────────────────────────────────────

    pub async fn insert_audit(
        &self,
        user_id: Option<&str>,
        event_type: &str,
        event_data: &serde_json::Value,
    ) -> Result<()> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        let data = serde_json::to_string(event_data).unwrap_or_else(|_| "{}".to_string());
        with_timeout(async {
            sqlx::query(
                r#"
                INSERT INTO audit_logs (id, user_id, event_type, event_data, created_at)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(&id)
            .bind(user_id)
            .bind(event_type)
            .bind(&data)
            .bind(&now)
            .execute(&self.pool)
            .await
            .context("insert audit log")?;
            Ok(())
        })
        .await
    }

    pub async fn audit_count(&self, event_type: &str) -> Result<i64> {
        with_timeout(async {
            let row = sqlx::query("SELECT COUNT(*) AS n FROM audit_logs WHERE event_type = ?")
                .bind(event_type)
                .fetch_one(&self.pool)
                .await?;
            Ok(row.get::<i64, _>("n"))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn test_storage() -> (Storage, TempDir) {
        let dir = TempDir::new().expect("tempdir");
        let storage = Storage::new(dir.path()).await.expect("storage");
        (storage, dir)
    }

    fn trace_event(id: &str, command: &str, parent: Option<&str>) -> TraceEventPayload {
        TraceEventPayload {
            trace_id: id.to_string(),
            command_id: command.to_string(),
            agent_id: Some("A1".to_string()),
            parent_id: parent.map(str::to_string),
            kind: TraceKind::ToolCall,
            name: "bash".to_string(),
            content: serde_json::json!({"cmd": "ls"}),
            started_at: Utc::now().timestamp_millis(),
            completed_at: None,
            duration_ms: None,
            tokens_used: None,
        }
    }

    #[tokio::test]
    async fn agent_upsert_and_status() {
        let (storage, _dir) = test_storage().await;
        storage
            .upsert_agent("A1", "u-1", "claude", "online")
            .await
            .expect("upsert");
        storage
            .upsert_agent("A1", "u-1", "claude", "online")
            .await
            .expect("second upsert is an update");
        storage
            .set_agent_status("A1", "offline")
            .await
            .expect("status");

        let row = storage.get_agent("A1").await.expect("get").expect("row");
        assert_eq!(row.agent_type, "claude");
        assert_eq!(row.status, "offline");
        assert!(row.last_ping.is_some());
    }

    #[tokio::test]
    async fn command_insert_is_idempotent() {
        let (storage, _dir) = test_storage().await;
        let created = storage
            .insert_command("c-1", "u-1", "A1", "echo hi", None, 50)
            .await
            .expect("insert");
        assert!(created);
        let again = storage
            .insert_command("c-1", "u-1", "A1", "echo hi", None, 90)
            .await
            .expect("insert");
        assert!(!again, "duplicate id does not create a second command");

        let row = storage.get_command("c-1").await.expect("get").expect("row");
        assert_eq!(row.priority, 50, "original row untouched");
    }

    #[tokio::test]
    async fn terminal_state_is_immutable() {
        let (storage, _dir) = test_storage().await;
        storage
            .insert_command("c-1", "u-1", "A1", "echo hi", None, 50)
            .await
            .expect("insert");
        storage
            .update_command_status("c-1", CommandState::Queued, Some(1), None)
            .await
            .expect("queued");
        storage
            .update_command_status("c-1", CommandState::Executing, None, None)
            .await
            .expect("executing");
        storage
            .update_command_status("c-1", CommandState::Completed, None, None)
            .await
            .expect("completed");
        // A late cancel must not rewrite the terminal row.
        storage
            .update_command_status("c-1", CommandState::Cancelled, None, Some("late"))
            .await
            .expect("late update");

        let row = storage.get_command("c-1").await.expect("get").expect("row");
        assert_eq!(row.status, "completed");
        assert!(row.started_at.is_some());
        assert!(row.completed_at.is_some());
        assert!(row.failure_reason.is_none());
    }

    #[tokio::test]
    async fn trace_upsert_sets_completion() {
        let (storage, _dir) = test_storage().await;
        let mut event = trace_event("t-1", "c-1", None);
        storage.insert_trace(&event, "A1").await.expect("insert");

        event.completed_at = Some(event.started_at + 120);
        event.duration_ms = Some(120);
        storage.insert_trace(&event, "A1").await.expect("upsert");

        let row = storage
            .get_trace("t-1")
            .await
            .expect("get")
            .expect("trace row");
        assert_eq!(row.duration_ms, Some(120));
        assert!(row.completed_at.is_some());

        let all = storage.traces_for_command("c-1").await.expect("list");
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn trace_cleanup_deletes_and_counts() {
        let (storage, _dir) = test_storage().await;
        let mut old = trace_event("t-old", "c-1", None);
        old.started_at = (Utc::now() - chrono::Duration::days(60)).timestamp_millis();
        storage.insert_trace(&old, "A1").await.expect("insert old");
        storage
            .insert_trace(&trace_event("t-new", "c-1", None), "A1")
            .await
            .expect("insert new");

        let deleted = storage
            .delete_traces_older_than(Utc::now() - chrono::Duration::days(30))
            .await
            .expect("cleanup");
        assert_eq!(deleted, 1);
        assert!(storage.get_trace("t-old").await.expect("get").is_none());
        assert!(storage.get_trace("t-new").await.expect("get").is_some());
    }

    #[tokio::test]
    async fn terminal_outputs_prune_keeps_newest() {
        let (storage, _dir) = test_storage().await;
        for i in 0..5 {
            storage
                .insert_terminal_output("c-1", "A1", StreamKind::Stdout, &format!("line {i}"))
                .await
                .expect("insert");
        }
        let removed = storage
            .prune_terminal_outputs("c-1", 2)
            .await
            .expect("prune");
        assert_eq!(removed, 3);
    }

    #[tokio::test]
    async fn audit_log_round_trip() {
        let (storage, _dir) = test_storage().await;
        storage
            .insert_audit(
                Some("u-1"),
                "emergency_stop",
                &serde_json::json!({"agents": 2}),
            )
            .await
            .expect("insert");
        assert_eq!(
            storage.audit_count("emergency_stop").await.expect("count"),
            1
        );
    }
}
