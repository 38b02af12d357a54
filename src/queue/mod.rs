//! Per-agent priority command queues.
//!
//! Each agent owns one [`CommandQueue`]: pending commands ordered by
//! priority (0–100, clamped) with FIFO ties, a single executing slot, a
//! bounded pending set, and terminal-job history for metrics and audit.
//! Queues emit [`QueueEvent`]s on a shared channel whenever the ready set
//! changes; the orchestrator turns those into `queue:update` broadcasts.
//!
//! Interruption: a queued command is removed immediately; an executing one
//! is either force-removed or given a grace period to finish — on timeout it
//! is force-removed with the reason suffixed `"(forced after timeout)"`, and
//! any completion arriving later is ignored.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

use crate::config::QueueConfig;
use crate::protocol::{CommandConstraints, CommandState};

pub const MAX_COMMAND_PRIORITY: u8 = 100;

// ─── Types ───────────────────────────────────────────────────────────────────

/// The immutable description of a submitted command.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub command_id: String,
    pub agent_id: String,
    pub user_id: String,
    pub content: String,
    pub command_type: Option<String>,
    pub constraints: Option<CommandConstraints>,
}

/// A command's life inside one queue.
#[derive(Debug, Clone)]
pub struct Job {
    pub spec: CommandSpec,
    pub priority: u8,
    pub state: CommandState,
    pub attempt_count: u32,
    pub max_attempts: u32,
    /// Set by a graceful interrupt while the job is executing.
    pub interrupt_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Jobs are ready once `scheduled_at` has passed (enqueue delay, retry backoff).
    pub scheduled_at: DateTime<Utc>,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
}

impl Job {
    fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_at <= now
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue full ({0} pending)")]
    Full(usize),
    #[error("command is not active")]
    NotActive,
}

/// Result of an enqueue: `Merged` means the command id was already present
/// and no new job was created (idempotent resubmission).
#[derive(Debug, Clone)]
pub enum EnqueueOutcome {
    Created(Job),
    Merged(Job),
}

impl EnqueueOutcome {
    pub fn job(&self) -> &Job {
        match self {
            EnqueueOutcome::Created(job) | EnqueueOutcome::Merged(job) => job,
        }
    }

    pub fn is_merged(&self) -> bool {
        matches!(self, EnqueueOutcome::Merged(_))
    }
}

/// Outcome of an agent-reported completion.
#[derive(Debug, Clone)]
pub enum CompletionOutcome {
    Completed(Job),
    /// Failed with attempts left; re-enqueued after backoff.
    Retrying(Job),
    Failed(Job),
    /// No executing job with that id (late completion after a forced
    /// interrupt, or a stray ack) — dropped.
    Ignored,
}

#[derive(Debug, Clone)]
pub struct QueuedSummary {
    pub command_id: String,
    pub priority: u8,
    pub position: u32,
}

/// Snapshot broadcast to dashboards as `queue:update`.
#[derive(Debug, Clone)]
pub struct QueueSnapshot {
    pub agent_id: String,
    pub queue_size: usize,
    pub executing: Option<String>,
    pub queued: Vec<QueuedSummary>,
}

#[derive(Debug, Clone)]
pub enum QueueEvent {
    /// The ready set changed (enqueue, remove, dispatch, retry).
    PositionsChanged(QueueSnapshot),
    /// An enqueue was rejected.
    Full {
        agent_id: String,
        command_id: String,
        max_queue_size: usize,
    },
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct QueueMetrics {
    pub queued: usize,
    pub executing: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub avg_wait_ms: u64,
    pub avg_processing_ms: u64,
    /// Completions per hour over the last 100 completions.
    pub throughput_per_hour: f64,
}

/// Retry delay after a failed attempt: `min(2^(attempt-1) s, 30 s)`.
fn retry_backoff(attempt: u32) -> Duration {
    let secs = 1u64 << (attempt.saturating_sub(1)).min(5);
    Duration::from_secs(secs.min(30))
}

// ─── Queue internals ─────────────────────────────────────────────────────────

#[derive(Default)]
struct Inner {
    queued: Vec<Job>,
    executing: Option<Job>,
    completed: VecDeque<Job>,
    /// Failed and cancelled terminal jobs.
    failed: VecDeque<Job>,
    /// Timestamps of the last 100 completions, for throughput.
    completion_times: VecDeque<DateTime<Utc>>,
    wait_ms_sum: u64,
    wait_count: u64,
    processing_ms_sum: u64,
    processing_count: u64,
}

impl Inner {
    /// Ready jobs in dispatch order: priority descending, then created_at.
    fn ready_order(&self, now: DateTime<Utc>) -> Vec<&Job> {
        let mut ready: Vec<&Job> = self.queued.iter().filter(|j| j.is_ready(now)).collect();
        ready.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
        });
        ready
    }

    fn find_queued(&self, command_id: &str) -> Option<usize> {
        self.queued
            .iter()
            .position(|j| j.spec.command_id == command_id)
    }

    fn record_completion(&mut self, job: &Job) {
        let now = job.completed_at.unwrap_or_else(Utc::now);
        if let Some(started) = job.started_at {
            let wait = (started - job.queued_at).num_milliseconds().max(0) as u64;
            let processing = (now - started).num_milliseconds().max(0) as u64;
            self.wait_ms_sum += wait;
            self.wait_count += 1;
            self.processing_ms_sum += processing;
            self.processing_count += 1;
        }
        self.completion_times.push_back(now);
        while self.completion_times.len() > 100 {
            self.completion_times.pop_front();
        }
    }
}

// ─── CommandQueue ────────────────────────────────────────────────────────────

pub struct CommandQueue {
    pub agent_id: String,
    config: QueueConfig,
    inner: Mutex<Inner>,
    /// Notified whenever the executing slot empties.
    completion: Notify,
    events: mpsc::UnboundedSender<QueueEvent>,
    paused: AtomicBool,
}

impl CommandQueue {
    pub fn new(
        agent_id: String,
        config: QueueConfig,
        events: mpsc::UnboundedSender<QueueEvent>,
    ) -> Self {
        Self {
            agent_id,
            config,
            inner: Mutex::new(Inner::default()),
            completion: Notify::new(),
            events,
            paused: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit_positions(&self, inner: &Inner) {
        let _ = self
            .events
            .send(QueueEvent::PositionsChanged(self.snapshot_of(inner)));
    }

    fn snapshot_of(&self, inner: &Inner) -> QueueSnapshot {
        let now = Utc::now();
        let queued = inner
            .ready_order(now)
            .iter()
            .enumerate()
            .map(|(i, job)| QueuedSummary {
                command_id: job.spec.command_id.clone(),
                priority: job.priority,
                position: (i + 1) as u32,
            })
            .collect();
        QueueSnapshot {
            agent_id: self.agent_id.clone(),
            queue_size: inner.queued.len(),
            executing: inner
                .executing
                .as_ref()
                .map(|j| j.spec.command_id.clone()),
            queued,
        }
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let inner = self.lock();
        self.snapshot_of(&inner)
    }

    // ── Enqueue / remove ────────────────────────────────────────────────────

    /// Add a command. Priority is clamped to [0, 100]; `delay` pushes
    /// `scheduled_at` into the future. Resubmission of a live command id is
    /// merged, not duplicated.
    pub fn enqueue(
        &self,
        spec: CommandSpec,
        priority: u8,
        delay: Option<Duration>,
    ) -> Result<EnqueueOutcome, QueueError> {
        let mut inner = self.lock();

        if let Some(idx) = inner.find_queued(&spec.command_id) {
            return Ok(EnqueueOutcome::Merged(inner.queued[idx].clone()));
        }
        if let Some(executing) = &inner.executing {
            if executing.spec.command_id == spec.command_id {
                return Ok(EnqueueOutcome::Merged(executing.clone()));
            }
        }

        if inner.queued.len() >= self.config.max_queue_size {
            let _ = self.events.send(QueueEvent::Full {
                agent_id: self.agent_id.clone(),
                command_id: spec.command_id.clone(),
                max_queue_size: self.config.max_queue_size,
            });
            warn!(
                agent = %self.agent_id,
                command = %spec.command_id,
                "queue full — rejecting enqueue"
            );
            return Err(QueueError::Full(inner.queued.len()));
        }

        let now = Utc::now();
        let max_attempts = spec
            .constraints
            .as_ref()
            .and_then(|c| c.max_retries)
            .map(|r| r + 1)
            .unwrap_or(self.config.max_attempts);
        let job = Job {
            spec,
            priority: priority.min(MAX_COMMAND_PRIORITY),
            state: CommandState::Queued,
            attempt_count: 0,
            max_attempts,
            interrupt_reason: None,
            created_at: now,
            scheduled_at: now
                + chrono::Duration::from_std(delay.unwrap_or(Duration::ZERO))
                    .unwrap_or_else(|_| chrono::Duration::zero()),
            queued_at: now,
            started_at: None,
            completed_at: None,
            failure_reason: None,
        };
        inner.queued.push(job.clone());
        self.emit_positions(&inner);
        Ok(EnqueueOutcome::Created(job))
    }

    /// 1-based position among ready commands, or `None` if the command is
    /// not waiting (executing, delayed or unknown).
    pub fn position(&self, command_id: &str) -> Option<u32> {
        let inner = self.lock();
        let now = Utc::now();
        inner
            .ready_order(now)
            .iter()
            .position(|j| j.spec.command_id == command_id)
            .map(|i| (i + 1) as u32)
    }

    /// Remove a queued command. Positions of the remaining siblings are
    /// recomputed and re-emitted.
    pub fn remove(&self, command_id: &str) -> bool {
        let mut inner = self.lock();
        match inner.find_queued(command_id) {
            Some(idx) => {
                inner.queued.remove(idx);
                self.emit_positions(&inner);
                true
            }
            None => false,
        }
    }

    // ── Dispatch ────────────────────────────────────────────────────────────

    /// Pull the highest-priority ready command into the executing slot.
    ///
    /// Returns `None` while paused, while a command is already executing, or
    /// when nothing is ready — one executing command per agent, always.
    pub fn take_next_ready(&self) -> Option<Job> {
        if self.paused.load(Ordering::Relaxed) {
            return None;
        }
        let mut inner = self.lock();
        if inner.executing.is_some() {
            return None;
        }
        let now = Utc::now();
        let next_id = inner
            .ready_order(now)
            .first()
            .map(|j| j.spec.command_id.clone())?;
        let idx = inner.find_queued(&next_id)?;
        let mut job = inner.queued.remove(idx);
        job.state = CommandState::Executing;
        job.started_at = Some(now);
        inner.executing = Some(job.clone());
        self.emit_positions(&inner);
        Some(job)
    }

    pub fn executing_command(&self) -> Option<Job> {
        self.lock().executing.clone()
    }

    // ── Completion ──────────────────────────────────────────────────────────

    /// Apply an agent-reported completion to the executing job.
    pub fn complete_executing(
        &self,
        command_id: &str,
        success: bool,
        failure_reason: Option<String>,
    ) -> CompletionOutcome {
        let mut inner = self.lock();
        let matches = inner
            .executing
            .as_ref()
            .is_some_and(|j| j.spec.command_id == command_id);
        if !matches {
            debug!(
                agent = %self.agent_id,
                command = %command_id,
                "completion for non-executing command ignored"
            );
            return CompletionOutcome::Ignored;
        }
        let mut job = inner.executing.take().expect("checked above");
        let now = Utc::now();

        if success {
            job.state = CommandState::Completed;
            job.completed_at = Some(now);
            inner.record_completion(&job);
            inner.completed.push_back(job.clone());
            while inner.completed.len() > self.config.keep_completed {
                inner.completed.pop_front();
            }
            self.completion.notify_waiters();
            self.emit_positions(&inner);
            return CompletionOutcome::Completed(job);
        }

        job.attempt_count += 1;
        if job.attempt_count < job.max_attempts {
            // Re-enqueue with backoff; the retry keeps its priority and
            // original created_at so it does not jump younger siblings.
            let backoff = retry_backoff(job.attempt_count);
            job.state = CommandState::Queued;
            job.started_at = None;
            job.scheduled_at = now
                + chrono::Duration::from_std(backoff).unwrap_or_else(|_| chrono::Duration::zero());
            job.failure_reason = failure_reason;
            inner.queued.push(job.clone());
            self.completion.notify_waiters();
            self.emit_positions(&inner);
            info!(
                agent = %self.agent_id,
                command = %job.spec.command_id,
                attempt = job.attempt_count,
                backoff_ms = backoff.as_millis() as u64,
                "command failed — re-enqueued with backoff"
            );
            return CompletionOutcome::Retrying(job);
        }

        job.state = CommandState::Failed;
        job.completed_at = Some(now);
        job.failure_reason =
            failure_reason.or_else(|| Some("max attempts exhausted".to_string()));
        inner.failed.push_back(job.clone());
        while inner.failed.len() > self.config.keep_failed {
            inner.failed.pop_front();
        }
        self.completion.notify_waiters();
        self.emit_positions(&inner);
        CompletionOutcome::Failed(job)
    }

    // ── Interruption ────────────────────────────────────────────────────────

    /// Cancel a command.
    ///
    /// Queued: removed immediately. Executing without `force`: an interrupt
    /// marker is set and the call waits up to `timeout` for the agent's
    /// completion; if none arrives the job is force-removed with the reason
    /// suffixed `"(forced after timeout)"`. Executing with `force`: removed
    /// with no grace period. Anything else is `NotActive`.
    pub async fn interrupt(
        &self,
        command_id: &str,
        reason: &str,
        force: bool,
        timeout: Duration,
    ) -> Result<Job, QueueError> {
        {
            let mut inner = self.lock();

            if let Some(idx) = inner.find_queued(command_id) {
                let mut job = inner.queued.remove(idx);
                job.state = CommandState::Cancelled;
                job.completed_at = Some(Utc::now());
                job.failure_reason = Some(reason.to_string());
                inner.failed.push_back(job.clone());
                while inner.failed.len() > self.config.keep_failed {
                    inner.failed.pop_front();
                }
                self.emit_positions(&inner);
                return Ok(job);
            }

            let is_executing = inner
                .executing
                .as_ref()
                .is_some_and(|j| j.spec.command_id == command_id);
            if !is_executing {
                return Err(QueueError::NotActive);
            }

            if force {
                return Ok(self.force_remove_executing(&mut inner, reason.to_string()));
            }

            // Graceful: mark and fall through to wait without the lock held.
            if let Some(job) = inner.executing.as_mut() {
                job.interrupt_reason = Some(reason.to_string());
            }
        }

        // Wait for the agent to finish on its own.
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.completion.notified();
            {
                let mut inner = self.lock();
                let still_executing = inner
                    .executing
                    .as_ref()
                    .is_some_and(|j| j.spec.command_id == command_id);
                if !still_executing {
                    return self.settle_after_wait(&mut inner, command_id, reason);
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                let mut inner = self.lock();
                let still_executing = inner
                    .executing
                    .as_ref()
                    .is_some_and(|j| j.spec.command_id == command_id);
                if !still_executing {
                    return self.settle_after_wait(&mut inner, command_id, reason);
                }
                let reason = format!("{reason} (forced after timeout)");
                return Ok(self.force_remove_executing(&mut inner, reason));
            }
        }
    }

    /// Resolve an interrupt after the executing slot emptied during the
    /// grace wait: the job either reached a terminal state (report it) or
    /// failed and re-queued itself (cancel the retry — the interrupt wins).
    fn settle_after_wait(
        &self,
        inner: &mut Inner,
        command_id: &str,
        reason: &str,
    ) -> Result<Job, QueueError> {
        if let Some(idx) = inner.find_queued(command_id) {
            let mut job = inner.queued.remove(idx);
            job.state = CommandState::Cancelled;
            job.completed_at = Some(Utc::now());
            job.failure_reason = Some(reason.to_string());
            inner.failed.push_back(job.clone());
            while inner.failed.len() > self.config.keep_failed {
                inner.failed.pop_front();
            }
            self.emit_positions(inner);
            return Ok(job);
        }
        if let Some(job) = inner
            .completed
            .iter()
            .chain(inner.failed.iter())
            .rev()
            .find(|j| j.spec.command_id == command_id)
        {
            return Ok(job.clone());
        }
        Err(QueueError::NotActive)
    }

    fn force_remove_executing(&self, inner: &mut Inner, reason: String) -> Job {
        let mut job = inner.executing.take().expect("caller verified executing");
        job.state = CommandState::Cancelled;
        job.completed_at = Some(Utc::now());
        job.failure_reason = Some(reason);
        inner.failed.push_back(job.clone());
        while inner.failed.len() > self.config.keep_failed {
            inner.failed.pop_front();
        }
        self.completion.notify_waiters();
        self.emit_positions(inner);
        job
    }

    /// Cancel everything — queued and executing — with no grace period.
    /// Returns the cancelled jobs (emergency stop, shutdown).
    pub fn cancel_all(&self, reason: &str) -> Vec<Job> {
        let mut inner = self.lock();
        let now = Utc::now();
        let mut cancelled = Vec::new();

        for mut job in std::mem::take(&mut inner.queued) {
            job.state = CommandState::Cancelled;
            job.completed_at = Some(now);
            job.failure_reason = Some(reason.to_string());
            inner.failed.push_back(job.clone());
            cancelled.push(job);
        }
        if inner.executing.is_some() {
            cancelled.push(self.force_remove_executing(&mut inner, reason.to_string()));
        } else {
            self.emit_positions(&inner);
        }
        while inner.failed.len() > self.config.keep_failed {
            inner.failed.pop_front();
        }
        cancelled
    }

    // ── Pause / shutdown ────────────────────────────────────────────────────

    pub fn pause(&self) {
        self.paused.store(true, Ordering::Relaxed);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Relaxed);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    /// Graceful shutdown: stop dispatching, give the executing job up to
    /// `grace` to finish, then force-cancel whatever is left.
    pub async fn shutdown(&self, grace: Duration) -> Vec<Job> {
        self.pause();
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let notified = self.completion.notified();
            if self.lock().executing.is_none() {
                break;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                break;
            }
        }
        self.cancel_all("server shutting down")
    }

    // ── Metrics ─────────────────────────────────────────────────────────────

    pub fn metrics(&self) -> QueueMetrics {
        let inner = self.lock();
        let cancelled = inner
            .failed
            .iter()
            .filter(|j| j.state == CommandState::Cancelled)
            .count();
        let throughput = match (
            inner.completion_times.front(),
            inner.completion_times.back(),
        ) {
            (Some(first), Some(last)) if last > first => {
                let span_secs = (*last - *first).num_milliseconds() as f64 / 1_000.0;
                inner.completion_times.len() as f64 / (span_secs / 3_600.0)
            }
            (Some(_), Some(_)) => inner.completion_times.len() as f64,
            _ => 0.0,
        };
        QueueMetrics {
            queued: inner.queued.len(),
            executing: usize::from(inner.executing.is_some()),
            completed: inner.completed.len(),
            failed: inner.failed.len() - cancelled,
            cancelled,
            avg_wait_ms: if inner.wait_count > 0 {
                inner.wait_ms_sum / inner.wait_count
            } else {
                0
            },
            avg_processing_ms: if inner.processing_count > 0 {
                inner.processing_ms_sum / inner.processing_count
            } else {
                0
            },
            throughput_per_hour: throughput,
        }
    }
}

// ─── QueueManager ────────────────────────────────────────────────────────────

/// Owns one [`CommandQueue`] per agent, created on first use. All queues
/// share one event channel whose receiver belongs to the orchestrator.
pub struct QueueManager {
    config: QueueConfig,
    queues: Mutex<HashMap<String, Arc<CommandQueue>>>,
    events: mpsc::UnboundedSender<QueueEvent>,
}

impl QueueManager {
    pub fn new(config: QueueConfig) -> (Self, mpsc::UnboundedReceiver<QueueEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                config,
                queues: Mutex::new(HashMap::new()),
                events: tx,
            },
            rx,
        )
    }

    pub fn queue(&self, agent_id: &str) -> Arc<CommandQueue> {
        let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        queues
            .entry(agent_id.to_string())
            .or_insert_with(|| {
                Arc::new(CommandQueue::new(
                    agent_id.to_string(),
                    self.config.clone(),
                    self.events.clone(),
                ))
            })
            .clone()
    }

    pub fn get(&self, agent_id: &str) -> Option<Arc<CommandQueue>> {
        self.queues
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(agent_id)
            .cloned()
    }

    pub fn all(&self) -> Vec<Arc<CommandQueue>> {
        self.queues
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Locate the queue currently holding `command_id` (queued or executing).
    pub fn find_command(&self, command_id: &str) -> Option<Arc<CommandQueue>> {
        self.all().into_iter().find(|q| {
            let inner = q.lock();
            inner.find_queued(command_id).is_some()
                || inner
                    .executing
                    .as_ref()
                    .is_some_and(|j| j.spec.command_id == command_id)
        })
    }

    /// Graceful shutdown of every queue, concurrently.
    pub async fn shutdown_all(&self, grace: Duration) -> usize {
        let queues = self.all();
        let mut cancelled = 0;
        let handles: Vec<_> = queues
            .into_iter()
            .map(|q| tokio::spawn(async move { q.shutdown(grace).await.len() }))
            .collect();
        for handle in handles {
            cancelled += handle.await.unwrap_or(0);
        }
        cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(id: &str) -> CommandSpec {
        CommandSpec {
            command_id: id.to_string(),
            agent_id: "A1".to_string(),
            user_id: "u-1".to_string(),
            content: format!("echo {id}"),
            command_type: None,
            constraints: None,
        }
    }

    fn test_queue() -> (CommandQueue, mpsc::UnboundedReceiver<QueueEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            CommandQueue::new("A1".to_string(), QueueConfig::default(), tx),
            rx,
        )
    }

    #[tokio::test]
    async fn dispatch_follows_priority_then_fifo() {
        let (queue, _rx) = test_queue();
        queue.enqueue(spec("c-20"), 20, None).expect("enqueue");
        queue.enqueue(spec("c-50"), 50, None).expect("enqueue");
        queue.enqueue(spec("c-90"), 90, None).expect("enqueue");

        let order: Vec<String> = std::iter::from_fn(|| {
            let job = queue.take_next_ready()?;
            queue.complete_executing(&job.spec.command_id, true, None);
            Some(job.spec.command_id)
        })
        .collect();
        assert_eq!(order, vec!["c-90", "c-50", "c-20"]);
    }

    #[tokio::test]
    async fn priority_is_clamped() {
        let (queue, _rx) = test_queue();
        let outcome = queue.enqueue(spec("c-1"), 255, None).expect("enqueue");
        assert_eq!(outcome.job().priority, MAX_COMMAND_PRIORITY);
    }

    #[tokio::test]
    async fn one_executing_command_at_a_time() {
        let (queue, _rx) = test_queue();
        queue.enqueue(spec("c-1"), 50, None).expect("enqueue");
        queue.enqueue(spec("c-2"), 50, None).expect("enqueue");
        let first = queue.take_next_ready().expect("dispatch");
        assert!(queue.take_next_ready().is_none(), "slot is occupied");
        queue.complete_executing(&first.spec.command_id, true, None);
        assert!(queue.take_next_ready().is_some());
    }

    #[tokio::test]
    async fn resubmission_merges_by_command_id() {
        let (queue, _rx) = test_queue();
        let first = queue.enqueue(spec("c-1"), 50, None).expect("enqueue");
        assert!(!first.is_merged());
        let second = queue.enqueue(spec("c-1"), 80, None).expect("enqueue");
        assert!(second.is_merged());
        assert_eq!(second.job().priority, 50, "original job unchanged");
        assert_eq!(queue.snapshot().queue_size, 1);
    }

    #[tokio::test]
    async fn queue_full_rejects_and_emits() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let config = QueueConfig {
            max_queue_size: 2,
            ..QueueConfig::default()
        };
        let queue = CommandQueue::new("A1".to_string(), config, tx);
        queue.enqueue(spec("c-1"), 50, None).expect("enqueue");
        queue.enqueue(spec("c-2"), 50, None).expect("enqueue");
        let err = queue.enqueue(spec("c-3"), 50, None).unwrap_err();
        assert_eq!(err, QueueError::Full(2));

        let mut saw_full = false;
        while let Ok(event) = rx.try_recv() {
            if let QueueEvent::Full { command_id, .. } = event {
                assert_eq!(command_id, "c-3");
                saw_full = true;
            }
        }
        assert!(saw_full, "queue:full event emitted with the rejected id");
    }

    #[tokio::test]
    async fn positions_are_one_based_and_ready_only() {
        let (queue, _rx) = test_queue();
        queue.enqueue(spec("c-low"), 10, None).expect("enqueue");
        queue.enqueue(spec("c-high"), 90, None).expect("enqueue");
        queue
            .enqueue(spec("c-delayed"), 95, Some(Duration::from_secs(60)))
            .expect("enqueue");

        assert_eq!(queue.position("c-high"), Some(1));
        assert_eq!(queue.position("c-low"), Some(2));
        assert_eq!(
            queue.position("c-delayed"),
            None,
            "delayed commands are not in the ready set"
        );
    }

    #[tokio::test]
    async fn remove_recomputes_positions() {
        let (queue, mut rx) = test_queue();
        queue.enqueue(spec("c-1"), 90, None).expect("enqueue");
        queue.enqueue(spec("c-2"), 50, None).expect("enqueue");
        while rx.try_recv().is_ok() {}

        assert!(queue.remove("c-1"));
        assert!(!queue.remove("c-1"), "second remove is a no-op");
        assert_eq!(queue.position("c-2"), Some(1));

        match rx.try_recv().expect("positions event") {
            QueueEvent::PositionsChanged(snapshot) => {
                assert_eq!(snapshot.queued.len(), 1);
                assert_eq!(snapshot.queued[0].command_id, "c-2");
                assert_eq!(snapshot.queued[0].position, 1);
            }
            other => panic!("expected PositionsChanged, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn interrupt_queued_removes_immediately() {
        let (queue, _rx) = test_queue();
        queue.enqueue(spec("c-1"), 50, None).expect("enqueue");
        let job = queue
            .interrupt("c-1", "operator request", false, Duration::from_millis(100))
            .await
            .expect("interrupt");
        assert_eq!(job.state, CommandState::Cancelled);
        assert_eq!(job.failure_reason.as_deref(), Some("operator request"));
    }

    #[tokio::test]
    async fn interrupt_executing_force_skips_grace() {
        let (queue, _rx) = test_queue();
        queue.enqueue(spec("c-1"), 50, None).expect("enqueue");
        queue.take_next_ready().expect("dispatch");
        let job = queue
            .interrupt("c-1", "emergency", true, Duration::from_secs(5))
            .await
            .expect("interrupt");
        assert_eq!(job.state, CommandState::Cancelled);
        assert!(queue.executing_command().is_none());
    }

    #[tokio::test]
    async fn graceful_interrupt_times_out_with_suffix() {
        let (queue, _rx) = test_queue();
        queue.enqueue(spec("c-1"), 50, None).expect("enqueue");
        queue.take_next_ready().expect("dispatch");

        let job = queue
            .interrupt("c-1", "be nice", false, Duration::from_millis(100))
            .await
            .expect("interrupt");
        assert_eq!(job.state, CommandState::Cancelled);
        assert_eq!(
            job.failure_reason.as_deref(),
            Some("be nice (forced after timeout)")
        );

        // A late completion from the agent is ignored.
        let outcome = queue.complete_executing("c-1", true, None);
        assert!(matches!(outcome, CompletionOutcome::Ignored));
    }

    #[tokio::test]
    async fn graceful_interrupt_lets_command_finish() {
        let (queue, _rx) = test_queue();
        queue.enqueue(spec("c-1"), 50, None).expect("enqueue");
        queue.take_next_ready().expect("dispatch");

        let queue = Arc::new(queue);
        let q2 = Arc::clone(&queue);
        let waiter = tokio::spawn(async move {
            q2.interrupt("c-1", "wrap up", false, Duration::from_secs(5))
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            queue
                .executing_command()
                .expect("still executing")
                .interrupt_reason
                .as_deref(),
            Some("wrap up")
        );
        queue.complete_executing("c-1", true, None);

        let job = waiter.await.expect("join").expect("interrupt result");
        assert_eq!(job.state, CommandState::Completed, "finished gracefully");
    }

    #[tokio::test]
    async fn interrupt_terminal_command_is_not_active() {
        let (queue, _rx) = test_queue();
        queue.enqueue(spec("c-1"), 50, None).expect("enqueue");
        queue.take_next_ready().expect("dispatch");
        queue.complete_executing("c-1", true, None);
        let err = queue
            .interrupt("c-1", "too late", false, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err, QueueError::NotActive);
    }

    #[tokio::test]
    async fn failure_retries_with_backoff_then_fails() {
        let (queue, _rx) = test_queue();
        queue.enqueue(spec("c-1"), 50, None).expect("enqueue");

        // Attempt 1 fails — re-enqueued with a future scheduled_at.
        queue.take_next_ready().expect("dispatch");
        let outcome = queue.complete_executing("c-1", false, Some("boom".to_string()));
        let job = match outcome {
            CompletionOutcome::Retrying(job) => job,
            other => panic!("expected Retrying, got {other:?}"),
        };
        assert_eq!(job.attempt_count, 1);
        assert!(job.scheduled_at > Utc::now(), "backoff scheduled");
        assert!(
            queue.take_next_ready().is_none(),
            "not ready until backoff elapses"
        );

        // Walk the job through its remaining attempts by hand.
        {
            let mut inner = queue.lock();
            let idx = inner.find_queued("c-1").expect("requeued");
            inner.queued[idx].scheduled_at = Utc::now();
        }
        queue.take_next_ready().expect("redispatch");
        let outcome = queue.complete_executing("c-1", false, Some("boom".to_string()));
        assert!(matches!(outcome, CompletionOutcome::Retrying(_)));
        {
            let mut inner = queue.lock();
            let idx = inner.find_queued("c-1").expect("requeued");
            inner.queued[idx].scheduled_at = Utc::now();
        }
        queue.take_next_ready().expect("redispatch");
        let outcome = queue.complete_executing("c-1", false, Some("boom".to_string()));
        let job = match outcome {
            CompletionOutcome::Failed(job) => job,
            other => panic!("expected Failed, got {other:?}"),
        };
        assert_eq!(job.state, CommandState::Failed);
        assert_eq!(job.failure_reason.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn cancel_all_clears_queue_and_slot() {
        let (queue, _rx) = test_queue();
        queue.enqueue(spec("c-1"), 50, None).expect("enqueue");
        queue.enqueue(spec("c-2"), 50, None).expect("enqueue");
        queue.take_next_ready().expect("dispatch");

        let cancelled = queue.cancel_all("emergency stop");
        assert_eq!(cancelled.len(), 2);
        assert!(cancelled
            .iter()
            .all(|j| j.state == CommandState::Cancelled));
        assert_eq!(queue.snapshot().queue_size, 0);
        assert!(queue.executing_command().is_none());
    }

    #[tokio::test]
    async fn pause_blocks_dispatch_until_resume() {
        let (queue, _rx) = test_queue();
        queue.enqueue(spec("c-1"), 50, None).expect("enqueue");
        queue.pause();
        assert!(queue.take_next_ready().is_none(), "paused queue holds work");
        queue.resume();
        assert!(queue.take_next_ready().is_some());
    }

    #[tokio::test]
    async fn shutdown_waits_then_force_cancels() {
        let (queue, _rx) = test_queue();
        let queue = Arc::new(queue);
        queue.enqueue(spec("c-1"), 50, None).expect("enqueue");
        queue.take_next_ready().expect("dispatch");

        let q2 = Arc::clone(&queue);
        let shutdown = tokio::spawn(async move { q2.shutdown(Duration::from_millis(200)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(queue.is_paused());
        queue.complete_executing("c-1", true, None);

        let cancelled = shutdown.await.expect("join");
        assert!(cancelled.is_empty(), "finished within grace — nothing cancelled");
    }

    #[tokio::test]
    async fn metrics_track_history() {
        let (queue, _rx) = test_queue();
        for i in 0..3 {
            let id = format!("c-{i}");
            queue.enqueue(spec(&id), 50, None).expect("enqueue");
            queue.take_next_ready().expect("dispatch");
            queue.complete_executing(&id, true, None);
        }
        queue.enqueue(spec("c-fail"), 50, None).expect("enqueue");
        queue.take_next_ready().expect("dispatch");
        queue.complete_executing("c-fail", false, Some("boom".to_string()));

        let metrics = queue.metrics();
        assert_eq!(metrics.completed, 3);
        assert_eq!(metrics.queued, 1, "failed attempt re-enqueued");
        assert!(metrics.throughput_per_hour > 0.0);
    }

    #[tokio::test]
    async fn manager_routes_to_per_agent_queues() {
        let (manager, _rx) = QueueManager::new(QueueConfig::default());
        let q1 = manager.queue("A1");
        let q1_again = manager.queue("A1");
        assert!(Arc::ptr_eq(&q1, &q1_again));

        q1.enqueue(spec("c-1"), 50, None).expect("enqueue");
        let found = manager.find_command("c-1").expect("located");
        assert_eq!(found.agent_id, "A1");
        assert!(manager.find_command("c-unknown").is_none());
    }
}
