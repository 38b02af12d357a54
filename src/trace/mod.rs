//! Trace collection: ingest streamed trace events, persist them, rebuild
//! per-command trees and surface command completion.
//!
//! Ingest path per event: validate the parent chain (same command, depth
//! within `max_trace_depth`), redact secrets, persist, append to the
//! per-command in-memory list (bounded; oldest dropped with a warning) and
//! emit `TraceAdded`. When an event arrives already completed — or a sweep
//! finds a command idle past `idle_complete_secs` — the collector checks
//! whether every event has completed; if so it builds the aggregation,
//! emits `CommandCompleted` and evicts the in-memory list.

pub mod export;
pub mod tree;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::TraceConfig;
use crate::protocol::TraceEventPayload;
use crate::redact::redact_json;
use crate::storage::Storage;

pub use tree::{build_tree, TraceStats, TraceTree};

/// How often the idle-completion sweeper runs.
const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

// ─── Types ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum TraceError {
    #[error("trace depth {0} exceeds the configured maximum")]
    DepthExceeded(usize),
    #[error("parent trace {parent} belongs to command {parent_command}, not {command}")]
    ParentMismatch {
        parent: String,
        parent_command: String,
        command: String,
    },
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Events out of the collector, consumed by the orchestrator.
#[derive(Debug, Clone)]
pub enum CollectorEvent {
    /// Stored and ready to stream to subscribed dashboards.
    TraceAdded {
        agent_id: String,
        event: TraceEventPayload,
    },
    /// Every event of the command has completed; aggregation attached.
    CommandCompleted {
        command_id: String,
        agent_id: String,
        stats: TraceStats,
    },
}

struct CommandTraces {
    agent_id: String,
    events: Vec<TraceEventPayload>,
    last_event_at: Instant,
    dropped: u64,
}

// ─── Collector ───────────────────────────────────────────────────────────────

pub struct TraceCollector {
    storage: Arc<Storage>,
    config: TraceConfig,
    inner: Mutex<HashMap<String, CommandTraces>>,
    events: mpsc::UnboundedSender<CollectorEvent>,
}

impl TraceCollector {
    pub fn new(
        storage: Arc<Storage>,
        config: TraceConfig,
    ) -> (Self, mpsc::UnboundedReceiver<CollectorEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                storage,
                config,
                inner: Mutex::new(HashMap::new()),
                events: tx,
            },
            rx,
        )
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, CommandTraces>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ── Ingest ──────────────────────────────────────────────────────────────

    pub async fn ingest(
        &self,
        agent_id: &str,
        mut event: TraceEventPayload,
    ) -> Result<(), TraceError> {
        self.check_parent_chain(&event).await?;

        if redact_json(&mut event.content) {
            debug!(trace = %event.trace_id, "redacted secret material from trace content");
        }

        self.storage.insert_trace(&event, agent_id).await?;

        let completed = event.completed_at.is_some();
        let command_id = event.command_id.clone();
        {
            let mut inner = self.lock();
            let entry = inner
                .entry(command_id.clone())
                .or_insert_with(|| CommandTraces {
                    agent_id: agent_id.to_string(),
                    events: Vec::new(),
                    last_event_at: Instant::now(),
                    dropped: 0,
                });
            entry.last_event_at = Instant::now();
            // An update (completion) for an event we already hold replaces it.
            if let Some(existing) = entry
                .events
                .iter_mut()
                .find(|e| e.trace_id == event.trace_id)
            {
                *existing = event.clone();
            } else {
                entry.events.push(event.clone());
                if entry.events.len() > self.config.max_traces_per_command {
                    entry.events.remove(0);
                    entry.dropped += 1;
                    warn!(
                        command = %command_id,
                        dropped = entry.dropped,
                        "per-command trace cap exceeded — oldest event dropped"
                    );
                }
            }
        }

        let _ = self.events.send(CollectorEvent::TraceAdded {
            agent_id: agent_id.to_string(),
            event,
        });

        if completed {
            self.try_complete(&command_id);
        }
        Ok(())
    }

    /// Walk the parent chain, mixing the in-memory list with storage, and
    /// reject events nested past `max_trace_depth` or pointing at a parent
    /// from another command.
    async fn check_parent_chain(&self, event: &TraceEventPayload) -> Result<(), TraceError> {
        let mut depth = 1usize;
        let mut current = event.parent_id.clone();
        while let Some(parent_id) = current {
            depth += 1;
            if depth > self.config.max_trace_depth {
                return Err(TraceError::DepthExceeded(depth));
            }

            let from_memory = {
                let inner = self.lock();
                inner.get(&event.command_id).and_then(|entry| {
                    entry
                        .events
                        .iter()
                        .find(|e| e.trace_id == parent_id)
                        .map(|e| (e.command_id.clone(), e.parent_id.clone()))
                })
            };
            let parent = match from_memory {
                Some(found) => Some(found),
                None => self
                    .storage
                    .get_trace(&parent_id)
                    .await?
                    .map(|row| (row.command_id, row.parent_id)),
            };

            match parent {
                Some((parent_command, grandparent)) => {
                    if parent_command != event.command_id {
                        return Err(TraceError::ParentMismatch {
                            parent: parent_id,
                            parent_command,
                            command: event.command_id.clone(),
                        });
                    }
                    current = grandparent;
                }
                // Unknown parent: the event becomes an orphan root in the
                // tree build; nothing left to walk.
                None => break,
            }
        }
        Ok(())
    }

    // ── Completion ──────────────────────────────────────────────────────────

    /// If every in-memory event of the command has completed, emit the
    /// aggregation and evict the list.
    fn try_complete(&self, command_id: &str) {
        let done = {
            let mut inner = self.lock();
            let Some(entry) = inner.get(command_id) else {
                return;
            };
            if entry.events.is_empty()
                || !entry.events.iter().all(|e| e.completed_at.is_some())
            {
                return;
            }
            inner.remove(command_id)
        };
        if let Some(entry) = done {
            let tree = build_tree(command_id, &entry.events, &self.config);
            info!(
                command = %command_id,
                events = tree.stats.total_events,
                duration_ms = tree.stats.total_duration_ms,
                "trace collection complete"
            );
            let _ = self.events.send(CollectorEvent::CommandCompleted {
                command_id: command_id.to_string(),
                agent_id: entry.agent_id,
                stats: tree.stats,
            });
        }
    }

    /// Drop the in-memory list for a command that reached a terminal state
    /// without completing its traces (cancelled, failed).
    pub fn evict(&self, command_id: &str) {
        self.lock().remove(command_id);
    }

    /// Completion check for commands with no new events for
    /// `idle_complete_secs`.
    pub fn sweep(&self) {
        let idle = Duration::from_secs(self.config.idle_complete_secs);
        let idle_commands: Vec<String> = {
            let inner = self.lock();
            inner
                .iter()
                .filter(|(_, entry)| entry.last_event_at.elapsed() >= idle)
                .map(|(id, _)| id.clone())
                .collect()
        };
        for command_id in idle_commands {
            self.try_complete(&command_id);
        }
    }

    /// Spawn the periodic idle-completion sweeper.
    pub fn start_sweeper(self: &Arc<Self>) {
        let collector = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            interval.tick().await; // skip the immediate first tick
            loop {
                interval.tick().await;
                collector.sweep();
            }
        });
    }

    // ── Queries ─────────────────────────────────────────────────────────────

    /// Build the trace tree for a command: from memory while the command is
    /// live, from storage afterwards.
    pub async fn tree(&self, command_id: &str) -> Result<TraceTree, TraceError> {
        let from_memory: Option<Vec<TraceEventPayload>> = {
            let inner = self.lock();
            inner.get(command_id).map(|entry| entry.events.clone())
        };
        let events = match from_memory {
            Some(events) => events,
            None => self
                .storage
                .traces_for_command(command_id)
                .await?
                .iter()
                .map(|row| row.to_payload())
                .collect(),
        };
        Ok(build_tree(command_id, &events, &self.config))
    }

    /// Flamegraph export of a command's trace tree, bounded by the export caps.
    pub async fn flamegraph(
        &self,
        command_id: &str,
    ) -> Result<export::FlamegraphExport, TraceError> {
        let tree = self.tree(command_id).await?;
        Ok(export::flamegraph(&tree, &self.config))
    }

    /// Timeline export of a command's trace tree, bounded by the export caps.
    pub async fn timeline(
        &self,
        command_id: &str,
    ) -> Result<Vec<export::TimelineEvent>, TraceError> {
        let tree = self.tree(command_id).await?;
        Ok(export::timeline(&tree, &self.config))
    }

    /// Delete stored trace entries older than `older_than`. Returns the count.
    pub async fn cleanup(&self, older_than: chrono::Duration) -> Result<u64, TraceError> {
        let cutoff: DateTime<Utc> = Utc::now() - older_than;
        Ok(self.storage.delete_traces_older_than(cutoff).await?)
    }
}
