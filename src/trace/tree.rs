//! Trace forest construction and aggregation.
//!
//! A command's trace events arrive flat; this module rebuilds the
//! parent/child forest, derives per-node depth, subtree sums and error
//! state, and computes the aggregate statistics dashboards render (totals,
//! per-type counts, max depth, critical path, slow/high-token flags).
//!
//! The build is a pure function of the event set: rebuilding from a
//! flattened tree yields the same tree.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::config::TraceConfig;
use crate::protocol::{TraceEventPayload, TraceKind};

// ─── Nodes ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct TraceNode {
    pub event: TraceEventPayload,
    pub depth: usize,
    /// Parent id was set but no such event exists — surfaced as a root.
    pub orphan: bool,
    /// Started, ran past its reported duration, never completed.
    pub errored: bool,
    pub duration_ms: u64,
    pub child_count: usize,
    pub subtree_duration_ms: u64,
    pub subtree_tokens: u64,
    pub children: Vec<TraceNode>,
}

impl TraceNode {
    fn visit<'a>(&'a self, f: &mut impl FnMut(&'a TraceNode)) {
        f(self);
        for child in &self.children {
            child.visit(f);
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceStats {
    pub total_events: usize,
    pub total_duration_ms: u64,
    pub avg_duration_ms: u64,
    pub total_tokens: u64,
    pub avg_tokens: u64,
    pub llm_prompts: usize,
    pub tool_calls: usize,
    pub responses: usize,
    pub error_count: usize,
    pub orphan_count: usize,
    pub max_depth: usize,
    /// Trace ids, root to leaf, following the heaviest subtree at each step.
    pub critical_path: Vec<String>,
    pub critical_path_ms: u64,
    pub slow_nodes: Vec<String>,
    pub very_slow_nodes: Vec<String>,
    pub high_token_nodes: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TraceTree {
    pub command_id: String,
    pub roots: Vec<TraceNode>,
    pub stats: TraceStats,
}

impl TraceTree {
    /// Every event in the tree, depth-first. `build(flatten(t))` is `t`.
    pub fn flatten(&self) -> Vec<TraceEventPayload> {
        let mut events = Vec::new();
        for root in &self.roots {
            root.visit(&mut |node| events.push(node.event.clone()));
        }
        events
    }

    pub fn find(&self, trace_id: &str) -> Option<&TraceNode> {
        fn search<'a>(nodes: &'a [TraceNode], id: &str) -> Option<&'a TraceNode> {
            for node in nodes {
                if node.event.trace_id == id {
                    return Some(node);
                }
                if let Some(found) = search(&node.children, id) {
                    return Some(found);
                }
            }
            None
        }
        search(&self.roots, trace_id)
    }
}

// ─── Build ───────────────────────────────────────────────────────────────────

fn node_duration(event: &TraceEventPayload) -> u64 {
    if let Some(d) = event.duration_ms {
        return d;
    }
    match event.completed_at {
        Some(done) => (done - event.started_at).max(0) as u64,
        None => 0,
    }
}

fn is_errored(event: &TraceEventPayload, now_ms: i64) -> bool {
    event.completed_at.is_none()
        && event
            .duration_ms
            .is_some_and(|d| event.started_at + (d as i64) < now_ms)
}

/// Build the trace forest for one command from its flat event set.
///
/// Entries whose parent is absent become roots flagged `orphan`; siblings
/// are ordered by `started_at`; recursion stops at `max_trace_depth`.
pub fn build_tree(command_id: &str, events: &[TraceEventPayload], config: &TraceConfig) -> TraceTree {
    let now_ms = chrono::Utc::now().timestamp_millis();
    let known: HashSet<&str> = events.iter().map(|e| e.trace_id.as_str()).collect();

    // Bucket children by parent id; unknown parents surface as orphan roots.
    let mut children_of: HashMap<&str, Vec<&TraceEventPayload>> = HashMap::new();
    let mut roots: Vec<(&TraceEventPayload, bool)> = Vec::new();
    for event in events {
        match event.parent_id.as_deref() {
            Some(parent) if known.contains(parent) => {
                children_of.entry(parent).or_default().push(event);
            }
            Some(_) => roots.push((event, true)),
            None => roots.push((event, false)),
        }
    }
    roots.sort_by_key(|(e, _)| e.started_at);
    for bucket in children_of.values_mut() {
        bucket.sort_by_key(|e| e.started_at);
    }

    fn build_node(
        event: &TraceEventPayload,
        orphan: bool,
        depth: usize,
        children_of: &HashMap<&str, Vec<&TraceEventPayload>>,
        config: &TraceConfig,
        now_ms: i64,
    ) -> TraceNode {
        let children: Vec<TraceNode> = if depth + 1 < config.max_trace_depth {
            children_of
                .get(event.trace_id.as_str())
                .map(|kids| {
                    kids.iter()
                        .map(|kid| build_node(kid, false, depth + 1, children_of, config, now_ms))
                        .collect()
                })
                .unwrap_or_default()
        } else {
            Vec::new()
        };

        let duration_ms = node_duration(event);
        let subtree_duration_ms = duration_ms
            + children
                .iter()
                .map(|c| c.subtree_duration_ms)
                .sum::<u64>();
        let subtree_tokens = event.tokens_used.unwrap_or(0)
            + children.iter().map(|c| c.subtree_tokens).sum::<u64>();

        TraceNode {
            depth,
            orphan,
            errored: is_errored(event, now_ms),
            duration_ms,
            child_count: children.len(),
            subtree_duration_ms,
            subtree_tokens,
            children,
            event: event.clone(),
        }
    }

    let roots: Vec<TraceNode> = roots
        .into_iter()
        .map(|(event, orphan)| build_node(event, orphan, 0, &children_of, config, now_ms))
        .collect();

    let stats = compute_stats(&roots, config);
    TraceTree {
        command_id: command_id.to_string(),
        roots,
        stats,
    }
}

// ─── Stats ───────────────────────────────────────────────────────────────────

fn compute_stats(roots: &[TraceNode], config: &TraceConfig) -> TraceStats {
    let mut stats = TraceStats::default();

    for root in roots {
        root.visit(&mut |node| {
            stats.total_events += 1;
            stats.total_duration_ms += node.duration_ms;
            stats.total_tokens += node.event.tokens_used.unwrap_or(0);
            match node.event.kind {
                TraceKind::LlmPrompt => stats.llm_prompts += 1,
                TraceKind::ToolCall => stats.tool_calls += 1,
                TraceKind::Response => stats.responses += 1,
            }
            if node.errored {
                stats.error_count += 1;
            }
            if node.orphan {
                stats.orphan_count += 1;
            }
            stats.max_depth = stats.max_depth.max(node.depth + 1);
            if node.duration_ms >= config.very_slow_trace_ms {
                stats.very_slow_nodes.push(node.event.trace_id.clone());
            } else if node.duration_ms >= config.slow_trace_ms {
                stats.slow_nodes.push(node.event.trace_id.clone());
            }
            if node.event.tokens_used.unwrap_or(0) >= config.high_token_usage {
                stats.high_token_nodes.push(node.event.trace_id.clone());
            }
        });
    }

    if stats.total_events > 0 {
        stats.avg_duration_ms = stats.total_duration_ms / stats.total_events as u64;
        stats.avg_tokens = stats.total_tokens / stats.total_events as u64;
    }

    // Critical path: from the heaviest root, repeatedly follow the child
    // with the largest subtree duration.
    if let Some(mut node) = roots.iter().max_by_key(|r| r.subtree_duration_ms) {
        stats.critical_path_ms = node.subtree_duration_ms;
        loop {
            stats.critical_path.push(node.event.trace_id.clone());
            match node.children.iter().max_by_key(|c| c.subtree_duration_ms) {
                Some(next) => node = next,
                None => break,
            }
        }
    }

    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn event(
        id: &str,
        parent: Option<&str>,
        started_offset_ms: i64,
        duration_ms: u64,
        tokens: u64,
    ) -> TraceEventPayload {
        let base = Utc::now().timestamp_millis() - 60_000;
        TraceEventPayload {
            trace_id: id.to_string(),
            command_id: "c-1".to_string(),
            agent_id: Some("A1".to_string()),
            parent_id: parent.map(str::to_string),
            kind: TraceKind::ToolCall,
            name: id.to_string(),
            content: serde_json::Value::Null,
            started_at: base + started_offset_ms,
            completed_at: Some(base + started_offset_ms + duration_ms as i64),
            duration_ms: Some(duration_ms),
            tokens_used: Some(tokens),
        }
    }

    fn config() -> TraceConfig {
        TraceConfig::default()
    }

    #[test]
    fn builds_forest_with_sorted_siblings() {
        let events = vec![
            event("root", None, 0, 100, 10),
            event("late-child", Some("root"), 50, 20, 5),
            event("early-child", Some("root"), 10, 30, 5),
        ];
        let tree = build_tree("c-1", &events, &config());
        assert_eq!(tree.roots.len(), 1);
        let root = &tree.roots[0];
        assert_eq!(root.child_count, 2);
        assert_eq!(root.children[0].event.trace_id, "early-child");
        assert_eq!(root.children[1].event.trace_id, "late-child");
        assert_eq!(root.subtree_duration_ms, 150);
        assert_eq!(root.subtree_tokens, 20);
    }

    #[test]
    fn orphan_surfaces_as_flagged_root() {
        let events = vec![
            event("root", None, 0, 100, 0),
            event("lost", Some("no-such-parent"), 10, 5, 0),
        ];
        let tree = build_tree("c-1", &events, &config());
        assert_eq!(tree.roots.len(), 2);
        let lost = tree.find("lost").expect("present");
        assert!(lost.orphan);
        assert_eq!(tree.stats.orphan_count, 1);
        // Invariant: every non-root node's parent is in the tree.
        for root in &tree.roots {
            for child in &root.children {
                assert_eq!(
                    child.event.parent_id.as_deref(),
                    Some(root.event.trace_id.as_str())
                );
            }
        }
    }

    #[test]
    fn depth_bound_is_enforced() {
        let mut cfg = config();
        cfg.max_trace_depth = 3;
        let events = vec![
            event("a", None, 0, 10, 0),
            event("b", Some("a"), 1, 10, 0),
            event("c", Some("b"), 2, 10, 0),
            event("d", Some("c"), 3, 10, 0),
        ];
        let tree = build_tree("c-1", &events, &cfg);
        assert_eq!(tree.stats.max_depth, 3);
        assert!(tree.find("d").is_none(), "node beyond depth bound");
    }

    #[test]
    fn critical_path_follows_heaviest_subtree() {
        let events = vec![
            event("root", None, 0, 10, 0),
            event("light", Some("root"), 1, 20, 0),
            event("heavy", Some("root"), 2, 30, 0),
            event("heavy-leaf", Some("heavy"), 3, 50, 0),
        ];
        let tree = build_tree("c-1", &events, &config());
        assert_eq!(
            tree.stats.critical_path,
            vec!["root", "heavy", "heavy-leaf"]
        );
        assert_eq!(tree.stats.critical_path_ms, 110);
    }

    #[test]
    fn incomplete_past_duration_is_errored() {
        let mut overdue = event("overdue", None, 0, 1_000, 0);
        overdue.completed_at = None;
        let mut pending = event("pending", None, 0, 0, 0);
        pending.completed_at = None;
        pending.duration_ms = None;

        let tree = build_tree("c-1", &[overdue, pending], &config());
        assert_eq!(tree.stats.error_count, 1);
        assert!(tree.find("overdue").expect("node").errored);
        assert!(!tree.find("pending").expect("node").errored);
    }

    #[test]
    fn flags_slow_and_high_token_nodes() {
        let cfg = config();
        let events = vec![
            event("fast", None, 0, 100, 0),
            event("slow", None, 1, cfg.slow_trace_ms + 1, 0),
            event("glacial", None, 2, cfg.very_slow_trace_ms + 1, 0),
            event("hungry", None, 3, 10, cfg.high_token_usage + 1),
        ];
        let tree = build_tree("c-1", &events, &cfg);
        assert_eq!(tree.stats.slow_nodes, vec!["slow"]);
        assert_eq!(tree.stats.very_slow_nodes, vec!["glacial"]);
        assert_eq!(tree.stats.high_token_nodes, vec!["hungry"]);
    }

    #[test]
    fn rebuild_is_a_fixed_point() {
        let events = vec![
            event("root", None, 0, 100, 10),
            event("child-a", Some("root"), 10, 30, 5),
            event("child-b", Some("root"), 20, 20, 5),
            event("grandchild", Some("child-a"), 15, 10, 1),
            event("stray", Some("gone"), 5, 1, 0),
        ];
        let tree = build_tree("c-1", &events, &config());
        let rebuilt = build_tree("c-1", &tree.flatten(), &config());

        assert_eq!(tree.stats.total_events, rebuilt.stats.total_events);
        assert_eq!(tree.stats.total_duration_ms, rebuilt.stats.total_duration_ms);
        assert_eq!(tree.stats.max_depth, rebuilt.stats.max_depth);
        assert_eq!(tree.stats.critical_path, rebuilt.stats.critical_path);
        assert_eq!(tree.roots.len(), rebuilt.roots.len());
        for (a, b) in tree.roots.iter().zip(rebuilt.roots.iter()) {
            assert_eq!(a.event.trace_id, b.event.trace_id);
            assert_eq!(a.child_count, b.child_count);
            assert_eq!(a.subtree_duration_ms, b.subtree_duration_ms);
        }
    }
}
