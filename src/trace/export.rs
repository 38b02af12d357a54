//! Trace tree exports: flamegraph and timeline shapes for dashboards.
//!
//! Both exports are bounded by `max_export_size` (node count) and
//! `max_export_depth`; oversized trees are truncated breadth-last with the
//! dropped count reported on the export.

use serde::Serialize;

use crate::config::TraceConfig;
use crate::protocol::TraceKind;

use super::tree::{TraceNode, TraceTree};

// ─── Flamegraph ──────────────────────────────────────────────────────────────

const COLOR_LLM_PROMPT: &str = "#7c5cff";
const COLOR_TOOL_CALL: &str = "#2f9e62";
const COLOR_RESPONSE: &str = "#3878c9";
const COLOR_ERROR: &str = "#d64545";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlamegraphNode {
    pub name: String,
    /// Duration in milliseconds.
    pub value: u64,
    pub color: &'static str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<FlamegraphNode>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlamegraphExport {
    pub command_id: String,
    pub root: FlamegraphNode,
    /// Nodes left out by the size/depth caps.
    pub truncated: usize,
}

fn node_color(node: &TraceNode) -> &'static str {
    if node.errored {
        return COLOR_ERROR;
    }
    match node.event.kind {
        TraceKind::LlmPrompt => COLOR_LLM_PROMPT,
        TraceKind::ToolCall => COLOR_TOOL_CALL,
        TraceKind::Response => COLOR_RESPONSE,
    }
}

/// Render the tree as a single flamegraph rooted at a synthetic node whose
/// value is the sum of the root subtrees.
pub fn flamegraph(tree: &TraceTree, config: &TraceConfig) -> FlamegraphExport {
    let mut budget = config.max_export_size;
    let mut truncated = 0usize;

    fn convert(
        node: &TraceNode,
        depth: usize,
        budget: &mut usize,
        truncated: &mut usize,
        config: &TraceConfig,
    ) -> Option<FlamegraphNode> {
        if *budget == 0 || depth >= config.max_export_depth {
            *truncated += 1 + count_nodes(&node.children);
            return None;
        }
        *budget -= 1;
        let children = node
            .children
            .iter()
            .filter_map(|child| convert(child, depth + 1, budget, truncated, config))
            .collect();
        Some(FlamegraphNode {
            name: node.event.name.clone(),
            value: node.subtree_duration_ms,
            color: node_color(node),
            children,
        })
    }

    fn count_nodes(nodes: &[TraceNode]) -> usize {
        nodes.iter().map(|n| 1 + count_nodes(&n.children)).sum()
    }

    let children: Vec<FlamegraphNode> = tree
        .roots
        .iter()
        .filter_map(|root| convert(root, 0, &mut budget, &mut truncated, config))
        .collect();
    let total: u64 = children.iter().map(|c| c.value).sum();

    FlamegraphExport {
        command_id: tree.command_id.clone(),
        root: FlamegraphNode {
            name: tree.command_id.clone(),
            value: total,
            color: COLOR_RESPONSE,
            children,
        },
        truncated,
    }
}

// ─── Timeline ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineEvent {
    pub trace_id: String,
    pub name: String,
    /// Milliseconds since the Unix epoch.
    pub start: i64,
    pub end: i64,
    /// Nesting level (tree depth).
    pub level: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<String>,
}

/// Flatten the tree into chronological lanes for a Gantt-style view.
pub fn timeline(tree: &TraceTree, config: &TraceConfig) -> Vec<TimelineEvent> {
    let mut events = Vec::new();

    fn walk(node: &TraceNode, out: &mut Vec<TimelineEvent>, config: &TraceConfig) {
        if out.len() >= config.max_export_size || node.depth >= config.max_export_depth {
            return;
        }
        let start = node.event.started_at;
        let end = node
            .event
            .completed_at
            .unwrap_or(start + node.duration_ms as i64);
        out.push(TimelineEvent {
            trace_id: node.event.trace_id.clone(),
            name: node.event.name.clone(),
            start,
            end,
            level: node.depth,
            children: node
                .children
                .iter()
                .map(|c| c.event.trace_id.clone())
                .collect(),
        });
        for child in &node.children {
            walk(child, out, config);
        }
    }

    for root in &tree.roots {
        walk(root, &mut events, config);
    }
    events.sort_by_key(|e| (e.start, e.level));
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::TraceEventPayload;
    use crate::trace::tree::build_tree;

    fn event(id: &str, parent: Option<&str>, offset: i64, duration: u64) -> TraceEventPayload {
        let base = 1_700_000_000_000i64;
        TraceEventPayload {
            trace_id: id.to_string(),
            command_id: "c-1".to_string(),
            agent_id: Some("A1".to_string()),
            parent_id: parent.map(str::to_string),
            kind: TraceKind::ToolCall,
            name: id.to_string(),
            content: serde_json::Value::Null,
            started_at: base + offset,
            completed_at: Some(base + offset + duration as i64),
            duration_ms: Some(duration),
            tokens_used: None,
        }
    }

    #[test]
    fn flamegraph_mirrors_tree_shape() {
        let cfg = TraceConfig::default();
        let events = vec![
            event("root", None, 0, 100),
            event("child", Some("root"), 10, 40),
        ];
        let tree = build_tree("c-1", &events, &cfg);
        let graph = flamegraph(&tree, &cfg);
        assert_eq!(graph.truncated, 0);
        assert_eq!(graph.root.children.len(), 1);
        assert_eq!(graph.root.children[0].name, "root");
        assert_eq!(graph.root.children[0].value, 140, "subtree duration");
        assert_eq!(graph.root.children[0].children[0].name, "child");
    }

    #[test]
    fn flamegraph_respects_size_cap() {
        let mut cfg = TraceConfig::default();
        cfg.max_export_size = 2;
        let events = vec![
            event("root", None, 0, 100),
            event("a", Some("root"), 1, 10),
            event("b", Some("root"), 2, 10),
        ];
        let tree = build_tree("c-1", &events, &cfg);
        let graph = flamegraph(&tree, &cfg);
        assert_eq!(graph.truncated, 1);
    }

    #[test]
    fn timeline_is_chronological_with_levels() {
        let cfg = TraceConfig::default();
        let events = vec![
            event("root", None, 0, 100),
            event("late", Some("root"), 60, 20),
            event("early", Some("root"), 20, 20),
        ];
        let tree = build_tree("c-1", &events, &cfg);
        let lanes = timeline(&tree, &cfg);
        assert_eq!(lanes.len(), 3);
        assert_eq!(lanes[0].trace_id, "root");
        assert_eq!(lanes[0].level, 0);
        assert_eq!(lanes[1].trace_id, "early");
        assert_eq!(lanes[2].trace_id, "late");
        assert!(lanes[1].level == 1 && lanes[2].level == 1);
        assert_eq!(lanes[0].children, vec!["early", "late"]);
    }
}
