//! Criterion benchmarks for hot paths in the fleetd control plane.
//!
//! Run with:
//!   cargo bench
//!
//! Covers:
//!   - Wire envelope parsing (serde_json)
//!   - Router enqueue + drain (priority queue, fan-out)
//!   - Secret redaction (regex pipeline)
//!   - Trace tree build (forest assembly + aggregation)

use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use fleetd::auth::{Principal, Role};
use fleetd::config::{RouterConfig, TraceConfig};
use fleetd::protocol::{MessageType, TraceEventPayload, TraceKind, WireMessage};
use fleetd::redact::redact_str;
use fleetd::registry::{Connection, ConnectionRegistry, Population};
use fleetd::router::MessageRouter;
use fleetd::trace::build_tree;

static TERMINAL_OUTPUT_MSG: &str = r#"{
    "version": "1.0.0",
    "type": "terminal:output",
    "id": "01HXYZ1234567890ABCDEFGHIJ",
    "timestamp": 1722470400000,
    "payload": {
        "commandId": "7b0d8a1e-31f7-4a36-a2c5-2f9f53f3a111",
        "streamType": "stdout",
        "content": "Compiling fleetd v0.1.0 (/workspace/fleetd)\n",
        "ansiCodes": false,
        "sequence": 118
    }
}"#;

// ─── Envelope parsing ────────────────────────────────────────────────────────

fn bench_parse(c: &mut Criterion) {
    c.bench_function("parse_terminal_output", |b| {
        b.iter(|| {
            let msg = WireMessage::parse(black_box(TERMINAL_OUTPUT_MSG)).expect("parse");
            black_box(msg);
        })
    });
}

// ─── Router enqueue + drain ──────────────────────────────────────────────────

fn principal() -> Principal {
    Principal {
        user_id: "u-1".to_string(),
        email: "bench@example.com".to_string(),
        role: Role::Operator,
    }
}

fn bench_router(c: &mut Criterion) {
    let registry = Arc::new(ConnectionRegistry::new(Duration::from_secs(30)));
    let mut receivers = Vec::new();
    for _ in 0..8 {
        let (conn, rx) = Connection::new(
            Population::Dashboard,
            principal(),
            chrono::Utc::now() + chrono::Duration::hours(1),
        );
        conn.set_subscriptions(true, Vec::<String>::new());
        registry.register(conn);
        receivers.push(rx);
    }
    let router = MessageRouter::new(registry, RouterConfig::default());
    let payload = serde_json::json!({ "agentId": "A1", "queueSize": 3 });

    c.bench_function("router_enqueue_drain_100", |b| {
        b.iter(|| {
            for i in 0..100u8 {
                router.to_dashboards(
                    MessageType::QueueUpdate,
                    payload.clone(),
                    black_box(i % 10),
                    None,
                );
            }
            router.process_once();
            // Keep the outbound channels from filling up.
            for rx in receivers.iter_mut() {
                while rx.try_recv().is_ok() {}
            }
        })
    });
}

// ─── Redaction ───────────────────────────────────────────────────────────────

fn bench_redact(c: &mut Criterion) {
    let clean = "Compiling fleetd v0.1.0 — 114 crates, 38s elapsed, all tests green";
    let dirty = "export ANTHROPIC_API_KEY=sk-abcdefghijklmnopqrstuvwxyz123456 && cargo run";

    c.bench_function("redact_clean_line", |b| {
        b.iter(|| black_box(redact_str(black_box(clean))))
    });
    c.bench_function("redact_dirty_line", |b| {
        b.iter(|| black_box(redact_str(black_box(dirty))))
    });
}

// ─── Trace tree build ────────────────────────────────────────────────────────

fn bench_tree_build(c: &mut Criterion) {
    let base = 1_722_470_400_000i64;
    let mut events = Vec::new();
    // 20 roots with 10 children each.
    for root in 0..20 {
        let root_id = format!("t-{root}");
        events.push(TraceEventPayload {
            trace_id: root_id.clone(),
            command_id: "c-1".to_string(),
            agent_id: Some("A1".to_string()),
            parent_id: None,
            kind: TraceKind::LlmPrompt,
            name: "prompt".to_string(),
            content: serde_json::Value::Null,
            started_at: base + root * 1_000,
            completed_at: Some(base + root * 1_000 + 900),
            duration_ms: Some(900),
            tokens_used: Some(150),
        });
        for child in 0..10 {
            events.push(TraceEventPayload {
                trace_id: format!("t-{root}-{child}"),
                command_id: "c-1".to_string(),
                agent_id: Some("A1".to_string()),
                parent_id: Some(root_id.clone()),
                kind: TraceKind::ToolCall,
                name: "bash".to_string(),
                content: serde_json::Value::Null,
                started_at: base + root * 1_000 + child * 50,
                completed_at: Some(base + root * 1_000 + child * 50 + 40),
                duration_ms: Some(40),
                tokens_used: Some(10),
            });
        }
    }
    let config = TraceConfig::default();

    c.bench_function("trace_tree_build_220", |b| {
        b.iter(|| black_box(build_tree("c-1", black_box(&events), &config)))
    });
}

criterion_group!(benches, bench_parse, bench_router, bench_redact, bench_tree_build);
criterion_main!(benches);
