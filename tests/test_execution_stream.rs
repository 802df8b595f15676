//! Tests for agent execution streams: accumulation, cancellation, pausing, merging.

use std::sync::Arc;
use std::time::{Duration, Instant};

use conductor::agents::builtin::ScriptedInvoker;
use conductor::agents::{AgentChunk, ToolConfig};
use conductor::engine::types::{EventPayload, ExecutionEvent};
use conductor::stream::{ExecutionStream, PauseGate, StreamRequest, StreamTermination, merge};
use futures_util::StreamExt;
use serde_json::json;
use tokio_util::sync::CancellationToken;

fn request(step_id: &str) -> StreamRequest {
    StreamRequest {
        session_id: "s1".to_string(),
        step_id: step_id.to_string(),
        agent_kind: "researcher".to_string(),
        task: "Find things".to_string(),
        prompt: "TASK:\nFind things".to_string(),
        tools: ToolConfig::default(),
        attempt: 1,
    }
}

fn text(s: &str) -> AgentChunk {
    AgentChunk::Text(s.to_string())
}

fn kind(event: &ExecutionEvent) -> &'static str {
    match event.payload {
        EventPayload::Initialized { .. } => "initialized",
        EventPayload::TextChunk { .. } => "text_chunk",
        EventPayload::ToolUse { .. } => "tool_use",
        EventPayload::Completed { .. } => "completed",
        EventPayload::Error { .. } => "error",
        EventPayload::Interrupted { .. } => "interrupted",
    }
}

// --- Accumulation ---

#[tokio::test]
async fn stream_accumulates_output_and_metrics() {
    let invoker = ScriptedInvoker::named("scripted").with_script(vec![
        text("hello "),
        text("big world"),
        AgentChunk::ToolUse {
            name: "write_md".to_string(),
            input: json!({ "path": "out.md" }),
        },
        AgentChunk::Usage { tokens: 5 },
    ]);
    let mut stream = ExecutionStream::spawn(
        Arc::new(invoker),
        request("a"),
        CancellationToken::new(),
        PauseGate::new(),
    );

    let events: Vec<ExecutionEvent> = stream.by_ref().collect().await;
    let kinds: Vec<&str> = events.iter().map(kind).collect();
    assert_eq!(
        kinds,
        vec!["initialized", "text_chunk", "text_chunk", "tool_use", "completed"]
    );
    assert!(events.iter().all(|e| e.agent_id == stream.agent_id()));
    assert!(events.iter().all(|e| e.step_id == "a" && e.session_id == "s1"));
    assert!(stream.agent_id().starts_with("researcher_"));

    let outcome = stream.finish().await;
    assert_eq!(outcome.termination, StreamTermination::Completed);
    assert_eq!(outcome.output, "hello big world");
    assert_eq!(outcome.metrics.words_generated, 3);
    assert_eq!(outcome.metrics.tool_calls, 1);
    assert_eq!(outcome.metrics.tokens_used, 5);
    assert_eq!(outcome.metrics.api_calls, 1);
    assert_eq!(outcome.tool_log.len(), 1);
    assert_eq!(outcome.tool_log[0].tool, "write_md");
}

#[tokio::test]
async fn upstream_error_ends_stream() {
    let invoker = ScriptedInvoker::named("flaky")
        .with_script(vec![text("first "), text("second")])
        .failing_first(1);
    let mut stream = ExecutionStream::spawn(
        Arc::new(invoker),
        request("a"),
        CancellationToken::new(),
        PauseGate::new(),
    );

    let events: Vec<ExecutionEvent> = stream.by_ref().collect().await;
    let kinds: Vec<&str> = events.iter().map(kind).collect();
    assert_eq!(kinds, vec!["initialized", "text_chunk", "error"]);

    let outcome = stream.finish().await;
    match outcome.termination {
        StreamTermination::Error(ref msg) => assert!(msg.contains("invocation 1"), "{}", msg),
        ref other => panic!("unexpected termination: {:?}", other),
    }
    assert_eq!(outcome.output, "first ");
    assert_eq!(outcome.metrics.errors, 1);
}

#[tokio::test]
async fn output_size_counts_characters() {
    let invoker = ScriptedInvoker::named("scripted").with_script(vec![text("héllo "), text("wörld")]);
    let stream = ExecutionStream::spawn(
        Arc::new(invoker),
        request("a"),
        CancellationToken::new(),
        PauseGate::new(),
    );

    let events: Vec<ExecutionEvent> = stream.collect().await;
    match events.last().unwrap().payload {
        EventPayload::Completed { output_chars, .. } => assert_eq!(output_chars, 11),
        ref other => panic!("unexpected event: {:?}", other),
    }
}

// --- Cancellation ---

#[tokio::test]
async fn cancel_interrupts_a_stalled_agent() {
    let invoker = ScriptedInvoker::named("stuck")
        .with_script(vec![text("partial ")])
        .stalling();
    let cancel = CancellationToken::new();
    let mut stream = ExecutionStream::spawn(
        Arc::new(invoker),
        request("a"),
        cancel.clone(),
        PauseGate::new(),
    );

    // initialized, then the one chunk
    assert_eq!(kind(&stream.next().await.unwrap()), "initialized");
    assert_eq!(kind(&stream.next().await.unwrap()), "text_chunk");

    cancel.cancel();
    let last = tokio::time::timeout(Duration::from_secs(1), stream.next())
        .await
        .unwrap()
        .unwrap();
    match last.payload {
        EventPayload::Interrupted { partial_chars, .. } => assert_eq!(partial_chars, 8),
        ref other => panic!("unexpected event: {:?}", other),
    }

    let outcome = tokio::time::timeout(Duration::from_secs(1), stream.finish())
        .await
        .unwrap();
    assert_eq!(outcome.termination, StreamTermination::Interrupted);
    assert_eq!(outcome.output, "partial ");
}

#[tokio::test]
async fn cancel_reaches_a_paused_stream() {
    let gate = PauseGate::new();
    gate.pause();
    let cancel = CancellationToken::new();
    let mut stream = ExecutionStream::spawn(
        Arc::new(ScriptedInvoker::echo()),
        request("a"),
        cancel.clone(),
        gate.clone(),
    );
    assert_eq!(kind(&stream.next().await.unwrap()), "initialized");

    cancel.cancel();
    let outcome = tokio::time::timeout(Duration::from_secs(1), stream.finish())
        .await
        .unwrap();
    assert_eq!(outcome.termination, StreamTermination::Interrupted);
    assert!(outcome.output.is_empty());
    assert!(gate.is_paused());
}

// --- Pausing ---

#[tokio::test]
async fn pause_holds_output_until_resume() {
    let gate = PauseGate::new();
    gate.pause();
    let invoker = ScriptedInvoker::named("scripted").with_script(vec![text("held")]);
    let mut stream = ExecutionStream::spawn(
        Arc::new(invoker),
        request("a"),
        CancellationToken::new(),
        gate.clone(),
    );
    assert_eq!(kind(&stream.next().await.unwrap()), "initialized");

    let held = tokio::time::timeout(Duration::from_millis(150), stream.next()).await;
    assert!(held.is_err(), "no event may pass while paused");

    gate.resume();
    let rest: Vec<ExecutionEvent> = stream.by_ref().collect().await;
    let kinds: Vec<&str> = rest.iter().map(kind).collect();
    assert_eq!(kinds, vec!["text_chunk", "completed"]);
    assert_eq!(stream.finish().await.output, "held");
}

// --- Merging ---

#[tokio::test]
async fn merge_does_not_block_on_slow_streams() {
    let fast = ScriptedInvoker::named("fast")
        .with_script((0..5).map(|i| text(&format!("f{} ", i))).collect())
        .with_chunk_delay(Duration::from_millis(10));
    let slow = ScriptedInvoker::named("slow")
        .with_script(vec![text("s0 ")])
        .with_chunk_delay(Duration::from_millis(400));

    let slow_stream = ExecutionStream::spawn(
        Arc::new(slow),
        request("slow"),
        CancellationToken::new(),
        PauseGate::new(),
    );
    let fast_stream = ExecutionStream::spawn(
        Arc::new(fast),
        request("fast"),
        CancellationToken::new(),
        PauseGate::new(),
    );

    let started = Instant::now();
    let mut merged = Box::pin(merge(vec![slow_stream, fast_stream]));
    let mut fast_events = Vec::new();
    let mut slow_events = Vec::new();
    let mut fast_done_at = None;

    while let Some(event) = merged.next().await {
        let terminal = event.is_terminal();
        if event.step_id == "fast" {
            fast_events.push(event);
            if terminal {
                fast_done_at = Some(started.elapsed());
            }
        } else {
            slow_events.push(event);
        }
    }

    let fast_done_at = fast_done_at.unwrap();
    assert!(
        fast_done_at < Duration::from_millis(300),
        "fast stream finished after {:?}",
        fast_done_at
    );

    let fast_text: Vec<String> = fast_events
        .iter()
        .filter_map(|e| match e.payload {
            EventPayload::TextChunk { ref content, .. } => Some(content.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(fast_text, vec!["f0 ", "f1 ", "f2 ", "f3 ", "f4 "]);
    assert_eq!(kind(fast_events.first().unwrap()), "initialized");
    assert_eq!(kind(fast_events.last().unwrap()), "completed");

    let slow_kinds: Vec<&str> = slow_events.iter().map(kind).collect();
    assert_eq!(slow_kinds, vec!["initialized", "text_chunk", "completed"]);
}
