// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Events emitted over the lifetime of one run.
/// Consumers (feedback controller, UI bridge) subscribe to these; the agent
/// loop never holds references to its subscribers.
///
/// Serialises as `{"name": "...", "payload": {...}}` for the event sink.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "name", content = "payload")]
pub enum RunEvent {
    #[serde(rename = "run.started")]
    RunStarted { run_id: Uuid, session_key: String },
    #[serde(rename = "run.completed")]
    RunCompleted { run_id: Uuid },
    #[serde(rename = "run.failed")]
    RunFailed { run_id: Uuid, error: String },
    /// A user or session cancel ended the run.  Deliberately not a
    /// `RunFailed`: cancellation is normal operation, and sinks that alert
    /// on failures must not fire for it.
    #[serde(rename = "run.cancelled")]
    RunCancelled { run_id: Uuid },
    /// A text chunk streamed from the model.
    #[serde(rename = "chunk")]
    Chunk { run_id: Uuid, content: String },
    /// A reasoning chunk, when the provider exposes thinking.
    #[serde(rename = "thinking")]
    Thinking { run_id: Uuid, content: String },
    #[serde(rename = "tool.call")]
    ToolCall { run_id: Uuid, call_id: String, tool: String },
    #[serde(rename = "tool.result")]
    ToolResult { run_id: Uuid, call_id: String, is_error: bool },
}

impl RunEvent {
    pub fn run_id(&self) -> Uuid {
        match self {
            RunEvent::RunStarted { run_id, .. }
            | RunEvent::RunCompleted { run_id }
            | RunEvent::RunFailed { run_id, .. }
            | RunEvent::RunCancelled { run_id }
            | RunEvent::Chunk { run_id, .. }
            | RunEvent::Thinking { run_id, .. }
            | RunEvent::ToolCall { run_id, .. }
            | RunEvent::ToolResult { run_id, .. } => *run_id,
        }
    }

    /// True for `run.completed`, `run.failed`, and `run.cancelled`.
    /// No events for a run follow its terminal one.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunEvent::RunCompleted { .. }
                | RunEvent::RunFailed { .. }
                | RunEvent::RunCancelled { .. }
        )
    }
}

/// Broadcast fan-out for run events.  Copy-send: slow consumers lag and
/// lose old events rather than backpressuring the agent loop, and the bus
/// holds no references to its subscribers.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RunEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn emit(&self, event: RunEvent) {
        // No receivers is fine; events are fire-and-forget.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_emitted_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let id = Uuid::new_v4();
        bus.emit(RunEvent::RunCompleted { run_id: id });
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.run_id(), id);
        assert!(ev.is_terminal());
    }

    #[test]
    fn emit_without_subscribers_does_not_panic() {
        let bus = EventBus::default();
        bus.emit(RunEvent::RunCompleted { run_id: Uuid::new_v4() });
    }

    #[test]
    fn events_serialise_with_dotted_names() {
        let ev = RunEvent::RunStarted {
            run_id: Uuid::nil(),
            session_key: "agent:a:heartbeat".into(),
        };
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains(r#""name":"run.started""#), "{json}");
        assert!(json.contains(r#""payload""#), "{json}");
    }

    #[test]
    fn chunk_is_not_terminal() {
        let ev = RunEvent::Chunk { run_id: Uuid::nil(), content: "x".into() };
        assert!(!ev.is_terminal());
    }

    #[test]
    fn cancelled_is_terminal_but_distinct_from_failed() {
        let ev = RunEvent::RunCancelled { run_id: Uuid::nil() };
        assert!(ev.is_terminal());
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains(r#""name":"run.cancelled""#), "{json}");
        assert!(!json.contains("run.failed"), "{json}");
    }
}
