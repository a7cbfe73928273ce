// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use tokio::sync::oneshot;
use uuid::Uuid;

use hermod_model::{Message, Usage};

use crate::session::SessionKey;

/// Synthetic message submitted by the idle producer on the cron lane.
pub const HEARTBEAT_POLL: &str = "HEARTBEAT_POLL";
/// Literal reply meaning "nothing to say" on a heartbeat turn; suppressed.
pub const HEARTBEAT_OK: &str = "HEARTBEAT_OK";
/// Literal reply meaning "stay silent" on an ordinary user turn; suppressed.
pub const NO_REPLY: &str = "NO_REPLY";

/// One submission to the gateway.  Immutable once constructed.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub run_id: Uuid,
    pub session_key: SessionKey,
    pub agent_id: String,
    pub message: String,
    pub channel: Option<String>,
    /// Set for subagent runs; `None` for top-level submissions.
    pub parent_run_id: Option<Uuid>,
    /// Spawn depth: 0 for top-level runs, parent depth + 1 for children.
    pub depth: u8,
    pub stream: bool,
}

impl RunRequest {
    pub fn new(session_key: SessionKey, agent_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            session_key,
            agent_id: agent_id.into(),
            message: message.into(),
            channel: None,
            parent_run_id: None,
            depth: 0,
            stream: true,
        }
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }
}

/// What a completed run hands back to its submitter.
#[derive(Debug, Clone, Default)]
pub struct RunOutcome {
    /// Channel-deliverable reply text.  `None` when the model chose silence
    /// (`NO_REPLY`, `HEARTBEAT_OK`) or produced only tool traffic.
    pub reply: Option<String>,
    /// Messages this run appended to the session, in append order.
    pub messages: Vec<Message>,
    pub usage: Usage,
}

/// Delivered exactly once on the submission's result channel.
pub type RunReply = Result<RunOutcome, GatewayError>;

/// Errors observed at the core boundary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    /// Submission after `mark_draining()`; caller retries later.
    #[error("gateway is draining; submission refused")]
    Draining,
    /// `drop = new` and the pending queue is saturated.
    #[error("session queue is full")]
    QueueFull,
    /// Evicted by `drop = old` to make room for a newer request.
    #[error("request dropped to make room for a newer one")]
    QueueDropped,
    /// Enqueued before an abort cutoff; skipped without running.
    #[error("request predates an abort cutoff; skipped as stale")]
    MessageStale,
    /// The queue was hard-reset during an in-process reload.
    #[error("session queue was cleared during restart; resubmit")]
    LaneCleared,
    /// Normal user or session cancel; not a failure.
    #[error("run cancelled")]
    Cancelled,
    /// Upstream LLM failure; terminates the run.
    #[error("provider error: {0}")]
    Provider(String),
    /// The target lane refused the job (full or closed).
    #[error("lane rejected job: {0}")]
    LaneRejected(String),
    /// Unexpected core failure (e.g. the session store could not commit).
    #[error("internal error: {0}")]
    Internal(String),
}

/// One scheduled start.  Under a collapsing debounce window several queued
/// requests become a single run: the newest supplies the prompt and
/// `context_messages` carries the older message bodies, in enqueue order,
/// to be appended to history before the prompt.
#[derive(Debug, Clone)]
pub struct RunBatch {
    pub request: RunRequest,
    pub context_messages: Vec<String>,
}

impl RunBatch {
    pub fn single(request: RunRequest) -> Self {
        Self { request, context_messages: Vec::new() }
    }
}

/// Executes one run.  Implemented by the agent loop; tests substitute
/// lightweight doubles to exercise the scheduling machinery in isolation.
///
/// `cancel` resolves (value or sender drop) when the run is cancelled;
/// implementations must observe it at every suspension point.
#[async_trait]
#[async_trait]
pub trait RunHandler: Send + Sync {
    async fn run(&self, batch: RunBatch, cancel: oneshot::Receiver<()>) -> RunReply;
}

/// Seam through which the spawn tool re-enters the scheduler on the
/// subagent lane.  Keeps the core crate free of a gateway dependency.
#[async_trait]
pub trait SubagentSpawner: Send + Sync {
    async fn spawn(
        &self,
        request: RunRequest,
    ) -> Result<oneshot::Receiver<RunReply>, GatewayError>;
}

/// Per-run context threaded through provider calls, tool executions, and
/// store writes (as tracing span fields).
#[derive(Debug, Clone)]
pub struct RunContext {
    pub trace_id: Uuid,
    pub parent_run_id: Option<Uuid>,
    pub agent_id: String,
    pub session_key: SessionKey,
}

impl RunContext {
    pub fn for_request(req: &RunRequest) -> Self {
        Self {
            trace_id: Uuid::new_v4(),
            parent_run_id: req.parent_run_id,
            agent_id: req.agent_id.clone(),
            session_key: req.session_key.clone(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionKey;

    #[test]
    fn new_requests_get_unique_run_ids() {
        let k = SessionKey::heartbeat("a");
        let a = RunRequest::new(k.clone(), "a", "hi");
        let b = RunRequest::new(k, "a", "hi");
        assert_ne!(a.run_id, b.run_id);
        assert_eq!(a.depth, 0);
        assert!(a.parent_run_id.is_none());
    }

    #[test]
    fn batch_single_has_no_context() {
        let req = RunRequest::new(SessionKey::heartbeat("a"), "a", "m");
        let b = RunBatch::single(req);
        assert!(b.context_messages.is_empty());
    }

    #[test]
    fn gateway_errors_are_distinguishable() {
        assert_ne!(GatewayError::QueueFull, GatewayError::QueueDropped);
        assert_eq!(GatewayError::Cancelled, GatewayError::Cancelled);
    }

    #[test]
    fn error_messages_name_the_condition() {
        assert!(GatewayError::Draining.to_string().contains("draining"));
        assert!(GatewayError::MessageStale.to_string().contains("stale"));
        assert!(GatewayError::Provider("boom".into()).to_string().contains("boom"));
    }
}
