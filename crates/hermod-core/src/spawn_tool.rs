// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use hermod_config::SubagentConfig;
use hermod_tools::{Tool, ToolCall, ToolCapability, ToolOutput};

use crate::runs::{GatewayError, RunRequest, SubagentSpawner};
use crate::session::SessionKey;
use crate::store::SessionStore;

/// The `spawn` tool: delegates a focused task to a child agent run.
///
/// One instance exists per parent run, bound to the parent's identity so the
/// per-parent child bound needs no shared bookkeeping.  The child re-enters
/// the scheduler on the subagent lane through the [`SubagentSpawner`] seam.
///
/// Completion is push-style: a watcher task appends the child's final text
/// to the parent's session as an announce message, which the parent picks up
/// on its next turn.  Parents never poll.
pub struct SpawnTool {
    spawner: Arc<dyn SubagentSpawner>,
    store: Arc<SessionStore>,
    agent_id: String,
    parent_run_id: Uuid,
    parent_session_key: SessionKey,
    parent_depth: u8,
    limits: SubagentConfig,
    /// Children spawned by this parent run.
    children: AtomicUsize,
    /// Subagents currently running anywhere in the process.
    global_active: Arc<AtomicUsize>,
}

impl SpawnTool {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        spawner: Arc<dyn SubagentSpawner>,
        store: Arc<SessionStore>,
        agent_id: impl Into<String>,
        parent_run_id: Uuid,
        parent_session_key: SessionKey,
        parent_depth: u8,
        limits: SubagentConfig,
        global_active: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            spawner,
            store,
            agent_id: agent_id.into(),
            parent_run_id,
            parent_session_key,
            parent_depth,
            limits,
            children: AtomicUsize::new(0),
            global_active,
        }
    }

    /// Reserve one slot in the global concurrent-subagent budget.
    fn try_acquire_global(&self) -> bool {
        let mut current = self.global_active.load(Ordering::Acquire);
        loop {
            if current >= self.limits.max_concurrent {
                return false;
            }
            match self.global_active.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }
}

#[async_trait]
impl Tool for SpawnTool {
    fn name(&self) -> &str {
        "spawn"
    }

    fn description(&self) -> &str {
        "Spawn a subagent to complete a focused task. The subagent runs \
         independently and its result is announced back into this conversation \
         when it finishes; do not wait or poll for it."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "prompt": {
                    "type": "string",
                    "description": "The task description for the subagent"
                },
                "label": {
                    "type": "string",
                    "description": "Short human-readable task label"
                }
            },
            "required": ["prompt"]
        })
    }

    fn capability(&self) -> ToolCapability {
        ToolCapability::Spawn
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let prompt = match call.args.get("prompt").and_then(|v| v.as_str()) {
            Some(p) if !p.is_empty() => p.to_string(),
            _ => return ToolOutput::err(&call.id, "missing 'prompt'"),
        };
        let label = call
            .args
            .get("label")
            .and_then(|v| v.as_str())
            .unwrap_or("subagent task")
            .to_string();

        if self.parent_depth >= self.limits.max_depth {
            return ToolOutput::err(
                &call.id,
                format!("maximum subagent depth ({}) reached", self.limits.max_depth),
            );
        }
        if self.children.load(Ordering::Acquire) >= self.limits.max_children {
            return ToolOutput::err(
                &call.id,
                format!(
                    "this run already spawned the maximum of {} subagents",
                    self.limits.max_children
                ),
            );
        }
        if !self.try_acquire_global() {
            return ToolOutput::err(
                &call.id,
                format!(
                    "too many subagents running ({}); try again later",
                    self.limits.max_concurrent
                ),
            );
        }

        let nonce = Uuid::new_v4().simple().to_string();
        let child = RunRequest {
            run_id: Uuid::new_v4(),
            session_key: SessionKey::subagent(
                &self.agent_id,
                &self.parent_run_id.simple().to_string(),
                &nonce[..8],
            ),
            agent_id: self.agent_id.clone(),
            message: prompt,
            channel: None,
            parent_run_id: Some(self.parent_run_id),
            depth: self.parent_depth + 1,
            stream: false,
        };
        let child_id = child.run_id;

        let reply_rx = match self.spawner.spawn(child).await {
            Ok(rx) => rx,
            Err(e) => {
                self.global_active.fetch_sub(1, Ordering::AcqRel);
                return ToolOutput::err(&call.id, format!("spawn refused: {e}"));
            }
        };
        self.children.fetch_add(1, Ordering::AcqRel);
        debug!(
            child_run_id = %child_id,
            depth = self.parent_depth + 1,
            "subagent spawned"
        );

        // Watcher: announce the result into the parent session when the
        // child finishes, then release the global slot.
        let store = Arc::clone(&self.store);
        let parent_key = self.parent_session_key.clone();
        let global = Arc::clone(&self.global_active);
        tokio::spawn(async move {
            let reply = reply_rx.await;
            global.fetch_sub(1, Ordering::AcqRel);
            let announce = match reply {
                Ok(Ok(outcome)) => format!(
                    "[Subagent '{label}' ({child_id}) finished]\n{}",
                    outcome.reply.as_deref().unwrap_or("(no text output)")
                ),
                Ok(Err(GatewayError::Cancelled)) => {
                    format!("[Subagent '{label}' ({child_id}) was cancelled]")
                }
                Ok(Err(e)) => format!("[Subagent '{label}' ({child_id}) failed: {e}]"),
                Err(_) => format!("[Subagent '{label}' ({child_id}) was dropped before completing]"),
            };
            if let Err(e) = store
                .append_message(&parent_key, hermod_model::Message::user(announce))
                .await
            {
                warn!(error = %e, "failed to announce subagent result");
            }
        });

        ToolOutput::ok(
            &call.id,
            format!(
                "spawned subagent {child_id} at depth {}; its result will be \
                 announced to this session when it completes",
                self.parent_depth + 1
            ),
        )
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use tokio::sync::oneshot;

    use crate::runs::{RunOutcome, RunReply};

    use super::*;

    /// Spawner double: records requests, optionally completes them.
    struct RecordingSpawner {
        requests: std::sync::Mutex<Vec<RunRequest>>,
        replies: std::sync::Mutex<Vec<oneshot::Sender<RunReply>>>,
    }

    impl RecordingSpawner {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                requests: std::sync::Mutex::new(Vec::new()),
                replies: std::sync::Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl SubagentSpawner for RecordingSpawner {
        async fn spawn(
            &self,
            request: RunRequest,
        ) -> Result<oneshot::Receiver<RunReply>, GatewayError> {
            self.requests.lock().unwrap().push(request);
            let (tx, rx) = oneshot::channel();
            self.replies.lock().unwrap().push(tx);
            Ok(rx)
        }
    }

    fn tool_at_depth(
        spawner: Arc<RecordingSpawner>,
        store: Arc<SessionStore>,
        depth: u8,
    ) -> SpawnTool {
        SpawnTool::new(
            spawner,
            store,
            "ada",
            Uuid::new_v4(),
            SessionKey::direct("ada", "web", "u1"),
            depth,
            SubagentConfig::default(),
            Arc::new(AtomicUsize::new(0)),
        )
    }

    fn spawn_call(prompt: &str) -> ToolCall {
        ToolCall {
            id: "tc-1".into(),
            name: "spawn".into(),
            args: json!({ "prompt": prompt }),
        }
    }

    #[tokio::test]
    async fn spawn_submits_child_with_derived_key_and_depth() {
        let spawner = RecordingSpawner::new();
        let store = Arc::new(SessionStore::in_memory());
        let tool = tool_at_depth(Arc::clone(&spawner), store, 1);

        let out = tool.execute(&spawn_call("do the thing")).await;
        assert!(!out.is_error, "{}", out.content);

        let reqs = spawner.requests.lock().unwrap();
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].depth, 2);
        assert!(reqs[0].session_key.as_str().contains(":subagent:"));
        assert!(reqs[0].parent_run_id.is_some());
    }

    #[tokio::test]
    async fn depth_bound_rejects_without_enqueuing() {
        let spawner = RecordingSpawner::new();
        let store = Arc::new(SessionStore::in_memory());
        let tool = tool_at_depth(Arc::clone(&spawner), store, 5);

        let out = tool.execute(&spawn_call("too deep")).await;
        assert!(out.is_error);
        assert!(out.content.contains("depth"));
        assert!(spawner.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn global_concurrency_bound_rejects() {
        let spawner = RecordingSpawner::new();
        let store = Arc::new(SessionStore::in_memory());
        let global = Arc::new(AtomicUsize::new(0));
        let limits = SubagentConfig { max_concurrent: 1, ..Default::default() };
        let tool = SpawnTool::new(
            Arc::clone(&spawner) as Arc<dyn SubagentSpawner>,
            store,
            "ada",
            Uuid::new_v4(),
            SessionKey::direct("ada", "web", "u1"),
            0,
            limits,
            global,
        );

        assert!(!tool.execute(&spawn_call("first")).await.is_error);
        let second = tool.execute(&spawn_call("second")).await;
        assert!(second.is_error);
        assert!(second.content.contains("too many subagents"));
    }

    #[tokio::test]
    async fn missing_prompt_is_an_error() {
        let spawner = RecordingSpawner::new();
        let store = Arc::new(SessionStore::in_memory());
        let tool = tool_at_depth(spawner, store, 0);
        let call = ToolCall { id: "x".into(), name: "spawn".into(), args: json!({}) };
        let out = tool.execute(&call).await;
        assert!(out.is_error);
    }

    #[tokio::test]
    async fn child_result_is_announced_to_parent_session() {
        let spawner = RecordingSpawner::new();
        let store = Arc::new(SessionStore::in_memory());
        let parent_key = SessionKey::direct("ada", "web", "u1");
        let tool = SpawnTool::new(
            Arc::clone(&spawner) as Arc<dyn SubagentSpawner>,
            Arc::clone(&store),
            "ada",
            Uuid::new_v4(),
            parent_key.clone(),
            0,
            SubagentConfig::default(),
            Arc::new(AtomicUsize::new(0)),
        );

        assert!(!tool.execute(&spawn_call("research")).await.is_error);

        // Complete the child.
        let tx = spawner.replies.lock().unwrap().pop().unwrap();
        tx.send(Ok(RunOutcome {
            reply: Some("child findings".into()),
            ..Default::default()
        }))
        .unwrap();

        // The watcher task appends asynchronously.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let data = store.load(&parent_key).await;
        assert_eq!(data.messages.len(), 1);
        assert!(data.messages[0]
            .as_text()
            .unwrap()
            .contains("child findings"));
    }
}
