// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::oneshot;
use tracing::{warn, Instrument};

use hermod_config::AgentConfig;
use hermod_model::{
    sanitize::sanitize_history, CompletionRequest, Message, ModelProvider, ResponseEvent, Usage,
};
use hermod_tools::{ToolCall, ToolCapability, ToolOutput, ToolPolicy, ToolRegistry};

use crate::events::{EventBus, RunEvent};
use crate::prompts::{system_prompt, PromptContext};
use crate::runs::{
    GatewayError, RunBatch, RunContext, RunHandler, RunReply, RunOutcome, SubagentSpawner,
    HEARTBEAT_OK, NO_REPLY,
};
use crate::spawn_tool::SpawnTool;
use crate::store::SessionStore;

const TRUNCATION_NOTICE: &str =
    "[Run truncated: the tool-call iteration limit was reached before the \
     task finished. Ask me to continue if needed.]";

/// The agent loop: drives think–act–observe for one run at a time.
///
/// Stateless across runs — all durable state lives in the [`SessionStore`],
/// and each run writes through its own buffered handle so parallel runs on
/// one session cannot interleave their appends.
pub struct AgentRunner {
    store: Arc<SessionStore>,
    tools: Arc<ToolRegistry>,
    model: Arc<dyn ModelProvider>,
    config: Arc<AgentConfig>,
    policy: Arc<ToolPolicy>,
    events: EventBus,
    /// Late-bound: the scheduler is constructed with this runner as its
    /// handler, then binds itself back here as the spawn seam.
    spawner: OnceLock<Arc<dyn SubagentSpawner>>,
    subagents_active: Arc<AtomicUsize>,
    owner: Option<String>,
    workspace: Option<PathBuf>,
    context_files: Vec<String>,
}

impl AgentRunner {
    pub fn new(
        store: Arc<SessionStore>,
        tools: Arc<ToolRegistry>,
        model: Arc<dyn ModelProvider>,
        config: Arc<AgentConfig>,
    ) -> Self {
        Self {
            store,
            tools,
            model,
            config,
            policy: Arc::new(ToolPolicy::default()),
            events: EventBus::default(),
            spawner: OnceLock::new(),
            subagents_active: Arc::new(AtomicUsize::new(0)),
            owner: None,
            workspace: None,
            context_files: Vec::new(),
        }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn with_policy(mut self, policy: ToolPolicy) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    /// Enable the `spawn` tool; children re-enter the scheduler through
    /// `spawner` on the subagent lane.  May be called at most once, after
    /// the runner is already shared with the scheduler.
    pub fn bind_spawner(&self, spawner: Arc<dyn SubagentSpawner>) {
        let _ = self.spawner.set(spawner);
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn with_workspace(mut self, workspace: PathBuf) -> Self {
        self.workspace = Some(workspace);
        self
    }

    pub fn with_context_files(mut self, files: Vec<String>) -> Self {
        self.context_files = files;
        self
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Registry for one run: the shared tool set, plus a `spawn` tool bound
    /// to this run's identity when a spawner is wired in.
    fn run_registry(&self, batch: &RunBatch) -> ToolRegistry {
        let req = &batch.request;
        match self.spawner.get() {
            Some(spawner) => self.tools.child_with(Arc::new(SpawnTool::new(
                Arc::clone(spawner),
                Arc::clone(&self.store),
                req.agent_id.clone(),
                req.run_id,
                req.session_key.clone(),
                req.depth,
                self.config.subagents.clone(),
                Arc::clone(&self.subagents_active),
            ))),
            None => (*self.tools).clone(),
        }
    }

    fn compose_system_prompt(&self, batch: &RunBatch, tool_names: &[String]) -> Message {
        let ctx = PromptContext {
            agent_id: &batch.request.agent_id,
            tool_names,
            skills_hint: None,
            workspace: self.workspace.as_deref(),
            owner: self.owner.as_deref(),
            context_files: &self.context_files,
            depth: batch.request.depth,
            max_depth: self.config.subagents.max_depth,
            fingerprint: concat!("hermod ", env!("CARGO_PKG_VERSION"), " (tokio)"),
        };
        Message::system(system_prompt(&ctx))
    }

    fn tool_deadline(&self, capability: ToolCapability) -> Duration {
        match capability {
            ToolCapability::Exec => Duration::from_secs(self.config.exec_tool_timeout_secs),
            _ => Duration::from_secs(self.config.tool_timeout_secs),
        }
    }

    /// Terminal path for a cancelled run.  Cancellation is normal operation,
    /// never a failure: it gets its own `run.cancelled` terminal event so
    /// sinks that alert on `run.failed` stay quiet for `/stop` and session
    /// cancels.
    fn cancelled(&self, run_id: uuid::Uuid) -> RunReply {
        self.events.emit(RunEvent::RunCancelled { run_id });
        Err(GatewayError::Cancelled)
    }

    /// Call the model once, streaming chunks through the event bus and
    /// collecting tool-call fragments.  Returns (text, tool_calls, usage).
    async fn stream_one_turn(
        &self,
        run_id: uuid::Uuid,
        messages: Vec<Message>,
        tools: Vec<hermod_model::ToolSchema>,
        stream: bool,
    ) -> anyhow::Result<(String, Vec<ToolCall>, Usage)> {
        let req = CompletionRequest { messages, tools, stream };
        let mut response = self.model.complete(req).await?;

        let mut full_text = String::new();
        let mut usage = Usage::default();
        // Keyed by the parallel-tool-call index from the provider: chunks
        // for different tool calls arrive interleaved by index.
        let mut pending: HashMap<u32, PendingToolCall> = HashMap::new();

        while let Some(event) = response.next().await {
            match event? {
                ResponseEvent::TextDelta(delta) if !delta.is_empty() => {
                    full_text.push_str(&delta);
                    self.events.emit(RunEvent::Chunk { run_id, content: delta });
                }
                ResponseEvent::ThinkingDelta(delta) => {
                    self.events.emit(RunEvent::Thinking { run_id, content: delta });
                }
                ResponseEvent::ToolCall { index, id, name, arguments } => {
                    let p = pending.entry(index).or_default();
                    if !id.is_empty() {
                        p.id = id;
                    }
                    if !name.is_empty() {
                        p.name = name;
                    }
                    p.args_buf.push_str(&arguments);
                }
                ResponseEvent::Usage { input_tokens, output_tokens } => {
                    usage.add(Usage { input_tokens, output_tokens });
                }
                ResponseEvent::Done => break,
                ResponseEvent::Error(e) => {
                    warn!(%run_id, "model stream error: {e}");
                }
                _ => {}
            }
        }

        // Flush accumulated parallel tool calls, ordered by index.  Calls
        // with an empty name cannot be dispatched and are dropped — storing
        // them would corrupt the history replayed on the next turn.
        let mut sorted: Vec<(u32, PendingToolCall)> = pending.into_iter().collect();
        sorted.sort_by_key(|(idx, _)| *idx);
        let mut tool_calls = Vec::with_capacity(sorted.len());
        for (i, (_, p)) in sorted.into_iter().enumerate() {
            if p.name.is_empty() {
                warn!(tool_call_id = %p.id, "dropping tool call with empty name");
                continue;
            }
            tool_calls.push(p.finish(i));
        }

        Ok((full_text, tool_calls, usage))
    }
}

#[async_trait]
impl RunHandler for AgentRunner {
    async fn run(&self, batch: RunBatch, mut cancel: oneshot::Receiver<()>) -> RunReply {
        let ctx = RunContext::for_request(&batch.request);
        let span = tracing::info_span!(
            "run",
            run_id = %batch.request.run_id,
            trace_id = %ctx.trace_id,
            session_key = %batch.request.session_key,
            agent_id = %ctx.agent_id,
        );

        async move {
            let req = &batch.request;
            let run_id = req.run_id;
            let key = &req.session_key;

            self.events.emit(RunEvent::RunStarted {
                run_id,
                session_key: key.as_str().to_string(),
            });

            // Proactive compaction, before this run snapshots its history.
            if let Err(e) = self
                .store
                .compact_if_needed(key, &self.config.compaction, &*self.model)
                .await
            {
                warn!(error = %e, "pre-run compaction failed; continuing uncompacted");
            }

            let registry = self.run_registry(&batch);
            let tool_names = registry.names();
            let schemas: Vec<hermod_model::ToolSchema> = registry
                .schemas()
                .into_iter()
                .map(|s| hermod_model::ToolSchema {
                    name: s.name,
                    description: s.description,
                    parameters: s.parameters,
                })
                .collect();
            let system = self.compose_system_prompt(&batch, &tool_names);

            let mut handle = Arc::clone(&self.store).begin_concurrent_write(key).await;
            if let Some(channel) = &req.channel {
                handle.set_channel(channel.clone());
            }
            // Older messages collapsed into this run land in history first,
            // in enqueue order; the newest is the prompt.
            for earlier in &batch.context_messages {
                handle.append(Message::user(earlier.clone()));
            }
            handle.append(Message::user(req.message.clone()));

            for _iteration in 0..self.config.max_iterations {
                // Cancellation check between provider calls.  A dropped
                // sender counts as cancellation too.
                match cancel.try_recv() {
                    Err(oneshot::error::TryRecvError::Empty) => {}
                    _ => return self.cancelled(run_id),
                }

                let mut messages = vec![system.clone()];
                messages.extend(sanitize_history(handle.history()));

                let provider_deadline = Duration::from_secs(self.config.provider_timeout_secs);
                let turn = tokio::select! {
                    biased;
                    _ = &mut cancel => return self.cancelled(run_id),
                    result = tokio::time::timeout(
                        provider_deadline,
                        self.stream_one_turn(run_id, messages, schemas.clone(), req.stream),
                    ) => result.unwrap_or_else(|_| {
                        Err(anyhow::anyhow!(
                            "provider call exceeded {}s deadline",
                            provider_deadline.as_secs()
                        ))
                    }),
                };

                let (text, tool_calls, usage) = match turn {
                    Ok(t) => t,
                    Err(e) => {
                        // Provider failure terminates the run; surface it in
                        // the history so the session shows what happened.
                        handle.append(Message::assistant(format!("Error: {e}")));
                        let _ = handle.commit().await;
                        self.events.emit(RunEvent::RunFailed {
                            run_id,
                            error: e.to_string(),
                        });
                        return Err(GatewayError::Provider(e.to_string()));
                    }
                };
                handle.add_usage(usage);

                if tool_calls.is_empty() {
                    if !text.is_empty() {
                        handle.append(Message::assistant(text.clone()));
                    }
                    let usage = handle.usage();
                    let appended = handle
                        .commit()
                        .await
                        .map_err(|e| GatewayError::Internal(format!("session commit: {e}")))?;
                    self.events.emit(RunEvent::RunCompleted { run_id });
                    let silent =
                        text.is_empty() || text == HEARTBEAT_OK || text == NO_REPLY;
                    return Ok(RunOutcome {
                        reply: if silent { None } else { Some(text) },
                        messages: appended,
                        usage,
                    });
                }

                for tc in &tool_calls {
                    // Cancellation check between tool calls.
                    match cancel.try_recv() {
                        Err(oneshot::error::TryRecvError::Empty) => {}
                        _ => return self.cancelled(run_id),
                    }

                    handle.append(Message::tool_call(&tc.id, &tc.name, tc.args.to_string()));
                    self.events.emit(RunEvent::ToolCall {
                        run_id,
                        call_id: tc.id.clone(),
                        tool: tc.name.clone(),
                    });

                    let deadline = self.tool_deadline(registry.capability(&tc.name));
                    let output = tokio::select! {
                        biased;
                        _ = &mut cancel => return self.cancelled(run_id),
                        result = tokio::time::timeout(deadline, registry.execute_gated(tc, &self.policy)) => {
                            result.unwrap_or_else(|_| {
                                ToolOutput::err(
                                    &tc.id,
                                    format!("tool '{}' timed out after {}s", tc.name, deadline.as_secs()),
                                )
                            })
                        }
                    };

                    self.events.emit(RunEvent::ToolResult {
                        run_id,
                        call_id: tc.id.clone(),
                        is_error: output.is_error,
                    });
                    // Tool failure is recovered locally: feed the error back
                    // to the model as a result and keep looping.
                    let content = if output.is_error {
                        format!("Error: {}", output.content)
                    } else {
                        output.content
                    };
                    handle.append(Message::tool_result(&tc.id, content));
                }
            }

            // Iteration budget exhausted.
            handle.append(Message::assistant(TRUNCATION_NOTICE));
            let usage = handle.usage();
            let appended = handle
                .commit()
                .await
                .map_err(|e| GatewayError::Internal(format!("session commit: {e}")))?;
            self.events.emit(RunEvent::RunCompleted { run_id });
            Ok(RunOutcome {
                reply: Some(TRUNCATION_NOTICE.to_string()),
                messages: appended,
                usage,
            })
        }
        .instrument(span)
        .await
    }
}

#[derive(Default)]
struct PendingToolCall {
    id: String,
    name: String,
    args_buf: String,
}

impl PendingToolCall {
    fn finish(self, ordinal: usize) -> ToolCall {
        // Always resolve to a JSON object: providers require tool arguments
        // to be an object, and `null` poisons the next completion request.
        let args = if self.args_buf.is_empty() {
            serde_json::Value::Object(Default::default())
        } else {
            serde_json::from_str(&self.args_buf).unwrap_or_else(|e| {
                warn!(
                    tool_name = %self.name,
                    error = %e,
                    "model sent invalid JSON tool arguments; substituting {{}}"
                );
                serde_json::Value::Object(Default::default())
            })
        };
        let id = if self.id.is_empty() {
            // An empty id violates provider id constraints; synthesise one.
            format!("tc_synthetic_{ordinal}")
        } else {
            self.id
        };
        ToolCall { id, name: self.name, args }
    }
}
