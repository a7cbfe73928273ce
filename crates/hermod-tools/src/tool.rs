// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::Value;

/// A single tool invocation requested by the model.
#[derive(Debug, Clone)]
pub struct ToolCall {
    /// Opaque identifier returned by the model (forwarded verbatim)
    pub id: String,
    pub name: String,
    /// Parsed JSON arguments
    pub args: Value,
}

/// The result of executing a tool.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub call_id: String,
    pub content: String,
    /// If true, the tool execution failed non-fatally (returned error message).
    pub is_error: bool,
}

impl ToolOutput {
    /// Successful plain-text result.
    pub fn ok(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self { call_id: call_id.into(), content: content.into(), is_error: false }
    }

    /// Error result containing a plain-text error message.
    pub fn err(call_id: impl Into<String>, msg: impl Into<String>) -> Self {
        Self { call_id: call_id.into(), content: msg.into(), is_error: true }
    }
}

/// Coarse capability class of a tool, used for policy gating and deadline
/// selection.  Tools declare what they touch; the policy layer and the agent
/// loop never hard-code tool names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ToolCapability {
    /// Reads local or remote state without side effects.
    #[default]
    Read,
    /// Mutates files or durable state.
    Write,
    /// Runs external processes (sandboxed exec); gets the long deadline.
    Exec,
    /// Sends user-visible output through a channel.
    Messaging,
    /// Spawns subagent runs.
    Spawn,
}

/// Trait that every built-in and user-defined tool must implement.
/// MCP-bridged and user-defined tools register through this same interface.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for parameters
    fn parameters_schema(&self) -> Value;
    /// What this tool touches.  Drives policy gating and deadlines.
    fn capability(&self) -> ToolCapability {
        ToolCapability::Read
    }
    /// Execute the tool.  Errors should be wrapped in [`ToolOutput::err`].
    async fn execute(&self, call: &ToolCall) -> ToolOutput;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
