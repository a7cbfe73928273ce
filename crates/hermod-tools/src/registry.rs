// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::policy::{PolicyDecision, ToolPolicy};
use crate::tool::{Tool, ToolCall, ToolCapability, ToolOutput};

/// A tool schema – mirrors hermod_model::ToolSchema but keeps the tools
/// crate independent from the model crate.
#[derive(Debug, Clone)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Central registry holding all available tools.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: HashMap::new() }
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Clone of this registry with one extra tool.  Used to build per-run
    /// registries (e.g. a spawn tool bound to the parent run's identity).
    pub fn child_with(&self, tool: Arc<dyn Tool>) -> Self {
        let mut child = self.clone();
        child.register_arc(tool);
        child
    }

    /// Capability of a registered tool; unknown names report `Read`.
    pub fn capability(&self, name: &str) -> ToolCapability {
        self.tools
            .get(name)
            .map(|t| t.capability())
            .unwrap_or_default()
    }

    /// Produce schemas for all registered tools, sorted by name.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self
            .tools
            .values()
            .map(|t| ToolSchema {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
            })
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    pub async fn execute(&self, call: &ToolCall) -> ToolOutput {
        match self.tools.get(&call.name) {
            Some(tool) => tool.execute(call).await,
            None => ToolOutput::err(&call.id, format!("unknown tool: {}", call.name)),
        }
    }

    /// Policy-gated execution.  A blocked tool is never invoked; the model
    /// receives a synthetic error result instead.
    pub async fn execute_gated(&self, call: &ToolCall, policy: &ToolPolicy) -> ToolOutput {
        match policy.evaluate(&call.name, self.capability(&call.name)) {
            PolicyDecision::Allow => self.execute(call).await,
            PolicyDecision::Deny(reason) => {
                debug!(tool = %call.name, %reason, "tool call blocked by policy");
                ToolOutput::err(&call.id, format!("blocked by policy: {reason}"))
            }
        }
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::{json, Value};

    use super::*;
    use crate::policy::ToolProfile;

    /// Minimal no-op tool for registry tests.
    struct EchoTool {
        name: &'static str,
        capability: ToolCapability,
    }

    impl EchoTool {
        fn named(name: &'static str) -> Self {
            Self { name, capability: ToolCapability::Read }
        }
    }

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "echoes its input"
        }
        fn parameters_schema(&self) -> Value {
            json!({ "type": "object" })
        }
        fn capability(&self) -> ToolCapability {
            self.capability
        }
        async fn execute(&self, call: &ToolCall) -> ToolOutput {
            ToolOutput::ok(&call.id, format!("echo:{}", call.args))
        }
    }

    #[test]
    fn register_and_get() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool::named("echo"));
        assert!(reg.get("echo").is_some());
    }

    #[test]
    fn get_unknown_returns_none() {
        let reg = ToolRegistry::new();
        assert!(reg.get("nope").is_none());
    }

    #[test]
    fn schemas_sorted_by_name() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool::named("zeta"));
        reg.register(EchoTool::named("alpha"));
        let names: Vec<_> = reg.schemas().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    #[test]
    fn child_with_does_not_mutate_parent() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool::named("base"));
        let child = reg.child_with(Arc::new(EchoTool::named("extra")));
        assert!(child.get("extra").is_some());
        assert!(reg.get("extra").is_none());
    }

    #[tokio::test]
    async fn execute_known_tool_succeeds() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool::named("echo"));
        let call = ToolCall { id: "1".into(), name: "echo".into(), args: json!({"x":1}) };
        let out = reg.execute(&call).await;
        assert!(!out.is_error);
        assert!(out.content.starts_with("echo:"));
    }

    #[tokio::test]
    async fn execute_unknown_tool_returns_error() {
        let reg = ToolRegistry::new();
        let call = ToolCall { id: "x".into(), name: "missing".into(), args: json!({}) };
        let out = reg.execute(&call).await;
        assert!(out.is_error);
        assert!(out.content.contains("unknown tool"));
    }

    #[tokio::test]
    async fn gated_execution_blocks_denied_tool_without_running_it() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool { name: "danger", capability: ToolCapability::Exec });
        let policy = ToolPolicy::new(ToolProfile::Safe);
        let call = ToolCall { id: "1".into(), name: "danger".into(), args: json!({}) };
        let out = reg.execute_gated(&call, &policy).await;
        assert!(out.is_error);
        assert!(out.content.contains("blocked by policy"));
    }

    #[tokio::test]
    async fn gated_execution_runs_allowed_tool() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool::named("echo"));
        let call = ToolCall { id: "1".into(), name: "echo".into(), args: json!({}) };
        let out = reg.execute_gated(&call, &ToolPolicy::default()).await;
        assert!(!out.is_error);
    }
}
