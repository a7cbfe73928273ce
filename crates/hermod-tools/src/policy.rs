// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use crate::tool::ToolCapability;

/// Base capability profile a tool set runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ToolProfile {
    /// Every capability permitted.
    #[default]
    Full,
    /// Read and messaging only; no writes, exec, or spawning.
    Safe,
}

impl ToolProfile {
    fn permits(&self, capability: ToolCapability) -> bool {
        match self {
            ToolProfile::Full => true,
            ToolProfile::Safe => matches!(
                capability,
                ToolCapability::Read | ToolCapability::Messaging
            ),
        }
    }
}

/// Decision for one tool invocation.  Blocked tools get a synthetic error
/// result; they are never executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    Allow,
    Deny(String),
}

/// Policy gate evaluated before every tool execution.
///
/// Evaluation order: deny list → allow list (when non-empty it also lifts
/// the profile restriction for the named tool) → profile capability check.
/// Agent-level overrides are merged on top of the gateway-wide lists.
#[derive(Debug, Clone, Default)]
pub struct ToolPolicy {
    pub profile: ToolProfile,
    pub allow: Vec<String>,
    pub deny: Vec<String>,
}

impl ToolPolicy {
    pub fn new(profile: ToolProfile) -> Self {
        Self { profile, allow: Vec::new(), deny: Vec::new() }
    }

    /// Merge agent-level allow/deny overrides into this policy.
    /// Overrides extend the lists; they never remove gateway-wide entries.
    pub fn with_agent_overrides(
        mut self,
        allow: impl IntoIterator<Item = String>,
        deny: impl IntoIterator<Item = String>,
    ) -> Self {
        self.allow.extend(allow);
        self.deny.extend(deny);
        self
    }

    pub fn evaluate(&self, name: &str, capability: ToolCapability) -> PolicyDecision {
        if self.deny.iter().any(|d| d == name) {
            return PolicyDecision::Deny(format!("tool '{name}' is denied by policy"));
        }
        if !self.allow.is_empty() {
            return if self.allow.iter().any(|a| a == name) {
                PolicyDecision::Allow
            } else {
                PolicyDecision::Deny(format!("tool '{name}' is not on the allow list"))
            };
        }
        if self.profile.permits(capability) {
            PolicyDecision::Allow
        } else {
            PolicyDecision::Deny(format!(
                "tool '{name}' requires a capability the current profile does not permit"
            ))
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
