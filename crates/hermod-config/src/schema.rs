// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub session: SessionQueueConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub feedback: FeedbackConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    /// Directory holding persisted session records.  Defaults to
    /// `~/.local/state/hermod/sessions` (or the platform equivalent).
    #[serde(default)]
    pub state_dir: Option<std::path::PathBuf>,
}

// ── Lanes ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub lanes: LanesConfig,
}

/// Per-lane worker and queue bounds.  Lanes are pure parallelism quotas;
/// ordering within a session is the session queue's job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanesConfig {
    #[serde(default = "LaneConfig::default_main")]
    pub main: LaneConfig,
    #[serde(default = "LaneConfig::default_subagent")]
    pub subagent: LaneConfig,
    #[serde(default = "LaneConfig::default_cron")]
    pub cron: LaneConfig,
}

impl Default for LanesConfig {
    fn default() -> Self {
        Self {
            main: LaneConfig::default_main(),
            subagent: LaneConfig::default_subagent(),
            cron: LaneConfig::default_cron(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaneConfig {
    /// Maximum jobs running in parallel on this lane.
    pub max_workers: usize,
    /// Pending-job cap; submissions beyond this are rejected.
    pub queue_depth: usize,
}

impl LaneConfig {
    pub fn default_main() -> Self {
        Self { max_workers: 4, queue_depth: 64 }
    }
    pub fn default_subagent() -> Self {
        Self { max_workers: 8, queue_depth: 64 }
    }
    pub fn default_cron() -> Self {
        Self { max_workers: 2, queue_depth: 16 }
    }
}

// ── Session queue ─────────────────────────────────────────────────────────────

/// Admission mode for a session queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueMode {
    /// FIFO: requests run in enqueue order.
    #[default]
    Queue,
    /// Same as `Queue` today; reserved for future reordering.
    Followup,
    /// An incoming request cancels every active and queued request first.
    Interrupt,
}

/// What to evict when the pending queue is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DropPolicy {
    /// Evict the oldest pending request to make room.
    #[default]
    Old,
    /// Reject the incoming request.
    New,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionQueueConfig {
    #[serde(default)]
    pub mode: QueueMode,
    /// Maximum pending depth.
    #[serde(default = "default_queue_cap")]
    pub cap: usize,
    #[serde(default)]
    pub drop: DropPolicy,
    /// Minimum delay between enqueue and start; resets on each new enqueue,
    /// collapsing bursts into a single run.
    #[serde(default)]
    pub debounce_ms: u64,
    /// Parallel runs allowed for one session (1 = serial; >1 for group chats).
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

fn default_queue_cap() -> usize {
    16
}

fn default_max_concurrent() -> usize {
    1
}

impl Default for SessionQueueConfig {
    fn default() -> Self {
        Self {
            mode: QueueMode::default(),
            cap: default_queue_cap(),
            drop: DropPolicy::default(),
            debounce_ms: 0,
            max_concurrent: default_max_concurrent(),
        }
    }
}

// ── Agent ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Maximum provider-call iterations per run before the loop gives up
    /// and appends a truncation notice.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Deadline for one provider call, covering the full streamed response.
    #[serde(default = "default_provider_timeout")]
    pub provider_timeout_secs: u64,
    /// Per-tool execution deadline in seconds.
    #[serde(default = "default_tool_timeout")]
    pub tool_timeout_secs: u64,
    /// Deadline for sandboxed exec-category tools (longer: container startup).
    #[serde(default = "default_exec_timeout")]
    pub exec_tool_timeout_secs: u64,
    #[serde(default)]
    pub compaction: CompactionConfig,
    #[serde(default)]
    pub subagents: SubagentConfig,
}

fn default_max_iterations() -> u32 {
    20
}

fn default_provider_timeout() -> u64 {
    120
}

fn default_tool_timeout() -> u64 {
    60
}

fn default_exec_timeout() -> u64 {
    300
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            provider_timeout_secs: default_provider_timeout(),
            tool_timeout_secs: default_tool_timeout(),
            exec_tool_timeout_secs: default_exec_timeout(),
            compaction: CompactionConfig::default(),
            subagents: SubagentConfig::default(),
        }
    }
}

/// When and how session history is summarised to fit the context window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    /// Compact once estimated history tokens exceed this share of the
    /// model's context window.
    #[serde(default = "default_history_share")]
    pub max_history_share: f32,
    /// Recent messages preserved verbatim across a compaction.
    #[serde(default = "default_keep_recent")]
    pub keep_recent: usize,
}

fn default_history_share() -> f32 {
    0.7
}

fn default_keep_recent() -> usize {
    8
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            max_history_share: default_history_share(),
            keep_recent: default_keep_recent(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubagentConfig {
    /// Maximum spawn depth.  A run at this depth cannot spawn children.
    #[serde(default = "default_max_depth")]
    pub max_depth: u8,
    /// Maximum children one parent run may spawn.
    #[serde(default = "default_max_children")]
    pub max_children: usize,
    /// Global cap on concurrently running subagents.
    #[serde(default = "default_max_concurrent_subagents")]
    pub max_concurrent: usize,
}

fn default_max_depth() -> u8 {
    5
}

fn default_max_children() -> usize {
    20
}

fn default_max_concurrent_subagents() -> usize {
    8
}

impl Default for SubagentConfig {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
            max_children: default_max_children(),
            max_concurrent: default_max_concurrent_subagents(),
        }
    }
}

// ── Feedback / heartbeat ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackConfig {
    /// TTL safety net: the typing indicator is force-stopped after this
    /// many seconds even if neither completion signal arrived.
    #[serde(default = "default_feedback_ttl")]
    pub ttl_secs: u64,
    /// Re-fire the channel start function every interval while the
    /// controller is open.  0 disables the keepalive loop.
    #[serde(default)]
    pub keepalive_secs: u64,
}

fn default_feedback_ttl() -> u64 {
    60
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self { ttl_secs: default_feedback_ttl(), keepalive_secs: 0 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_heartbeat_interval")]
    pub interval_secs: u64,
}

fn default_heartbeat_interval() -> u64 {
    300
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self { enabled: false, interval_secs: default_heartbeat_interval() }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_three_lanes() {
        let c = Config::default();
        assert_eq!(c.gateway.lanes.main.max_workers, 4);
        assert_eq!(c.gateway.lanes.subagent.max_workers, 8);
        assert_eq!(c.gateway.lanes.cron.max_workers, 2);
    }

    #[test]
    fn empty_yaml_is_a_valid_config() {
        let c: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(c.session.cap, 16);
        assert_eq!(c.session.max_concurrent, 1);
        assert_eq!(c.agent.max_iterations, 20);
    }

    #[test]
    fn queue_mode_parses_lowercase() {
        let c: SessionQueueConfig =
            serde_yaml::from_str("mode: interrupt").unwrap();
        assert_eq!(c.mode, QueueMode::Interrupt);
    }

    #[test]
    fn drop_policy_defaults_to_old() {
        let c = SessionQueueConfig::default();
        assert_eq!(c.drop, DropPolicy::Old);
    }

    #[test]
    fn subagent_bounds_have_safe_defaults() {
        let s = SubagentConfig::default();
        assert_eq!(s.max_depth, 5);
        assert_eq!(s.max_children, 20);
    }

    #[test]
    fn partial_yaml_overrides_only_named_fields() {
        let c: Config = serde_yaml::from_str(
            "session:\n  debounce_ms: 800\n  max_concurrent: 3\n",
        )
        .unwrap();
        assert_eq!(c.session.debounce_ms, 800);
        assert_eq!(c.session.max_concurrent, 3);
        assert_eq!(c.session.cap, 16); // untouched default
    }
}
