// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod agent;
mod compact;
mod events;
mod prompts;
mod runs;
mod session;
mod spawn_tool;
mod store;

pub use agent::AgentRunner;
pub use compact::{compaction_split, fallback_compact, serialize_history};
pub use events::{EventBus, RunEvent};
pub use prompts::{system_prompt, PromptContext};
pub use runs::{
    GatewayError, RunBatch, RunContext, RunHandler, RunOutcome, RunReply, RunRequest,
    SubagentSpawner, HEARTBEAT_OK, HEARTBEAT_POLL, NO_REPLY,
};
pub use session::{PeerKind, SessionData, SessionKey};
pub use spawn_tool::SpawnTool;
pub use store::{SessionStore, WriteHandle};
