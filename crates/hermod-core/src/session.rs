// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use hermod_model::Message;

/// Who is on the other side of a session.  Scopes the session key so that,
/// for example, a user's DM history never bleeds into a group chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerKind {
    Direct,
    Group,
    Subagent,
    Cron,
    Heartbeat,
    System,
}

impl PeerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeerKind::Direct => "direct",
            PeerKind::Group => "group",
            PeerKind::Subagent => "subagent",
            PeerKind::Cron => "cron",
            PeerKind::Heartbeat => "heartbeat",
            PeerKind::System => "system",
        }
    }
}

impl std::fmt::Display for PeerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical session identifier.  The key is the sole handle on history
/// isolation: two requests sharing a key share conversation.
///
/// Construction is deterministic per origin:
/// - direct:    `agent:{agent}:{channel}:direct:{sender}`
/// - group:     `agent:{agent}:{channel}:group:{chat}`
/// - subagent:  `agent:{agent}:subagent:{parent_run}:{nonce}`
/// - cron:      `agent:{agent}:cron:{job}`
/// - heartbeat: `agent:{agent}:heartbeat`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionKey(String);

impl SessionKey {
    pub fn direct(agent_id: &str, channel: &str, sender_id: &str) -> Self {
        Self(format!("agent:{agent_id}:{channel}:direct:{sender_id}"))
    }

    pub fn group(agent_id: &str, channel: &str, chat_id: &str) -> Self {
        Self(format!("agent:{agent_id}:{channel}:group:{chat_id}"))
    }

    pub fn subagent(agent_id: &str, parent_run_id: &str, nonce: &str) -> Self {
        Self(format!("agent:{agent_id}:subagent:{parent_run_id}:{nonce}"))
    }

    pub fn cron(agent_id: &str, job_id: &str) -> Self {
        Self(format!("agent:{agent_id}:cron:{job_id}"))
    }

    pub fn heartbeat(agent_id: &str) -> Self {
        Self(format!("agent:{agent_id}:heartbeat"))
    }

    /// Adopt an externally computed key verbatim.
    pub fn from_raw(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Peer kind parsed back out of the key segments.
    pub fn peer_kind(&self) -> PeerKind {
        for seg in self.0.split(':') {
            match seg {
                "direct" => return PeerKind::Direct,
                "group" => return PeerKind::Group,
                "subagent" => return PeerKind::Subagent,
                "cron" => return PeerKind::Cron,
                "heartbeat" => return PeerKind::Heartbeat,
                _ => {}
            }
        }
        PeerKind::System
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The durable record behind one session key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionData {
    #[serde(default)]
    pub messages: Vec<Message>,
    /// Empty until first compaction; then holds the condensed prior history.
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub compaction_count: u32,
    /// Advances on every durable mutation.
    pub updated: DateTime<Utc>,
    /// Free-form tag, set by the first write and overwritten by later ones.
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub channel: String,
}

impl Default for SessionData {
    fn default() -> Self {
        Self {
            messages: Vec::new(),
            summary: String::new(),
            input_tokens: 0,
            output_tokens: 0,
            compaction_count: 0,
            updated: Utc::now(),
            label: String::new(),
            channel: String::new(),
        }
    }
}

impl SessionData {
    /// Approximate total token count of the stored history.
    pub fn approx_tokens(&self) -> usize {
        self.messages.iter().map(|m| m.approx_tokens()).sum()
    }

    pub fn touch(&mut self) {
        self.updated = Utc::now();
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
