// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use hermod_config::CompactionConfig;
use hermod_model::{Message, ModelProvider, Usage};

use crate::compact::{compaction_split, fallback_compact, summarize};
use crate::session::{SessionData, SessionKey};

/// Owns every [`SessionData`] record.  In-memory map fronting optional
/// file-backed persistence (one JSON document per key, atomically replaced
/// on each durable mutation).
///
/// Concurrent runs never write through the store directly: each takes a
/// [`WriteHandle`] whose appends are buffered locally and flushed as one
/// contiguous block on commit, so interleaved tool calls from parallel runs
/// cannot interleave in the persisted record.
pub struct SessionStore {
    dir: Option<PathBuf>,
    sessions: Mutex<HashMap<SessionKey, SessionData>>,
}

impl SessionStore {
    /// Volatile store; records do not survive the process.
    pub fn in_memory() -> Self {
        Self { dir: None, sessions: Mutex::new(HashMap::new()) }
    }

    /// File-backed store rooted at `dir` (created if missing).
    pub fn at(dir: PathBuf) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating state dir {}", dir.display()))?;
        Ok(Self { dir: Some(dir), sessions: Mutex::new(HashMap::new()) })
    }

    /// Current record for `key`; empty if absent.
    pub async fn load(&self, key: &SessionKey) -> SessionData {
        let mut map = self.sessions.lock().await;
        self.entry(&mut map, key).clone()
    }

    /// Append one user message with monotonic ordering.
    pub async fn append_user_message(
        &self,
        key: &SessionKey,
        text: impl Into<String>,
    ) -> anyhow::Result<()> {
        self.append_message(key, Message::user(text)).await
    }

    /// Append an arbitrary message (e.g. a subagent announce) durably.
    pub async fn append_message(&self, key: &SessionKey, msg: Message) -> anyhow::Result<()> {
        let mut map = self.sessions.lock().await;
        let data = self.entry(&mut map, key);
        data.messages.push(msg);
        data.touch();
        self.persist(key, data)
    }

    /// Drop all state for `key` (the `/reset` command).
    pub async fn clear(&self, key: &SessionKey) -> anyhow::Result<()> {
        let mut map = self.sessions.lock().await;
        map.remove(key);
        if let Some(path) = self.file_path(key) {
            if path.exists() {
                std::fs::remove_file(&path)
                    .with_context(|| format!("removing {}", path.display()))?;
            }
        }
        Ok(())
    }

    /// Begin a buffered write scope for one run.  The handle snapshots the
    /// history as of now; appends by other runs committed in the meantime
    /// are not visible through it.
    pub async fn begin_concurrent_write(self: Arc<Self>, key: &SessionKey) -> WriteHandle {
        let base = {
            let mut map = self.sessions.lock().await;
            self.entry(&mut map, key).messages.clone()
        };
        WriteHandle {
            store: self,
            key: key.clone(),
            base,
            buffered: Vec::new(),
            usage: Usage::default(),
            label: None,
            channel: None,
        }
    }

    /// Summarise the history prefix when estimated usage exceeds
    /// `policy.max_history_share` of the provider's context window.
    ///
    /// Returns `true` iff a compaction (summary or deterministic fallback)
    /// occurred.  The provider call runs without the store lock held; the
    /// rebuild keeps any messages appended meanwhile, which is safe because
    /// the store only ever appends at the tail.
    pub async fn compact_if_needed(
        &self,
        key: &SessionKey,
        policy: &CompactionConfig,
        provider: &dyn ModelProvider,
    ) -> anyhow::Result<bool> {
        let snapshot = {
            let mut map = self.sessions.lock().await;
            self.entry(&mut map, key).clone()
        };

        let window = provider.context_window();
        if window == 0 {
            return Ok(false);
        }
        let threshold = (window as f32 * policy.max_history_share) as usize;
        if snapshot.approx_tokens() < threshold {
            return Ok(false);
        }

        let split = compaction_split(&snapshot.messages, policy.keep_recent);
        if split == 0 {
            return Ok(false);
        }
        let prefix = &snapshot.messages[..split];

        let summary = match summarize(provider, prefix).await {
            Ok(s) if !s.is_empty() => Some(s),
            Ok(_) => {
                warn!(session_key = %key, "compaction returned empty summary; truncating");
                None
            }
            Err(e) => {
                warn!(session_key = %key, error = %e, "compaction call failed; truncating");
                None
            }
        };

        let mut map = self.sessions.lock().await;
        let data = self.entry(&mut map, key);
        if data.messages.len() < split {
            // A concurrent compaction already shrank the history.
            return Ok(false);
        }
        let tail: Vec<Message> = data.messages[split..].to_vec();
        match summary {
            Some(text) => {
                let mut rebuilt = Vec::with_capacity(tail.len() + 1);
                rebuilt.push(Message::system(format!("Summary of earlier conversation:\n{text}")));
                rebuilt.extend(tail);
                data.messages = rebuilt;
                data.summary = text;
            }
            None => {
                data.messages = fallback_compact(&data.messages, data.messages.len() - split);
            }
        }
        data.compaction_count += 1;
        data.touch();
        debug!(session_key = %key, count = data.compaction_count, "session compacted");
        self.persist(key, data)?;
        Ok(true)
    }

    /// Flush a write handle's buffer as one contiguous append.
    async fn commit_append(
        &self,
        key: &SessionKey,
        buffered: Vec<Message>,
        usage: Usage,
        label: Option<String>,
        channel: Option<String>,
    ) -> anyhow::Result<()> {
        let mut map = self.sessions.lock().await;
        let data = self.entry(&mut map, key);
        data.messages.extend(buffered);
        data.input_tokens += usage.input_tokens;
        data.output_tokens += usage.output_tokens;
        if let Some(l) = label {
            data.label = l;
        }
        if let Some(c) = channel {
            data.channel = c;
        }
        data.touch();
        self.persist(key, data)
    }

    /// Lock-free-ish token estimate for the adaptive throttle.  Returns
    /// `None` when the map is contended or the key has never been touched;
    /// the throttle treats that as "no signal" rather than blocking.
    pub fn try_estimate_tokens(&self, key: &SessionKey) -> Option<usize> {
        let map = self.sessions.try_lock().ok()?;
        map.get(key).map(|data| data.approx_tokens())
    }

    /// Look up `key`, reading it from disk on first touch.
    fn entry<'a>(
        &self,
        map: &'a mut HashMap<SessionKey, SessionData>,
        key: &SessionKey,
    ) -> &'a mut SessionData {
        map.entry(key.clone()).or_insert_with(|| {
            self.read_from_disk(key).unwrap_or_default()
        })
    }

    fn read_from_disk(&self, key: &SessionKey) -> Option<SessionData> {
        let path = self.file_path(key)?;
        let text = std::fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&text) {
            Ok(data) => Some(data),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "ignoring unreadable session file");
                None
            }
        }
    }

    fn file_path(&self, key: &SessionKey) -> Option<PathBuf> {
        self.dir
            .as_ref()
            .map(|d| d.join(format!("{}.json", encode_key(key.as_str()))))
    }

    /// Write-through: temp file + rename so a crash never leaves a partial
    /// record.  No-op for in-memory stores.
    fn persist(&self, key: &SessionKey, data: &SessionData) -> anyhow::Result<()> {
        let Some(path) = self.file_path(key) else {
            return Ok(());
        };
        let tmp = path.with_extension("json.tmp");
        let text = serde_json::to_string_pretty(data)?;
        std::fs::write(&tmp, text).with_context(|| format!("writing {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("replacing {}", path.display()))?;
        Ok(())
    }
}

/// Session keys contain `:`; encode anything outside a filename-safe set.
fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for b in key.bytes() {
        match b {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'.' | b'_' | b'-' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

/// Scoped buffered write for one run.
///
/// Appends accumulate locally; [`commit`](WriteHandle::commit) flushes them
/// to the store as one contiguous block.  Dropping the handle without
/// committing discards the buffer — a cancelled run leaves no partial
/// history behind.
pub struct WriteHandle {
    store: Arc<SessionStore>,
    key: SessionKey,
    base: Vec<Message>,
    buffered: Vec<Message>,
    usage: Usage,
    label: Option<String>,
    channel: Option<String>,
}

impl WriteHandle {
    pub fn append(&mut self, msg: Message) {
        self.buffered.push(msg);
    }

    pub fn add_usage(&mut self, usage: Usage) {
        self.usage.add(usage);
    }

    pub fn usage(&self) -> Usage {
        self.usage
    }

    pub fn set_label(&mut self, label: impl Into<String>) {
        self.label = Some(label.into());
    }

    pub fn set_channel(&mut self, channel: impl Into<String>) {
        self.channel = Some(channel.into());
    }

    /// This run's view of the history: snapshot at begin plus own appends.
    pub fn history(&self) -> Vec<Message> {
        let mut out = self.base.clone();
        out.extend(self.buffered.iter().cloned());
        out
    }

    pub fn buffered(&self) -> &[Message] {
        &self.buffered
    }

    /// Flush atomically.  Returns the messages that were appended.
    pub async fn commit(self) -> anyhow::Result<Vec<Message>> {
        let appended = self.buffered.clone();
        self.store
            .commit_append(&self.key, self.buffered, self.usage, self.label, self.channel)
            .await?;
        Ok(appended)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
