// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use futures::StreamExt;

use hermod_model::{CompletionRequest, Message, MessageContent, ModelProvider, ResponseEvent, Role};

/// Prompt for the summarisation call.  The summary replaces the original
/// history, so it must keep everything a future turn could need.
const SUMMARIZE_PROMPT: &str =
    "You are a context compaction assistant. Summarise the following conversation history \
     in a concise, information-dense way. Preserve all technical details, decisions, names, \
     identifiers, and tool outputs that may be relevant to future turns. \
     The summary will replace the original history to free up context space.";

/// Notice used when the summarisation call fails and history is truncated
/// deterministically instead.
const TRUNCATION_NOTICE: &str =
    "[Context truncated: earlier history was dropped to prevent a context-window \
     overflow. Ask the user to re-provide anything that is missing.]";

/// Where to cut the history for compaction.
///
/// Returns the number of leading non-system messages to summarise, keeping
/// the last `keep_recent` verbatim.  The split is moved backward until it
/// lands on a conversation-turn boundary: cutting inside a tool-call group
/// would leave orphaned tool results referencing summarised-away calls,
/// which providers reject.
pub fn compaction_split(messages: &[Message], keep_recent: usize) -> usize {
    let mut split = messages.len().saturating_sub(keep_recent);
    while split > 0 && split < messages.len() {
        match &messages[split].content {
            MessageContent::ToolResult { .. } | MessageContent::ToolCall { .. } => {
                split -= 1;
            }
            _ => break,
        }
    }
    split
}

/// Render history as plain text for the summarisation request.
pub fn serialize_history(messages: &[Message]) -> String {
    let mut out = String::new();
    for m in messages {
        let role = match m.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        };
        let body = match &m.content {
            MessageContent::Text(t) => t.clone(),
            MessageContent::ToolCall { function, .. } => {
                format!("[tool call] {}({})", function.name, function.arguments)
            }
            MessageContent::ToolResult { content, .. } => {
                format!("[tool result] {content}")
            }
        };
        out.push_str(role);
        out.push_str(": ");
        out.push_str(&body);
        out.push('\n');
    }
    out
}

/// Ask the provider for a summary of `prefix`.  Tool-free, non-streaming
/// consumption: text deltas are concatenated, everything else ignored.
pub async fn summarize(
    provider: &dyn ModelProvider,
    prefix: &[Message],
) -> anyhow::Result<String> {
    let req = CompletionRequest {
        messages: vec![
            Message::system(SUMMARIZE_PROMPT),
            Message::user(serialize_history(prefix)),
        ],
        tools: vec![],
        stream: false,
    };
    let mut stream = provider.complete(req).await?;
    let mut summary = String::new();
    while let Some(event) = stream.next().await {
        match event? {
            ResponseEvent::TextDelta(delta) => summary.push_str(&delta),
            ResponseEvent::Done => break,
            _ => {}
        }
    }
    Ok(summary.trim().to_string())
}

/// Deterministic fallback when the summarisation call fails: keep the tail,
/// drop the rest behind a canned notice.  Never makes a model call, so it
/// always succeeds regardless of session size.
pub fn fallback_compact(messages: &[Message], keep_recent: usize) -> Vec<Message> {
    let keep = keep_recent.min(messages.len());
    let split = compaction_split(messages, keep);
    let mut out = Vec::with_capacity(messages.len() - split + 1);
    out.push(Message::system(TRUNCATION_NOTICE));
    out.extend_from_slice(&messages[split..]);
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
