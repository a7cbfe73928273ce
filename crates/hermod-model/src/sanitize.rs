// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! History sanitisation: repair tool-call/result pairing before replay.
//!
//! Providers reject conversation histories in which an assistant tool call
//! has no matching tool result, or a tool result references an unknown call.
//! Both states occur legitimately here — compaction can swallow one half of
//! a pair, and a cancelled run can leave the other — so every provider call
//! goes through [`sanitize_history`] first.

use tracing::warn;

use crate::{Message, MessageContent, Role};

/// Placeholder result text for a tool call whose real result was lost to
/// compaction.  The wording is user-visible in transcripts; keep it stable.
pub const MISSING_RESULT: &str = "[Tool result missing — session was compacted]";

/// Rewrite `messages` so that every assistant tool call is followed by
/// exactly one matching tool result and no orphan results remain.
///
/// Rules, in order:
/// 1. Leading `tool` messages with no preceding matching assistant call are
///    dropped.
/// 2. Each assistant tool call without a result gets a synthetic
///    [`MISSING_RESULT`] placeholder, inserted after the call block and any
///    results it already has.
/// 3. `tool` messages whose id matches no pending assistant call are dropped.
///
/// Sanitising an already-valid history returns it unchanged.
pub fn sanitize_history(messages: Vec<Message>) -> Vec<Message> {
    let mut out: Vec<Message> = Vec::with_capacity(messages.len());
    // Ids of assistant tool calls still awaiting a result.
    let mut pending: Vec<String> = Vec::new();

    for msg in messages {
        match (&msg.role, &msg.content) {
            (Role::Assistant, MessageContent::ToolCall { tool_call_id, .. }) => {
                pending.push(tool_call_id.clone());
                out.push(msg);
            }
            (Role::Tool, MessageContent::ToolResult { tool_call_id, .. }) => {
                if let Some(pos) = pending.iter().position(|id| id == tool_call_id) {
                    pending.remove(pos);
                    out.push(msg);
                } else {
                    // Orphan: either a leading result whose call was compacted
                    // away, or a duplicate.  Either way the provider rejects it.
                    warn!(tool_call_id = %tool_call_id, "dropping orphan tool result");
                }
            }
            _ => {
                // A user or plain-assistant message ends the current tool
                // block: synthesise results for anything still unanswered.
                flush_pending(&mut out, &mut pending);
                out.push(msg);
            }
        }
    }

    // Trailing unanswered calls (e.g. the tail of a cancelled run).
    flush_pending(&mut out, &mut pending);

    out
}

fn flush_pending(out: &mut Vec<Message>, pending: &mut Vec<String>) {
    for id in pending.drain(..) {
        warn!(tool_call_id = %id, "synthesising missing tool result");
        out.push(Message::tool_result(id, MISSING_RESULT));
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn call(id: &str) -> Message {
        Message::tool_call(id, "shell", "{}")
    }

    fn result(id: &str) -> Message {
        Message::tool_result(id, "ok")
    }

    fn ids(messages: &[Message]) -> Vec<Option<&str>> {
        messages.iter().map(|m| m.tool_call_id()).collect()
    }

    #[test]
    fn valid_history_is_unchanged() {
        let history = vec![
            Message::system("sys"),
            Message::user("hi"),
            call("a"),
            result("a"),
            Message::assistant("done"),
        ];
        let before = ids(&history).into_iter().map(|o| o.map(str::to_owned)).collect::<Vec<_>>();
        let out = sanitize_history(history);
        assert_eq!(out.len(), 5);
        let after = ids(&out).into_iter().map(|o| o.map(str::to_owned)).collect::<Vec<_>>();
        assert_eq!(before, after);
    }

    #[test]
    fn sanitize_is_idempotent() {
        let history = vec![call("a"), Message::user("next")];
        let once = sanitize_history(history);
        let twice = sanitize_history(once.clone());
        assert_eq!(once.len(), twice.len());
    }

    #[test]
    fn leading_orphan_result_is_dropped() {
        let history = vec![result("ghost"), Message::user("hi")];
        let out = sanitize_history(history);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].as_text(), Some("hi"));
    }

    #[test]
    fn missing_result_is_synthesised_before_next_user_turn() {
        let history = vec![call("a"), Message::user("next question")];
        let out = sanitize_history(history);
        assert_eq!(out.len(), 3);
        assert_eq!(out[1].tool_call_id(), Some("a"));
        match &out[1].content {
            MessageContent::ToolResult { content, .. } => {
                assert_eq!(content, MISSING_RESULT)
            }
            other => panic!("expected synthesised result, got {other:?}"),
        }
    }

    #[test]
    fn trailing_unanswered_call_gets_placeholder() {
        let history = vec![Message::user("go"), call("z")];
        let out = sanitize_history(history);
        assert_eq!(out.last().unwrap().tool_call_id(), Some("z"));
        assert!(matches!(out.last().unwrap().role, Role::Tool));
    }

    #[test]
    fn duplicate_result_is_dropped() {
        let history = vec![call("a"), result("a"), result("a")];
        let out = sanitize_history(history);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn parallel_calls_each_keep_their_result() {
        let history = vec![
            call("a"),
            call("b"),
            result("b"),
            result("a"),
            Message::assistant("done"),
        ];
        let out = sanitize_history(history);
        assert_eq!(out.len(), 5);
    }

    #[test]
    fn mixed_missing_and_orphan_repairs_both() {
        // Call "a" lost its result to compaction; result "ghost" lost its call.
        let history = vec![
            call("a"),
            result("ghost"),
            Message::user("continue"),
        ];
        let out = sanitize_history(history);
        // call a, synthetic result a, user
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].tool_call_id(), Some("a"));
        assert_eq!(out[1].tool_call_id(), Some("a"));
    }
}
