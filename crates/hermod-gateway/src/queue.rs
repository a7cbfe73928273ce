// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

use hermod_config::{DropPolicy, QueueMode, SessionQueueConfig};
use hermod_core::{GatewayError, RunBatch, RunHandler, RunReply, RunRequest, SessionKey};

use crate::lanes::{LaneName, LanePool, SubmitResult};

/// Callback returning `(estimated_tokens, context_window)` for a session.
/// Installed by the scheduler so queues can throttle near the compaction
/// threshold without depending on the store.
pub type UsageProbe = Arc<dyn Fn(&SessionKey) -> Option<(usize, usize)> + Send + Sync>;

/// Context share at which the adaptive throttle clamps a session to one
/// run at a time.  Parallel runs past this point would race to trigger
/// compaction with inconsistent prefixes.
const THROTTLE_SHARE: f64 = 0.6;

/// Per-session admission controller: ordering, debounce, drop policy,
/// cancellation, and generation-guarded completion.
///
/// Debounce semantics: the window COLLAPSES.  When the timer fires, every
/// request then pending (under an effective concurrency of 1) becomes one
/// run — the newest supplies the prompt, older messages ride along as
/// context, and all submitters receive the same outcome.  With an effective
/// concurrency above 1, requests start individually in enqueue order.
pub struct SessionQueue {
    key: SessionKey,
    config: SessionQueueConfig,
    lanes: Arc<LanePool>,
    handler: Arc<dyn RunHandler>,
    usage_probe: Option<UsageProbe>,
    draining: Arc<AtomicBool>,
    state: Mutex<QueueState>,
    /// Back-reference for handing owned clones to timers and lane jobs.
    me: Weak<SessionQueue>,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Pending>,
    active: Vec<Active>,
    /// Bumped on hard reset; completions carrying an older generation are
    /// discarded without mutating queue state.
    generation: u64,
    /// Requests enqueued before this instant are dropped as stale at the
    /// next start attempt.  Set by `cancel_all`, cleared by the first
    /// non-stale request found.
    abort_cutoff: Option<Instant>,
    /// End of the current debounce window; reset on every enqueue.
    debounce_deadline: Option<Instant>,
    /// Identifies the newest armed debounce timer; earlier timers no-op.
    debounce_seq: u64,
}

struct Pending {
    request: RunRequest,
    lane: LaneName,
    reply: oneshot::Sender<RunReply>,
    enqueued_at: Instant,
}

struct Active {
    run_id: Uuid,
    cancel: Option<oneshot::Sender<()>>,
    generation: u64,
    /// All submitters whose requests were collapsed into this run.
    replies: Vec<oneshot::Sender<RunReply>>,
}

impl SessionQueue {
    pub fn new(
        key: SessionKey,
        config: SessionQueueConfig,
        lanes: Arc<LanePool>,
        handler: Arc<dyn RunHandler>,
        usage_probe: Option<UsageProbe>,
        draining: Arc<AtomicBool>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            key,
            config,
            lanes,
            handler,
            usage_probe,
            draining,
            state: Mutex::new(QueueState::default()),
            me: me.clone(),
        })
    }

    /// Owned handle for spawned work.  The scheduler keeps every queue
    /// alive until shutdown, so an upgrade failure means the process is
    /// tearing down and the work is moot.
    fn arc(&self) -> Option<Arc<SessionQueue>> {
        self.me.upgrade()
    }

    /// Admit one request.  The returned receiver resolves exactly once with
    /// the run's outcome or the admission error.
    pub async fn enqueue(
        &self,
        lane: LaneName,
        request: RunRequest,
    ) -> oneshot::Receiver<RunReply> {
        let (reply_tx, reply_rx) = oneshot::channel();

        if self.draining.load(Ordering::Acquire) {
            let _ = reply_tx.send(Err(GatewayError::Draining));
            return reply_rx;
        }

        {
            let mut st = self.state.lock().await;

            if self.config.mode == QueueMode::Interrupt {
                // Incoming cancels everything active and queued.
                for active in st.active.iter_mut() {
                    if let Some(cancel) = active.cancel.take() {
                        let _ = cancel.send(());
                    }
                }
                for stale in st.pending.drain(..) {
                    let _ = stale.reply.send(Err(GatewayError::Cancelled));
                }
            }

            if st.pending.len() >= self.config.cap.max(1) {
                match self.config.drop {
                    DropPolicy::Old => {
                        if let Some(victim) = st.pending.pop_front() {
                            warn!(
                                session_key = %self.key,
                                run_id = %victim.request.run_id,
                                "queue at capacity; evicting oldest pending request"
                            );
                            let _ = victim.reply.send(Err(GatewayError::QueueDropped));
                        }
                    }
                    DropPolicy::New => {
                        warn!(session_key = %self.key, "queue at capacity; rejecting request");
                        let _ = reply_tx.send(Err(GatewayError::QueueFull));
                        return reply_rx;
                    }
                }
            }

            st.pending.push_back(Pending {
                request,
                lane,
                reply: reply_tx,
                enqueued_at: Instant::now(),
            });

            if self.config.debounce_ms > 0 {
                // Re-arm: the window restarts on every enqueue, so a burst
                // only fires once, after its last message.
                let window = Duration::from_millis(self.config.debounce_ms);
                st.debounce_deadline = Some(Instant::now() + window);
                st.debounce_seq += 1;
                let seq = st.debounce_seq;
                let Some(this) = self.arc() else {
                    return reply_rx;
                };
                tokio::spawn(async move {
                    tokio::time::sleep(window).await;
                    let fire = {
                        let mut st = this.state.lock().await;
                        if st.debounce_seq == seq {
                            st.debounce_deadline = None;
                            true
                        } else {
                            false
                        }
                    };
                    if fire {
                        this.pump().await;
                    }
                });
                return reply_rx;
            }
        }

        self.pump().await;
        reply_rx
    }

    /// Cancel the oldest active run (a user's `/stop`).
    pub async fn cancel_one(&self) -> bool {
        let mut st = self.state.lock().await;
        for active in st.active.iter_mut() {
            if let Some(cancel) = active.cancel.take() {
                let _ = cancel.send(());
                debug!(session_key = %self.key, run_id = %active.run_id, "cancelled oldest run");
                return true;
            }
        }
        false
    }

    /// Cancel every active run and stamp the abort cutoff: requests already
    /// accepted but not yet started are skipped as stale rather than being
    /// silently promoted into an empty chat later.
    pub async fn cancel_all(&self) {
        {
            let mut st = self.state.lock().await;
            for active in st.active.iter_mut() {
                if let Some(cancel) = active.cancel.take() {
                    let _ = cancel.send(());
                }
            }
            st.abort_cutoff = Some(Instant::now());
            debug!(session_key = %self.key, "cancelled all active runs");
        }
        // Sweep pending immediately rather than waiting for the next start.
        self.pump().await;
    }

    /// Hard restart for in-process reload: invalidate in-flight completions,
    /// cancel actives, and fail everything with `LaneCleared`.
    pub async fn reset(&self) {
        let mut st = self.state.lock().await;
        st.generation += 1;
        for mut active in st.active.drain(..) {
            if let Some(cancel) = active.cancel.take() {
                let _ = cancel.send(());
            }
            for reply in active.replies.drain(..) {
                let _ = reply.send(Err(GatewayError::LaneCleared));
            }
        }
        for stale in st.pending.drain(..) {
            let _ = stale.reply.send(Err(GatewayError::LaneCleared));
        }
        st.abort_cutoff = None;
        st.debounce_deadline = None;
        debug!(session_key = %self.key, generation = st.generation, "queue reset");
    }

    pub async fn active_count(&self) -> usize {
        self.state.lock().await.active.len()
    }

    pub async fn pending_count(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    /// `max_concurrent`, clamped to 1 near the compaction threshold.
    fn effective_max_concurrent(&self) -> usize {
        let configured = self.config.max_concurrent.max(1);
        if configured == 1 {
            return 1;
        }
        if let Some(probe) = &self.usage_probe {
            if let Some((tokens, window)) = probe(&self.key) {
                if window > 0 && tokens as f64 / window as f64 >= THROTTLE_SHARE {
                    debug!(
                        session_key = %self.key,
                        tokens, window,
                        "adaptive throttle: serialising near compaction threshold"
                    );
                    return 1;
                }
            }
        }
        configured
    }

    /// Start as much queued work as admission rules allow.
    ///
    /// Returns an explicitly boxed future (rather than `async fn`) because
    /// this method and `on_finished` call each other indirectly through a
    /// spawned lane job; without the explicit `Send` bound here the
    /// compiler cannot resolve the recursive auto-trait check.
    fn pump(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
        loop {
            let mut st = self.state.lock().await;

            if self.draining.load(Ordering::Acquire) {
                for stale in st.pending.drain(..) {
                    let _ = stale.reply.send(Err(GatewayError::Draining));
                }
                return;
            }

            // Stale sweep runs regardless of capacity so an abort cutoff
            // clears the backlog promptly.
            while let Some(head) = st.pending.front() {
                match st.abort_cutoff {
                    Some(cutoff) if head.enqueued_at < cutoff => {
                        let stale = st.pending.pop_front().expect("head exists");
                        debug!(
                            session_key = %self.key,
                            run_id = %stale.request.run_id,
                            "dropping stale request from before abort cutoff"
                        );
                        let _ = stale.reply.send(Err(GatewayError::MessageStale));
                    }
                    Some(_) => {
                        // First non-stale request ends the cutoff's reach.
                        st.abort_cutoff = None;
                        break;
                    }
                    None => break,
                }
            }

            if st.pending.is_empty() {
                return;
            }
            // An open debounce window defers starting; its timer will pump.
            if matches!(st.debounce_deadline, Some(deadline) if Instant::now() < deadline) {
                return;
            }
            let effective = self.effective_max_concurrent();
            if st.active.len() >= effective {
                return;
            }

            // Collapse: a debounce-configured serial queue folds its whole
            // backlog into one run.
            let collapse = effective == 1 && self.config.debounce_ms > 0;
            let items: Vec<Pending> = if collapse {
                st.pending.drain(..).collect()
            } else {
                vec![st.pending.pop_front().expect("pending non-empty")]
            };

            let mut context_messages = Vec::with_capacity(items.len() - 1);
            let mut replies = Vec::with_capacity(items.len());
            let mut lane = LaneName::Main;
            let mut request = None;
            for (i, item) in items.into_iter().enumerate() {
                if i > 0 {
                    // All but the newest become context for the merged run.
                    let prev = request.replace(item.request).expect("set on first item");
                    context_messages.push(prev.message);
                } else {
                    request = Some(item.request);
                }
                lane = item.lane;
                replies.push(item.reply);
            }
            let request = request.expect("at least one item");
            let run_id = request.run_id;
            let generation = st.generation;

            let (cancel_tx, cancel_rx) = oneshot::channel();
            st.active.push(Active {
                run_id,
                cancel: Some(cancel_tx),
                generation,
                replies,
            });

            let batch = RunBatch { request, context_messages };
            let Some(this) = self.arc() else { return };
            let job: crate::lanes::Job = Box::pin(async move {
                // A job that was queued behind others may only reach a worker
                // after shutdown began; it must not start a run then.
                let reply = if this.draining.load(Ordering::Acquire) {
                    Err(GatewayError::Draining)
                } else {
                    this.handler.run(batch, cancel_rx).await
                };
                this.on_finished(run_id, generation, reply).await;
            });

            match self.lanes.submit(lane, job) {
                SubmitResult::Ok => {}
                refused => {
                    // Roll back the active record and fail the submitters.
                    let pos = st
                        .active
                        .iter()
                        .position(|a| a.run_id == run_id)
                        .expect("just pushed");
                    let mut active = st.active.remove(pos);
                    warn!(
                        session_key = %self.key,
                        lane = %lane,
                        ?refused,
                        "lane refused job; failing submission"
                    );
                    let error = GatewayError::LaneRejected(format!(
                        "{lane} lane {}",
                        match refused {
                            SubmitResult::Full => "queue is full",
                            _ => "is closed",
                        }
                    ));
                    for reply in active.replies.drain(..) {
                        let _ = reply.send(Err(error.clone()));
                    }
                }
            }
            // Loop again: more capacity may remain.
        }
        })
    }

    /// Completion path.  Generation mismatches are dropped silently — the
    /// queue was reset while this run was in flight and its submitters have
    /// already been answered.
    async fn on_finished(&self, run_id: Uuid, generation: u64, reply: RunReply) {
        {
            let mut st = self.state.lock().await;
            if generation != st.generation {
                debug!(
                    session_key = %self.key,
                    %run_id,
                    "discarding completion from a previous generation"
                );
                return;
            }
            let Some(pos) = st.active.iter().position(|a| a.run_id == run_id) else {
                return;
            };
            let mut active = st.active.remove(pos);
            for tx in active.replies.drain(..) {
                let _ = tx.send(reply.clone());
            }
        }
        // Capacity freed; schedule the next queued request.
        self.pump().await;
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
