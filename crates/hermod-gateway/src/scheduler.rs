// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{oneshot, RwLock};
use tracing::{debug, info};

use hermod_config::{LanesConfig, SessionQueueConfig};
use hermod_core::{
    GatewayError, RunHandler, RunReply, RunRequest, SessionKey, SubagentSpawner,
};

use crate::lanes::{LaneName, LanePool, LaneStats};
use crate::queue::{SessionQueue, UsageProbe};

/// Thin coordinator over the lane pool and the per-session queues.
///
/// Owns the only shared map in the system: session key → queue, created
/// lazily on first submission and kept until shutdown.  Queues never share
/// state beyond the lanes and whatever the run handler touches.
pub struct Scheduler {
    lanes: Arc<LanePool>,
    handler: Arc<dyn RunHandler>,
    queue_config: SessionQueueConfig,
    usage_probe: Option<UsageProbe>,
    queues: RwLock<HashMap<SessionKey, Arc<SessionQueue>>>,
    draining: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn new(
        lanes: &LanesConfig,
        queue_config: SessionQueueConfig,
        handler: Arc<dyn RunHandler>,
    ) -> Self {
        Self {
            lanes: Arc::new(LanePool::new(lanes)),
            handler,
            queue_config,
            usage_probe: None,
            queues: RwLock::new(HashMap::new()),
            draining: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Install the token-usage callback driving the adaptive throttle.
    /// Applies to queues created after this call, so wire it before serving.
    pub fn with_usage_probe(mut self, probe: UsageProbe) -> Self {
        self.usage_probe = Some(probe);
        self
    }

    /// Submit a run.  The receiver resolves exactly once with the outcome
    /// or an admission error.
    pub async fn submit(
        &self,
        lane: LaneName,
        request: RunRequest,
    ) -> oneshot::Receiver<RunReply> {
        self.submit_with_concurrency(lane, request, None).await
    }

    /// Like [`submit`](Self::submit), with an optional `max_concurrent`
    /// override for the session (e.g. group chats allowing parallel runs).
    /// The override applies when the session queue is first created;
    /// later values for an existing queue are ignored.
    pub async fn submit_with_concurrency(
        &self,
        lane: LaneName,
        request: RunRequest,
        max_concurrent: Option<usize>,
    ) -> oneshot::Receiver<RunReply> {
        if self.draining.load(Ordering::Acquire) {
            let (tx, rx) = oneshot::channel();
            let _ = tx.send(Err(GatewayError::Draining));
            return rx;
        }
        let queue = self.get_or_create(&request.session_key, max_concurrent).await;
        queue.enqueue(lane, request).await
    }

    /// Cancel every active run and drain the pending queue for a session.
    pub async fn cancel_session(&self, key: &SessionKey) -> bool {
        match self.get(key).await {
            Some(queue) => {
                queue.cancel_all().await;
                true
            }
            None => false,
        }
    }

    /// Cancel the oldest active run for a session (the `/stop` command).
    pub async fn cancel_one_session(&self, key: &SessionKey) -> bool {
        match self.get(key).await {
            Some(queue) => queue.cancel_one().await,
            None => false,
        }
    }

    /// Hard-reset one session queue (in-process reload).
    pub async fn reset_session(&self, key: &SessionKey) -> bool {
        match self.get(key).await {
            Some(queue) => {
                queue.reset().await;
                true
            }
            None => false,
        }
    }

    /// Hard-reset every session queue.
    pub async fn reset_all(&self) {
        let queues: Vec<Arc<SessionQueue>> =
            self.queues.read().await.values().cloned().collect();
        for queue in queues {
            queue.reset().await;
        }
    }

    /// Refuse new work; in-flight runs continue to completion.
    pub fn mark_draining(&self) {
        self.draining.store(true, Ordering::Release);
        info!("gateway draining: refusing new submissions");
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Drain and stop the lanes.  Safe to call exactly once; repeated calls
    /// are no-ops.
    pub fn stop(&self) {
        self.mark_draining();
        self.lanes.stop_all();
        info!("gateway stopped: lanes closed");
    }

    pub fn lane_stats(&self, lane: LaneName) -> LaneStats {
        self.lanes.stats(lane)
    }

    pub async fn session_count(&self) -> usize {
        self.queues.read().await.len()
    }

    async fn get(&self, key: &SessionKey) -> Option<Arc<SessionQueue>> {
        self.queues.read().await.get(key).cloned()
    }

    /// Read-mostly map with double-checked creation: the read lock serves
    /// the common path, the write lock is taken only for a genuinely new
    /// session.
    async fn get_or_create(
        &self,
        key: &SessionKey,
        max_concurrent: Option<usize>,
    ) -> Arc<SessionQueue> {
        if let Some(queue) = self.queues.read().await.get(key) {
            return Arc::clone(queue);
        }
        let mut map = self.queues.write().await;
        if let Some(queue) = map.get(key) {
            return Arc::clone(queue);
        }
        debug!(session_key = %key, "creating session queue");
        let mut config = self.queue_config.clone();
        if let Some(limit) = max_concurrent {
            config.max_concurrent = limit.max(1);
        }
        let queue = SessionQueue::new(
            key.clone(),
            config,
            Arc::clone(&self.lanes),
            Arc::clone(&self.handler),
            self.usage_probe.clone(),
            Arc::clone(&self.draining),
        );
        map.insert(key.clone(), Arc::clone(&queue));
        queue
    }
}

/// Subagent spawns are ordinary submissions on the subagent lane.
#[async_trait]
impl SubagentSpawner for Scheduler {
    async fn spawn(
        &self,
        request: RunRequest,
    ) -> Result<oneshot::Receiver<RunReply>, GatewayError> {
        if self.is_draining() {
            return Err(GatewayError::Draining);
        }
        Ok(self.submit(LaneName::Subagent, request).await)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use hermod_core::{RunBatch, RunOutcome};

    use super::*;

    struct CountingHandler {
        runs: AtomicUsize,
    }

    #[async_trait]
    impl RunHandler for CountingHandler {
        async fn run(&self, batch: RunBatch, _cancel: oneshot::Receiver<()>) -> RunReply {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(RunOutcome {
                reply: Some(format!("ok: {}", batch.request.message)),
                ..Default::default()
            })
        }
    }

    fn scheduler() -> (Scheduler, Arc<CountingHandler>) {
        let handler = Arc::new(CountingHandler { runs: AtomicUsize::new(0) });
        let s = Scheduler::new(
            &LanesConfig::default(),
            SessionQueueConfig::default(),
            handler.clone(),
        );
        (s, handler)
    }

    fn request(session: &SessionKey, message: &str) -> RunRequest {
        RunRequest::new(session.clone(), "ada", message)
    }

    #[tokio::test]
    async fn submit_routes_to_handler_and_replies() {
        let (scheduler, handler) = scheduler();
        let key = SessionKey::direct("ada", "web", "u1");
        let rx = scheduler.submit(LaneName::Main, request(&key, "hi")).await;
        let outcome = rx.await.unwrap().unwrap();
        assert_eq!(outcome.reply.as_deref(), Some("ok: hi"));
        assert_eq!(handler.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn queues_are_created_lazily_and_reused() {
        let (scheduler, _) = scheduler();
        let a = SessionKey::direct("ada", "web", "u1");
        let b = SessionKey::direct("ada", "web", "u2");
        assert_eq!(scheduler.session_count().await, 0);
        let _ = scheduler.submit(LaneName::Main, request(&a, "1")).await.await;
        let _ = scheduler.submit(LaneName::Main, request(&a, "2")).await.await;
        let _ = scheduler.submit(LaneName::Main, request(&b, "3")).await.await;
        assert_eq!(scheduler.session_count().await, 2);
    }

    #[tokio::test]
    async fn draining_refuses_submissions() {
        let (scheduler, handler) = scheduler();
        scheduler.mark_draining();
        let key = SessionKey::direct("ada", "web", "u1");
        let rx = scheduler.submit(LaneName::Main, request(&key, "late")).await;
        assert_eq!(rx.await.unwrap().unwrap_err(), GatewayError::Draining);
        assert_eq!(handler.runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let (scheduler, _) = scheduler();
        scheduler.stop();
        scheduler.stop();
        assert!(scheduler.is_draining());
    }

    #[tokio::test]
    async fn no_runs_start_after_stop() {
        let (scheduler, handler) = scheduler();
        let key = SessionKey::direct("ada", "web", "u1");
        let _ = scheduler.submit(LaneName::Main, request(&key, "before")).await.await;
        scheduler.stop();
        let rx = scheduler.submit(LaneName::Main, request(&key, "after")).await;
        assert!(rx.await.unwrap().is_err());
        assert_eq!(handler.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn per_submission_concurrency_override_applies_on_creation() {
        struct PeakHandler {
            running: AtomicUsize,
            peak: AtomicUsize,
        }

        #[async_trait]
        impl RunHandler for PeakHandler {
            async fn run(&self, _batch: RunBatch, _cancel: oneshot::Receiver<()>) -> RunReply {
                let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                self.running.fetch_sub(1, Ordering::SeqCst);
                Ok(RunOutcome::default())
            }
        }

        let handler = Arc::new(PeakHandler {
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let scheduler = Scheduler::new(
            &LanesConfig::default(),
            SessionQueueConfig::default(), // max_concurrent = 1
            handler.clone(),
        );
        let key = SessionKey::group("ada", "discord", "c1");
        let rx1 = scheduler
            .submit_with_concurrency(LaneName::Main, request(&key, "a"), Some(2))
            .await;
        let rx2 = scheduler
            .submit_with_concurrency(LaneName::Main, request(&key, "b"), Some(2))
            .await;
        assert!(rx1.await.unwrap().is_ok());
        assert!(rx2.await.unwrap().is_ok());
        assert_eq!(handler.peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cancel_session_on_unknown_key_is_false() {
        let (scheduler, _) = scheduler();
        let key = SessionKey::direct("ada", "web", "nobody");
        assert!(!scheduler.cancel_session(&key).await);
        assert!(!scheduler.cancel_one_session(&key).await);
    }

    #[tokio::test]
    async fn spawner_submits_on_subagent_lane() {
        let (scheduler, handler) = scheduler();
        let key = SessionKey::subagent("ada", "parent", "n1");
        let rx = SubagentSpawner::spawn(&scheduler, request(&key, "child task"))
            .await
            .unwrap();
        let outcome = rx.await.unwrap().unwrap();
        assert_eq!(outcome.reply.as_deref(), Some("ok: child task"));
        assert_eq!(handler.runs.load(Ordering::SeqCst), 1);
        assert!(scheduler.lane_stats(LaneName::Subagent).submitted_total >= 1);
    }

    #[tokio::test]
    async fn spawner_refuses_while_draining() {
        let (scheduler, _) = scheduler();
        scheduler.mark_draining();
        let key = SessionKey::subagent("ada", "parent", "n1");
        let result = SubagentSpawner::spawn(&scheduler, request(&key, "child")).await;
        assert!(matches!(result, Err(GatewayError::Draining)));
    }
}
