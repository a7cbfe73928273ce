// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use hermod_config::{LaneConfig, LanesConfig};

/// A job submitted to a lane.  Jobs must be total: they never block
/// indefinitely on resources they do not own.
pub type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Named work classes.  Lanes are pure parallelism quotas; they never
/// reason about sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LaneName {
    /// User-facing turns.
    Main,
    /// Spawned subagent runs.
    Subagent,
    /// Scheduled jobs and heartbeats.
    Cron,
}

impl LaneName {
    pub fn as_str(&self) -> &'static str {
        match self {
            LaneName::Main => "main",
            LaneName::Subagent => "subagent",
            LaneName::Cron => "cron",
        }
    }
}

impl std::fmt::Display for LaneName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitResult {
    Ok,
    /// The job queue is saturated.
    Full,
    /// The lane was stopped; no new jobs accepted.
    Closed,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LaneStats {
    pub workers_busy: usize,
    pub queue_len: usize,
    pub submitted_total: u64,
    pub rejected_total: u64,
}

/// One bounded work pool: a job queue of `queue_depth` drained by
/// `max_workers` worker tasks.
struct Lane {
    name: LaneName,
    tx: mpsc::Sender<Job>,
    closed: AtomicBool,
    busy: AtomicUsize,
    queued: AtomicUsize,
    submitted: AtomicU64,
    rejected: AtomicU64,
}

impl Lane {
    fn new(name: LaneName, config: &LaneConfig) -> Arc<Self> {
        let (tx, rx) = mpsc::channel::<Job>(config.queue_depth.max(1));
        let lane = Arc::new(Self {
            name,
            tx,
            closed: AtomicBool::new(false),
            busy: AtomicUsize::new(0),
            queued: AtomicUsize::new(0),
            submitted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        });

        // Workers share one receiver; each takes the next job as it frees up.
        let rx = Arc::new(Mutex::new(rx));
        for worker in 0..config.max_workers.max(1) {
            let lane = Arc::clone(&lane);
            let rx = Arc::clone(&rx);
            tokio::spawn(async move {
                loop {
                    let job = { rx.lock().await.recv().await };
                    let Some(job) = job else { break };
                    lane.queued.fetch_sub(1, Ordering::AcqRel);
                    lane.busy.fetch_add(1, Ordering::AcqRel);
                    job.await;
                    lane.busy.fetch_sub(1, Ordering::AcqRel);
                }
                debug!(lane = %lane.name, worker, "lane worker exited");
            });
        }
        lane
    }

    fn submit(&self, job: Job) -> SubmitResult {
        if self.closed.load(Ordering::Acquire) {
            self.rejected.fetch_add(1, Ordering::AcqRel);
            return SubmitResult::Closed;
        }
        match self.tx.try_send(job) {
            Ok(()) => {
                self.queued.fetch_add(1, Ordering::AcqRel);
                self.submitted.fetch_add(1, Ordering::AcqRel);
                SubmitResult::Ok
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.rejected.fetch_add(1, Ordering::AcqRel);
                SubmitResult::Full
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.rejected.fetch_add(1, Ordering::AcqRel);
                SubmitResult::Closed
            }
        }
    }

    fn stats(&self) -> LaneStats {
        LaneStats {
            workers_busy: self.busy.load(Ordering::Acquire),
            queue_len: self.queued.load(Ordering::Acquire),
            submitted_total: self.submitted.load(Ordering::Acquire),
            rejected_total: self.rejected.load(Ordering::Acquire),
        }
    }

    /// Stop intake.  Running and already-queued jobs complete.
    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// The three process-wide lanes.  Lanes outlive sessions.
pub struct LanePool {
    main: Arc<Lane>,
    subagent: Arc<Lane>,
    cron: Arc<Lane>,
}

impl LanePool {
    pub fn new(config: &LanesConfig) -> Self {
        Self {
            main: Lane::new(LaneName::Main, &config.main),
            subagent: Lane::new(LaneName::Subagent, &config.subagent),
            cron: Lane::new(LaneName::Cron, &config.cron),
        }
    }

    fn lane(&self, name: LaneName) -> &Lane {
        match name {
            LaneName::Main => &self.main,
            LaneName::Subagent => &self.subagent,
            LaneName::Cron => &self.cron,
        }
    }

    pub fn submit(&self, name: LaneName, job: Job) -> SubmitResult {
        self.lane(name).submit(job)
    }

    pub fn stats(&self, name: LaneName) -> LaneStats {
        self.lane(name).stats()
    }

    /// Signal all lanes to drain: running jobs complete, no new jobs accepted.
    pub fn stop_all(&self) {
        self.main.close();
        self.subagent.close();
        self.cron.close();
    }
}

impl Default for LanePool {
    fn default() -> Self {
        Self::new(&LanesConfig::default())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::oneshot;

    use super::*;

    fn tiny_pool(max_workers: usize, queue_depth: usize) -> LanePool {
        let lane = LaneConfig { max_workers, queue_depth };
        LanePool::new(&LanesConfig {
            main: lane.clone(),
            subagent: lane.clone(),
            cron: lane,
        })
    }

    #[tokio::test]
    async fn submitted_job_runs() {
        let pool = tiny_pool(1, 4);
        let (tx, rx) = oneshot::channel();
        let result = pool.submit(
            LaneName::Main,
            Box::pin(async move {
                let _ = tx.send(42);
            }),
        );
        assert_eq!(result, SubmitResult::Ok);
        assert_eq!(rx.await.unwrap(), 42);
    }

    #[tokio::test]
    async fn saturated_queue_returns_full() {
        let pool = tiny_pool(1, 1);
        // Occupy the single worker.
        let (hold_tx, hold_rx) = oneshot::channel::<()>();
        assert_eq!(
            pool.submit(LaneName::Main, Box::pin(async move {
                let _ = hold_rx.await;
            })),
            SubmitResult::Ok
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
        // Fill the queue slot, then overflow it.
        assert_eq!(
            pool.submit(LaneName::Main, Box::pin(async {})),
            SubmitResult::Ok
        );
        assert_eq!(
            pool.submit(LaneName::Main, Box::pin(async {})),
            SubmitResult::Full
        );
        let stats = pool.stats(LaneName::Main);
        assert_eq!(stats.rejected_total, 1);
        let _ = hold_tx.send(());
    }

    #[tokio::test]
    async fn stopped_lane_refuses_new_jobs() {
        let pool = tiny_pool(1, 4);
        pool.stop_all();
        assert_eq!(
            pool.submit(LaneName::Cron, Box::pin(async {})),
            SubmitResult::Closed
        );
    }

    #[tokio::test]
    async fn running_jobs_complete_after_stop() {
        let pool = tiny_pool(1, 4);
        let (done_tx, done_rx) = oneshot::channel();
        let (go_tx, go_rx) = oneshot::channel::<()>();
        pool.submit(
            LaneName::Main,
            Box::pin(async move {
                let _ = go_rx.await;
                let _ = done_tx.send(());
            }),
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.stop_all();
        let _ = go_tx.send(());
        assert!(done_rx.await.is_ok());
    }

    #[tokio::test]
    async fn workers_bound_parallelism() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let pool = tiny_pool(2, 16);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut waits = Vec::new();
        for _ in 0..6 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            let (tx, rx) = oneshot::channel();
            waits.push(rx);
            pool.submit(
                LaneName::Subagent,
                Box::pin(async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    let _ = tx.send(());
                }),
            );
        }
        for rx in waits {
            let _ = rx.await;
        }
        assert!(peak.load(Ordering::SeqCst) <= 2, "peak {} > 2", peak.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn stats_count_submissions() {
        let pool = tiny_pool(1, 8);
        for _ in 0..3 {
            pool.submit(LaneName::Main, Box::pin(async {}));
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
        let stats = pool.stats(LaneName::Main);
        assert_eq!(stats.submitted_total, 3);
        assert_eq!(stats.queue_len, 0);
        assert_eq!(stats.workers_busy, 0);
    }
}
