// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::debug;

/// Channel-side callback fired by the controller (typing-indicator start or
/// stop).  Must be cheap and non-blocking; real adapters enqueue an API call.
pub type FireFn = Arc<dyn Fn() + Send + Sync>;

/// Per-run typing/reaction lifecycle.
///
/// Naive single-signal cleanup either leaves a phantom typing indicator
/// (run finished, delivery failed) or clears it too early (channel still
/// emitting chunks).  This controller requires BOTH completion signals —
/// run complete and dispatch idle — before stopping, with a TTL safety net
/// for when one never arrives:
///
/// - `start()` fires the channel start once, arms the TTL, and begins the
///   keepalive loop when configured.
/// - `stop()` is idempotent: the channel stop fires exactly once, ever.
/// - After stop, all further starts (including scheduled keepalives) are
///   silently suppressed.
#[derive(Clone)]
pub struct FeedbackController {
    inner: Arc<Inner>,
}

struct Inner {
    start_fn: FireFn,
    stop_fn: FireFn,
    ttl: Duration,
    keepalive: Option<Duration>,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    started: bool,
    stopped: bool,
    run_complete: bool,
    dispatch_idle: bool,
}

impl FeedbackController {
    /// `keepalive = None` disables the re-fire loop.
    pub fn new(
        start_fn: FireFn,
        stop_fn: FireFn,
        ttl: Duration,
        keepalive: Option<Duration>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                start_fn,
                stop_fn,
                ttl,
                keepalive,
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Fire the channel start once and arm the TTL safety timer.
    /// Subsequent calls (and any call after stop) are no-ops.
    pub fn start(&self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.started || state.stopped {
                return;
            }
            state.started = true;
        }
        (self.inner.start_fn)();

        // TTL safety net: force-stop even if a completion signal is lost.
        let ttl = self.inner.ttl;
        let controller = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            if !controller.is_stopped() {
                debug!("feedback TTL expired; forcing stop");
                controller.stop();
            }
        });

        if let Some(interval) = self.inner.keepalive {
            let controller = self.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(interval).await;
                    if controller.is_stopped() {
                        break;
                    }
                    (controller.inner.start_fn)();
                }
            });
        }
    }

    /// The agent run reached a terminal state.
    pub fn mark_run_complete(&self) {
        let fire = {
            let mut state = self.inner.state.lock().unwrap();
            state.run_complete = true;
            state.run_complete && state.dispatch_idle && !state.stopped
        };
        if fire {
            self.stop();
        }
    }

    /// The channel adapter finished writing the reply.
    pub fn mark_dispatch_idle(&self) {
        let fire = {
            let mut state = self.inner.state.lock().unwrap();
            state.dispatch_idle = true;
            state.run_complete && state.dispatch_idle && !state.stopped
        };
        if fire {
            self.stop();
        }
    }

    /// Idempotent: fires the channel stop exactly once.
    pub fn stop(&self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.stopped {
                return;
            }
            state.stopped = true;
        }
        (self.inner.stop_fn)();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.state.lock().unwrap().stopped
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct Counters {
        starts: Arc<AtomicUsize>,
        stops: Arc<AtomicUsize>,
    }

    fn controller(ttl: Duration, keepalive: Option<Duration>) -> (FeedbackController, Counters) {
        let starts = Arc::new(AtomicUsize::new(0));
        let stops = Arc::new(AtomicUsize::new(0));
        let s1 = Arc::clone(&starts);
        let s2 = Arc::clone(&stops);
        let ctrl = FeedbackController::new(
            Arc::new(move || {
                s1.fetch_add(1, Ordering::SeqCst);
            }),
            Arc::new(move || {
                s2.fetch_add(1, Ordering::SeqCst);
            }),
            ttl,
            keepalive,
        );
        (ctrl, Counters { starts, stops })
    }

    #[tokio::test]
    async fn start_fires_channel_start_once() {
        let (ctrl, c) = controller(Duration::from_secs(60), None);
        ctrl.start();
        ctrl.start();
        assert_eq!(c.starts.load(Ordering::SeqCst), 1);
        assert_eq!(c.stops.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn neither_signal_alone_stops() {
        let (ctrl, c) = controller(Duration::from_secs(60), None);
        ctrl.start();
        ctrl.mark_run_complete();
        assert_eq!(c.stops.load(Ordering::SeqCst), 0);

        let (ctrl2, c2) = controller(Duration::from_secs(60), None);
        ctrl2.start();
        ctrl2.mark_dispatch_idle();
        assert_eq!(c2.stops.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn both_signals_stop_in_either_order() {
        let (ctrl, c) = controller(Duration::from_secs(60), None);
        ctrl.start();
        ctrl.mark_run_complete();
        ctrl.mark_dispatch_idle();
        assert_eq!(c.stops.load(Ordering::SeqCst), 1);

        let (ctrl2, c2) = controller(Duration::from_secs(60), None);
        ctrl2.start();
        ctrl2.mark_dispatch_idle();
        ctrl2.mark_run_complete();
        assert_eq!(c2.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn repeated_stop_fires_exactly_once() {
        let (ctrl, c) = controller(Duration::from_secs(60), None);
        ctrl.start();
        ctrl.stop();
        ctrl.stop();
        ctrl.stop();
        assert_eq!(c.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn signals_after_stop_do_not_refire() {
        let (ctrl, c) = controller(Duration::from_secs(60), None);
        ctrl.start();
        ctrl.stop();
        ctrl.mark_run_complete();
        ctrl.mark_dispatch_idle();
        assert_eq!(c.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn ttl_expiry_stops_exactly_once() {
        let (ctrl, c) = controller(Duration::from_millis(50), None);
        ctrl.start();
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(c.stops.load(Ordering::SeqCst), 1);
        // And a later explicit stop does not double-fire.
        ctrl.stop();
        assert_eq!(c.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn keepalive_refires_while_open_then_ceases() {
        let (ctrl, c) = controller(Duration::from_secs(60), Some(Duration::from_millis(30)));
        ctrl.start();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let while_open = c.starts.load(Ordering::SeqCst);
        assert!(while_open >= 3, "expected initial + >=2 keepalives, got {while_open}");

        ctrl.stop();
        tokio::time::sleep(Duration::from_millis(70)).await;
        let after_close = c.starts.load(Ordering::SeqCst);
        // At most one keepalive already in flight when stop landed.
        assert!(
            after_close <= while_open + 1,
            "keepalive kept firing after close: {after_close} vs {while_open}"
        );
    }

    #[tokio::test]
    async fn start_after_stop_is_a_no_op() {
        let (ctrl, c) = controller(Duration::from_secs(60), None);
        ctrl.start();
        ctrl.stop();
        ctrl.start();
        assert_eq!(c.starts.load(Ordering::SeqCst), 1);
    }
}
