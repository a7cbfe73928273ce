// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use hermod_config::HeartbeatConfig;
use hermod_core::{RunRequest, SessionKey, HEARTBEAT_POLL};

use crate::lanes::LaneName;
use crate::scheduler::Scheduler;

/// Idle producer: periodically submits a synthetic `HEARTBEAT_POLL` turn on
/// the cron lane under the agent's heartbeat session.  The agent loop
/// suppresses delivery of `HEARTBEAT_OK` replies, so a quiet agent costs
/// one silent run per interval.
///
/// The task exits on its own once the scheduler starts draining.
pub fn spawn_heartbeat(
    scheduler: Arc<Scheduler>,
    agent_id: String,
    config: HeartbeatConfig,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = Duration::from_secs(config.interval_secs.max(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick completes immediately; skip it so the initial poll
        // happens one full interval after startup.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if scheduler.is_draining() {
                debug!("heartbeat producer exiting: gateway draining");
                return;
            }
            let request = RunRequest {
                stream: false,
                ..RunRequest::new(
                    SessionKey::heartbeat(&agent_id),
                    agent_id.clone(),
                    HEARTBEAT_POLL,
                )
            };
            let run_id = request.run_id;
            let reply_rx = scheduler.submit(LaneName::Cron, request).await;
            tokio::spawn(async move {
                match reply_rx.await {
                    Ok(Ok(outcome)) => {
                        if let Some(reply) = outcome.reply {
                            debug!(%run_id, "heartbeat produced a deliverable reply: {reply}");
                        }
                    }
                    Ok(Err(e)) => warn!(%run_id, "heartbeat run failed: {e}"),
                    Err(_) => {}
                }
            });
        }
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
