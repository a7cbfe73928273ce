// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands};
use hermod_core::{
    AgentRunner, EventBus, RunEvent, RunRequest, SessionKey, SessionStore,
};
use hermod_gateway::{spawn_heartbeat, FeedbackController, LaneName, Scheduler, UsageProbe};
use hermod_model::{MockProvider, ModelProvider};
use hermod_tools::ToolRegistry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = Arc::new(hermod_config::load(cli.config.as_deref())?);

    match cli.command {
        Some(Commands::ShowConfig) => {
            println!("{}", serde_yaml::to_string(&*config).unwrap_or_default());
            Ok(())
        }
        Some(Commands::Serve { agent_id, owner }) => serve(config, agent_id, owner).await,
        None => serve(config, "hermod".into(), None).await,
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Wire the gateway and drive it from a line-oriented stdin channel.
///
/// Real deployments attach channel adapters (Telegram, Discord, Web) as
/// producers; this local channel exists so the whole pipeline can be
/// exercised from a terminal.  The model defaults to the built-in echo
/// mock — provider HTTP clients plug in out of tree.
async fn serve(
    config: Arc<hermod_config::Config>,
    agent_id: String,
    owner: Option<String>,
) -> anyhow::Result<()> {
    let store = match session_dir(&config) {
        Some(dir) => Arc::new(SessionStore::at(dir)?),
        None => Arc::new(SessionStore::in_memory()),
    };
    let model: Arc<dyn ModelProvider> = Arc::new(MockProvider);
    let events = EventBus::default();

    let mut runner = AgentRunner::new(
        Arc::clone(&store),
        Arc::new(ToolRegistry::new()),
        Arc::clone(&model),
        Arc::new(config.agent.clone()),
    )
    .with_events(events.clone());
    if let Some(owner) = &owner {
        runner = runner.with_owner(owner.clone());
    }
    let runner = Arc::new(runner);

    let probe: UsageProbe = {
        let store = Arc::clone(&store);
        let window = model.context_window();
        Arc::new(move |key| store.try_estimate_tokens(key).map(|tokens| (tokens, window)))
    };
    let scheduler = Arc::new(
        Scheduler::new(&config.gateway.lanes, config.session.clone(), runner.clone())
            .with_usage_probe(probe),
    );
    runner.bind_spawner(scheduler.clone());

    if config.heartbeat.enabled {
        spawn_heartbeat(Arc::clone(&scheduler), agent_id.clone(), config.heartbeat.clone());
    }

    // Stream chunks to stdout as they arrive.
    let mut event_rx = events.subscribe();
    tokio::spawn(async move {
        use std::io::Write;
        while let Ok(event) = event_rx.recv().await {
            if let RunEvent::Chunk { content, .. } = event {
                print!("{content}");
                let _ = std::io::stdout().flush();
            }
        }
    });

    eprintln!("hermod ready; type a message, or /stop, /stopall, /reset, /quit");
    let session = SessionKey::direct(&agent_id, "local", "operator");
    let stdin = tokio::io::stdin();
    let mut lines = tokio::io::AsyncBufReadExt::lines(tokio::io::BufReader::new(stdin));

    while let Some(line) = lines.next_line().await.context("reading stdin")? {
        let line = line.trim().to_string();
        match line.as_str() {
            "" => continue,
            "/quit" => break,
            "/stop" => {
                scheduler.cancel_one_session(&session).await;
                continue;
            }
            "/stopall" => {
                scheduler.cancel_session(&session).await;
                continue;
            }
            "/reset" => {
                scheduler.cancel_session(&session).await;
                store.clear(&session).await?;
                eprintln!("session cleared");
                continue;
            }
            _ => {}
        }

        let request = RunRequest::new(session.clone(), &agent_id, line)
            .with_channel("local");
        let feedback = typing_indicator(&config.feedback);
        feedback.start();

        let reply_rx = scheduler.submit(LaneName::Main, request).await;
        match reply_rx.await {
            Ok(Ok(outcome)) => {
                feedback.mark_run_complete();
                // Chunks already streamed; print silent outcomes explicitly.
                if outcome.reply.is_none() {
                    eprintln!("(no reply)");
                } else {
                    println!();
                }
                feedback.mark_dispatch_idle();
            }
            Ok(Err(e)) => {
                feedback.stop();
                eprintln!("error: {e}");
            }
            Err(_) => feedback.stop(),
        }
    }

    scheduler.stop();
    Ok(())
}

/// Terminal stand-in for a channel typing indicator.
fn typing_indicator(config: &hermod_config::FeedbackConfig) -> FeedbackController {
    let keepalive = (config.keepalive_secs > 0)
        .then(|| Duration::from_secs(config.keepalive_secs));
    FeedbackController::new(
        Arc::new(|| eprintln!("[typing…]")),
        Arc::new(|| eprintln!("[typing stopped]")),
        Duration::from_secs(config.ttl_secs.max(1)),
        keepalive,
    )
}

fn session_dir(config: &hermod_config::Config) -> Option<std::path::PathBuf> {
    config
        .state_dir
        .clone()
        .or_else(|| dirs::data_local_dir().map(|d| d.join("hermod/sessions")))
}
