// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "hermod", about = "Multi-tenant AI agent gateway", version)]
pub struct Cli {
    /// Explicit config file, merged over the discovered layers.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log to stderr at debug level (RUST_LOG overrides).
    #[arg(long, short, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the gateway with a line-oriented local channel on stdin (default).
    Serve {
        /// Agent identity used for session keys and the system prompt.
        #[arg(long, default_value = "hermod")]
        agent_id: String,
        /// Mark the local operator as the agent's owner.
        #[arg(long)]
        owner: Option<String>,
    },
    /// Print the merged configuration and exit.
    ShowConfig,
}
