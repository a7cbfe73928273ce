// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;

use crate::{CompletionRequest, ResponseEvent};

pub type ResponseStream = Pin<Box<dyn Stream<Item = anyhow::Result<ResponseEvent>> + Send>>;

/// The model behind an agent.  Implementations live out of tree (HTTP/SSE
/// clients per provider); this crate ships only the deterministic mocks.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Human-readable provider name for status display.
    fn name(&self) -> &str;

    /// Model identifier as reported to users.
    fn model_name(&self) -> &str;

    /// Send a completion request and return a streaming response.
    ///
    /// Cancellation is cooperative: callers drop the stream to abandon an
    /// in-flight call, and implementations tie the underlying request to the
    /// stream's lifetime.
    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<ResponseStream>;

    /// Context window of the underlying model, in tokens.  Drives the
    /// compaction trigger and the adaptive throttle.
    fn context_window(&self) -> usize {
        128_000
    }
}
