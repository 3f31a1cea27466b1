// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Trait implemented by the agent's long-running background loops (checkpoint
/// GC, sender workers, resource governor, alarm aggregator).
///
/// The run loop is expected to poll its cancellation token between awaits and
/// return once cancelled, so the lifecycle controller can join every worker
/// during shutdown.
pub trait Worker {
    /// Main worker loop
    fn run(&mut self) -> impl std::future::Future<Output = ()> + Send;
}
