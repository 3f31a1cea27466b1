// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Hand-off seam to an optional extended processor host.
//!
//! The core does not run user code; it hands records across this boundary
//! synchronously and accepts finished batches back into the send path. The
//! host side (plugin loading, scheduling, its own pipelines) lives outside
//! this crate.

use ddtail_common::tag::Tag;
use ddtail_pipeline::Batch;
use ddtail_sender::Sender;
use std::sync::Arc;
use tracing::warn;

/// Status returned by [`ExtendedProcessor::process`]. Zero means consumed;
/// anything else is logged and the record continues down the native path.
pub const PROCESS_OK: i32 = 0;

/// Implemented by an out-of-core processor host.
pub trait ExtendedProcessor: Send + Sync {
    /// Synchronous hand-off of one merged record. `config_name` identifies
    /// the source configuration the record came from.
    fn process(&self, config_name: &str, record: &[u8], tags: &[Tag]) -> i32;
}

/// The channel through which an extended processor pushes its asynchronous
/// output back into the agent's send path.
#[derive(Clone)]
pub struct ExtensionHost {
    sender: Arc<Sender>,
}

impl ExtensionHost {
    pub fn new(sender: Arc<Sender>) -> ExtensionHost {
        ExtensionHost { sender }
    }

    /// Enqueue a batch produced by the extended processor. The batch enters
    /// the same per-destination queues as native data.
    pub async fn send(&self, config_name: &str, mut batch: Batch, partition: &str) {
        batch.partition = partition.to_owned();
        if let Err(e) = self.sender.submit(batch).await {
            warn!(config = config_name, error = %e, "extension batch rejected");
        }
    }
}
