// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The send side of the agent: sealed batches in, acknowledged bytes out.
//!
//! Each destination owns a queue, a worker pool and a flow-control state
//! machine. Network failures block the destination only after a long
//! consecutive run; a single quota rejection drops concurrency to the floor
//! immediately. Both recover through timed unblocks whose intervals grow
//! multiplicatively. Exactly-once sources additionally route every batch
//! through a durable range slot, at most one in flight per file.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

mod destination;
mod exactly_once;
mod payload;
mod transport;
mod worker;

pub use destination::{DestinationHandle, DestinationSnapshot, DestinationState};
pub use exactly_once::RangeScheduler;
pub use payload::{
    decode_body, encode_batch, EncodedBatch, SenderMeta, WirePayload, WireRecord,
};
pub use transport::{
    BatchTransport, HttpTransport, MemoryTransport, RoutingTransport, SendOutcome,
};
pub use worker::Sender;

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("destination {0} is not configured")]
    UnknownDestination(String),
    #[error("payload encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("invalid endpoint url: {0}")]
    Endpoint(String),
    #[error(transparent)]
    Store(#[from] ddtail_checkpoint::StoreError),
}
