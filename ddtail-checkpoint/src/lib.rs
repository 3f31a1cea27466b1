// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Durable per-file read state for the ddtail agent.
//!
//! Two kinds of checkpoints live in one ordered key/value store:
//!
//! - **Primary checkpoints**, one per file, holding the file identity
//!   (`device`, `inode`, prefix signature), paths and the read offset.
//! - **Range checkpoints**, exactly-once mode only: per primary key, up to K
//!   half-open byte ranges with their send status, so a crash can neither
//!   duplicate nor lose a block.
//!
//! The store guarantees atomic batch updates: after a crash either every
//! entry of a `batch_put`/`batch_delete` is visible or none is.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

mod gc;
mod keys;
mod store;
mod types;

pub use gc::{CheckpointGc, GcView};
pub use keys::{
    primary_key, primary_key_source, range_key, split_range_key, PRIMARY_PREFIX, RANGE_PREFIX,
};
pub use store::{CheckpointStore, ScanMode};
pub use types::{PrimaryCheckpoint, RangeCheckpoint, RangeStatus};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Underlying I/O failure; callers degrade to reading from offset 0.
    #[error("checkpoint store unavailable: {0}")]
    Unavailable(#[from] std::io::Error),
    #[error("checkpoint store locked by pid {0}")]
    Locked(u32),
    #[error("corrupt checkpoint entry for key {key}: {message}")]
    Corrupt { key: String, message: String },
}
