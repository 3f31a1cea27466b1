// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Range-slot scheduling for exactly-once sources.
//!
//! A file declared with concurrency K owns up to K durable range slots.
//! Every batch covers a byte range; the scheduler assigns it to a free slot
//! and marks it in-flight. At most one slot per file is in flight per epoch,
//! which bounds delivery to at-most-once; acknowledging before the
//! checkpoint commit bounds it to at-least-once. A K change between runs
//! starts a new epoch: the acknowledged prefix becomes the new base offset
//! and the remaining bytes are re-split as fresh batches arrive.

use ddtail_checkpoint::{
    range_key, CheckpointStore, RangeCheckpoint, RangeStatus, StoreError,
};
use ddtail_pipeline::BatchRange;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

#[derive(Clone)]
pub struct RangeScheduler {
    store: Arc<CheckpointStore>,
}

impl RangeScheduler {
    pub fn new(store: Arc<CheckpointStore>) -> RangeScheduler {
        RangeScheduler { store }
    }

    /// Try to place `range` into a slot. Returns `None` while another range
    /// of the same primary key is in flight; the caller waits and retries.
    pub fn assign(
        &self,
        range: &BatchRange,
        k: u32,
        sequence: u64,
    ) -> Result<Option<u32>, StoreError> {
        let existing = self.store.ranges_of(&range.primary_key);
        if existing
            .iter()
            .any(|(_, r)| r.status == RangeStatus::InFlight)
        {
            return Ok(None);
        }
        let free = (0..k).find(|i| !existing.iter().any(|(idx, _)| idx == i));
        let index = match free {
            Some(index) => index,
            None => {
                // All slots populated: recycle the oldest acknowledged one.
                match existing
                    .iter()
                    .filter(|(_, r)| r.status == RangeStatus::Acknowledged)
                    .min_by_key(|(_, r)| r.sequence)
                    .map(|(index, _)| *index)
                {
                    Some(index) => index,
                    None => return Ok(None),
                }
            }
        };
        self.store.put_range(
            range_key(&range.primary_key, index),
            &RangeCheckpoint {
                begin: range.begin,
                end: range.end,
                status: RangeStatus::InFlight,
                sequence,
                updated_at: unix_now(),
            },
        )?;
        debug!(
            primary = %String::from_utf8_lossy(&range.primary_key),
            index,
            begin = range.begin,
            end = range.end,
            "range assigned"
        );
        Ok(Some(index))
    }

    /// The destination acknowledged the slot's bytes; persist before the
    /// caller advances any checkpoint.
    pub fn acknowledge(&self, primary_key: &[u8], index: u32) -> Result<(), StoreError> {
        let key = range_key(primary_key, index);
        match self.store.get_range(&key)? {
            Some(mut range) => {
                range.status = RangeStatus::Acknowledged;
                range.updated_at = unix_now();
                self.store.put_range(key, &range)
            }
            None => {
                warn!(
                    primary = %String::from_utf8_lossy(primary_key),
                    index,
                    "acknowledging a missing range slot"
                );
                Ok(())
            }
        }
    }

    /// Start a new epoch for `primary_key`: compute the contiguous
    /// acknowledged prefix, drop every slot, and return the prefix end as
    /// the new base offset. Bytes past it are re-read and re-split under the
    /// new K. Also used to repair a range-coverage invariant violation.
    pub fn rebase_epoch(&self, primary_key: &[u8]) -> Result<Option<u64>, StoreError> {
        let mut ranges = self.store.ranges_of(primary_key);
        if ranges.is_empty() {
            return Ok(None);
        }
        ranges.sort_by_key(|(_, r)| r.begin);
        let mut prefix = ranges[0].1.begin;
        for (_, range) in &ranges {
            if range.status == RangeStatus::Acknowledged && range.begin <= prefix {
                prefix = prefix.max(range.end);
            } else {
                break;
            }
        }
        let keys: Vec<Vec<u8>> = ranges
            .iter()
            .map(|(index, _)| range_key(primary_key, *index))
            .collect();
        self.store.batch_delete(keys)?;
        debug!(
            primary = %String::from_utf8_lossy(primary_key),
            prefix,
            "epoch rebased"
        );
        Ok(Some(prefix))
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
