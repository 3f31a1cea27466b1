// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Background collection of dead checkpoints.
//!
//! A single worker performs budgeted incremental scans so GC cost stays flat
//! regardless of how many files the agent has ever seen. A primary checkpoint
//! is deleted when its source config is gone, when exactly-once is enabled
//! but no ranges remain, when every range has been acknowledged past the
//! retention window, or when the key has sat in the deferred-delete list
//! beyond the grace period.

use crate::keys::{primary_key_source, range_key, PRIMARY_PREFIX};
use crate::store::{CheckpointStore, ScanMode};
use crate::{RangeStatus, StoreError};
use ddtail_common::worker::Worker;
use ddtail_common::MutexExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// What GC needs to know about the current config generation. The lifecycle
/// controller replaces the view on every config swap.
#[derive(Debug, Default, Clone)]
pub struct GcView {
    /// Live source names mapped to whether exactly-once is enabled.
    pub sources: HashMap<String, bool>,
}

pub struct CheckpointGc {
    store: Arc<CheckpointStore>,
    view: Arc<Mutex<GcView>>,
    interval: Duration,
    scan_budget: Duration,
    grace: Duration,
    retention_secs: u64,
    cancel: CancellationToken,
}

impl CheckpointGc {
    pub fn new(
        store: Arc<CheckpointStore>,
        view: Arc<Mutex<GcView>>,
        interval: Duration,
        scan_budget: Duration,
        grace: Duration,
        retention_secs: u64,
        cancel: CancellationToken,
    ) -> CheckpointGc {
        CheckpointGc {
            store,
            view,
            interval,
            scan_budget,
            grace,
            retention_secs,
            cancel,
        }
    }

    /// One GC pass. Public so the lifecycle controller can force a pass in
    /// tests and on config swap.
    pub fn pass(&self) -> Result<usize, StoreError> {
        let now = unix_now();
        let view = self.view.lock_or_panic().clone();
        let mut doomed: Vec<Vec<u8>> = Vec::new();

        for (key, _) in self.store.scan(ScanMode::Incremental {
            budget: self.scan_budget,
        }) {
            if !key.starts_with(PRIMARY_PREFIX) {
                continue;
            }
            let Some(source) = primary_key_source(&key) else {
                warn!(key = %String::from_utf8_lossy(&key), "malformed primary key");
                doomed.push(key);
                continue;
            };
            let ranges = self.store.ranges_of(&key);
            match view.sources.get(source) {
                None => {
                    // Config no longer exists.
                    for (index, _) in &ranges {
                        doomed.push(range_key(&key, *index));
                    }
                    doomed.push(key);
                }
                Some(true) => {
                    let all_expired = !ranges.is_empty()
                        && ranges.iter().all(|(_, r)| {
                            r.status == RangeStatus::Acknowledged
                                && r.updated_at + self.retention_secs <= now
                        });
                    if ranges.is_empty() || all_expired {
                        for (index, _) in &ranges {
                            doomed.push(range_key(&key, *index));
                        }
                        doomed.push(key);
                    }
                }
                Some(false) => {}
            }
        }

        // Deferred deletes whose grace period expired without a rescue.
        for key in self.store.gc_marked(self.grace) {
            for (index, _) in self.store.ranges_of(&key) {
                doomed.push(range_key(&key, index));
            }
            doomed.push(key);
        }

        let count = doomed.len();
        if count > 0 {
            doomed.sort();
            doomed.dedup();
            let elapsed = self.store.batch_delete(doomed)?;
            debug!(count, ?elapsed, "checkpoint gc pass deleted entries");
        }
        Ok(count)
    }
}

impl Worker for CheckpointGc {
    async fn run(&mut self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            select! {
                _ = self.cancel.cancelled() => return,
                _ = ticker.tick() => {
                    if let Err(e) = self.pass() {
                        warn!(error = %e, "checkpoint gc pass failed");
                    }
                }
            }
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
