// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::SendOutcome;
use ddtail_common::MutexExt;
use ddtail_config::DestinationConfig;
use rand::Rng;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Flow-control state for one remote region/endpoint. This is the only
/// concurrent object in the data path; workers reach it through
/// [`DestinationHandle`]'s mutex.
#[derive(Debug)]
pub struct DestinationState {
    config: Arc<DestinationConfig>,
    concurrency: u32,
    inflight: u32,
    consec_net_err: u32,
    consec_quota_err: u32,
    last_net_err: Option<Instant>,
    last_quota_err: Option<Instant>,
    net_retry: Duration,
    quota_retry: Duration,
    network_ok: bool,
    quota_ok: bool,
    concurrency_changed: Instant,
}

/// Read-only view for tests and the self-monitor profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationSnapshot {
    pub concurrency: u32,
    pub inflight: u32,
    pub network_ok: bool,
    pub quota_ok: bool,
    pub consec_net_err: u32,
    pub consec_quota_err: u32,
}

impl DestinationState {
    pub fn new(config: Arc<DestinationConfig>) -> DestinationState {
        let base_quota = quota_base(&config);
        DestinationState {
            concurrency: config.concurrency_max,
            inflight: 0,
            consec_net_err: 0,
            consec_quota_err: 0,
            last_net_err: None,
            last_quota_err: None,
            net_retry: Duration::from_secs(config.network_retry_secs),
            quota_retry: base_quota,
            network_ok: true,
            quota_ok: true,
            concurrency_changed: Instant::now(),
            config,
        }
    }

    /// Gate one send attempt. Handles the timed unblocks (growing the retry
    /// interval on each unblock), the concurrency ceiling, and the drift
    /// nudge that lets a silent destination recover. `urgent` skips the
    /// block flags during shutdown drain but still honors the ceiling.
    pub fn try_acquire(&mut self, now: Instant, urgent: bool) -> bool {
        // Nudge: a destination stuck at the floor with no traffic for the
        // drift window gets another chance even without successes.
        if self.concurrency < self.config.concurrency_min
            || (self.concurrency == self.config.concurrency_min
                && now.duration_since(self.concurrency_changed).as_secs()
                    >= self.config.concurrency_drift_secs)
        {
            self.concurrency = self.config.concurrency_min.max(1);
            self.concurrency_changed = now;
        }

        if !urgent {
            if !self.network_ok {
                let blocked = self
                    .last_net_err
                    .map_or(false, |t| now.duration_since(t) < self.net_retry);
                if blocked {
                    return false;
                }
                info!(
                    destination = %self.config.name,
                    retry = ?self.net_retry,
                    "network unblock, attempting send"
                );
                self.network_ok = true;
                self.net_retry = scale_interval(
                    self.net_retry,
                    self.config.network_retry_scale,
                    self.config.network_retry_max_secs,
                );
            }
            if !self.quota_ok {
                let blocked = self
                    .last_quota_err
                    .map_or(false, |t| now.duration_since(t) < self.quota_retry);
                if blocked {
                    return false;
                }
                info!(
                    destination = %self.config.name,
                    retry = ?self.quota_retry,
                    "quota unblock, attempting send"
                );
                self.quota_ok = true;
                self.quota_retry = scale_interval(
                    self.quota_retry,
                    self.config.quota_retry_scale,
                    self.config.quota_retry_max_secs,
                );
            }
        }

        if self.inflight >= self.concurrency {
            return false;
        }
        self.inflight += 1;
        true
    }

    pub fn release(&mut self) {
        self.inflight = self.inflight.saturating_sub(1);
    }

    /// Apply one send result. `urgent` suppresses concurrency decreases so
    /// the shutdown drain cannot strangle itself.
    pub fn record(&mut self, outcome: SendOutcome, now: Instant, urgent: bool) {
        match outcome {
            // A permanent client error counts as success for flow control;
            // the record loss is alarmed elsewhere.
            SendOutcome::Ok | SendOutcome::Discard => {
                self.consec_net_err = 0;
                self.consec_quota_err = 0;
                self.network_ok = true;
                self.quota_ok = true;
                self.net_retry = Duration::from_secs(self.config.network_retry_secs);
                self.quota_retry = quota_base(&self.config);
                if self.concurrency < self.config.concurrency_max {
                    self.concurrency =
                        (self.concurrency + 2).min(self.config.concurrency_max);
                    self.concurrency_changed = now;
                }
            }
            SendOutcome::NetworkFail => {
                self.last_net_err = Some(now);
                self.consec_net_err += 1;
                if self.consec_net_err >= self.config.network_error_threshold {
                    if self.network_ok {
                        debug!(
                            destination = %self.config.name,
                            consecutive = self.consec_net_err,
                            "network blocked"
                        );
                    }
                    self.network_ok = false;
                }
            }
            SendOutcome::QuotaFail => {
                self.last_quota_err = Some(now);
                self.consec_quota_err += 1;
                if self.consec_quota_err >= self.config.quota_error_threshold {
                    self.quota_ok = false;
                }
                if !urgent && self.concurrency > self.config.concurrency_min {
                    self.concurrency = self.config.concurrency_min;
                    self.concurrency_changed = now;
                }
            }
        }
    }

    pub fn snapshot(&self) -> DestinationSnapshot {
        DestinationSnapshot {
            concurrency: self.concurrency,
            inflight: self.inflight,
            network_ok: self.network_ok,
            quota_ok: self.quota_ok,
            consec_net_err: self.consec_net_err,
            consec_quota_err: self.consec_quota_err,
        }
    }
}

/// Shared handle; one per destination, cloned into every worker.
#[derive(Debug, Clone)]
pub struct DestinationHandle {
    inner: Arc<Mutex<DestinationState>>,
}

impl DestinationHandle {
    pub fn new(config: Arc<DestinationConfig>) -> DestinationHandle {
        DestinationHandle {
            inner: Arc::new(Mutex::new(DestinationState::new(config))),
        }
    }

    pub fn try_acquire(&self, now: Instant, urgent: bool) -> bool {
        self.inner.lock_or_panic().try_acquire(now, urgent)
    }

    pub fn release(&self) {
        self.inner.lock_or_panic().release();
    }

    pub fn record(&self, outcome: SendOutcome, now: Instant, urgent: bool) {
        self.inner.lock_or_panic().record(outcome, now, urgent);
    }

    pub fn snapshot(&self) -> DestinationSnapshot {
        self.inner.lock_or_panic().snapshot()
    }
}

/// Base quota retry carries a little jitter so a fleet of agents does not
/// hammer a throttled endpoint in lockstep.
fn quota_base(config: &DestinationConfig) -> Duration {
    let jitter = rand::thread_rng().gen_range(0..5);
    Duration::from_secs(config.quota_retry_secs + jitter)
}

fn scale_interval(current: Duration, scale: f64, cap_secs: u64) -> Duration {
    let scaled = current.as_secs_f64() * scale;
    Duration::from_secs_f64(scaled.min(cap_secs as f64))
}
