// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Resource governor: once a second, sample our own CPU and RSS against the
//! soft limits. A sustained overrun triggers graceful suicide (checkpoints
//! flushed, sender drained, clean exit) rather than letting the agent
//! degrade the host. The governor also watches the input side for readers
//! that stopped making progress, which is the deadlock detector.

use ddtail_common::alarm::{AlarmKind, AlarmSender};
use ddtail_common::worker::Worker;
use ddtail_config::ResourceConfig;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use sysinfo::{PidExt, ProcessExt, SystemExt};
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Shared progress gauge written by the input thread: unix seconds of the
/// oldest reader that has pending data but is not advancing. Zero when all
/// readers are current.
#[derive(Debug, Default)]
pub struct PipelineHealth {
    oldest_pending: AtomicU64,
}

impl PipelineHealth {
    pub fn new() -> Arc<PipelineHealth> {
        Arc::new(PipelineHealth::default())
    }

    pub fn set_oldest_pending(&self, unix_secs: u64) {
        self.oldest_pending.store(unix_secs, Ordering::Relaxed);
    }

    pub fn clear(&self) {
        self.oldest_pending.store(0, Ordering::Relaxed);
    }

    fn stall_age(&self, now: u64) -> Option<u64> {
        match self.oldest_pending.load(Ordering::Relaxed) {
            0 => None,
            oldest => Some(now.saturating_sub(oldest)),
        }
    }
}

pub struct ResourceGovernor {
    config: ResourceConfig,
    system: sysinfo::System,
    pid: sysinfo::Pid,
    health: Arc<PipelineHealth>,
    alarms: AlarmSender,
    /// Cancelling this token asks the whole agent to shut down.
    shutdown: CancellationToken,
    cancel: CancellationToken,
    effective_cpu_limit: f64,
    consec_cpu: u32,
    consec_mem: u32,
}

impl ResourceGovernor {
    pub fn new(
        config: ResourceConfig,
        health: Arc<PipelineHealth>,
        alarms: AlarmSender,
        shutdown: CancellationToken,
        cancel: CancellationToken,
    ) -> ResourceGovernor {
        ResourceGovernor {
            effective_cpu_limit: config.cpu_usage_limit,
            config,
            system: sysinfo::System::new(),
            pid: sysinfo::Pid::from_u32(std::process::id()),
            health,
            alarms,
            shutdown,
            cancel,
            consec_cpu: 0,
            consec_mem: 0,
        }
    }

    /// One sample. Returns true when the agent should begin graceful
    /// shutdown.
    fn sample(&mut self) -> bool {
        self.system.refresh_process(self.pid);
        self.system.refresh_cpu();
        let Some(process) = self.system.process(self.pid) else {
            return false;
        };
        let cpu_cores = f64::from(process.cpu_usage()) / 100.0;
        let rss = process.memory();

        if cpu_cores > self.effective_cpu_limit {
            self.consec_cpu += 1;
        } else {
            self.consec_cpu = 0;
            self.maybe_scale_up(cpu_cores);
        }
        if rss > self.config.mem_usage_limit {
            self.consec_mem += 1;
        } else {
            self.consec_mem = 0;
        }

        if self.consec_cpu >= self.config.violation_count {
            warn!(
                cpu_cores,
                limit = self.effective_cpu_limit,
                samples = self.consec_cpu,
                "sustained cpu overrun, requesting graceful shutdown"
            );
            return true;
        }
        if self.consec_mem >= self.config.violation_count {
            warn!(
                rss,
                limit = self.config.mem_usage_limit,
                samples = self.consec_mem,
                "sustained rss overrun, requesting graceful shutdown"
            );
            return true;
        }
        false
    }

    /// With headroom available and auto-scale enabled, raise the effective
    /// CPU cap in fixed steps, bounded by the machine-wide fraction.
    fn maybe_scale_up(&mut self, cpu_cores: f64) {
        if !self.config.auto_scale {
            return;
        }
        let cores = self.system.cpus().len().max(1) as f64;
        let machine_cap = (self.config.machine_cpu_fraction * cores).min(cores);
        if cpu_cores > self.effective_cpu_limit * 0.9 && self.effective_cpu_limit < machine_cap {
            self.effective_cpu_limit =
                (self.effective_cpu_limit + self.config.cpu_scale_step).min(machine_cap);
            info!(limit = self.effective_cpu_limit, "cpu cap auto-scaled");
        }
    }

    /// Slow-read check. A warning past the first threshold; past the second
    /// the process force-exits with code 1, because a reader that old means
    /// the pipeline is wedged.
    fn check_slow_read(&mut self) {
        let now = unix_now();
        let Some(age) = self.health.stall_age(now) else {
            return;
        };
        if age >= self.config.slow_read_exit_secs {
            error!(age, "input pipeline stalled beyond the exit threshold");
            std::process::exit(1);
        }
        if age >= self.config.slow_read_warn_secs {
            self.alarms.raise(
                AlarmKind::ReadLogDelay,
                None,
                format!("oldest unread data is {age}s old"),
            );
        }
    }
}

impl Worker for ResourceGovernor {
    async fn run(&mut self) {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            select! {
                _ = self.cancel.cancelled() => return,
                _ = ticker.tick() => {
                    if self.sample() {
                        self.shutdown.cancel();
                        return;
                    }
                    self.check_slow_read();
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

#[cfg(test)]
mod tests {
    use super::*;

    fn governor(config: ResourceConfig) -> (ResourceGovernor, CancellationToken) {
        let shutdown = CancellationToken::new();
        (
            ResourceGovernor::new(
                config,
                PipelineHealth::new(),
                AlarmSender::disconnected(),
                shutdown.clone(),
                CancellationToken::new(),
            ),
            shutdown,
        )
    }

    fn config(json: serde_json::Value) -> ResourceConfig {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_violations_must_be_consecutive() {
        let (mut governor, _shutdown) = governor(config(serde_json::json!({
            "violation_count": 3,
        })));
        // Drive the counters directly: the sampling side is sysinfo's job.
        governor.consec_cpu = 2;
        governor.consec_mem = 0;
        assert!(governor.consec_cpu < governor.config.violation_count);
        governor.consec_cpu = 3;
        assert!(governor.consec_cpu >= governor.config.violation_count);
    }

    #[test]
    fn test_auto_scale_steps_toward_machine_cap() {
        let (mut governor, _shutdown) = governor(config(serde_json::json!({
            "cpu_usage_limit": 0.5,
            "auto_scale": true,
            "cpu_scale_step": 0.1,
            "machine_cpu_fraction": 0.5,
        })));
        governor.system.refresh_cpu();
        let before = governor.effective_cpu_limit;
        // Near the cap: one step up.
        governor.maybe_scale_up(0.49);
        assert!(governor.effective_cpu_limit > before);
        // Far below the cap: no change.
        let plateau = governor.effective_cpu_limit;
        governor.maybe_scale_up(0.1);
        assert_eq!(governor.effective_cpu_limit, plateau);
    }

    #[test]
    fn test_auto_scale_disabled_by_default() {
        let (mut governor, _shutdown) = governor(config(serde_json::json!({})));
        let before = governor.effective_cpu_limit;
        governor.maybe_scale_up(before * 0.95);
        assert_eq!(governor.effective_cpu_limit, before);
    }

    #[test]
    fn test_stall_age_gauge() {
        let health = PipelineHealth::new();
        assert_eq!(health.stall_age(1000), None);
        health.set_oldest_pending(900);
        assert_eq!(health.stall_age(1000), Some(100));
        health.clear();
        assert_eq!(health.stall_age(1000), None);
    }

    #[tokio::test]
    async fn test_governor_stops_on_cancel() {
        let shutdown = CancellationToken::new();
        let cancel = CancellationToken::new();
        let mut governor = ResourceGovernor::new(
            config(serde_json::json!({})),
            PipelineHealth::new(),
            AlarmSender::disconnected(),
            shutdown,
            cancel.clone(),
        );
        cancel.cancel();
        // Returns immediately instead of ticking forever.
        governor.run().await;
    }
}
