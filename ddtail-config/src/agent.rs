// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::{ConfigError, DestinationConfig, SourceConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable overriding the `--config` path.
pub const ENV_CONFIG_PATH: &str = "AGENT_CONFIG_PATH";
/// Identity metadata attached to outgoing records.
pub const ENV_USER_ID: &str = "AGENT_USER_ID";
pub const ENV_USER_DEFINED_ID: &str = "AGENT_USER_DEFINED_ID";

/// Top-level agent configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub destinations: Vec<DestinationConfig>,
    /// Directory holding the checkpoint store and its lock file.
    #[serde(default = "default_checkpoint_dir")]
    pub checkpoint_dir: PathBuf,
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub resource: ResourceConfig,
    #[serde(default)]
    pub gc: GcConfig,

    /// Global cap on simultaneously open readers.
    #[serde(default = "default_max_open_readers")]
    pub max_open_readers: usize,
    /// A deleted file's reader is destroyed once idle this long.
    #[serde(default = "default_reader_expire_secs")]
    pub reader_expire_secs: u64,
    /// Read chunk size per I/O call.
    #[serde(default = "default_read_chunk_bytes")]
    pub read_chunk_bytes: usize,
    /// Per-reader byte budget per tick, so one busy file cannot starve the
    /// input thread.
    #[serde(default = "default_tick_budget_bytes")]
    pub tick_budget_bytes: usize,
    /// Bound on total drain time during shutdown.
    #[serde(default = "default_exit_drain_secs")]
    pub exit_drain_secs: u64,

    /// Identity metadata, overridable from the environment.
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub user_defined_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WatchConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// OS notifier watch budget; paths past it are poll-only.
    #[serde(default = "default_max_watches")]
    pub max_watches: usize,
    /// Entry cap per polling walk.
    #[serde(default = "default_max_poll_entries")]
    pub max_poll_entries: usize,
    /// Watches whose whole subtree has been idle this long are dropped.
    #[serde(default = "default_watch_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// De-duplication window for merged notifier/poller events.
    #[serde(default = "default_coalesce_ms")]
    pub coalesce_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        WatchConfig {
            poll_interval_secs: default_poll_interval_secs(),
            max_watches: default_max_watches(),
            max_poll_entries: default_max_poll_entries(),
            idle_timeout_secs: default_watch_idle_timeout_secs(),
            coalesce_ms: default_coalesce_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceConfig {
    /// Soft CPU cap in cores.
    #[serde(default = "default_cpu_limit")]
    pub cpu_usage_limit: f64,
    /// Soft RSS cap in bytes.
    #[serde(default = "default_mem_limit")]
    pub mem_usage_limit: u64,
    /// Consecutive over-limit samples before graceful suicide.
    #[serde(default = "default_violation_count")]
    pub violation_count: u32,
    /// Allow raising the effective CPU cap when headroom exists.
    #[serde(default)]
    pub auto_scale: bool,
    /// CPU cap increment per auto-scale step, in cores.
    #[serde(default = "default_cpu_scale_step")]
    pub cpu_scale_step: f64,
    /// Machine-wide fraction of cores the scaled cap may not exceed.
    #[serde(default = "default_machine_cpu_fraction")]
    pub machine_cpu_fraction: f64,
    /// Oldest-unread-record age that triggers a warning.
    #[serde(default = "default_slow_read_warn_secs")]
    pub slow_read_warn_secs: u64,
    /// Oldest-unread-record age that force-exits the process.
    #[serde(default = "default_slow_read_exit_secs")]
    pub slow_read_exit_secs: u64,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        ResourceConfig {
            cpu_usage_limit: default_cpu_limit(),
            mem_usage_limit: default_mem_limit(),
            violation_count: default_violation_count(),
            auto_scale: false,
            cpu_scale_step: default_cpu_scale_step(),
            machine_cpu_fraction: default_machine_cpu_fraction(),
            slow_read_warn_secs: default_slow_read_warn_secs(),
            slow_read_exit_secs: default_slow_read_exit_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GcConfig {
    #[serde(default = "default_gc_interval_secs")]
    pub interval_secs: u64,
    /// Incremental scan budget per GC pass.
    #[serde(default = "default_gc_scan_budget_ms")]
    pub scan_budget_ms: u64,
    /// Grace period for checkpoints sitting in the deferred-delete list.
    #[serde(default = "default_gc_grace_secs")]
    pub grace_secs: u64,
    /// Acknowledged range checkpoints older than this are collectable.
    #[serde(default = "default_gc_retention_secs")]
    pub retention_secs: u64,
}

impl Default for GcConfig {
    fn default() -> Self {
        GcConfig {
            interval_secs: default_gc_interval_secs(),
            scan_budget_ms: default_gc_scan_budget_ms(),
            grace_secs: default_gc_grace_secs(),
            retention_secs: default_gc_retention_secs(),
        }
    }
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from("/var/lib/ddtail")
}
fn default_max_open_readers() -> usize {
    512
}
fn default_reader_expire_secs() -> u64 {
    3600
}
fn default_read_chunk_bytes() -> usize {
    512 * 1024
}
fn default_tick_budget_bytes() -> usize {
    1024 * 1024
}
fn default_exit_drain_secs() -> u64 {
    20
}
fn default_poll_interval_secs() -> u64 {
    5
}
fn default_max_watches() -> usize {
    3000
}
fn default_max_poll_entries() -> usize {
    10_000
}
fn default_watch_idle_timeout_secs() -> u64 {
    900
}
fn default_coalesce_ms() -> u64 {
    100
}
fn default_cpu_limit() -> f64 {
    2.0
}
fn default_mem_limit() -> u64 {
    2 * 1024 * 1024 * 1024
}
fn default_violation_count() -> u32 {
    10
}
fn default_cpu_scale_step() -> f64 {
    0.1
}
fn default_machine_cpu_fraction() -> f64 {
    0.4
}
fn default_slow_read_warn_secs() -> u64 {
    120
}
fn default_slow_read_exit_secs() -> u64 {
    600
}
fn default_gc_interval_secs() -> u64 {
    60
}
fn default_gc_scan_budget_ms() -> u64 {
    50
}
fn default_gc_grace_secs() -> u64 {
    600
}
fn default_gc_retention_secs() -> u64 {
    86400
}

impl AgentConfig {
    /// Load and parse the config file, applying environment overrides for
    /// the identity fields.
    pub fn from_file(path: &Path) -> Result<AgentConfig, ConfigError> {
        let data = std::fs::read(path).map_err(|err| ConfigError::Io {
            path: path.to_owned(),
            err,
        })?;
        let mut config: AgentConfig = serde_json::from_slice(&data)?;
        if let Ok(user_id) = std::env::var(ENV_USER_ID) {
            config.user_id = Some(user_id);
        }
        if let Ok(user_defined_id) = std::env::var(ENV_USER_DEFINED_ID) {
            config.user_defined_id = Some(user_defined_id);
        }
        Ok(config)
    }
}
