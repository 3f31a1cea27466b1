// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One remote intake endpoint plus its flow-control and batching knobs.
///
/// The defaults mirror years of operational tuning: a single quota rejection
/// drops concurrency to the floor immediately, while network failures only
/// block the destination after a long consecutive run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DestinationConfig {
    pub name: String,
    /// Intake endpoint URL, e.g. `https://intake.example.com/v1/batch`.
    pub endpoint: String,
    /// Region label attached to outgoing records.
    #[serde(default)]
    pub region: String,
    #[serde(default = "default_true")]
    pub compression: bool,

    // Send concurrency.
    #[serde(default = "default_concurrency_max")]
    pub concurrency_max: u32,
    #[serde(default = "default_concurrency_min")]
    pub concurrency_min: u32,
    /// A destination stuck below `concurrency_min` for longer than this with
    /// no traffic is nudged back up so it can recover without sends.
    #[serde(default = "default_concurrency_drift_secs")]
    pub concurrency_drift_secs: u64,

    // Network failure discipline.
    #[serde(default = "default_network_error_threshold")]
    pub network_error_threshold: u32,
    #[serde(default = "default_network_retry_secs")]
    pub network_retry_secs: u64,
    #[serde(default = "default_network_retry_max_secs")]
    pub network_retry_max_secs: u64,
    #[serde(default = "default_retry_scale")]
    pub network_retry_scale: f64,

    // Quota failure discipline.
    #[serde(default = "default_quota_error_threshold")]
    pub quota_error_threshold: u32,
    #[serde(default = "default_quota_retry_secs")]
    pub quota_retry_secs: u64,
    #[serde(default = "default_quota_retry_max_secs")]
    pub quota_retry_max_secs: u64,
    #[serde(default = "default_retry_scale")]
    pub quota_retry_scale: f64,

    // Batching thresholds.
    #[serde(default = "default_max_batch_bytes")]
    pub max_batch_bytes: usize,
    #[serde(default = "default_max_batch_count")]
    pub max_batch_count: usize,
    #[serde(default = "default_max_batch_age_ms")]
    pub max_batch_age_ms: u64,
    /// Per-bucket memory bound; exceeding it is the upstream backpressure
    /// signal that pauses readers.
    #[serde(default = "default_max_bucket_bytes")]
    pub max_bucket_bytes: usize,
}

fn default_true() -> bool {
    true
}
fn default_concurrency_max() -> u32 {
    20
}
fn default_concurrency_min() -> u32 {
    1
}
fn default_concurrency_drift_secs() -> u64 {
    300
}
fn default_network_error_threshold() -> u32 {
    60
}
fn default_network_retry_secs() -> u64 {
    1
}
fn default_network_retry_max_secs() -> u64 {
    600
}
fn default_retry_scale() -> f64 {
    2.0
}
fn default_quota_error_threshold() -> u32 {
    1
}
fn default_quota_retry_secs() -> u64 {
    3
}
fn default_quota_retry_max_secs() -> u64 {
    60
}
fn default_max_batch_bytes() -> usize {
    256 * 1024
}
fn default_max_batch_count() -> usize {
    512
}
fn default_max_batch_age_ms() -> u64 {
    3000
}
fn default_max_bucket_bytes() -> usize {
    512 * 1024
}

impl DestinationConfig {
    pub fn max_batch_age(&self) -> Duration {
        Duration::from_millis(self.max_batch_age_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let d: DestinationConfig = serde_json::from_value(serde_json::json!({
            "name": "main",
            "endpoint": "https://intake.example.com/v1/batch",
        }))
        .unwrap();
        assert_eq!(d.concurrency_max, 20);
        assert_eq!(d.quota_error_threshold, 1);
        assert_eq!(d.network_error_threshold, 60);
        assert_eq!(d.max_batch_bytes, 256 * 1024);
        assert_eq!(d.max_bucket_bytes, 512 * 1024);
        assert!(d.compression);
    }
}
