// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Self-monitor profile: per-source cumulative counters (bytes read, lines
//! split, parse failures, send state) flushed periodically as records toward
//! the data destination, so operators can see collection health per source
//! without a separate telemetry stack.

use chrono::Utc;
use ddtail_common::MutexExt;
use ddtail_pipeline::Record;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Default, Clone, Copy)]
pub struct SourceProfile {
    pub read_bytes: u64,
    pub lines: u64,
    pub records: u64,
    pub parse_failures: u64,
    pub time_failures: u64,
    pub outdated_dropped: u64,
    pub encoding_errors: u64,
    pub last_read_unix: u64,
}

/// Shared collector; the input thread adds, the flush task drains.
#[derive(Debug, Default)]
pub struct ProfileCollector {
    cells: Mutex<HashMap<String, SourceProfile>>,
}

impl ProfileCollector {
    pub fn new() -> ProfileCollector {
        ProfileCollector::default()
    }

    pub fn add(&self, source: &str, update: impl FnOnce(&mut SourceProfile)) {
        let mut cells = self.cells.lock_or_panic();
        update(cells.entry(source.to_owned()).or_default());
    }

    /// Drain the current window into records, one per source.
    pub fn flush(&self) -> Vec<(String, Record)> {
        let cells: HashMap<String, SourceProfile> =
            std::mem::take(&mut *self.cells.lock_or_panic());
        let now = Utc::now();
        cells
            .into_iter()
            .map(|(source, profile)| {
                let record = Record::new(
                    now,
                    vec![
                        ("profile_source".to_owned(), source.clone()),
                        ("read_bytes".to_owned(), profile.read_bytes.to_string()),
                        ("lines".to_owned(), profile.lines.to_string()),
                        ("records".to_owned(), profile.records.to_string()),
                        (
                            "parse_failures".to_owned(),
                            profile.parse_failures.to_string(),
                        ),
                        (
                            "time_failures".to_owned(),
                            profile.time_failures.to_string(),
                        ),
                        (
                            "outdated_dropped".to_owned(),
                            profile.outdated_dropped.to_string(),
                        ),
                        (
                            "encoding_errors".to_owned(),
                            profile.encoding_errors.to_string(),
                        ),
                        (
                            "last_read_unix".to_owned(),
                            profile.last_read_unix.to_string(),
                        ),
                    ],
                );
                (source, record)
            })
            .collect()
    }
}
