// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Accumulates parsed records into sealed batches per
//! `(destination, partition)` bucket.
//!
//! A bucket seals when its serialized size or record count crosses the
//! destination's thresholds, or when its oldest record exceeds the batch age
//! on a poll. A bucket that reaches `max_bucket_bytes` refuses new records;
//! that refusal is the pipeline's backpressure signal and pauses the readers
//! feeding it.

use crate::Record;
use chrono::{DateTime, Utc};
use ddtail_config::DestinationConfig;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BatchKey {
    pub destination: String,
    pub partition: String,
}

/// Byte-range provenance for exactly-once sources: every record in the batch
/// came from `[begin, end)` of the file behind `primary_key`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchRange {
    pub primary_key: Vec<u8>,
    pub begin: u64,
    pub end: u64,
}

/// An ordered run of records sealed for sending.
#[derive(Debug, Clone)]
pub struct Batch {
    pub destination: String,
    pub partition: String,
    /// The source's configured send-tag set, attached to the payload.
    pub tags: Vec<(String, String)>,
    pub records: Vec<Record>,
    pub bytes: usize,
    pub earliest: DateTime<Utc>,
    pub latest: DateTime<Utc>,
    /// Monotonic per-agent sequence used for retry idempotency.
    pub sequence: u64,
    pub range: Option<BatchRange>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BatchError {
    /// The bucket hit its memory bound; the caller must pause the reader.
    #[error("bucket {destination}/{partition} is full")]
    BucketFull {
        destination: String,
        partition: String,
    },
    #[error("unknown destination `{0}`")]
    UnknownDestination(String),
}

struct Bucket {
    /// Tag set of the source that opened the bucket. Buckets are keyed by
    /// `(destination, partition)` and the partition defaults to the source
    /// name, so the set is uniform per bucket.
    tags: Vec<(String, String)>,
    records: Vec<Record>,
    bytes: usize,
    opened: Instant,
    earliest: DateTime<Utc>,
    latest: DateTime<Utc>,
    range: Option<BatchRange>,
}

impl Bucket {
    fn new(now: Instant, tags: Vec<(String, String)>) -> Bucket {
        Bucket {
            tags,
            records: Vec::new(),
            bytes: 0,
            opened: now,
            earliest: DateTime::<Utc>::MAX_UTC,
            latest: DateTime::<Utc>::MIN_UTC,
            range: None,
        }
    }
}

pub struct Batcher {
    buckets: HashMap<BatchKey, Bucket>,
    destinations: HashMap<String, Arc<DestinationConfig>>,
    sequence: u64,
}

impl Batcher {
    pub fn new(destinations: HashMap<String, Arc<DestinationConfig>>) -> Batcher {
        Batcher {
            buckets: HashMap::new(),
            destinations,
            sequence: 0,
        }
    }

    /// True while the bucket can still take records. Readers check this
    /// before a tick instead of finding out mid-read.
    pub fn has_capacity(&self, destination: &str, partition: &str) -> bool {
        let Some(config) = self.destinations.get(destination) else {
            return false;
        };
        let key = BatchKey {
            destination: destination.to_owned(),
            partition: partition.to_owned(),
        };
        self.buckets
            .get(&key)
            .map_or(true, |b| b.bytes < config.max_bucket_bytes)
    }

    /// Add one record. `tags` is the source's send-tag set, adopted by the
    /// bucket on first insert. Returns a sealed batch when this push crossed
    /// a size or count threshold.
    pub fn push(
        &mut self,
        destination: &str,
        partition: &str,
        primary_key: Option<&[u8]>,
        tags: &[(String, String)],
        record: Record,
    ) -> Result<Option<Batch>, BatchError> {
        let config = self
            .destinations
            .get(destination)
            .ok_or_else(|| BatchError::UnknownDestination(destination.to_owned()))?
            .clone();
        let key = BatchKey {
            destination: destination.to_owned(),
            partition: partition.to_owned(),
        };
        let bucket = self
            .buckets
            .entry(key.clone())
            .or_insert_with(|| Bucket::new(Instant::now(), tags.to_vec()));

        if bucket.bytes >= config.max_bucket_bytes {
            return Err(BatchError::BucketFull {
                destination: key.destination,
                partition: key.partition,
            });
        }

        bucket.bytes += record.byte_size();
        bucket.earliest = bucket.earliest.min(record.time);
        bucket.latest = bucket.latest.max(record.time);
        if let (Some(pk), Some((begin, end))) = (primary_key, record.file_range) {
            match &mut bucket.range {
                None => {
                    bucket.range = Some(BatchRange {
                        primary_key: pk.to_vec(),
                        begin,
                        end,
                    });
                }
                Some(range) => {
                    range.begin = range.begin.min(begin);
                    range.end = range.end.max(end);
                }
            }
        }
        bucket.records.push(record);

        if bucket.bytes >= config.max_batch_bytes || bucket.records.len() >= config.max_batch_count
        {
            return Ok(Some(self.seal(key)));
        }
        Ok(None)
    }

    /// Seal every bucket whose oldest record has been waiting longer than the
    /// destination's batch age.
    pub fn poll_age(&mut self, now: Instant) -> Vec<Batch> {
        let due: Vec<BatchKey> = self
            .buckets
            .iter()
            .filter(|(key, bucket)| {
                !bucket.records.is_empty()
                    && self
                        .destinations
                        .get(&key.destination)
                        .map_or(false, |config| {
                            now.duration_since(bucket.opened) >= config.max_batch_age()
                        })
            })
            .map(|(key, _)| key.clone())
            .collect();
        due.into_iter().map(|key| self.seal(key)).collect()
    }

    /// Seal everything regardless of thresholds (shutdown, config swap).
    pub fn flush_all(&mut self) -> Vec<Batch> {
        let keys: Vec<BatchKey> = self
            .buckets
            .iter()
            .filter(|(_, bucket)| !bucket.records.is_empty())
            .map(|(key, _)| key.clone())
            .collect();
        keys.into_iter().map(|key| self.seal(key)).collect()
    }

    fn seal(&mut self, key: BatchKey) -> Batch {
        self.sequence += 1;
        let bucket = self.buckets.remove(&key).unwrap_or_else(|| {
            // Only reachable from seal callers that just observed the bucket.
            Bucket::new(Instant::now(), Vec::new())
        });
        Batch {
            destination: key.destination,
            partition: key.partition,
            tags: bucket.tags,
            records: bucket.records,
            bytes: bucket.bytes,
            earliest: bucket.earliest,
            latest: bucket.latest,
            sequence: self.sequence,
            range: bucket.range,
        }
    }
}
