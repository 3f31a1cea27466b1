// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Durable per-file read state. One per `(source, logical path)`.
///
/// The identity triple `(device, inode, signature)` decides whether a path
/// still names "the same file": matching `(device, inode)` with a different
/// signature means truncation or inode reuse, and the checkpoint must not be
/// resumed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimaryCheckpoint {
    pub source: String,
    pub logical_path: PathBuf,
    /// Path after symlink resolution.
    pub real_path: PathBuf,
    pub device: u64,
    pub inode: u64,
    /// Hash over the first `signature_size` bytes of the file.
    pub signature: Vec<u8>,
    /// Bytes actually hashed; less than the configured width while the file
    /// is still shorter than it.
    pub signature_size: u32,
    pub read_offset: u64,
    /// Unix seconds.
    pub created_at: u64,
    pub last_read_at: u64,
    /// Exactly-once concurrency the ranges were cut for; 0 when disabled.
    pub range_concurrency: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RangeStatus {
    /// Assigned but not yet handed to a sender worker.
    Ready,
    /// Handed to a sender worker this epoch; at most one per primary.
    InFlight,
    /// The destination acknowledged the range.
    Acknowledged,
}

/// Send state of one byte range of an exactly-once file.
///
/// For any primary key the union of its ranges is `[0, read_offset)` and
/// ranges are pairwise disjoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeCheckpoint {
    pub begin: u64,
    pub end: u64,
    pub status: RangeStatus,
    pub sequence: u64,
    /// Unix seconds of the last status change, used for GC retention.
    pub updated_at: u64,
}

impl RangeCheckpoint {
    pub fn len(&self) -> u64 {
        self.end - self.begin
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.begin
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primary_roundtrip_json() {
        let cpt = PrimaryCheckpoint {
            source: "nginx".into(),
            logical_path: "/var/log/access.log".into(),
            real_path: "/var/log/access.log".into(),
            device: 2049,
            inode: 131072,
            signature: vec![0xab; 32],
            signature_size: 640,
            read_offset: 640,
            created_at: 1_700_000_000,
            last_read_at: 1_700_000_060,
            range_concurrency: 0,
        };
        let bytes = serde_json::to_vec(&cpt).unwrap();
        let back: PrimaryCheckpoint = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, cpt);
    }

    #[test]
    fn test_range_roundtrip_bincode() {
        let range = RangeCheckpoint {
            begin: 1024,
            end: 4096,
            status: RangeStatus::InFlight,
            sequence: 7,
            updated_at: 1_700_000_000,
        };
        let bytes = bincode::serialize(&range).unwrap();
        let back: RangeCheckpoint = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, range);
        assert_eq!(back.len(), 3072);
    }
}
