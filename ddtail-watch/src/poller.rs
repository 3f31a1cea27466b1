// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::FileEventKind;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::warn;
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    size: u64,
    mtime: Option<SystemTime>,
}

/// Periodic tree walker. Keeps a `(size, mtime)` snapshot per file and
/// synthesizes create/modify/delete events by diffing against the previous
/// walk. This is the safety net under the kernel notifier.
pub struct Poller {
    snapshots: HashMap<PathBuf, FileStamp>,
    max_entries: usize,
    /// Set when a walk hit the entry cap, so the caller can raise an alarm.
    pub truncated_walk: bool,
}

impl Poller {
    pub fn new(max_entries: usize) -> Poller {
        Poller {
            snapshots: HashMap::new(),
            max_entries,
            truncated_walk: false,
        }
    }

    /// Walk every root and report what changed since the previous walk.
    /// `roots` carries `(directory, glob, max_depth)` per source.
    pub fn poll(
        &mut self,
        roots: &[(PathBuf, glob::Pattern, usize)],
    ) -> Vec<(PathBuf, FileEventKind)> {
        let mut seen: HashMap<PathBuf, FileStamp> = HashMap::new();
        let mut entries = 0usize;
        self.truncated_walk = false;

        'roots: for (root, pattern, max_depth) in roots {
            for entry in WalkDir::new(root)
                .max_depth(*max_depth)
                .follow_links(true)
                .into_iter()
                .filter_map(|e| match e {
                    Ok(entry) => Some(entry),
                    Err(e) => {
                        warn!(root = %root.display(), error = %e, "poll walk error");
                        None
                    }
                })
            {
                entries += 1;
                if entries > self.max_entries {
                    self.truncated_walk = true;
                    break 'roots;
                }
                if !entry.file_type().is_file() {
                    continue;
                }
                if !pattern.matches_path(entry.path()) {
                    continue;
                }
                let Ok(meta) = entry.metadata() else {
                    continue;
                };
                seen.insert(
                    entry.path().to_owned(),
                    FileStamp {
                        size: meta.len(),
                        mtime: meta.modified().ok(),
                    },
                );
            }
        }

        let mut events = Vec::new();
        for (path, stamp) in &seen {
            match self.snapshots.get(path) {
                None => events.push((path.clone(), FileEventKind::Create)),
                Some(previous) if previous != stamp => {
                    events.push((path.clone(), FileEventKind::Modify))
                }
                Some(_) => {}
            }
        }
        if !self.truncated_walk {
            // Only trust disappearances when the walk was complete.
            for path in self.snapshots.keys() {
                if !seen.contains_key(path) {
                    events.push((path.clone(), FileEventKind::Delete));
                }
            }
            self.snapshots = seen;
        } else {
            for (path, stamp) in seen {
                self.snapshots.insert(path, stamp);
            }
        }
        events
    }

    pub fn forget(&mut self, path: &Path) {
        self.snapshots.remove(path);
    }
}
