// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! File discovery: a kernel notifier where available, a polling walker
//! everywhere, merged into one de-duplicated event stream.
//!
//! The notifier is bounded by a watch budget; directories past the budget
//! are covered by the poller alone. The poller also repairs everything the
//! notifier can miss: filesystems without reliable events, broken symlinks
//! that come back, and directories whose inode changed underneath a watch.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

mod notifier;
mod poller;
mod watch_set;

pub use notifier::Notifier;
pub use poller::Poller;
pub use watch_set::WatchSet;

use ddtail_config::SourceConfig;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    /// The notifier refused more watches; the path stays poll-only.
    #[error("watch limit reached registering {0}")]
    LimitReached(PathBuf),
    #[error("registered path no longer exists: {0}")]
    PathGone(PathBuf),
    #[error("notifier error: {0}")]
    Notify(#[from] notify::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileEventKind {
    Create,
    Modify,
    Delete,
    Moved,
    /// Synthesized for files already present when a directory is registered.
    Existed,
}

/// One unified discovery event, already matched to a source.
#[derive(Debug, Clone)]
pub struct FileEvent {
    pub path: PathBuf,
    pub kind: FileEventKind,
    pub source: Arc<SourceConfig>,
}

/// The longest literal prefix of a glob: the directory to register watches
/// under. `/var/log/app/**/*.log` walks from `/var/log/app`.
pub fn glob_root(pattern: &str) -> PathBuf {
    let mut root = PathBuf::new();
    for component in Path::new(pattern).components() {
        let text = component.as_os_str().to_string_lossy();
        if text.contains('*') || text.contains('?') || text.contains('[') {
            break;
        }
        root.push(component);
    }
    if root.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        root
    }
}
