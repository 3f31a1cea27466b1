// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::notifier::Notifier;
use crate::poller::Poller;
use crate::{glob_root, FileEvent, FileEventKind, WatchError};
use ddtail_common::alarm::{AlarmKind, AlarmSender};
use ddtail_config::{Generation, SourceConfig, WatchConfig};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

struct DirEntry {
    device: u64,
    inode: u64,
    last_activity: Instant,
    is_symlink: bool,
}

/// The agent's discovery front end: registered directories, the merged
/// notifier/poller event stream, broken-link recovery and idle reclamation.
///
/// At most one entry exists per absolute path; a directory whose inode
/// changes is torn down and re-registered.
pub struct WatchSet {
    config: WatchConfig,
    sources: Vec<(Arc<SourceConfig>, PathBuf, glob::Pattern)>,
    notifier: Option<Notifier>,
    poller: Poller,
    entries: HashMap<PathBuf, DirEntry>,
    broken_links: HashSet<PathBuf>,
    recent: HashMap<(PathBuf, FileEventKind), Instant>,
    last_poll: Option<Instant>,
    alarms: AlarmSender,
}

impl WatchSet {
    pub fn new(config: WatchConfig, generation: &Generation, alarms: AlarmSender) -> WatchSet {
        let sources = generation
            .sources()
            .iter()
            .filter_map(|source| {
                match glob::Pattern::new(&source.path_glob) {
                    Ok(pattern) => Some((
                        Arc::clone(source),
                        glob_root(&source.path_glob),
                        pattern,
                    )),
                    // Validated at config load; a failure here means the
                    // generation was built by hand.
                    Err(e) => {
                        warn!(source = %source.name, error = %e, "unusable glob");
                        None
                    }
                }
            })
            .collect();
        let notifier = match Notifier::new(config.max_watches) {
            Ok(notifier) => Some(notifier),
            Err(e) => {
                alarms.raise(
                    AlarmKind::RegisterNotifyFail,
                    None,
                    format!("kernel notifier unavailable, polling only: {e}"),
                );
                None
            }
        };
        WatchSet {
            poller: Poller::new(config.max_poll_entries),
            config,
            sources,
            notifier,
            entries: HashMap::new(),
            broken_links: HashSet::new(),
            recent: HashMap::new(),
            last_poll: None,
            alarms,
        }
    }

    /// Register every source root and synthesize `Existed` events for files
    /// already on disk, so readers can apply the tail-from-start policy.
    pub fn register(&mut self) -> Vec<FileEvent> {
        let roots: Vec<(PathBuf, usize)> = self
            .sources
            .iter()
            .map(|(source, root, _)| (root.clone(), source.max_depth))
            .collect();
        let mut events = Vec::new();
        for (root, max_depth) in roots {
            events.extend(self.register_tree(&root, max_depth));
        }
        info!(
            dirs = self.entries.len(),
            broken = self.broken_links.len(),
            "watch set registered"
        );
        events
    }

    /// Merge and de-duplicate pending events. Cheap when called often; the
    /// polling walk only runs once per poll interval.
    pub fn poll(&mut self) -> Vec<FileEvent> {
        let now = Instant::now();
        let mut raw: Vec<(PathBuf, FileEventKind)> = Vec::new();
        if let Some(notifier) = &mut self.notifier {
            raw.extend(notifier.drain());
        }

        let poll_due = self
            .last_poll
            .map_or(true, |last| now.duration_since(last).as_secs() >= self.config.poll_interval_secs);
        if poll_due {
            self.last_poll = Some(now);
            let roots: Vec<(PathBuf, glob::Pattern, usize)> = self
                .sources
                .iter()
                .map(|(source, root, pattern)| (root.clone(), pattern.clone(), source.max_depth))
                .collect();
            raw.extend(self.poller.poll(&roots));
            if self.poller.truncated_walk {
                self.alarms.raise(
                    AlarmKind::DirExceedLimit,
                    None,
                    "polling walk truncated by max_poll_entries",
                );
            }
            raw.extend(self.retry_broken_links());
            raw.extend(self.revalidate_dirs());
            self.reclaim_idle(now);
            self.recent
                .retain(|_, seen| now.duration_since(*seen).as_millis() < 10 * u128::from(self.config.coalesce_ms));
        }

        let mut events = Vec::new();
        for (path, kind) in raw {
            if !self.dedup(&path, kind, now) {
                continue;
            }
            self.touch_ancestors(&path, now);
            for (source, _, pattern) in &self.sources {
                if pattern.matches_path(&path) {
                    events.push(FileEvent {
                        path: path.clone(),
                        kind,
                        source: Arc::clone(source),
                    });
                }
            }
        }
        events
    }

    pub fn watched_dirs(&self) -> usize {
        self.entries.len()
    }

    pub fn broken_links(&self) -> usize {
        self.broken_links.len()
    }

    /// Drop every registration. Used on config swap and shutdown.
    pub fn teardown(&mut self) {
        if let Some(notifier) = &mut self.notifier {
            for path in self.entries.keys() {
                notifier.unwatch_dir(path);
            }
        }
        self.entries.clear();
        self.recent.clear();
        self.broken_links.clear();
    }

    /// Walk a directory tree, register each directory, and return `Existed`
    /// events for matching files.
    fn register_tree(&mut self, root: &Path, max_depth: usize) -> Vec<FileEvent> {
        let mut events = Vec::new();
        match fs::symlink_metadata(root) {
            Err(_) => {
                // The root may be a dangling symlink or simply not exist yet;
                // either way the poller retries it.
                self.broken_links.insert(root.to_owned());
                return events;
            }
            Ok(meta) if meta.file_type().is_symlink() && fs::metadata(root).is_err() => {
                self.broken_links.insert(root.to_owned());
                return events;
            }
            Ok(_) => {}
        }

        for entry in WalkDir::new(root)
            .max_depth(max_depth)
            .follow_links(true)
            .into_iter()
            .filter_map(Result::ok)
        {
            let path = entry.path();
            if entry.file_type().is_dir() {
                self.register_dir(path);
            } else if entry.file_type().is_file() {
                for (source, _, pattern) in &self.sources {
                    if pattern.matches_path(path) {
                        events.push(FileEvent {
                            path: path.to_owned(),
                            kind: FileEventKind::Existed,
                            source: Arc::clone(source),
                        });
                    }
                }
            }
        }
        events
    }

    fn register_dir(&mut self, path: &Path) {
        let Ok(meta) = fs::metadata(path) else {
            return;
        };
        let is_symlink = fs::symlink_metadata(path)
            .map(|m| m.file_type().is_symlink())
            .unwrap_or(false);
        self.entries.insert(
            path.to_owned(),
            DirEntry {
                device: meta.dev(),
                inode: meta.ino(),
                last_activity: Instant::now(),
                is_symlink,
            },
        );
        if let Some(notifier) = &mut self.notifier {
            match notifier.watch_dir(path) {
                Ok(()) => {}
                Err(WatchError::LimitReached(_)) => {
                    self.alarms.raise(
                        AlarmKind::NotifyDirLimit,
                        None,
                        format!("watch budget exhausted at {}", path.display()),
                    );
                }
                Err(e) => {
                    self.alarms.raise(
                        AlarmKind::RegisterNotifyFail,
                        None,
                        format!("cannot watch {}: {e}", path.display()),
                    );
                }
            }
        }
    }

    /// Re-stat broken symlinks; a recovered target is re-registered and its
    /// files surface as events.
    fn retry_broken_links(&mut self) -> Vec<(PathBuf, FileEventKind)> {
        let recovered: Vec<PathBuf> = self
            .broken_links
            .iter()
            .filter(|path| fs::metadata(path).is_ok())
            .cloned()
            .collect();
        let mut raw = Vec::new();
        for root in recovered {
            self.broken_links.remove(&root);
            info!(path = %root.display(), "broken link recovered");
            let max_depth = self
                .sources
                .iter()
                .find(|(_, r, _)| *r == root)
                .map_or(1, |(source, _, _)| source.max_depth);
            for event in self.register_tree(&root, max_depth) {
                raw.push((event.path, FileEventKind::Create));
            }
        }
        raw
    }

    /// Detect watched directories that vanished or changed inode; the
    /// subtree is unregistered and, when still present, re-registered.
    fn revalidate_dirs(&mut self) -> Vec<(PathBuf, FileEventKind)> {
        let mut gone = Vec::new();
        let mut replaced = Vec::new();
        for (path, entry) in &self.entries {
            match fs::metadata(path) {
                Err(_) => gone.push((path.clone(), entry.is_symlink)),
                Ok(meta) if (meta.dev(), meta.ino()) != (entry.device, entry.inode) => {
                    replaced.push(path.clone());
                }
                Ok(_) => {}
            }
        }
        let mut raw = Vec::new();
        for (path, was_symlink) in gone {
            warn!(error = %WatchError::PathGone(path.clone()), "dropping watch");
            self.drop_entry(&path);
            if was_symlink {
                self.broken_links.insert(path);
            }
        }
        for path in replaced {
            debug!(path = %path.display(), "directory inode changed, re-registering");
            self.drop_entry(&path);
            for event in self.register_tree(&path, 1) {
                raw.push((event.path, FileEventKind::Create));
            }
        }
        raw
    }

    fn drop_entry(&mut self, path: &Path) {
        self.entries.remove(path);
        if let Some(notifier) = &mut self.notifier {
            notifier.unwatch_dir(path);
        }
    }

    /// Memory reclamation: drop watches whose whole subtree has been idle.
    /// Data under a dropped watch is rediscovered by the poller on activity.
    fn reclaim_idle(&mut self, now: Instant) {
        let timeout = Duration::from_secs(self.config.idle_timeout_secs);
        let idle: Vec<PathBuf> = self
            .entries
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.last_activity) >= timeout)
            .map(|(path, _)| path.clone())
            .collect();
        for path in idle {
            debug!(path = %path.display(), "dropping idle watch");
            self.drop_entry(&path);
        }
    }

    /// Activity on a path refreshes its directory and every registered
    /// ancestor, so a busy leaf keeps its whole chain alive.
    fn touch_ancestors(&mut self, path: &Path, now: Instant) {
        let mut current = path.parent();
        while let Some(dir) = current {
            if let Some(entry) = self.entries.get_mut(dir) {
                entry.last_activity = now;
            }
            current = dir.parent();
        }
    }

    /// Returns false for a duplicate `(path, kind)` within the coalescing
    /// window (the same change usually arrives from both discovery sides).
    fn dedup(&mut self, path: &Path, kind: FileEventKind, now: Instant) -> bool {
        let window = Duration::from_millis(self.config.coalesce_ms);
        match self.recent.get(&(path.to_owned(), kind)) {
            Some(seen) if now.duration_since(*seen) < window => false,
            _ => {
                self.recent.insert((path.to_owned(), kind), now);
                true
            }
        }
    }
}
