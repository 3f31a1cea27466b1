// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::{FileEventKind, WatchError};
use notify::event::{EventKind, ModifyKind};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use tracing::{debug, warn};

/// Kernel file-system notifier. One non-recursive registration per
/// directory, bounded by the configured watch budget.
pub struct Notifier {
    watcher: RecommendedWatcher,
    rx: mpsc::Receiver<notify::Result<notify::Event>>,
    watched: HashSet<PathBuf>,
    max_watches: usize,
}

impl Notifier {
    pub fn new(max_watches: usize) -> Result<Notifier, WatchError> {
        let (tx, rx) = mpsc::channel();
        let watcher = RecommendedWatcher::new(
            move |event| {
                // A full channel only means the input thread is behind; the
                // poller will repair anything dropped here.
                let _ = tx.send(event);
            },
            notify::Config::default(),
        )?;
        Ok(Notifier {
            watcher,
            rx,
            watched: HashSet::new(),
            max_watches,
        })
    }

    pub fn is_watched(&self, dir: &Path) -> bool {
        self.watched.contains(dir)
    }

    pub fn watch_count(&self) -> usize {
        self.watched.len()
    }

    pub fn watch_dir(&mut self, dir: &Path) -> Result<(), WatchError> {
        if self.watched.contains(dir) {
            return Ok(());
        }
        if self.watched.len() >= self.max_watches {
            return Err(WatchError::LimitReached(dir.to_owned()));
        }
        self.watcher.watch(dir, RecursiveMode::NonRecursive)?;
        self.watched.insert(dir.to_owned());
        debug!(dir = %dir.display(), total = self.watched.len(), "watch registered");
        Ok(())
    }

    pub fn unwatch_dir(&mut self, dir: &Path) {
        if self.watched.remove(dir) {
            if let Err(e) = self.watcher.unwatch(dir) {
                debug!(dir = %dir.display(), error = %e, "unwatch failed");
            }
        }
    }

    /// Drain pending kernel events into `(path, kind)` pairs.
    pub fn drain(&mut self) -> Vec<(PathBuf, FileEventKind)> {
        let mut out = Vec::new();
        while let Ok(result) = self.rx.try_recv() {
            let event = match result {
                Ok(event) => event,
                Err(e) => {
                    warn!(error = %e, "notifier event error");
                    continue;
                }
            };
            let kind = match event.kind {
                EventKind::Create(_) => FileEventKind::Create,
                EventKind::Remove(_) => FileEventKind::Delete,
                EventKind::Modify(ModifyKind::Name(_)) => FileEventKind::Moved,
                EventKind::Modify(_) => FileEventKind::Modify,
                _ => continue,
            };
            for path in event.paths {
                out.push((path, kind));
            }
        }
        out
    }
}
