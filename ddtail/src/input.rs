// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The two pipeline threads.
//!
//! The **input thread** drives discovery and the readers: it polls the watch
//! set, opens and retires readers, ticks each reader under a byte budget,
//! and hands parsed records over a bounded channel. Readers run sequentially
//! here so one hot file cannot starve the rest.
//!
//! The **processing thread** drains that channel into the batcher and pushes
//! sealed batches into the sender queues. The batcher's bucket cap and the
//! channel bound are the two backpressure joints; when either is full the
//! input thread stops reading and offsets simply lag.

use crate::extension::{ExtendedProcessor, PROCESS_OK};
use crate::governor::PipelineHealth;
use crate::profile::ProfileCollector;
use ddtail_common::tag::Tag;
use ddtail_checkpoint::{CheckpointStore, PrimaryCheckpoint};
use ddtail_common::alarm::{AlarmKind, AlarmSender};
use ddtail_common::MutexExt;
use ddtail_config::SourceConfig;
use ddtail_pipeline::{
    Batcher, FileReader, ParserStats, ReadStatus, ReaderError, Record,
};
use ddtail_sender::Sender;
use ddtail_watch::{FileEvent, FileEventKind, WatchSet};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// One record on its way from a reader to the batcher, together with the
/// source config whose destination and send-tag set apply to it.
pub struct PipelineItem {
    pub source: Arc<SourceConfig>,
    pub partition: String,
    pub primary_key: Option<Vec<u8>>,
    pub record: Record,
}

/// How often reader offsets are persisted while running.
const CHECKPOINT_DUMP_INTERVAL: Duration = Duration::from_secs(3);
/// Input thread nap when nothing moved.
const IDLE_NAP: Duration = Duration::from_millis(200);

struct ReaderSlot {
    reader: FileReader,
    last_stats: ParserStats,
    last_encoding_errors: u64,
    backpressured_since: Option<Instant>,
}

pub struct InputContext {
    pub watch: WatchSet,
    pub initial_events: Vec<FileEvent>,
    pub resume: HashMap<(String, PathBuf), PrimaryCheckpoint>,
    pub store: Arc<CheckpointStore>,
    pub batcher: Arc<Mutex<Batcher>>,
    pub tx: SyncSender<PipelineItem>,
    pub alarms: AlarmSender,
    pub profiles: Arc<ProfileCollector>,
    pub health: Arc<PipelineHealth>,
    pub stop: Arc<AtomicBool>,
    pub extension: Option<Arc<dyn ExtendedProcessor>>,
    pub max_open_readers: usize,
    pub reader_expire: Duration,
    pub read_chunk: usize,
    pub tick_budget: usize,
}

/// Partition key for a reader's records. Exactly-once sources get one
/// bucket per file so a batch's byte range never spans files.
fn partition_for(source: &SourceConfig, primary_key: &[u8]) -> String {
    if source.exactly_once() {
        String::from_utf8_lossy(primary_key).into_owned()
    } else {
        source.partition().to_owned()
    }
}

/// Body of the input thread.
pub fn run_input(mut ctx: InputContext) {
    let mut readers: HashMap<(String, PathBuf), ReaderSlot> = HashMap::new();
    let mut abandoned: HashSet<(String, PathBuf)> = HashSet::new();
    let mut last_dump = Instant::now();
    let initial = std::mem::take(&mut ctx.initial_events);
    let mut pending_events: Vec<FileEvent> = initial;

    info!(events = pending_events.len(), "input thread started");
    loop {
        if ctx.stop.load(Ordering::SeqCst) {
            break;
        }

        pending_events.extend(ctx.watch.poll());
        let mut activity = !pending_events.is_empty();
        for event in pending_events.drain(..) {
            handle_event(&mut ctx, &mut readers, &abandoned, event);
        }

        // Tick every reader once, round robin.
        let keys: Vec<(String, PathBuf)> = readers.keys().cloned().collect();
        for key in keys {
            let Some(slot) = readers.get_mut(&key) else {
                continue;
            };
            let source = Arc::clone(slot.reader.source());
            let primary_key = slot.reader.primary_key();
            let partition = partition_for(&source, &primary_key);

            if !ctx
                .batcher
                .lock_or_panic()
                .has_capacity(&source.destination, &partition)
            {
                if slot.backpressured_since.is_none() {
                    slot.backpressured_since = Some(Instant::now());
                }
                continue;
            }
            slot.backpressured_since = None;

            match slot.reader.tick(ctx.tick_budget) {
                Ok(out) => {
                    activity |= out.consumed > 0;
                    if out.truncated {
                        ctx.alarms.raise(
                            AlarmKind::LogTruncate,
                            Some(&source.name),
                            format!("{} truncated, offset reset", key.1.display()),
                        );
                    }
                    forward_records(&ctx, &source, &primary_key, &partition, out.records);
                    track_profile(&ctx, slot, out.consumed);

                    match out.status {
                        ReadStatus::Eof => {
                            for record in slot.reader.poll_idle(Instant::now()) {
                                forward(&ctx, &source, &primary_key, &partition, record);
                            }
                        }
                        ReadStatus::BudgetExhausted => {}
                        ReadStatus::Rotated => {
                            // Old inode fully drained. Drop the reader and
                            // reopen the path, which now names the new file.
                            let checkpoint = slot.reader.checkpoint();
                            persist_checkpoints(&ctx, vec![(primary_key.clone(), checkpoint)]);
                            readers.remove(&key);
                            handle_event(
                                &mut ctx,
                                &mut readers,
                                &abandoned,
                                FileEvent {
                                    path: key.1.clone(),
                                    kind: FileEventKind::Create,
                                    source,
                                },
                            );
                        }
                        ReadStatus::Deleted => {
                            if slot.reader.is_expired(ctx.reader_expire) {
                                debug!(path = %key.1.display(), "deleted reader expired");
                                ctx.store.mark_gc(&primary_key);
                                readers.remove(&key);
                            }
                        }
                    }
                }
                Err(ReaderError::PermissionDenied(path)) => {
                    ctx.alarms.raise(
                        AlarmKind::LogfilePermission,
                        Some(&source.name),
                        format!("lost read permission on {}", path.display()),
                    );
                    abandoned.insert(key.clone());
                    readers.remove(&key);
                }
                Err(e) => {
                    // Transient: park the reader and retry on the next pass.
                    debug!(error = %e, "reader tick failed");
                }
            }
        }

        publish_health(&ctx, &readers);

        if last_dump.elapsed() >= CHECKPOINT_DUMP_INTERVAL {
            last_dump = Instant::now();
            let dump: Vec<(Vec<u8>, PrimaryCheckpoint)> = readers
                .values()
                .map(|slot| (slot.reader.primary_key(), slot.reader.checkpoint()))
                .collect();
            persist_checkpoints(&ctx, dump);
        }

        if !activity {
            std::thread::sleep(IDLE_NAP);
        }
    }

    // Hold input: dump every reader's state so the next generation (or the
    // next process) resumes without re-sending.
    let dump: Vec<(Vec<u8>, PrimaryCheckpoint)> = readers
        .values()
        .map(|slot| (slot.reader.primary_key(), slot.reader.checkpoint()))
        .collect();
    persist_checkpoints(&ctx, dump);
    ctx.watch.teardown();
    info!("input thread stopped");
}

fn handle_event(
    ctx: &mut InputContext,
    readers: &mut HashMap<(String, PathBuf), ReaderSlot>,
    abandoned: &HashSet<(String, PathBuf)>,
    event: FileEvent,
) {
    let key = (event.source.name.clone(), event.path.clone());
    match event.kind {
        FileEventKind::Create
        | FileEventKind::Existed
        | FileEventKind::Modify
        | FileEventKind::Moved => {
            if readers.contains_key(&key) || abandoned.contains(&key) {
                return;
            }
            if readers.len() >= ctx.max_open_readers {
                ctx.alarms.raise(
                    AlarmKind::FileReaderExceed,
                    Some(&event.source.name),
                    format!(
                        "open reader cap {} reached, deferring {}",
                        ctx.max_open_readers,
                        event.path.display()
                    ),
                );
                return;
            }
            open_reader(ctx, readers, event, key);
        }
        FileEventKind::Delete => {
            // The reader notices the deletion itself on its next stat and
            // keeps draining the open handle until then.
        }
    }
}

fn open_reader(
    ctx: &mut InputContext,
    readers: &mut HashMap<(String, PathBuf), ReaderSlot>,
    event: FileEvent,
    key: (String, PathBuf),
) {
    let primary_key = ddtail_checkpoint::primary_key(&event.source.name, &event.path);
    // The in-memory resume set (startup scan) wins; otherwise the store is
    // consulted, which also rescues the key from deferred deletion.
    let checkpoint = match ctx.resume.remove(&key) {
        Some(checkpoint) => Some(checkpoint),
        None => match ctx.store.get_primary(&primary_key) {
            Ok(checkpoint) => checkpoint,
            Err(e) => {
                ctx.alarms.raise(
                    AlarmKind::Checkpoint,
                    Some(&event.source.name),
                    format!("checkpoint read failed, reading from start: {e}"),
                );
                None
            }
        },
    };

    let opened = FileReader::open(
        Arc::clone(&event.source),
        &event.path,
        checkpoint.as_ref(),
        ctx.read_chunk,
    );
    let opened = match opened {
        Err(ReaderError::SignatureMismatch(_)) => {
            // Same inode, different content: this is a new file.
            let _ = ctx.store.batch_delete(vec![primary_key.clone()]);
            FileReader::open(Arc::clone(&event.source), &event.path, None, ctx.read_chunk)
        }
        other => other,
    };
    match opened {
        Ok(reader) => {
            let stats = reader.parser_stats();
            readers.insert(
                key,
                ReaderSlot {
                    reader,
                    last_stats: stats,
                    last_encoding_errors: 0,
                    backpressured_since: None,
                },
            );
        }
        Err(ReaderError::PermissionDenied(path)) => {
            ctx.alarms.raise(
                AlarmKind::LogfilePermission,
                Some(&event.source.name),
                format!("cannot read {}", path.display()),
            );
        }
        Err(e) => {
            ctx.alarms.raise(
                AlarmKind::OpenLogfileFail,
                Some(&event.source.name),
                format!("open failed, will retry: {e}"),
            );
        }
    }
}

fn forward_records(
    ctx: &InputContext,
    source: &Arc<SourceConfig>,
    primary_key: &[u8],
    partition: &str,
    records: Vec<Record>,
) {
    for record in records {
        forward(ctx, source, primary_key, partition, record);
    }
}

fn forward(
    ctx: &InputContext,
    source: &Arc<SourceConfig>,
    primary_key: &[u8],
    partition: &str,
    record: Record,
) {
    // Sources marked for the extended processor hand their records across
    // the synchronous seam; a consumed record leaves the native path.
    if source.forward_extended {
        if let Some(extension) = &ctx.extension {
            let tags: Vec<Tag> = source
                .tags
                .iter()
                .filter_map(|(k, v)| Tag::new(k, v).ok())
                .collect();
            let bytes = serde_json::to_vec(&record.fields).unwrap_or_default();
            if extension.process(&source.name, &bytes, &tags) == PROCESS_OK {
                return;
            }
        }
    }
    let item = PipelineItem {
        source: Arc::clone(source),
        partition: partition.to_owned(),
        primary_key: source.exactly_once().then(|| primary_key.to_vec()),
        record,
    };
    // Blocks when the processing side is behind; that is the backpressure.
    if ctx.tx.send(item).is_err() {
        warn!("processing channel closed, dropping record");
    }
}

fn track_profile(ctx: &InputContext, slot: &mut ReaderSlot, consumed: u64) {
    let stats = slot.reader.parser_stats();
    let previous = slot.last_stats;
    let encoding_errors = slot.reader.encoding_errors();
    let encoding_delta = encoding_errors - slot.last_encoding_errors;
    slot.last_stats = stats;
    slot.last_encoding_errors = encoding_errors;
    if encoding_delta > 0 {
        ctx.alarms.raise(
            AlarmKind::EncodingConvert,
            Some(&slot.reader.source().name),
            format!("{encoding_delta} lossy transcoding chunks"),
        );
    }
    let source = slot.reader.source().name.clone();
    ctx.profiles.add(&source, |p| {
        p.read_bytes += consumed;
        p.parse_failures += stats.parse_failures - previous.parse_failures;
        p.time_failures += stats.time_failures - previous.time_failures;
        p.outdated_dropped += stats.outdated_dropped - previous.outdated_dropped;
        p.encoding_errors += encoding_delta;
        p.last_read_unix = unix_now();
    });
}

fn persist_checkpoints(ctx: &InputContext, dump: Vec<(Vec<u8>, PrimaryCheckpoint)>) {
    if dump.is_empty() {
        return;
    }
    let entries: Vec<(Vec<u8>, Vec<u8>)> = dump
        .into_iter()
        .filter_map(|(key, checkpoint)| {
            serde_json::to_vec(&checkpoint).ok().map(|v| (key, v))
        })
        .collect();
    if let Err(e) = ctx.store.batch_put(entries) {
        ctx.alarms.raise(
            AlarmKind::Checkpoint,
            None,
            format!("checkpoint dump failed: {e}"),
        );
    }
}

/// The slow-read gauge: the oldest backpressured reader's stall start, or
/// zero when everything is flowing.
fn publish_health(ctx: &InputContext, readers: &HashMap<(String, PathBuf), ReaderSlot>) {
    let oldest = readers
        .values()
        .filter_map(|slot| slot.backpressured_since)
        .min();
    match oldest {
        Some(since) => {
            let stalled_for = since.elapsed().as_secs();
            ctx.health.set_oldest_pending(unix_now().saturating_sub(stalled_for));
        }
        None => ctx.health.clear(),
    }
}

/// Body of the processing thread: channel → batcher → sender queues.
pub fn run_processing(
    rx: std::sync::mpsc::Receiver<PipelineItem>,
    batcher: Arc<Mutex<Batcher>>,
    sender: Arc<Sender>,
) {
    info!("processing thread started");
    loop {
        match rx.recv_timeout(Duration::from_millis(200)) {
            Ok(item) => {
                let sealed = loop {
                    let pushed = batcher.lock_or_panic().push(
                        &item.source.destination,
                        &item.partition,
                        item.primary_key.as_deref(),
                        &item.source.tags,
                        item.record.clone(),
                    );
                    match pushed {
                        Ok(sealed) => break sealed,
                        Err(ddtail_pipeline::BatchError::BucketFull { .. }) => {
                            // Wait for the bucket to relieve; age-based
                            // sealing guarantees progress.
                            for batch in batcher.lock_or_panic().poll_age(Instant::now()) {
                                let _ = sender.submit_blocking(batch);
                            }
                            std::thread::sleep(Duration::from_millis(20));
                        }
                        Err(e) => {
                            warn!(error = %e, "record dropped");
                            break None;
                        }
                    }
                };
                if let Some(batch) = sealed {
                    let _ = sender.submit_blocking(batch);
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        for batch in batcher.lock_or_panic().poll_age(Instant::now()) {
            let _ = sender.submit_blocking(batch);
        }
    }
    // Input side is gone: seal everything and hand it to the sender, which
    // drains under the shutdown budget.
    for batch in batcher.lock_or_panic().flush_all() {
        let _ = sender.submit_blocking(batch);
    }
    info!("processing thread stopped");
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
