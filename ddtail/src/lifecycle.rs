// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The lifecycle controller.
//!
//! `Agent` owns one instance of every collaborator — store, watch set,
//! readers, batcher, sender, governor, GC — and threads them together for
//! start, config swap and shutdown. A config swap holds the input side,
//! dumps reader state as checkpoints, tears the pipeline down and rebuilds
//! it from "register watches" onward; checkpoints persist across the swap so
//! nothing is re-sent.

use crate::governor::{PipelineHealth, ResourceGovernor};
use crate::input::{run_input, run_processing, InputContext, PipelineItem};
use crate::profile::ProfileCollector;
use crate::AgentError;
use chrono::Utc;
use ddtail_checkpoint::{
    primary_key_source, range_key, CheckpointGc, CheckpointStore, GcView, PrimaryCheckpoint,
    ScanMode, PRIMARY_PREFIX,
};
use ddtail_common::alarm::{
    AlarmAggregator, AlarmRecord, AlarmSender, DEFAULT_FLUSH_INTERVAL,
};
use ddtail_common::worker::Worker;
use ddtail_common::MutexExt;
use ddtail_config::{AgentConfig, Generation};
use ddtail_pipeline::{find_inode_in_dir, signature_matches, Batcher, Record};
use ddtail_sender::{
    BatchTransport, HttpTransport, RangeScheduler, RoutingTransport, Sender, SenderMeta,
};
use ddtail_watch::{FileEvent, FileEventKind, WatchSet};
use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sysinfo::SystemExt;
use tokio::select;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Directory-search budget during the startup checkpoint scan. Past it,
/// unresolved checkpoints are dropped rather than stat-storming the disk.
const SCAN_SEARCH_LIMIT: usize = 128;
/// Partition used for agent-generated records (alarms, profiles).
const AGENT_PARTITION: &str = "ddtail-agent";

pub struct Agent {
    config: AgentConfig,
    config_path: Option<PathBuf>,
    store: Arc<CheckpointStore>,
    gc_view: Arc<Mutex<GcView>>,
    transport: Arc<dyn BatchTransport>,
    extension: Option<Arc<dyn crate::extension::ExtendedProcessor>>,
}

/// Everything belonging to one running config generation.
struct GenerationRun {
    stop: Arc<AtomicBool>,
    input_join: std::thread::JoinHandle<()>,
    processing_join: std::thread::JoinHandle<()>,
    sender: Arc<Sender>,
    worker_cancel: CancellationToken,
}

impl Agent {
    /// Prepare the environment: open the checkpoint store and build the
    /// per-destination transport. `transport` overrides the HTTP transport
    /// for tests.
    pub fn new(
        config: AgentConfig,
        config_path: Option<PathBuf>,
        transport: Option<Arc<dyn BatchTransport>>,
    ) -> Result<Agent, AgentError> {
        let store = Arc::new(
            CheckpointStore::open(&config.checkpoint_dir)
                .map_err(|e| AgentError::EnvPrep(e.to_string()))?,
        );
        let transport = match transport {
            Some(transport) => transport,
            None => {
                let mut router = RoutingTransport::new();
                for destination in &config.destinations {
                    let http = HttpTransport::new(&destination.endpoint)?;
                    router.insert(destination.name.clone(), Arc::new(http));
                }
                Arc::new(router) as Arc<dyn BatchTransport>
            }
        };
        Ok(Agent {
            config,
            config_path,
            store,
            gc_view: Arc::new(Mutex::new(GcView::default())),
            transport,
            extension: None,
        })
    }

    pub fn store(&self) -> &Arc<CheckpointStore> {
        &self.store
    }

    /// Install an extended processor host. Sources with `forward_extended`
    /// hand their records to it instead of the native path.
    pub fn set_extension(
        &mut self,
        extension: Arc<dyn crate::extension::ExtendedProcessor>,
    ) {
        self.extension = Some(extension);
    }

    /// Main loop: run the current generation until shutdown or a reload
    /// request, swapping generations in place on reload.
    pub async fn run(
        mut self,
        shutdown: CancellationToken,
        reload: Arc<Notify>,
    ) -> Result<(), AgentError> {
        let mut run = self.start_generation(&shutdown)?;
        loop {
            select! {
                _ = shutdown.cancelled() => {
                    info!("shutdown requested");
                    self.teardown(run, Duration::from_secs(self.config.exit_drain_secs))
                        .await;
                    return Ok(());
                }
                _ = reload.notified() => {
                    info!("config reload requested");
                    match self.reload_config() {
                        Ok(config) => {
                            // Swap drains quickly; full exit budgets are for
                            // process shutdown only.
                            self.teardown(run, Duration::from_secs(5)).await;
                            self.config = config;
                            run = self.start_generation(&shutdown)?;
                        }
                        Err(e) => {
                            error!(error = %e, "reload failed, keeping current config");
                        }
                    }
                }
            }
        }
    }

    fn reload_config(&self) -> Result<AgentConfig, AgentError> {
        match &self.config_path {
            Some(path) => Ok(AgentConfig::from_file(path)?),
            None => Ok(self.config.clone()),
        }
    }

    /// The start sequence: configs → checkpoint scan → watches → workers →
    /// pipeline threads.
    fn start_generation(
        &self,
        shutdown: &CancellationToken,
    ) -> Result<GenerationRun, AgentError> {
        let (generation, config_errors) = Generation::build(&self.config);
        let worker_cancel = CancellationToken::new();

        // Alarm stream first so everything after can raise.
        let (alarm_tx, alarm_rx) = mpsc::channel::<AlarmRecord>(64);
        let (alarms, mut aggregator) =
            AlarmAggregator::new(alarm_tx, DEFAULT_FLUSH_INTERVAL, worker_cancel.clone());
        tokio::spawn(async move { aggregator.run().await });
        for error in &config_errors {
            alarms.raise(
                ddtail_common::alarm::AlarmKind::UserConfig,
                None,
                error.to_string(),
            );
        }

        // Update the GC view for this generation.
        {
            let mut view = self.gc_view.lock_or_panic();
            view.sources = generation
                .sources()
                .iter()
                .map(|s| (s.name.clone(), s.exactly_once()))
                .collect();
        }

        // Validate every durable checkpoint against the new generation and
        // synthesize resume events.
        let scheduler = RangeScheduler::new(Arc::clone(&self.store));
        let (resume, mut events) = self.scan_checkpoints(&generation, &scheduler, &alarms);

        // Register watches; files already on disk surface as Existed.
        let mut watch = WatchSet::new(self.config.watch.clone(), &generation, alarms.clone());
        events.extend(watch.register());

        // Sender and its workers.
        let meta = SenderMeta {
            host: sysinfo::System::new().host_name().unwrap_or_default(),
            user_id: self.config.user_id.clone(),
            user_defined_id: self.config.user_defined_id.clone(),
        };
        let sender = Arc::new(Sender::start(
            &generation,
            Arc::clone(&self.transport),
            Some(scheduler),
            meta,
            alarms.clone(),
            CancellationToken::new(),
        ));

        // Batcher shared between the pipeline threads and the agent-record
        // routers.
        let destinations: HashMap<String, _> = generation
            .destinations()
            .map(|d| (d.name.clone(), Arc::clone(d)))
            .collect();
        let batcher = Arc::new(Mutex::new(Batcher::new(destinations)));

        // Alarm and profile records enter the same send path as data.
        let profiles = Arc::new(ProfileCollector::new());
        tokio::spawn(route_alarms(
            alarm_rx,
            generation.clone(),
            Arc::clone(&batcher),
            Arc::clone(&sender),
            worker_cancel.clone(),
        ));
        tokio::spawn(flush_profiles(
            Arc::clone(&profiles),
            generation.clone(),
            Arc::clone(&batcher),
            Arc::clone(&sender),
            worker_cancel.clone(),
        ));

        // Checkpoint GC.
        let mut gc = CheckpointGc::new(
            Arc::clone(&self.store),
            Arc::clone(&self.gc_view),
            Duration::from_secs(self.config.gc.interval_secs),
            Duration::from_millis(self.config.gc.scan_budget_ms),
            Duration::from_secs(self.config.gc.grace_secs),
            self.config.gc.retention_secs,
            worker_cancel.clone(),
        );
        tokio::spawn(async move { gc.run().await });

        // Resource governor; it cancels `shutdown` on sustained overrun.
        let health = PipelineHealth::new();
        let mut governor = ResourceGovernor::new(
            self.config.resource.clone(),
            Arc::clone(&health),
            alarms.clone(),
            shutdown.clone(),
            worker_cancel.clone(),
        );
        tokio::spawn(async move { governor.run().await });

        // Pipeline threads.
        let stop = Arc::new(AtomicBool::new(false));
        let (tx, rx) = std::sync::mpsc::sync_channel::<PipelineItem>(1024);
        let input_ctx = InputContext {
            watch,
            initial_events: events,
            resume,
            store: Arc::clone(&self.store),
            batcher: Arc::clone(&batcher),
            tx,
            alarms,
            profiles,
            health,
            stop: Arc::clone(&stop),
            extension: self.extension.clone(),
            max_open_readers: self.config.max_open_readers,
            reader_expire: Duration::from_secs(self.config.reader_expire_secs),
            read_chunk: self.config.read_chunk_bytes,
            tick_budget: self.config.tick_budget_bytes,
        };
        let input_join = std::thread::Builder::new()
            .name("ddtail-input".to_owned())
            .spawn(move || run_input(input_ctx))
            .map_err(|e| AgentError::EnvPrep(format!("cannot spawn input thread: {e}")))?;
        let processing_sender = Arc::clone(&sender);
        let processing_batcher = Arc::clone(&batcher);
        let processing_join = std::thread::Builder::new()
            .name("ddtail-processing".to_owned())
            .spawn(move || run_processing(rx, processing_batcher, processing_sender))
            .map_err(|e| AgentError::EnvPrep(format!("cannot spawn processing thread: {e}")))?;

        info!(generation = generation.id, "generation started");
        Ok(GenerationRun {
            stop,
            input_join,
            processing_join,
            sender,
            worker_cancel,
        })
    }

    /// Stop sequence: hold input, dump checkpoints (the input thread does
    /// both on its way out), let processing flush, drain the sender under
    /// the budget, stop the background workers.
    async fn teardown(&self, run: GenerationRun, drain_budget: Duration) {
        run.stop.store(true, Ordering::SeqCst);
        let input_join = run.input_join;
        let _ = tokio::task::spawn_blocking(move || input_join.join()).await;
        let processing_join = run.processing_join;
        let _ = tokio::task::spawn_blocking(move || processing_join.join()).await;
        run.sender.drain(drain_budget).await;
        run.worker_cancel.cancel();
        info!("generation stopped");
    }

    /// The checkpoint scan validation table. For every durable primary
    /// checkpoint decide: resume (possibly at an updated path), or delete.
    fn scan_checkpoints(
        &self,
        generation: &Generation,
        scheduler: &RangeScheduler,
        alarms: &AlarmSender,
    ) -> (
        HashMap<(String, PathBuf), PrimaryCheckpoint>,
        Vec<FileEvent>,
    ) {
        let mut resume = HashMap::new();
        let mut events = Vec::new();
        let mut doomed: Vec<Vec<u8>> = Vec::new();
        let mut updates: Vec<(Vec<u8>, PrimaryCheckpoint)> = Vec::new();
        let mut searches = 0usize;

        for (key, value) in self.store.scan(ScanMode::Full) {
            if !key.starts_with(PRIMARY_PREFIX) {
                continue;
            }
            let Ok(mut cpt) = serde_json::from_slice::<PrimaryCheckpoint>(&value) else {
                warn!(key = %String::from_utf8_lossy(&key), "corrupt checkpoint dropped");
                doomed.push(key);
                continue;
            };
            let source = primary_key_source(&key)
                .and_then(|name| generation.source(name))
                .cloned();
            let Some(source) = source else {
                // Config name no longer present.
                self.doom_with_ranges(&key, &mut doomed);
                continue;
            };

            // Resolve the file the checkpoint described.
            let resolved = match fs::metadata(&cpt.logical_path) {
                Ok(meta) if (meta.dev(), meta.ino()) == (cpt.device, cpt.inode) => {
                    if signature_matches(&cpt.logical_path, &cpt) {
                        Some(cpt.logical_path.clone())
                    } else {
                        // Same inode, different content: a new file.
                        None
                    }
                }
                _ => {
                    // Path gone or reused: look for the inode in the parent
                    // directory (renamed-aside rotation), within a bounded
                    // search budget.
                    searches += 1;
                    if searches > SCAN_SEARCH_LIMIT {
                        alarms.raise(
                            ddtail_common::alarm::AlarmKind::Checkpoint,
                            Some(&source.name),
                            "checkpoint scan search budget exceeded",
                        );
                        self.doom_with_ranges(&key, &mut doomed);
                        continue;
                    }
                    cpt.logical_path
                        .parent()
                        .and_then(|dir| find_inode_in_dir(dir, cpt.device, cpt.inode))
                        .filter(|found| signature_matches(found, &cpt))
                }
            };

            let Some(path) = resolved else {
                self.doom_with_ranges(&key, &mut doomed);
                continue;
            };
            cpt.logical_path = path.clone();

            // A changed exactly-once concurrency opens a new epoch: the
            // acknowledged prefix becomes the base offset and the remaining
            // bytes are re-read and re-split.
            if source.exactly_once() && cpt.range_concurrency != source.exactly_once_concurrency
            {
                match scheduler.rebase_epoch(&key) {
                    Ok(Some(prefix)) => cpt.read_offset = prefix,
                    Ok(None) => {}
                    Err(e) => {
                        warn!(error = %e, "epoch rebase failed, resuming at checkpoint offset");
                    }
                }
                cpt.range_concurrency = source.exactly_once_concurrency;
            }

            updates.push((key, cpt.clone()));
            events.push(FileEvent {
                path: path.clone(),
                kind: FileEventKind::Modify,
                source: Arc::clone(&source),
            });
            resume.insert((source.name.clone(), path), cpt);
        }

        if !doomed.is_empty() {
            if let Err(e) = self.store.batch_delete(doomed) {
                warn!(error = %e, "checkpoint scan delete failed");
            }
        }
        if !updates.is_empty() {
            let entries: Vec<(Vec<u8>, Vec<u8>)> = updates
                .into_iter()
                .filter_map(|(key, cpt)| serde_json::to_vec(&cpt).ok().map(|v| (key, v)))
                .collect();
            if let Err(e) = self.store.batch_put(entries) {
                warn!(error = %e, "checkpoint scan update failed");
            }
        }
        info!(
            resumed = resume.len(),
            "checkpoint scan complete"
        );
        (resume, events)
    }

    fn doom_with_ranges(&self, key: &[u8], doomed: &mut Vec<Vec<u8>>) {
        for (index, _) in self.store.ranges_of(key) {
            doomed.push(range_key(key, index));
        }
        doomed.push(key.to_vec());
    }
}

/// Push aggregated alarms into the send path, routed to the destination of
/// the source they concern (or the first destination for global alarms).
async fn route_alarms(
    mut rx: mpsc::Receiver<AlarmRecord>,
    generation: Generation,
    batcher: Arc<Mutex<Batcher>>,
    sender: Arc<Sender>,
    cancel: CancellationToken,
) {
    loop {
        let alarm = select! {
            _ = cancel.cancelled() => return,
            alarm = rx.recv() => match alarm {
                Some(alarm) => alarm,
                None => return,
            },
        };
        let destination = alarm
            .source
            .as_deref()
            .and_then(|name| generation.source(name))
            .map(|s| s.destination.clone())
            .or_else(|| generation.destinations().next().map(|d| d.name.clone()));
        let Some(destination) = destination else {
            continue;
        };
        let record = Record::new(
            Utc::now(),
            vec![
                ("alarm_kind".to_owned(), alarm.kind.as_str().to_owned()),
                (
                    "alarm_source".to_owned(),
                    alarm.source.unwrap_or_default(),
                ),
                ("count".to_owned(), alarm.count.to_string()),
                ("first_message".to_owned(), alarm.first_message),
                ("last_message".to_owned(), alarm.last_message),
            ],
        );
        submit_agent_record(&batcher, &sender, &destination, record).await;
    }
}

/// Flush self-monitor profiles once a minute toward each source's
/// destination.
async fn flush_profiles(
    profiles: Arc<ProfileCollector>,
    generation: Generation,
    batcher: Arc<Mutex<Batcher>>,
    sender: Arc<Sender>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(60));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        for (source, record) in profiles.flush() {
            let Some(destination) = generation
                .source(&source)
                .map(|s| s.destination.clone())
            else {
                continue;
            };
            submit_agent_record(&batcher, &sender, &destination, record).await;
        }
    }
}

async fn submit_agent_record(
    batcher: &Arc<Mutex<Batcher>>,
    sender: &Arc<Sender>,
    destination: &str,
    record: Record,
) {
    let sealed = {
        match batcher
            .lock_or_panic()
            .push(destination, AGENT_PARTITION, None, &[], record)
        {
            Ok(sealed) => sealed,
            Err(e) => {
                warn!(error = %e, "agent record dropped");
                None
            }
        }
    };
    if let Some(batch) = sealed {
        let _ = sender.submit(batch).await;
    }
}
