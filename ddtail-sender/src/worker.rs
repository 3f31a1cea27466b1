// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::destination::DestinationHandle;
use crate::exactly_once::RangeScheduler;
use crate::payload::{encode_batch, SenderMeta};
use crate::transport::{BatchTransport, SendOutcome};
use ddtail_checkpoint::primary_key_source;
use ddtail_common::alarm::{AlarmKind, AlarmSender};
use ddtail_config::{DestinationConfig, Generation};
use ddtail_pipeline::Batch;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::select;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Queue depth per destination. Full queues push back on the processing
/// thread, which pushes back on readers through the batcher.
const QUEUE_DEPTH: usize = 64;
/// Gate re-check cadence while a destination is blocked or saturated.
const GATE_POLL: Duration = Duration::from_millis(100);
/// Re-check cadence while waiting for an exactly-once slot.
const SLOT_POLL: Duration = Duration::from_millis(50);

struct Shared {
    transport: Arc<dyn BatchTransport>,
    scheduler: Option<RangeScheduler>,
    meta: SenderMeta,
    alarms: AlarmSender,
    urgent: AtomicBool,
    pending: AtomicU64,
    /// Exactly-once concurrency per source name.
    eo_k: HashMap<String, u32>,
    cancel: CancellationToken,
}

/// Per-destination queues and worker pools. One instance per agent.
pub struct Sender {
    queues: HashMap<String, mpsc::Sender<Batch>>,
    destinations: HashMap<String, DestinationHandle>,
    shared: Arc<Shared>,
    workers: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Sender {
    /// Spawn worker pools for every destination in `generation`.
    pub fn start(
        generation: &Generation,
        transport: Arc<dyn BatchTransport>,
        scheduler: Option<RangeScheduler>,
        meta: SenderMeta,
        alarms: AlarmSender,
        cancel: CancellationToken,
    ) -> Sender {
        let eo_k = generation
            .sources()
            .iter()
            .filter(|s| s.exactly_once())
            .map(|s| (s.name.clone(), s.exactly_once_concurrency))
            .collect();
        let shared = Arc::new(Shared {
            transport,
            scheduler,
            meta,
            alarms,
            urgent: AtomicBool::new(false),
            pending: AtomicU64::new(0),
            eo_k,
            cancel,
        });

        let mut queues = HashMap::new();
        let mut destinations = HashMap::new();
        let mut workers = Vec::new();
        for config in generation.destinations() {
            let (tx, rx) = mpsc::channel::<Batch>(QUEUE_DEPTH);
            let rx = Arc::new(tokio::sync::Mutex::new(rx));
            let handle = DestinationHandle::new(Arc::clone(config));
            for worker_id in 0..config.concurrency_max {
                workers.push(tokio::spawn(run_worker(
                    worker_id,
                    Arc::clone(config),
                    handle.clone(),
                    Arc::clone(&rx),
                    Arc::clone(&shared),
                )));
            }
            queues.insert(config.name.clone(), tx);
            destinations.insert(config.name.clone(), handle);
        }
        info!(destinations = queues.len(), "sender started");
        Sender {
            queues,
            destinations,
            shared,
            workers: std::sync::Mutex::new(workers),
        }
    }

    /// Enqueue from the processing thread. Blocks while the destination
    /// queue is full, which is the intended backpressure.
    pub fn submit_blocking(&self, batch: Batch) -> Result<(), crate::SendError> {
        let queue = self
            .queues
            .get(&batch.destination)
            .ok_or_else(|| crate::SendError::UnknownDestination(batch.destination.clone()))?;
        self.shared.pending.fetch_add(1, Ordering::SeqCst);
        if queue.blocking_send(batch).is_err() {
            self.shared.pending.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }

    pub async fn submit(&self, batch: Batch) -> Result<(), crate::SendError> {
        let queue = self
            .queues
            .get(&batch.destination)
            .ok_or_else(|| crate::SendError::UnknownDestination(batch.destination.clone()))?;
        self.shared.pending.fetch_add(1, Ordering::SeqCst);
        if queue.send(batch).await.is_err() {
            self.shared.pending.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }

    pub fn destination(&self, name: &str) -> Option<&DestinationHandle> {
        self.destinations.get(name)
    }

    /// Batches queued or in flight.
    pub fn pending(&self) -> u64 {
        self.shared.pending.load(Ordering::SeqCst)
    }

    /// Enter urgent mode: errors stop decreasing concurrency and cancelled
    /// workers keep draining their queues.
    pub fn set_urgent(&self) {
        self.shared.urgent.store(true, Ordering::SeqCst);
    }

    /// Shutdown drain: urgent mode, wait for the queues to empty within
    /// `budget`, then stop. Whatever did not make it out stays recoverable
    /// from checkpoints on the next start.
    pub async fn drain(&self, budget: Duration) {
        self.set_urgent();
        let deadline = Instant::now() + budget;
        while self.pending() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let abandoned = self.pending();
        if abandoned > 0 {
            warn!(abandoned, "drain budget exhausted, abandoning queued batches");
        }
        self.shared.cancel.cancel();
        // Leaving urgent mode after cancellation is the hard stop: workers
        // still retrying observe cancelled-and-not-urgent and abandon their
        // batch (recoverable from checkpoints next start).
        self.shared.urgent.store(false, Ordering::SeqCst);
        let workers: Vec<JoinHandle<()>> = {
            let mut guard = match self.workers.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.drain(..).collect()
        };
        for worker in workers {
            let _ = tokio::time::timeout(Duration::from_secs(1), worker).await;
        }
    }
}

async fn run_worker(
    worker_id: u32,
    config: Arc<DestinationConfig>,
    dest: DestinationHandle,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Batch>>>,
    shared: Arc<Shared>,
) {
    loop {
        let batch = {
            let mut rx = rx.lock().await;
            select! {
                _ = shared.cancel.cancelled() => {
                    // In urgent mode keep draining what is already queued.
                    if shared.urgent.load(Ordering::SeqCst) {
                        rx.try_recv().ok()
                    } else {
                        None
                    }
                }
                received = rx.recv() => received,
            }
        };
        let Some(batch) = batch else {
            debug!(destination = %config.name, worker_id, "sender worker exiting");
            return;
        };
        process_batch(&config, &dest, &shared, batch).await;
        shared.pending.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn process_batch(
    config: &DestinationConfig,
    dest: &DestinationHandle,
    shared: &Shared,
    batch: Batch,
) {
    let encoded = match encode_batch(&batch, &shared.meta, &config.region, config.compression) {
        Ok(encoded) => encoded,
        Err(e) => {
            shared.alarms.raise(
                AlarmKind::SendDataFail,
                Some(&batch.partition),
                format!("batch {} failed to encode: {e}", batch.sequence),
            );
            return;
        }
    };

    // Exactly-once: park until a range slot frees up.
    let eo_slot = match (&batch.range, &shared.scheduler) {
        (Some(range), Some(scheduler)) => {
            let k = primary_key_source(&range.primary_key)
                .and_then(|source| shared.eo_k.get(source).copied())
                .unwrap_or(0);
            if k == 0 {
                None
            } else {
                loop {
                    match scheduler.assign(range, k, batch.sequence) {
                        Ok(Some(index)) => break Some((range.primary_key.clone(), index)),
                        Ok(None) => {
                            if shared.cancel.is_cancelled() {
                                return;
                            }
                            tokio::time::sleep(SLOT_POLL).await;
                        }
                        Err(e) => {
                            shared.alarms.raise(
                                AlarmKind::Checkpoint,
                                Some(&batch.partition),
                                format!("range assignment failed: {e}"),
                            );
                            break None;
                        }
                    }
                }
            }
        }
        _ => None,
    };

    loop {
        let urgent = shared.urgent.load(Ordering::SeqCst);
        if !dest.try_acquire(Instant::now(), urgent) {
            if shared.cancel.is_cancelled() && !urgent {
                return;
            }
            tokio::time::sleep(GATE_POLL).await;
            continue;
        }
        let outcome = shared.transport.send(&encoded).await;
        dest.record(outcome, Instant::now(), urgent);
        dest.release();

        match outcome {
            SendOutcome::Ok => {
                if let (Some((primary, index)), Some(scheduler)) =
                    (&eo_slot, &shared.scheduler)
                {
                    if let Err(e) = scheduler.acknowledge(primary, *index) {
                        shared.alarms.raise(
                            AlarmKind::Checkpoint,
                            Some(&batch.partition),
                            format!("range ack failed: {e}"),
                        );
                    }
                }
                return;
            }
            SendOutcome::Discard => {
                shared.alarms.raise(
                    AlarmKind::DiscardData,
                    Some(&batch.partition),
                    format!(
                        "batch {} ({} records) discarded by destination",
                        batch.sequence, encoded.record_count
                    ),
                );
                // The destination refuses these bytes forever; mark the slot
                // done so the file is not wedged.
                if let (Some((primary, index)), Some(scheduler)) =
                    (&eo_slot, &shared.scheduler)
                {
                    let _ = scheduler.acknowledge(primary, *index);
                }
                return;
            }
            SendOutcome::NetworkFail => {
                shared.alarms.raise(
                    AlarmKind::SendDataFail,
                    Some(&batch.partition),
                    format!("network failure sending batch {}", batch.sequence),
                );
            }
            SendOutcome::QuotaFail => {
                shared.alarms.raise(
                    AlarmKind::SendQuotaExceed,
                    Some(&batch.partition),
                    format!("quota rejection for batch {}", batch.sequence),
                );
            }
        }
        // Retryable failure: the batch is retried in place (an in-flight
        // exactly-once range stays in flight). Cancellation without urgent
        // mode abandons it; checkpoints recover the bytes next start.
        if shared.cancel.is_cancelled() && !shared.urgent.load(Ordering::SeqCst) {
            return;
        }
        tokio::time::sleep(GATE_POLL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;
    use chrono::Utc;
    use ddtail_config::AgentConfig;
    use ddtail_pipeline::Record;

    fn generation(dest_overrides: serde_json::Value) -> Generation {
        let mut dest = serde_json::json!({
            "name": "main",
            "endpoint": "https://intake.example.com/v1",
            "concurrency_max": 2,
        });
        dest.as_object_mut()
            .unwrap()
            .extend(dest_overrides.as_object().unwrap().clone());
        let config: AgentConfig = serde_json::from_value(serde_json::json!({
            "sources": [{
                "name": "app",
                "path_glob": "/logs/*.log",
                "destination": "main",
            }],
            "destinations": [dest],
        }))
        .unwrap();
        let (generation, errors) = Generation::build(&config);
        assert!(errors.is_empty());
        generation
    }

    fn batch(sequence: u64) -> Batch {
        Batch {
            destination: "main".into(),
            partition: "app".into(),
            tags: Vec::new(),
            records: vec![Record::new(
                Utc::now(),
                vec![("content".into(), format!("record {sequence}"))],
            )],
            bytes: 32,
            earliest: Utc::now(),
            latest: Utc::now(),
            sequence,
            range: None,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_batches_delivered() {
        let transport = MemoryTransport::new();
        let cancel = CancellationToken::new();
        let sender = Sender::start(
            &generation(serde_json::json!({})),
            transport.clone(),
            None,
            SenderMeta::default(),
            AlarmSender::disconnected(),
            cancel.clone(),
        );
        for sequence in 1..=3 {
            sender.submit(batch(sequence)).await.unwrap();
        }
        let deadline = Instant::now() + Duration::from_secs(5);
        while sender.pending() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(sender.pending(), 0);
        let mut sequences: Vec<u64> = transport.delivered().iter().map(|b| b.sequence).collect();
        sequences.sort_unstable();
        assert_eq!(sequences, vec![1, 2, 3]);
        sender.drain(Duration::from_secs(1)).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_network_failure_retried_in_place() {
        let transport = MemoryTransport::scripted([SendOutcome::NetworkFail]);
        let cancel = CancellationToken::new();
        let sender = Sender::start(
            &generation(serde_json::json!({})),
            transport.clone(),
            None,
            SenderMeta::default(),
            AlarmSender::disconnected(),
            cancel.clone(),
        );
        sender.submit(batch(7)).await.unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while transport.delivered().is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        // First attempt failed, second succeeded.
        assert_eq!(transport.attempts(), 2);
        assert_eq!(transport.delivered().len(), 1);
        sender.drain(Duration::from_secs(1)).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_quota_backoff_scenario() {
        // Three batches; the destination quota-fails the third. With the
        // default threshold of 1 the destination blocks, then the retry
        // window (0 here) elapses and the resend succeeds, restoring
        // quota_ok and the base interval.
        let transport = MemoryTransport::scripted([
            SendOutcome::Ok,
            SendOutcome::Ok,
            SendOutcome::QuotaFail,
        ]);
        let cancel = CancellationToken::new();
        let sender = Sender::start(
            &generation(serde_json::json!({
                "concurrency_max": 1,
                "quota_retry_secs": 0,
            })),
            transport.clone(),
            None,
            SenderMeta::default(),
            AlarmSender::disconnected(),
            cancel.clone(),
        );
        for sequence in 1..=3 {
            sender.submit(batch(sequence)).await.unwrap();
        }
        let deadline = Instant::now() + Duration::from_secs(10);
        while transport.delivered().len() < 3 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(transport.delivered().len(), 3);
        assert_eq!(transport.attempts(), 4);
        let snapshot = sender.destination("main").unwrap().snapshot();
        assert!(snapshot.quota_ok);
        assert_eq!(snapshot.consec_quota_err, 0);
        sender.drain(Duration::from_secs(1)).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_drain_abandons_blocked_destination() {
        // Every send fails; drain must give up within its budget.
        let transport = MemoryTransport::scripted(
            std::iter::repeat(SendOutcome::NetworkFail).take(1000),
        );
        let cancel = CancellationToken::new();
        let sender = Sender::start(
            &generation(serde_json::json!({ "network_retry_secs": 600 })),
            transport.clone(),
            None,
            SenderMeta::default(),
            AlarmSender::disconnected(),
            cancel.clone(),
        );
        sender.submit(batch(1)).await.unwrap();
        let started = Instant::now();
        sender.drain(Duration::from_millis(300)).await;
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
