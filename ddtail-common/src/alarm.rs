// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Process-wide alarm stream.
//!
//! Components raise alarms instead of logging-and-forgetting operational
//! failures. Alarms are aggregated per `(kind, source)` inside a flush window
//! and the aggregate is emitted as a record toward the same destination as the
//! data, so operators see agent trouble next to the logs it affects.

use crate::worker::Worker;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::select;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Default aggregation window before a cell is flushed downstream.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(30);

/// Upper bound on distinct `(kind, source)` cells held between flushes.
/// Anything past the cap only bumps the overflow counter.
const MAX_CELLS: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmKind {
    UserConfig,
    TooManyConfig,
    RegisterNotifyFail,
    NotifyDirLimit,
    DirExceedLimit,
    LogfilePermission,
    OpenLogfileFail,
    FileReaderExceed,
    LogTruncate,
    SplitLogFail,
    ParseLogFail,
    ParseTimeFail,
    OutdatedLog,
    EncodingConvert,
    Checkpoint,
    SendDataFail,
    SendQuotaExceed,
    DiscardData,
    ReadLogDelay,
    InvariantViolation,
}

impl AlarmKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlarmKind::UserConfig => "user_config",
            AlarmKind::TooManyConfig => "too_many_config",
            AlarmKind::RegisterNotifyFail => "register_notify_fail",
            AlarmKind::NotifyDirLimit => "notify_dir_limit",
            AlarmKind::DirExceedLimit => "dir_exceed_limit",
            AlarmKind::LogfilePermission => "logfile_permission",
            AlarmKind::OpenLogfileFail => "open_logfile_fail",
            AlarmKind::FileReaderExceed => "file_reader_exceed",
            AlarmKind::LogTruncate => "log_truncate",
            AlarmKind::SplitLogFail => "split_log_fail",
            AlarmKind::ParseLogFail => "parse_log_fail",
            AlarmKind::ParseTimeFail => "parse_time_fail",
            AlarmKind::OutdatedLog => "outdated_log",
            AlarmKind::EncodingConvert => "encoding_convert",
            AlarmKind::Checkpoint => "checkpoint",
            AlarmKind::SendDataFail => "send_data_fail",
            AlarmKind::SendQuotaExceed => "send_quota_exceed",
            AlarmKind::DiscardData => "discard_data",
            AlarmKind::ReadLogDelay => "read_log_delay",
            AlarmKind::InvariantViolation => "invariant_violation",
        }
    }
}

/// A single raised alarm, before aggregation.
#[derive(Debug, Clone)]
pub struct Alarm {
    pub kind: AlarmKind,
    /// Source config name the alarm belongs to, if any.
    pub source: Option<String>,
    pub message: String,
}

/// Aggregate flushed downstream once per window.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AlarmRecord {
    pub kind: AlarmKind,
    pub source: Option<String>,
    pub count: u64,
    pub first_message: String,
    pub last_message: String,
}

/// Cheaply cloneable handle used by every component to raise alarms.
#[derive(Debug, Clone)]
pub struct AlarmSender {
    tx: mpsc::UnboundedSender<Alarm>,
}

impl AlarmSender {
    /// Raise an alarm. Never blocks; if the aggregator is gone the alarm is
    /// downgraded to a log line.
    pub fn raise(&self, kind: AlarmKind, source: Option<&str>, message: impl Into<String>) {
        let alarm = Alarm {
            kind,
            source: source.map(str::to_owned),
            message: message.into(),
        };
        if let Err(e) = self.tx.send(alarm) {
            let alarm = e.0;
            warn!(
                kind = alarm.kind.as_str(),
                message = %alarm.message,
                "alarm raised after aggregator shutdown"
            );
        }
    }

    /// A sender whose alarms go nowhere. For tests and tools.
    pub fn disconnected() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        AlarmSender { tx }
    }
}

struct Cell {
    count: u64,
    first_message: String,
    last_message: String,
}

/// Aggregates raised alarms and flushes them as records on a fixed interval.
pub struct AlarmAggregator {
    rx: mpsc::UnboundedReceiver<Alarm>,
    out: mpsc::Sender<AlarmRecord>,
    flush_interval: Duration,
    cancel: CancellationToken,
    cells: HashMap<(AlarmKind, Option<String>), Cell>,
    overflowed: u64,
}

impl AlarmAggregator {
    /// Build the `(sender, aggregator)` pair. `out` receives one record per
    /// live `(kind, source)` cell per flush window.
    pub fn new(
        out: mpsc::Sender<AlarmRecord>,
        flush_interval: Duration,
        cancel: CancellationToken,
    ) -> (AlarmSender, AlarmAggregator) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            AlarmSender { tx },
            AlarmAggregator {
                rx,
                out,
                flush_interval,
                cancel,
                cells: HashMap::new(),
                overflowed: 0,
            },
        )
    }

    fn absorb(&mut self, alarm: Alarm) {
        let key = (alarm.kind, alarm.source);
        if let Some(cell) = self.cells.get_mut(&key) {
            cell.count += 1;
            cell.last_message = alarm.message;
        } else if self.cells.len() < MAX_CELLS {
            self.cells.insert(
                key,
                Cell {
                    count: 1,
                    first_message: alarm.message.clone(),
                    last_message: alarm.message,
                },
            );
        } else {
            self.overflowed += 1;
        }
    }

    async fn flush(&mut self) {
        if self.overflowed > 0 {
            warn!(dropped = self.overflowed, "alarm cells over capacity");
            self.overflowed = 0;
        }
        for ((kind, source), cell) in self.cells.drain() {
            let record = AlarmRecord {
                kind,
                source,
                count: cell.count,
                first_message: cell.first_message,
                last_message: cell.last_message,
            };
            // The receiver applies its own backpressure; a full pipe drops the
            // aggregate rather than stalling the components raising alarms.
            if self.out.try_send(record).is_err() {
                warn!("alarm flush dropped, downstream full");
            }
        }
    }
}

impl Worker for AlarmAggregator {
    async fn run(&mut self) {
        let mut ticker = tokio::time::interval(self.flush_interval);
        loop {
            select! {
                _ = self.cancel.cancelled() => {
                    self.flush().await;
                    return;
                }
                maybe = self.rx.recv() => {
                    match maybe {
                        Some(alarm) => self.absorb(alarm),
                        None => {
                            self.flush().await;
                            return;
                        }
                    }
                }
                _ = ticker.tick() => {
                    self.flush().await;
                }
            }
        }
    }
}
