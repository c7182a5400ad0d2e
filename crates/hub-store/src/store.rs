//! EventStore - clonable handle over the single-writer log
//!
//! Appends are sent to a dedicated writer thread that serializes them into
//! the log, fsyncs, and only then replies and notifies live subscribers.
//! Appends queued together are committed with one fsync (group commit).

use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info};

use hub_common::Event;
use hub_config::StoreConfig;

use crate::archive::{ArchiveSink, FileArchiveSink};
use crate::checkpoint::CheckpointStore;
use crate::replay::{Replay, ReplayFrom};
use crate::snapshot::Snapshot;
use crate::subscription::{EventSubscription, SubscriptionSpec};
use crate::wal::{CompactionReport, EventLog, LogShared};
use crate::{Result, StoreError};

const COMMAND_CAPACITY: usize = 1024;
const MAX_GROUP: usize = 256;

enum WriteCommand {
    Append {
        events: Vec<Event>,
        reply: oneshot::Sender<Result<Vec<Event>>>,
    },
    Snapshot {
        sequence: u64,
        state: serde_json::Value,
        reply: oneshot::Sender<Result<Snapshot>>,
    },
    Compact {
        before: u64,
        reply: oneshot::Sender<Result<CompactionReport>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

struct Inner {
    partition: String,
    commands: mpsc::Sender<WriteCommand>,
    shared: Arc<LogShared>,
    notify: broadcast::Sender<Arc<Event>>,
    closed: AtomicBool,
}

/// Durable, append-only event log for one partition
#[derive(Clone)]
pub struct EventStore {
    inner: Arc<Inner>,
}

impl EventStore {
    /// Open the partition described by `config`, using a file archive when
    /// `archive_dir` is set.
    pub fn open(config: &StoreConfig) -> Result<Self> {
        let archive = config.archive_dir.as_ref().map(|dir| {
            Arc::new(FileArchiveSink::new(dir.clone(), config.partition.clone())) as Arc<dyn ArchiveSink>
        });
        Self::open_with_archive(config, archive)
    }

    pub fn open_with_archive(config: &StoreConfig, archive: Option<Arc<dyn ArchiveSink>>) -> Result<Self> {
        let log = EventLog::open(config, archive)?;
        let shared = log.shared();
        let (commands, rx) = mpsc::channel(COMMAND_CAPACITY);
        let (notify, _) = broadcast::channel(config.notify_capacity.max(1));

        let writer_notify = notify.clone();
        std::thread::Builder::new()
            .name(format!("hub-wal-{}", config.partition))
            .spawn(move || run_writer(log, rx, writer_notify))?;

        Ok(Self {
            inner: Arc::new(Inner {
                partition: config.partition.clone(),
                commands,
                shared,
                notify,
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn partition(&self) -> &str {
        &self.inner.partition
    }

    /// Append one event; returns its sequence number once durable
    pub async fn append(&self, event: Event) -> Result<u64> {
        let events = self.append_batch(vec![event]).await?;
        events
            .first()
            .map(|e| e.sequence_number)
            .ok_or_else(|| StoreError::corrupted(0, "writer returned an empty batch"))
    }

    /// Append events as one record: after a crash either all of them are in
    /// the log or none is. Returns the events with their sequence numbers,
    /// which form a contiguous range.
    pub async fn append_batch(&self, events: Vec<Event>) -> Result<Vec<Event>> {
        if events.is_empty() {
            return Ok(Vec::new());
        }
        self.inner.shared.check_writable()?;
        let (reply, rx) = oneshot::channel();
        self.send(WriteCommand::Append { events, reply }).await?;
        rx.await.map_err(|_| StoreError::Closed)?
    }

    /// Persist `(sequence, state)`. `sequence` must not be beyond the head.
    pub async fn snapshot(&self, sequence: u64, state: serde_json::Value) -> Result<Snapshot> {
        let (reply, rx) = oneshot::channel();
        self.send(WriteCommand::Snapshot { sequence, state, reply }).await?;
        rx.await.map_err(|_| StoreError::Closed)?
    }

    pub fn latest_snapshot(&self) -> Option<Snapshot> {
        self.inner.shared.snapshot.read().clone()
    }

    /// Remove records below `min(before, snapshot + 1)` that are past retention
    pub async fn compact(&self, before: u64) -> Result<CompactionReport> {
        let (reply, rx) = oneshot::channel();
        self.send(WriteCommand::Compact { before, reply }).await?;
        rx.await.map_err(|_| StoreError::Closed)?
    }

    /// Last durable sequence number
    pub fn head(&self) -> u64 {
        self.inner.shared.head()
    }

    /// Lowest sequence number still readable
    pub fn first_available(&self) -> u64 {
        self.inner.shared.first_available()
    }

    /// Lazy read of everything durable at call time, starting at `from`
    pub fn replay(&self, from: ReplayFrom) -> Result<Replay> {
        Replay::open(&self.inner.shared, from, u64::MAX)
    }

    /// Events with sequence numbers in `from..=to`, in order
    pub fn read_range(&self, from: u64, to: u64) -> Result<Vec<Event>> {
        if to < from {
            return Ok(Vec::new());
        }
        Replay::open(&self.inner.shared, ReplayFrom::Sequence(from), to)?.collect()
    }

    pub fn read(&self, range: RangeInclusive<u64>) -> Result<Vec<Event>> {
        self.read_range(*range.start(), *range.end())
    }

    /// Live feed of newly durable events
    pub fn live(&self) -> broadcast::Receiver<Arc<Event>> {
        self.inner.notify.subscribe()
    }

    /// Stream of events matching `spec.patterns` in persisted order. Durable
    /// subscriptions resume after the checkpoint saved under
    /// `spec.checkpoint_key()`.
    pub async fn subscribe(
        &self,
        spec: SubscriptionSpec,
        checkpoints: Option<Arc<dyn CheckpointStore>>,
    ) -> Result<EventSubscription> {
        EventSubscription::start(self.clone(), spec, checkpoints).await
    }

    /// False once closed, or after a failed write poisoned the log
    pub fn is_writable(&self) -> bool {
        !self.inner.closed.load(Ordering::Acquire)
            && !self.inner.commands.is_closed()
            && !self.inner.shared.is_poisoned()
    }

    /// Flush and stop the writer. Later writes fail with `Closed`.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let (reply, rx) = oneshot::channel();
        if self.inner.commands.send(WriteCommand::Shutdown { reply }).await.is_ok() {
            let _ = rx.await;
        }
        info!(partition = %self.inner.partition, "Event store closed");
    }

    async fn send(&self, command: WriteCommand) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        self.inner
            .commands
            .send(command)
            .await
            .map_err(|_| StoreError::Closed)
    }
}

type PendingAppend = (Vec<Event>, oneshot::Sender<Result<Vec<Event>>>);

fn run_writer(
    mut log: EventLog,
    mut rx: mpsc::Receiver<WriteCommand>,
    notify: broadcast::Sender<Arc<Event>>,
) {
    debug!("Event log writer started");
    let mut pending: Vec<PendingAppend> = Vec::new();

    while let Some(first) = rx.blocking_recv() {
        let mut commands = vec![first];
        while commands.len() < MAX_GROUP {
            match rx.try_recv() {
                Ok(cmd) => commands.push(cmd),
                Err(_) => break,
            }
        }

        for command in commands {
            match command {
                WriteCommand::Append { events, reply } => {
                    pending.push((events, reply));
                    continue;
                }
                other => {
                    commit_appends(&mut log, &mut pending, &notify);
                    match other {
                        WriteCommand::Snapshot { sequence, state, reply } => {
                            let _ = reply.send(log.write_snapshot(sequence, state));
                        }
                        WriteCommand::Compact { before, reply } => {
                            let _ = reply.send(log.compact(before));
                        }
                        WriteCommand::Shutdown { reply } => {
                            if let Err(e) = log.sync() {
                                error!(error = %e, "Final log sync failed");
                            }
                            rx.close();
                            // Fail anything that raced in behind the shutdown
                            while let Ok(cmd) = rx.try_recv() {
                                reject(cmd);
                            }
                            let _ = reply.send(());
                            debug!("Event log writer stopped");
                            return;
                        }
                        WriteCommand::Append { .. } => {}
                    }
                }
            }
        }
        commit_appends(&mut log, &mut pending, &notify);
    }

    debug!("Event log writer stopped, all handles dropped");
}

fn commit_appends(
    log: &mut EventLog,
    pending: &mut Vec<PendingAppend>,
    notify: &broadcast::Sender<Arc<Event>>,
) {
    if pending.is_empty() {
        return;
    }
    let (batches, replies): (Vec<_>, Vec<_>) = pending.drain(..).unzip();

    match log.append_group(batches) {
        Ok(stamped) => {
            for (events, reply) in stamped.into_iter().zip(replies) {
                // Write-then-notify: only durable events reach subscribers
                for event in &events {
                    let _ = notify.send(Arc::new(event.clone()));
                }
                let _ = reply.send(Ok(events));
            }
        }
        Err(e) => {
            error!(error = %e, "Event log append failed");
            for reply in replies {
                let _ = reply.send(Err(e.duplicate()));
            }
        }
    }
}

fn reject(command: WriteCommand) {
    match command {
        WriteCommand::Append { reply, .. } => {
            let _ = reply.send(Err(StoreError::Closed));
        }
        WriteCommand::Snapshot { reply, .. } => {
            let _ = reply.send(Err(StoreError::Closed));
        }
        WriteCommand::Compact { reply, .. } => {
            let _ = reply.send(Err(StoreError::Closed));
        }
        WriteCommand::Shutdown { reply } => {
            let _ = reply.send(());
        }
    }
}
