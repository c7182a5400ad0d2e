//! Message hub event store
//!
//! Durable, append-only, replayable log:
//! - EventStore: clonable handle over a single writer thread (group commit, fsync, write-then-notify)
//! - Replay: lazy, restartable, checksum-verified reads by sequence or timestamp
//! - Snapshot: `(sequence, state)` pairs that bound recovery replay
//! - Compaction: drops snapshot-covered records past retention, optionally archiving them
//! - Subscriptions: glob-pattern streams with durable checkpoints

pub mod archive;
pub mod checkpoint;
pub mod error;
pub mod replay;
pub mod snapshot;
pub mod store;
pub mod subscription;
mod wal;

pub use archive::{ArchiveSink, FileArchiveSink};
pub use checkpoint::{CheckpointStore, FileCheckpointStore, InMemoryCheckpointStore};
pub use error::StoreError;
pub use replay::{Replay, ReplayFrom};
pub use snapshot::Snapshot;
pub use store::EventStore;
pub use subscription::{EventSubscription, PatternSet, SubscriptionSpec};
pub use wal::CompactionReport;

pub type Result<T> = std::result::Result<T, StoreError>;
