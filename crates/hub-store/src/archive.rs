//! Destinations for compacted log ranges

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use tracing::info;

use hub_common::Event;

use crate::{Result, StoreError};

/// Receives events before compaction removes them from the log.
///
/// Called on the writer thread; an error aborts the compaction and leaves
/// the log untouched.
pub trait ArchiveSink: Send + Sync {
    fn archive(&self, events: &[Event]) -> Result<()>;
}

/// Writes each compacted range to `<dir>/<partition>-<first>-<last>.jsonl`
pub struct FileArchiveSink {
    dir: PathBuf,
    partition: String,
}

impl FileArchiveSink {
    pub fn new(dir: impl Into<PathBuf>, partition: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            partition: partition.into(),
        }
    }
}

impl ArchiveSink for FileArchiveSink {
    fn archive(&self, events: &[Event]) -> Result<()> {
        let (first, last) = match (events.first(), events.last()) {
            (Some(f), Some(l)) => (f.sequence_number, l.sequence_number),
            _ => return Ok(()),
        };

        std::fs::create_dir_all(&self.dir)
            .map_err(|e| StoreError::Archive(format!("create {}: {}", self.dir.display(), e)))?;
        let path = self.dir.join(format!("{}-{}-{}.jsonl", self.partition, first, last));

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| StoreError::Archive(format!("open {}: {}", path.display(), e)))?;

        let mut buf = Vec::new();
        for event in events {
            serde_json::to_writer(&mut buf, event)?;
            buf.push(b'\n');
        }
        file.write_all(&buf)
            .and_then(|_| file.sync_all())
            .map_err(|e| StoreError::Archive(format!("write {}: {}", path.display(), e)))?;

        info!(path = %path.display(), first = first, last = last, "Archived compacted events");
        Ok(())
    }
}
