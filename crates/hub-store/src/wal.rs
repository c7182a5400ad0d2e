//! Write-ahead log file
//!
//! One framed record per line: `<sha256 hex> <json array of events>\n`. The
//! checksum covers the exact JSON bytes. A record holds one append batch, so
//! a batch is visible either entirely or not at all after a crash.
//!
//! Only the writer thread owns an [`EventLog`]; readers go through the
//! shared [`LogShared`] index and open their own file handles.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};

use hub_common::Event;
use hub_config::StoreConfig;

use crate::archive::ArchiveSink;
use crate::replay::RecordReader;
use crate::snapshot::{self, Snapshot};
use crate::{Result, StoreError};

const CHECKSUM_HEX_LEN: usize = 64;

// ============================================================================
// Framing
// ============================================================================

pub(crate) fn encode_frame(json: &[u8]) -> Vec<u8> {
    let checksum = hex::encode(Sha256::digest(json));
    let mut buf = Vec::with_capacity(json.len() + CHECKSUM_HEX_LEN + 2);
    buf.extend_from_slice(checksum.as_bytes());
    buf.push(b' ');
    buf.extend_from_slice(json);
    buf.push(b'\n');
    buf
}

/// Verify a frame (without its trailing newline) and return the JSON body
pub(crate) fn decode_frame(line: &[u8], offset: u64) -> Result<&[u8]> {
    if line.len() <= CHECKSUM_HEX_LEN || line[CHECKSUM_HEX_LEN] != b' ' {
        return Err(StoreError::corrupted(offset, "malformed frame header"));
    }
    let (checksum, json) = (&line[..CHECKSUM_HEX_LEN], &line[CHECKSUM_HEX_LEN + 1..]);
    let actual = hex::encode(Sha256::digest(json));
    if actual.as_bytes() != checksum {
        return Err(StoreError::corrupted(offset, "checksum mismatch"));
    }
    Ok(json)
}

pub(crate) fn encode_record(events: &[Event]) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(events)?;
    Ok(encode_frame(&json))
}

pub(crate) fn decode_record(line: &[u8], offset: u64) -> Result<Vec<Event>> {
    let json = decode_frame(line, offset)?;
    let events: Vec<Event> = serde_json::from_slice(json)
        .map_err(|e| StoreError::corrupted(offset, format!("undecodable record: {}", e)))?;
    if events.is_empty() {
        return Err(StoreError::corrupted(offset, "empty record"));
    }
    for (i, event) in events.iter().enumerate() {
        if event.sequence_number != events[0].sequence_number + i as u64 {
            return Err(StoreError::corrupted(offset, "non-contiguous sequence inside record"));
        }
    }
    Ok(events)
}

// ============================================================================
// Shared index
// ============================================================================

/// Location of one record in the log file
#[derive(Debug, Clone)]
pub(crate) struct RecordMeta {
    pub first_seq: u64,
    pub last_seq: u64,
    pub offset: u64,
    pub len: u64,
    pub last_timestamp: DateTime<Utc>,
}

/// State visible to readers
pub(crate) struct LogShared {
    pub path: PathBuf,
    pub index: RwLock<Vec<RecordMeta>>,
    /// Last durable sequence number, 0 when nothing was ever written
    pub head: AtomicU64,
    pub snapshot: RwLock<Option<Snapshot>>,
    /// Why the log stopped accepting writes; set once, never cleared
    pub poisoned: RwLock<Option<String>>,
}

impl LogShared {
    pub fn head(&self) -> u64 {
        self.head.load(Ordering::Acquire)
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.read().is_some()
    }

    pub(crate) fn poison(&self, reason: String) {
        let mut poisoned = self.poisoned.write();
        if poisoned.is_none() {
            error!(reason = %reason, "Event log poisoned, refusing further writes");
            *poisoned = Some(reason);
        }
    }

    pub(crate) fn check_writable(&self) -> Result<()> {
        match self.poisoned.read().as_ref() {
            Some(reason) => Err(StoreError::Poisoned(reason.clone())),
            None => Ok(()),
        }
    }

    pub fn first_available(&self) -> u64 {
        self.index
            .read()
            .first()
            .map(|r| r.first_seq)
            .unwrap_or_else(|| self.head() + 1)
    }
}

/// Outcome of a compaction pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionReport {
    pub removed_records: usize,
    pub removed_events: u64,
    /// First sequence still present in the log, if any
    pub first_sequence: Option<u64>,
}

// ============================================================================
// EventLog
// ============================================================================

pub(crate) struct EventLog {
    file: File,
    len: u64,
    next_seq: u64,
    config: StoreConfig,
    shared: Arc<LogShared>,
    archive: Option<Arc<dyn ArchiveSink>>,
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).read(true).append(true).open(path)
}

impl EventLog {
    pub fn open(config: &StoreConfig, archive: Option<Arc<dyn ArchiveSink>>) -> Result<Self> {
        fs::create_dir_all(&config.data_dir)?;
        let path = config.log_path();
        let file = open_append(&path)?;

        let snapshot = snapshot::read_snapshot(&config.snapshot_path())?;
        let (index, len) = scan(&file, config.repair_torn_tail)?;

        let snapshot_seq = snapshot.as_ref().map(|s| s.sequence).unwrap_or(0);
        if let Some(first) = index.first() {
            if first.first_seq > snapshot_seq + 1 {
                return Err(StoreError::corrupted(
                    0,
                    format!(
                        "log starts at sequence {} but snapshot only covers {}",
                        first.first_seq, snapshot_seq
                    ),
                ));
            }
        }

        let last_seq = index.last().map(|r| r.last_seq).unwrap_or(0);
        // Never reuse a sequence, even when compaction emptied the log
        let head = last_seq.max(snapshot_seq);

        info!(
            path = %path.display(),
            records = index.len(),
            head = head,
            snapshot_sequence = snapshot_seq,
            "Opened event log"
        );

        let shared = Arc::new(LogShared {
            path,
            index: RwLock::new(index),
            head: AtomicU64::new(head),
            snapshot: RwLock::new(snapshot),
            poisoned: RwLock::new(None),
        });

        Ok(Self {
            file,
            len,
            next_seq: head + 1,
            config: config.clone(),
            shared,
            archive,
        })
    }

    pub fn shared(&self) -> Arc<LogShared> {
        self.shared.clone()
    }

    /// Write every batch as its own record and sync once. Either all batches
    /// become durable or none does. A failed write poisons the log: the
    /// file is rolled back to its previous length when possible, and every
    /// later write is refused.
    pub fn append_group(&mut self, batches: Vec<Vec<Event>>) -> Result<Vec<Vec<Event>>> {
        self.shared.check_writable()?;
        let start_len = self.len;
        let mut seq = self.next_seq;
        let mut frames = Vec::with_capacity(batches.len());
        let mut metas = Vec::with_capacity(batches.len());
        let mut offset = start_len;
        let mut stamped = Vec::with_capacity(batches.len());

        for mut batch in batches {
            let first_seq = seq;
            for event in batch.iter_mut() {
                event.sequence_number = seq;
                seq += 1;
            }
            let frame = encode_record(&batch)?;
            metas.push(RecordMeta {
                first_seq,
                last_seq: seq - 1,
                offset,
                len: frame.len() as u64,
                last_timestamp: batch.iter().map(|e| e.timestamp).max().unwrap_or_else(Utc::now),
            });
            offset += frame.len() as u64;
            frames.push(frame);
            stamped.push(batch);
        }

        if let Err(e) = self.write_frames(&frames) {
            match self.file.set_len(start_len) {
                Ok(()) => self.shared.poison(format!("append failed: {}", e)),
                Err(truncate_err) => self.shared.poison(format!(
                    "append failed: {}; rollback to {} bytes failed: {}",
                    e, start_len, truncate_err
                )),
            }
            return Err(e.into());
        }

        self.shared.index.write().extend(metas);
        self.len = offset;
        self.next_seq = seq;
        self.shared.head.store(seq - 1, Ordering::Release);

        Ok(stamped)
    }

    fn write_frames(&mut self, frames: &[Vec<u8>]) -> io::Result<()> {
        for frame in frames {
            self.file.write_all(frame)?;
        }
        if self.config.fsync {
            self.file.sync_data()?;
        }
        Ok(())
    }

    pub fn write_snapshot(&mut self, sequence: u64, state: serde_json::Value) -> Result<Snapshot> {
        self.shared.check_writable()?;
        let head = self.shared.head();
        if sequence > head {
            return Err(StoreError::InvalidSnapshot(format!(
                "sequence {} is beyond the log head {}",
                sequence, head
            )));
        }
        if let Some(current) = self.shared.snapshot.read().as_ref() {
            if sequence < current.sequence {
                return Err(StoreError::InvalidSnapshot(format!(
                    "sequence {} is older than the current snapshot at {}",
                    sequence, current.sequence
                )));
            }
        }

        let snap = Snapshot {
            sequence,
            taken_at: Utc::now(),
            state,
        };
        snapshot::write_snapshot(&self.config.snapshot_path(), &snap, self.config.fsync)?;
        *self.shared.snapshot.write() = Some(snap.clone());

        debug!(sequence = sequence, "Snapshot written");
        Ok(snap)
    }

    /// Drop the prefix of records below `min(before, snapshot + 1)` whose
    /// events are all older than the retention window.
    pub fn compact(&mut self, before: u64) -> Result<CompactionReport> {
        self.shared.check_writable()?;
        let snapshot_seq = self
            .shared
            .snapshot
            .read()
            .as_ref()
            .map(|s| s.sequence)
            .unwrap_or(0);
        let cutoff = before.min(snapshot_seq + 1);
        let retention = chrono::Duration::from_std(self.config.retention())
            .unwrap_or_else(|_| chrono::Duration::days(365 * 100));
        let horizon = Utc::now()
            .checked_sub_signed(retention)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let (removable, drop_bytes, removed_events, last_removed) = {
            let index = self.shared.index.read();
            let removable = index
                .iter()
                .take_while(|r| r.last_seq < cutoff && r.last_timestamp < horizon)
                .count();
            if removable == 0 {
                return Ok(CompactionReport {
                    first_sequence: index.first().map(|r| r.first_seq),
                    ..Default::default()
                });
            }
            let last = &index[removable - 1];
            let removed_events = last.last_seq - index[0].first_seq + 1;
            (removable, last.offset + last.len, removed_events, last.last_seq)
        };

        if let Some(sink) = &self.archive {
            let mut reader = RecordReader::open(&self.shared.path, 0)?;
            let mut archived = Vec::with_capacity(removed_events as usize);
            while let Some(events) = reader.next_record()? {
                let done = events.last().map(|e| e.sequence_number >= last_removed).unwrap_or(true);
                archived.extend(events);
                if done {
                    break;
                }
            }
            sink.archive(&archived)?;
        }

        let tmp = self.shared.path.with_extension("wal.compact");
        {
            let mut src = File::open(&self.shared.path)?;
            src.seek(SeekFrom::Start(drop_bytes))?;
            let mut dst = File::create(&tmp)?;
            io::copy(&mut src, &mut dst)?;
            dst.sync_all()?;
        }
        // The append handle follows the file through the rename, so nothing
        // fallible is left once the new log is in place
        let file = match open_append(&tmp) {
            Ok(file) => file,
            Err(e) => {
                let _ = fs::remove_file(&tmp);
                return Err(e.into());
            }
        };

        // Readers open the log under the index lock, so hold it across the swap
        let mut index = self.shared.index.write();
        if let Err(e) = fs::rename(&tmp, &self.shared.path) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        self.file = file;
        self.len -= drop_bytes;
        index.drain(..removable);
        for record in index.iter_mut() {
            record.offset -= drop_bytes;
        }

        let report = CompactionReport {
            removed_records: removable,
            removed_events,
            first_sequence: index.first().map(|r| r.first_seq),
        };
        info!(
            removed_records = report.removed_records,
            removed_events = report.removed_events,
            cutoff = cutoff,
            "Compacted event log"
        );
        Ok(report)
    }

    pub fn sync(&mut self) -> Result<()> {
        if let Err(e) = self.file.sync_all() {
            self.shared.poison(format!("sync failed: {}", e));
            return Err(e.into());
        }
        Ok(())
    }
}

/// Validate every record and build the index. Returns the index and the
/// length of the valid prefix.
fn scan(file: &File, repair_torn_tail: bool) -> Result<(Vec<RecordMeta>, u64)> {
    let mut reader = BufReader::new(file);
    reader.seek(SeekFrom::Start(0))?;

    let mut index: Vec<RecordMeta> = Vec::new();
    let mut offset = 0u64;
    let mut line = Vec::new();

    loop {
        line.clear();
        let n = reader.read_until(b'\n', &mut line)?;
        if n == 0 {
            break;
        }

        if line.last() != Some(&b'\n') {
            if repair_torn_tail {
                warn!(
                    offset = offset,
                    bytes = n,
                    "Truncating partial record at end of log"
                );
                file.set_len(offset)?;
                file.sync_all()?;
                break;
            }
            return Err(StoreError::corrupted(offset, "truncated record at end of log"));
        }

        let events = decode_record(&line[..n - 1], offset)?;
        let first_seq = events[0].sequence_number;
        let last_seq = first_seq + events.len() as u64 - 1;

        if let Some(prev) = index.last() {
            if first_seq != prev.last_seq + 1 {
                return Err(StoreError::corrupted(
                    offset,
                    format!("sequence gap: expected {}, found {}", prev.last_seq + 1, first_seq),
                ));
            }
        } else if first_seq == 0 {
            return Err(StoreError::corrupted(offset, "sequence numbers start at 1"));
        }

        index.push(RecordMeta {
            first_seq,
            last_seq,
            offset,
            len: n as u64,
            last_timestamp: events.iter().map(|e| e.timestamp).max().unwrap_or_else(Utc::now),
        });
        offset += n as u64;
    }

    Ok((index, offset))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_detects_tampering() {
        let frame = encode_frame(br#"{"a":1}"#);
        let body = &frame[..frame.len() - 1];
        assert_eq!(decode_frame(body, 0).unwrap(), br#"{"a":1}"#);

        let mut tampered = body.to_vec();
        let last = tampered.len() - 2;
        tampered[last] = b'2';
        let err = decode_frame(&tampered, 42).unwrap_err();
        assert!(matches!(err, StoreError::Corrupted { offset: 42, .. }));
    }

    fn test_config(dir: &Path) -> StoreConfig {
        StoreConfig {
            data_dir: dir.to_path_buf(),
            fsync: false,
            ..Default::default()
        }
    }

    #[test]
    fn test_failed_append_poisons_log() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let mut log = EventLog::open(&config, None).unwrap();
        log.append_group(vec![vec![Event::new("svc", "a.b", serde_json::json!({}))]])
            .unwrap();

        // A read-only handle makes the next write fail
        log.file = File::open(config.log_path()).unwrap();
        let err = log
            .append_group(vec![vec![Event::new("svc", "a.c", serde_json::json!({}))]])
            .unwrap_err();
        assert!(matches!(err, StoreError::Io(_)));
        assert!(log.shared.is_poisoned());
        assert_eq!(log.shared.head(), 1);

        // Refused even once the file would accept writes again
        log.file = open_append(&config.log_path()).unwrap();
        let err = log
            .append_group(vec![vec![Event::new("svc", "a.d", serde_json::json!({}))]])
            .unwrap_err();
        assert!(matches!(err, StoreError::Poisoned(_)));
        assert!(matches!(log.compact(u64::MAX), Err(StoreError::Poisoned(_))));

        drop(log);
        let reopened = EventLog::open(&config, None).unwrap();
        assert_eq!(reopened.shared.head(), 1);
    }

    #[test]
    fn test_record_rejects_non_contiguous_batch() {
        let mut a = Event::new("svc", "a.b", serde_json::json!({}));
        let mut b = a.clone();
        a.sequence_number = 1;
        b.sequence_number = 3;
        let frame = encode_record(&[a, b]).unwrap();
        assert!(decode_record(&frame[..frame.len() - 1], 0).is_err());
    }
}
