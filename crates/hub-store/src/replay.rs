//! Lazy, restartable reads over the log

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use hub_common::Event;

use crate::wal::{decode_record, LogShared};
use crate::{Result, StoreError};

/// Where a replay starts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayFrom {
    /// First event still present in the log
    Beginning,
    /// First event with this sequence number or higher
    Sequence(u64),
    /// First event stamped at or after this instant, and everything after it
    Timestamp(DateTime<Utc>),
}

/// Sequential record reader over one file handle
pub(crate) struct RecordReader {
    reader: BufReader<File>,
    offset: u64,
    line: Vec<u8>,
}

impl RecordReader {
    pub fn open(path: &Path, offset: u64) -> Result<Self> {
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(offset))?;
        Ok(Self {
            reader: BufReader::new(file),
            offset,
            line: Vec::new(),
        })
    }

    /// Next complete record, or `None` at end of file
    pub fn next_record(&mut self) -> Result<Option<Vec<Event>>> {
        self.line.clear();
        let n = self.reader.read_until(b'\n', &mut self.line)?;
        if n == 0 {
            return Ok(None);
        }
        if self.line.last() != Some(&b'\n') {
            return Err(StoreError::corrupted(self.offset, "truncated record"));
        }
        let events = decode_record(&self.line[..n - 1], self.offset)?;
        self.offset += n as u64;
        Ok(Some(events))
    }
}

/// Iterator over events in sequence order, bounded by the log head at the
/// time it was created.
///
/// Yields `Err(Corrupted)` once and then stops when a damaged record is
/// found. Restart with `ReplayFrom::Sequence(position() + 1)`.
pub struct Replay {
    reader: Option<RecordReader>,
    pending: VecDeque<Event>,
    start_seq: u64,
    since: Option<DateTime<Utc>>,
    until: u64,
    scanned: u64,
    position: u64,
    done: bool,
}

impl Replay {
    pub(crate) fn open(shared: &Arc<LogShared>, from: ReplayFrom, until: u64) -> Result<Self> {
        let head = shared.head();
        let until = until.min(head);

        // Opening under the index lock keeps offsets and file in agreement
        let index = shared.index.read();
        let first_available = index.first().map(|r| r.first_seq).unwrap_or(head + 1);

        let (start_seq, since) = match from {
            ReplayFrom::Beginning => (first_available, None),
            ReplayFrom::Sequence(seq) => {
                let seq = seq.max(1);
                if seq < first_available && first_available > 1 {
                    return Err(StoreError::Compacted {
                        requested: seq,
                        first_available,
                    });
                }
                (seq, None)
            }
            ReplayFrom::Timestamp(ts) => (first_available, Some(ts)),
        };

        let mut replay = Self {
            reader: None,
            pending: VecDeque::new(),
            start_seq,
            since,
            until,
            scanned: start_seq.saturating_sub(1),
            position: start_seq.saturating_sub(1),
            done: start_seq > until,
        };
        if replay.done {
            return Ok(replay);
        }

        let record = index.partition_point(|r| r.last_seq < start_seq);
        let offset = match index.get(record) {
            Some(meta) => meta.offset,
            None => {
                replay.done = true;
                return Ok(replay);
            }
        };
        replay.reader = Some(RecordReader::open(&shared.path, offset)?);
        Ok(replay)
    }

    /// Sequence number of the last event yielded
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Last sequence this replay will reach
    pub fn until(&self) -> u64 {
        self.until
    }
}

impl Iterator for Replay {
    type Item = Result<Event>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }

            if let Some(event) = self.pending.pop_front() {
                self.scanned = event.sequence_number;
                if event.sequence_number > self.until {
                    self.done = true;
                    return None;
                }
                if event.sequence_number < self.start_seq {
                    continue;
                }
                if let Some(since) = self.since {
                    if event.timestamp < since {
                        continue;
                    }
                    self.since = None;
                }
                self.position = event.sequence_number;
                return Some(Ok(event));
            }

            if self.scanned >= self.until {
                self.done = true;
                return None;
            }

            let reader = match self.reader.as_mut() {
                Some(r) => r,
                None => {
                    self.done = true;
                    return None;
                }
            };

            match reader.next_record() {
                Ok(Some(events)) => {
                    let expected = self.scanned + 1;
                    if events[0].sequence_number > expected && self.scanned >= self.start_seq {
                        self.done = true;
                        return Some(Err(StoreError::corrupted(
                            reader.offset,
                            format!("sequence gap: expected {}, found {}", expected, events[0].sequence_number),
                        )));
                    }
                    self.pending.extend(events);
                }
                Ok(None) => {
                    self.done = true;
                    if self.scanned < self.until {
                        return Some(Err(StoreError::corrupted(
                            reader.offset,
                            format!("log ends at {} before expected head {}", self.scanned, self.until),
                        )));
                    }
                    return None;
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}
