//! Snapshot persistence
//!
//! A snapshot is `(sequence, state)`: the caller's materialized state after
//! applying every event up to and including `sequence`. Stored with the same
//! checksummed framing as log records and replaced atomically by rename.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::wal::{decode_frame, encode_frame};
use crate::{Result, StoreError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub sequence: u64,
    pub taken_at: DateTime<Utc>,
    pub state: serde_json::Value,
}

pub(crate) fn write_snapshot(path: &Path, snapshot: &Snapshot, fsync: bool) -> Result<()> {
    let json = serde_json::to_vec(snapshot)?;
    let frame = encode_frame(&json);

    let tmp = path.with_extension("json.tmp");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(&frame)?;
        if fsync {
            file.sync_all()?;
        }
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

pub(crate) fn read_snapshot(path: &Path) -> Result<Option<Snapshot>> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let body = raw.strip_suffix(b"\n").ok_or_else(|| {
        StoreError::InvalidSnapshot(format!("{} is truncated", path.display()))
    })?;
    let json = decode_frame(body, 0)
        .map_err(|e| StoreError::InvalidSnapshot(format!("{}: {}", path.display(), e)))?;
    let snapshot = serde_json::from_slice(json)
        .map_err(|e| StoreError::InvalidSnapshot(format!("{}: {}", path.display(), e)))?;
    Ok(Some(snapshot))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_snapshot_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_snapshot(&dir.path().join("absent.json")).unwrap().is_none());
    }

    #[test]
    fn test_snapshot_round_trip_and_tamper() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hub.snapshot.json");
        let snap = Snapshot {
            sequence: 12,
            taken_at: Utc::now(),
            state: serde_json::json!({"messages": []}),
        };
        write_snapshot(&path, &snap, true).unwrap();
        assert_eq!(read_snapshot(&path).unwrap().unwrap().sequence, 12);

        let mut raw = fs::read(&path).unwrap();
        let pos = raw.len() - 4;
        raw[pos] ^= 0x01;
        fs::write(&path, raw).unwrap();
        assert!(matches!(read_snapshot(&path), Err(StoreError::InvalidSnapshot(_))));
    }
}
