//! Per-resource Transaction Log
//!
//! Dense, append-only sequence of committed transactions for one resource,
//! spread over versioned segment files. Every transaction carries the id of
//! the master that committed it, which is what branch detection compares.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::segment::{list_versions, segment_path, Segment};
use super::{TxRecord, BASE_TX_ID, NO_MASTER};
use crate::error::{Error, Result};

/// Where a transaction lives
#[derive(Debug, Clone, Copy)]
struct TxLocation {
    version: u64,
    pos: u64,
    master_id: i32,
}

/// Transaction log of a single resource
pub struct TxLog {
    /// Store directory
    dir: PathBuf,
    /// Resource name
    resource: String,
    /// Compress new entries
    compression: bool,
    /// Fsync appends
    fsync: bool,
    /// Open segments by version; the highest one is active
    segments: BTreeMap<u64, Segment>,
    /// Transaction index
    index: BTreeMap<i64, TxLocation>,
    /// Last committed transaction id
    last_tx: i64,
}

impl TxLog {
    /// Open (or create) the log of `resource` in `dir`
    pub fn open(dir: &Path, resource: &str, compression: bool, fsync: bool) -> Result<Self> {
        let mut log = Self {
            dir: dir.to_path_buf(),
            resource: resource.to_string(),
            compression,
            fsync,
            segments: BTreeMap::new(),
            index: BTreeMap::new(),
            last_tx: BASE_TX_ID,
        };

        let mut first = true;
        for version in list_versions(dir, resource)? {
            let path = segment_path(dir, resource, version);
            let mut segment = Segment::open(path, compression, fsync)?;
            if first {
                log.last_tx = segment.prev_last_tx();
                first = false;
            }

            for entry in segment.scan()? {
                if entry.tx_id != log.last_tx + 1 {
                    return Err(Error::StoreCorrupted {
                        resource: resource.to_string(),
                        reason: format!(
                            "log version {} holds tx {} after tx {}",
                            version, entry.tx_id, log.last_tx
                        ),
                    });
                }
                log.index.insert(
                    entry.tx_id,
                    TxLocation {
                        version,
                        pos: entry.pos,
                        master_id: entry.master_id,
                    },
                );
                log.last_tx = entry.tx_id;
            }
            log.segments.insert(version, segment);
        }

        log.ensure_active()?;

        tracing::debug!(
            "Opened {} log in {} at tx {} (version {})",
            log.resource,
            log.dir.display(),
            log.last_tx,
            log.active_version()
        );

        Ok(log)
    }

    /// Make sure the highest segment is writable. After a store copy the
    /// highest copied version is sealed history, so this starts the next one.
    fn ensure_active(&mut self) -> Result<()> {
        let needs_new = match self.segments.values().next_back() {
            Some(segment) => segment.is_sealed(),
            None => true,
        };

        if needs_new {
            let version = self
                .segments
                .keys()
                .next_back()
                .map(|v| v + 1)
                .unwrap_or(0);
            let path = segment_path(&self.dir, &self.resource, version);
            let segment = Segment::create(path, version, self.last_tx, self.compression, self.fsync)?;
            self.segments.insert(version, segment);
        }

        Ok(())
    }

    fn active_mut(&mut self) -> Result<&mut Segment> {
        self.segments
            .values_mut()
            .next_back()
            .ok_or_else(|| Error::Store(format!("No active log for {}", self.resource)))
    }

    /// Resource name
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Last committed transaction id
    pub fn last_committed_tx(&self) -> i64 {
        self.last_tx
    }

    /// Version of the active segment
    pub fn active_version(&self) -> u64 {
        self.segments.keys().next_back().copied().unwrap_or(0)
    }

    /// Commit a new transaction, assigning the next id
    pub fn append_new(&mut self, master_id: i32, data: Vec<u8>) -> Result<i64> {
        let record = TxRecord::new(self.last_tx + 1, master_id, data);
        let tx_id = record.tx_id;
        self.append(&record)?;
        Ok(tx_id)
    }

    /// Append a transaction received from elsewhere. Ids must be dense.
    pub fn append(&mut self, record: &TxRecord) -> Result<()> {
        let expected = self.last_tx + 1;
        if record.tx_id != expected {
            return Err(Error::TxGap {
                resource: self.resource.clone(),
                expected,
                actual: record.tx_id,
            });
        }

        let segment = self.active_mut()?;
        let version = segment.version;
        let pos = segment.append(record)?;

        self.index.insert(
            record.tx_id,
            TxLocation {
                version,
                pos,
                master_id: record.master_id,
            },
        );
        self.last_tx = record.tx_id;
        Ok(())
    }

    /// Seal the active segment and start the next version
    pub fn rotate(&mut self) -> Result<i64> {
        let last_tx = self.last_tx;
        let segment = self.active_mut()?;
        let next = segment.version + 1;
        segment.seal()?;

        let path = segment_path(&self.dir, &self.resource, next);
        let segment = Segment::create(path, next, last_tx, self.compression, self.fsync)?;
        self.segments.insert(next, segment);

        tracing::debug!("Rotated {} log to version {} at tx {}", self.resource, next, last_tx);
        Ok(last_tx)
    }

    /// Master that committed `tx_id`
    pub fn master_for_tx(&self, tx_id: i64) -> Result<i32> {
        if tx_id == BASE_TX_ID {
            return Ok(NO_MASTER);
        }
        self.index
            .get(&tx_id)
            .map(|loc| loc.master_id)
            .ok_or_else(|| Error::TxNotFound {
                resource: self.resource.clone(),
                tx_id,
            })
    }

    /// Read a single transaction
    pub fn get(&mut self, tx_id: i64) -> Result<TxRecord> {
        let loc = *self.index.get(&tx_id).ok_or_else(|| Error::TxNotFound {
            resource: self.resource.clone(),
            tx_id,
        })?;
        self.read(loc)
    }

    /// Every transaction committed after `from`, in order
    pub fn txs_after(&mut self, from: i64) -> Result<Vec<TxRecord>> {
        if from >= self.last_tx {
            return Ok(Vec::new());
        }

        let first_known = self.index.keys().next().copied();
        if let Some(first) = first_known {
            if from + 1 < first {
                return Err(Error::TxNotFound {
                    resource: self.resource.clone(),
                    tx_id: from + 1,
                });
            }
        }

        let locations: Vec<TxLocation> = self.index.range(from + 1..).map(|(_, l)| *l).collect();
        locations.into_iter().map(|loc| self.read(loc)).collect()
    }

    fn read(&mut self, loc: TxLocation) -> Result<TxRecord> {
        let segment = self.segments.get_mut(&loc.version).ok_or_else(|| {
            Error::Store(format!("Missing log version {} for {}", loc.version, self.resource))
        })?;
        let (record, _) = segment.read_at(loc.pos)?;
        Ok(record)
    }

    /// Paths of sealed history segments
    pub fn history_files(&self) -> Vec<PathBuf> {
        self.segments
            .values()
            .filter(|s| s.is_sealed())
            .map(|s| s.path.clone())
            .collect()
    }

    /// Flush the active segment
    pub fn sync(&self) -> Result<()> {
        match self.segments.values().next_back() {
            Some(segment) => segment.sync(),
            None => Ok(()),
        }
    }
}

/// Prepare copied history so the next open appends to a fresh version
/// above the highest copied one. Returns the new active version.
pub fn position_after_copy(dir: &Path, resource: &str) -> Result<u64> {
    let log = TxLog::open(dir, resource, false, true)?;
    let version = log.active_version();
    log.sync()?;
    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_append_and_reopen() {
        let dir = tempdir().unwrap();
        {
            let mut log = TxLog::open(dir.path(), "graph", true, false).unwrap();
            assert_eq!(log.last_committed_tx(), BASE_TX_ID);
            for i in 0..5 {
                let tx = log.append_new(1, vec![i]).unwrap();
                assert_eq!(tx, i as i64 + 1);
            }
        }

        let mut log = TxLog::open(dir.path(), "graph", true, false).unwrap();
        assert_eq!(log.last_committed_tx(), 5);
        assert_eq!(log.get(3).unwrap().data, vec![2]);
        assert_eq!(log.master_for_tx(5).unwrap(), 1);
    }

    #[test]
    fn test_gap_rejected() {
        let dir = tempdir().unwrap();
        let mut log = TxLog::open(dir.path(), "graph", false, false).unwrap();
        let err = log.append(&TxRecord::new(2, 1, vec![])).unwrap_err();
        assert!(matches!(err, Error::TxGap { expected: 1, actual: 2, .. }));
    }

    #[test]
    fn test_rotation_keeps_history_readable() {
        let dir = tempdir().unwrap();
        let mut log = TxLog::open(dir.path(), "graph", false, false).unwrap();
        log.append_new(1, b"a".to_vec()).unwrap();
        log.append_new(1, b"b".to_vec()).unwrap();
        assert_eq!(log.rotate().unwrap(), 2);
        log.append_new(2, b"c".to_vec()).unwrap();

        assert_eq!(log.active_version(), 1);
        assert_eq!(log.history_files().len(), 1);

        let txs = log.txs_after(1).unwrap();
        let ids: Vec<i64> = txs.iter().map(|t| t.tx_id).collect();
        assert_eq!(ids, vec![2, 3]);
        assert_eq!(log.master_for_tx(3).unwrap(), 2);
    }

    #[test]
    fn test_master_for_base_tx() {
        let dir = tempdir().unwrap();
        let log = TxLog::open(dir.path(), "graph", false, false).unwrap();
        assert_eq!(log.master_for_tx(BASE_TX_ID).unwrap(), NO_MASTER);
        assert!(matches!(
            log.master_for_tx(9),
            Err(Error::TxNotFound { tx_id: 9, .. })
        ));
    }

    #[test]
    fn test_position_after_copied_history() {
        let source = tempdir().unwrap();
        let target = tempdir().unwrap();

        let mut log = TxLog::open(source.path(), "graph", false, false).unwrap();
        for _ in 0..3 {
            log.append_new(4, vec![1]).unwrap();
        }
        log.rotate().unwrap();
        for path in log.history_files() {
            std::fs::copy(&path, target.path().join(path.file_name().unwrap())).unwrap();
        }

        assert_eq!(position_after_copy(target.path(), "graph").unwrap(), 1);

        let mut copied = TxLog::open(target.path(), "graph", false, false).unwrap();
        assert_eq!(copied.last_committed_tx(), 3);
        assert_eq!(copied.append_new(4, vec![2]).unwrap(), 4);
    }
}
