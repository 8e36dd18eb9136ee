//! Local Store Handle
//!
//! Owns the metadata database and the transaction logs of one store
//! directory. Every access goes through the store lock, so a snapshot for
//! a copy sees the logs and metadata at one consistent point.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;

use super::meta::MetaStore;
use super::txlog::TxLog;
use super::{store_exists, StoreId, TxRecord, RESOURCES};
use crate::config::StoreConfig;
use crate::error::{Error, Result};

/// Log file options
#[derive(Debug, Clone, Copy)]
pub struct StoreOptions {
    /// Compress transaction bodies
    pub compression: bool,
    /// Fsync every append
    pub fsync: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            compression: true,
            fsync: true,
        }
    }
}

impl From<&StoreConfig> for StoreOptions {
    fn from(config: &StoreConfig) -> Self {
        Self {
            compression: config.compression,
            fsync: config.fsync,
        }
    }
}

/// Consistent copy of a store's files
#[derive(Debug, Clone)]
pub struct StoreSnapshot {
    /// Files relative to the store directory, with their contents
    pub files: Vec<(String, Vec<u8>)>,
    /// Last committed tx per resource at the time of the snapshot
    pub last_txs: Vec<(String, i64)>,
}

struct StoreInner {
    meta: Arc<MetaStore>,
    logs: BTreeMap<String, TxLog>,
}

/// Handle to an open store
pub struct LocalStore {
    dir: PathBuf,
    store_id: StoreId,
    inner: Mutex<Option<StoreInner>>,
    healthy: AtomicBool,
}

impl LocalStore {
    /// Check whether `dir` holds a store
    pub fn exists(dir: &Path) -> bool {
        store_exists(dir)
    }

    /// Create a store with the given identity, or open the existing one
    /// if it carries the same identity
    pub async fn create(dir: &Path, store_id: StoreId, options: StoreOptions) -> Result<Self> {
        let meta = MetaStore::open(dir)?;
        meta.set_store_id(&store_id).await?;
        tracing::info!("Created store {} in {}", store_id, dir.display());
        Self::open_with(dir, store_id, meta, options)
    }

    /// Open an existing store
    pub async fn open(dir: &Path, options: StoreOptions) -> Result<Self> {
        if !store_exists(dir) {
            return Err(Error::Store(format!("No store in {}", dir.display())));
        }
        let meta = MetaStore::open(dir)?;
        let store_id = meta
            .store_id()
            .await?
            .ok_or_else(|| Error::Store(format!("Store in {} has no identity", dir.display())))?;
        Self::open_with(dir, store_id, meta, options)
    }

    fn open_with(dir: &Path, store_id: StoreId, meta: MetaStore, options: StoreOptions) -> Result<Self> {
        let mut logs = BTreeMap::new();
        for resource in RESOURCES {
            let log = TxLog::open(dir, resource, options.compression, options.fsync)?;
            logs.insert(resource.to_string(), log);
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            store_id,
            inner: Mutex::new(Some(StoreInner {
                meta: Arc::new(meta),
                logs,
            })),
            healthy: AtomicBool::new(true),
        })
    }

    /// Store directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Store identity
    pub fn store_id(&self) -> StoreId {
        self.store_id
    }

    /// False once an append has failed; the store must be restarted
    pub fn is_ok(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    /// Whether the store is still open
    pub async fn is_open(&self) -> bool {
        self.inner.lock().await.is_some()
    }

    /// Metadata database
    pub async fn meta(&self) -> Result<Arc<MetaStore>> {
        let guard = self.inner.lock().await;
        let inner = guard.as_ref().ok_or(Error::StoreClosed)?;
        Ok(Arc::clone(&inner.meta))
    }

    /// Last committed tx of a resource
    pub async fn last_committed_tx(&self, resource: &str) -> Result<i64> {
        let guard = self.inner.lock().await;
        let inner = guard.as_ref().ok_or(Error::StoreClosed)?;
        Ok(log_of(&inner.logs, resource)?.last_committed_tx())
    }

    /// Last committed tx of every resource
    pub async fn last_committed_txs(&self) -> Result<Vec<(String, i64)>> {
        let guard = self.inner.lock().await;
        let inner = guard.as_ref().ok_or(Error::StoreClosed)?;
        Ok(inner
            .logs
            .iter()
            .map(|(name, log)| (name.clone(), log.last_committed_tx()))
            .collect())
    }

    /// Master that committed `tx_id` in `resource`
    pub async fn master_for_committed_tx(&self, resource: &str, tx_id: i64) -> Result<i32> {
        let guard = self.inner.lock().await;
        let inner = guard.as_ref().ok_or(Error::StoreClosed)?;
        log_of(&inner.logs, resource)?.master_for_tx(tx_id)
    }

    /// Commit a new transaction as master, returning its id
    pub async fn commit(&self, resource: &str, master_id: i32, data: Vec<u8>) -> Result<i64> {
        self.check_ok()?;
        let mut guard = self.inner.lock().await;
        let inner = guard.as_mut().ok_or(Error::StoreClosed)?;
        let log = log_of_mut(&mut inner.logs, resource)?;

        match log.append_new(master_id, data) {
            Ok(tx_id) => Ok(tx_id),
            Err(e) => Err(self.mark_not_ok(resource, e)),
        }
    }

    /// Apply a transaction received from a master. Already applied
    /// transactions are skipped; returns whether it was appended.
    pub async fn apply_transaction(&self, resource: &str, record: &TxRecord) -> Result<bool> {
        self.check_ok()?;
        let mut guard = self.inner.lock().await;
        let inner = guard.as_mut().ok_or(Error::StoreClosed)?;
        let log = log_of_mut(&mut inner.logs, resource)?;

        if record.tx_id <= log.last_committed_tx() {
            tracing::trace!("Skipping already applied {} tx {}", resource, record.tx_id);
            return Ok(false);
        }

        match log.append(record) {
            Ok(()) => Ok(true),
            Err(e @ Error::TxGap { .. }) => Err(e),
            Err(e) => Err(self.mark_not_ok(resource, e)),
        }
    }

    /// Transactions of `resource` committed after `from`
    pub async fn txs_after(&self, resource: &str, from: i64) -> Result<Vec<TxRecord>> {
        let mut guard = self.inner.lock().await;
        let inner = guard.as_mut().ok_or(Error::StoreClosed)?;
        log_of_mut(&mut inner.logs, resource)?.txs_after(from)
    }

    /// Seal every active log and start the next version
    pub async fn rotate_logs(&self) -> Result<Vec<(String, i64)>> {
        let mut guard = self.inner.lock().await;
        let inner = guard.as_mut().ok_or(Error::StoreClosed)?;
        rotate_all(&mut inner.logs)
    }

    /// Rotate the logs and read every store file while holding the store
    /// lock. Nothing can commit between the rotation and the reads.
    pub async fn snapshot_for_copy(&self) -> Result<StoreSnapshot> {
        let mut guard = self.inner.lock().await;
        let inner = guard.as_mut().ok_or(Error::StoreClosed)?;

        let last_txs = rotate_all(&mut inner.logs)?;

        let mut files = Vec::new();
        let meta_name = file_name(inner.meta.path())?;
        files.push((meta_name, inner.meta.read_file().await?));

        for log in inner.logs.values() {
            for path in log.history_files() {
                let name = file_name(&path)?;
                let data = tokio::fs::read(&path).await?;
                files.push((name, data));
            }
        }

        tracing::debug!(
            "Snapshot of {} holds {} files at {:?}",
            self.dir.display(),
            files.len(),
            last_txs
        );

        Ok(StoreSnapshot { files, last_txs })
    }

    /// Flush and close. Later calls are no-ops.
    pub async fn close(&self) -> Result<()> {
        let inner = self.inner.lock().await.take();
        if let Some(inner) = inner {
            for log in inner.logs.values() {
                log.sync()?;
            }
            tracing::debug!("Closed store {}", self.dir.display());
        }
        Ok(())
    }

    fn check_ok(&self) -> Result<()> {
        if self.is_ok() {
            Ok(())
        } else {
            Err(Error::TxManagerNotOk(format!(
                "store {} refused writes after an earlier failure",
                self.dir.display()
            )))
        }
    }

    fn mark_not_ok(&self, resource: &str, cause: Error) -> Error {
        self.healthy.store(false, Ordering::SeqCst);
        tracing::error!("Append to {} failed, store marked not ok: {}", resource, cause);
        Error::TxManagerNotOk(format!("append to {} failed: {}", resource, cause))
    }
}

fn log_of<'a>(logs: &'a BTreeMap<String, TxLog>, resource: &str) -> Result<&'a TxLog> {
    logs.get(resource)
        .ok_or_else(|| unknown_resource(resource))
}

fn log_of_mut<'a>(logs: &'a mut BTreeMap<String, TxLog>, resource: &str) -> Result<&'a mut TxLog> {
    logs.get_mut(resource)
        .ok_or_else(|| unknown_resource(resource))
}

fn unknown_resource(resource: &str) -> Error {
    Error::Store(format!("Unknown resource '{}'", resource))
}

fn rotate_all(logs: &mut BTreeMap<String, TxLog>) -> Result<Vec<(String, i64)>> {
    let mut last_txs = Vec::with_capacity(logs.len());
    for (name, log) in logs.iter_mut() {
        last_txs.push((name.clone(), log.rotate()?));
    }
    Ok(last_txs)
}

fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| Error::Store(format!("Bad store file name {}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{DEFAULT_RESOURCE, INDEX_RESOURCE, META_FILE};
    use tempfile::tempdir;

    fn options() -> StoreOptions {
        StoreOptions {
            compression: true,
            fsync: false,
        }
    }

    #[tokio::test]
    async fn test_create_and_reopen() {
        let dir = tempdir().unwrap();
        let id = StoreId::new();
        {
            let store = LocalStore::create(dir.path(), id, options()).await.unwrap();
            store.commit(DEFAULT_RESOURCE, 1, b"a".to_vec()).await.unwrap();
            store.commit(DEFAULT_RESOURCE, 1, b"b".to_vec()).await.unwrap();
            store.close().await.unwrap();
        }

        assert!(LocalStore::exists(dir.path()));
        let store = LocalStore::open(dir.path(), options()).await.unwrap();
        assert_eq!(store.store_id(), id);
        assert_eq!(store.last_committed_tx(DEFAULT_RESOURCE).await.unwrap(), 2);
        assert_eq!(store.last_committed_tx(INDEX_RESOURCE).await.unwrap(), 0);
        assert_eq!(store.master_for_committed_tx(DEFAULT_RESOURCE, 2).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_apply_skips_and_rejects_gaps() {
        let dir = tempdir().unwrap();
        let store = LocalStore::create(dir.path(), StoreId::new(), options()).await.unwrap();

        assert!(store
            .apply_transaction(DEFAULT_RESOURCE, &TxRecord::new(1, 3, vec![]))
            .await
            .unwrap());
        assert!(!store
            .apply_transaction(DEFAULT_RESOURCE, &TxRecord::new(1, 3, vec![]))
            .await
            .unwrap());
        assert!(matches!(
            store
                .apply_transaction(DEFAULT_RESOURCE, &TxRecord::new(5, 3, vec![]))
                .await,
            Err(Error::TxGap { .. })
        ));
        assert!(store.is_ok());
    }

    #[tokio::test]
    async fn test_snapshot_contains_meta_and_history() {
        let dir = tempdir().unwrap();
        let store = LocalStore::create(dir.path(), StoreId::new(), options()).await.unwrap();
        store.commit(DEFAULT_RESOURCE, 1, vec![1]).await.unwrap();
        std::fs::write(dir.path().join(crate::store::MESSAGES_LOG), b"diag").unwrap();

        let snapshot = store.snapshot_for_copy().await.unwrap();
        let names: Vec<&str> = snapshot.files.iter().map(|(n, _)| n.as_str()).collect();
        assert!(names.contains(&META_FILE));
        assert!(names.contains(&"graph.log.0"));
        assert!(names.contains(&"index.log.0"));
        assert!(!names.contains(&crate::store::MESSAGES_LOG));
        assert!(snapshot
            .last_txs
            .contains(&(DEFAULT_RESOURCE.to_string(), 1)));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_commit_waits_for_snapshot() {
        let dir = tempdir().unwrap();
        let store = LocalStore::create(dir.path(), StoreId::new(), options()).await.unwrap();
        store.commit(DEFAULT_RESOURCE, 1, vec![1; 4096]).await.unwrap();

        let (snapshot, tx) = tokio::join!(
            store.snapshot_for_copy(),
            store.commit(DEFAULT_RESOURCE, 1, vec![2]),
        );
        let snapshot = snapshot.unwrap();
        assert!(snapshot
            .last_txs
            .contains(&(DEFAULT_RESOURCE.to_string(), 1)));
        assert_eq!(tx.unwrap(), 2);
        assert_eq!(store.txs_after(DEFAULT_RESOURCE, 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_closed_store_rejects_access() {
        let dir = tempdir().unwrap();
        let store = LocalStore::create(dir.path(), StoreId::new(), options()).await.unwrap();
        store.close().await.unwrap();
        store.close().await.unwrap();
        assert!(matches!(
            store.last_committed_tx(DEFAULT_RESOURCE).await,
            Err(Error::StoreClosed)
        ));
    }

    #[tokio::test]
    async fn test_unknown_resource() {
        let dir = tempdir().unwrap();
        let store = LocalStore::create(dir.path(), StoreId::new(), options()).await.unwrap();
        assert!(store.last_committed_tx("nope").await.is_err());
    }
}
