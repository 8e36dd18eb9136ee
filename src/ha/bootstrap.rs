//! Store Bootstrap
//!
//! Full copies of a master's store and incremental catch-up of an existing
//! one. The node uses these to join a cluster or replace branched data,
//! the backup tool uses them against any node's backup endpoint.

use std::path::Path;

use serde::Serialize;

use crate::error::{Error, Result};
use crate::replication::{apply_response, current_cursor, DirStoreWriter, Master, ReplicationCursor};
use crate::store::local::StoreOptions;
use crate::store::txlog::position_after_copy;
use crate::store::{LocalStore, RESOURCES};

/// Outcome of a bootstrap run
#[derive(Debug, Clone, Serialize)]
pub struct BootstrapReport {
    /// Files received, 0 for an incremental run
    pub files: usize,
    /// Bytes received, 0 for an incremental run
    pub bytes: u64,
    /// Last committed tx per resource afterwards
    pub last_txs: Vec<(String, i64)>,
}

/// Copy the master's store into `dir` and return it opened, with every
/// transaction committed during the copy applied.
pub async fn copy_from_master(
    master: &dyn Master,
    dir: &Path,
    machine_id: i32,
    options: StoreOptions,
) -> Result<LocalStore> {
    tokio::fs::create_dir_all(dir).await?;

    let mut writer = DirStoreWriter::new(dir);
    let response = master.copy_store(&ReplicationCursor::empty(), &mut writer).await?;
    tracing::info!(
        "Received {} store files ({} bytes) into {}",
        writer.files(),
        writer.bytes(),
        dir.display()
    );

    for resource in RESOURCES {
        let version = position_after_copy(dir, resource)?;
        tracing::debug!("Positioned {} log at version {}", resource, version);
    }

    let store = LocalStore::open(dir, options).await?;
    let mut cursor = current_cursor(&store, 0, machine_id, 0).await?;
    if let Err(e) = apply_response(&store, &mut cursor, response).await {
        if let Err(close) = store.close().await {
            tracing::warn!("Error closing partially copied store: {}", close);
        }
        return Err(e);
    }
    Ok(store)
}

/// Copy a complete store into an empty or missing `target`
pub async fn full(master: &dyn Master, target: &Path, options: StoreOptions) -> Result<BootstrapReport> {
    if target.exists() && std::fs::read_dir(target)?.next().is_some() {
        return Err(Error::Config(format!(
            "Full backup target {} is not empty",
            target.display()
        )));
    }

    let store = copy_from_master(master, target, -1, options).await?;
    let last_txs = store.last_committed_txs().await?;
    let (files, bytes) = dir_size(target)?;
    store.close().await?;

    Ok(BootstrapReport {
        files,
        bytes,
        last_txs,
    })
}

/// Bring an existing store up to date with the master
pub async fn incremental(master: &dyn Master, store: &LocalStore) -> Result<BootstrapReport> {
    let before = store.last_committed_txs().await?;
    let mut cursor = current_cursor(store, 0, -1, 0).await?;
    let response = master.pull_updates(&cursor).await?;
    let received = response.transactions.len();
    apply_response(store, &mut cursor, response).await?;

    let last_txs = store.last_committed_txs().await?;
    tracing::info!(
        "Applied {} transactions to {} (was {:?})",
        received,
        store.dir().display(),
        before
    );
    Ok(BootstrapReport {
        files: 0,
        bytes: 0,
        last_txs,
    })
}

fn dir_size(dir: &Path) -> Result<(usize, u64)> {
    let mut files = 0;
    let mut bytes = 0;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let metadata = entry.metadata()?;
        if metadata.is_dir() {
            let (f, b) = dir_size(&entry.path())?;
            files += f;
            bytes += b;
        } else {
            files += 1;
            bytes += metadata.len();
        }
    }
    Ok((files, bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::replication::MasterImpl;
    use crate::store::{StoreId, DEFAULT_RESOURCE, INDEX_RESOURCE};

    fn options() -> StoreOptions {
        StoreOptions {
            compression: true,
            fsync: false,
        }
    }

    async fn master_with_txs(dir: &Path, count: usize) -> MasterImpl {
        let store = LocalStore::create(dir, StoreId::new(), options()).await.unwrap();
        for i in 0..count {
            store.commit(DEFAULT_RESOURCE, 1, vec![i as u8; 16]).await.unwrap();
        }
        store.commit(INDEX_RESOURCE, 1, b"index".to_vec()).await.unwrap();
        MasterImpl::new(Arc::new(store), 1, Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_full_copy_matches_master() {
        let master_dir = tempfile::tempdir().unwrap();
        let master = master_with_txs(master_dir.path(), 12).await;

        let target = tempfile::tempdir().unwrap();
        let copy = target.path().join("backup");
        let report = full(&master, &copy, options()).await.unwrap();

        assert!(report.files > 0);
        assert_eq!(report.last_txs, master.store().last_committed_txs().await.unwrap());

        let store = LocalStore::open(&copy, options()).await.unwrap();
        assert_eq!(store.store_id(), master.store().store_id());
        assert_eq!(store.last_committed_tx(DEFAULT_RESOURCE).await.unwrap(), 12);
    }

    #[tokio::test]
    async fn test_full_refuses_non_empty_target() {
        let master_dir = tempfile::tempdir().unwrap();
        let master = master_with_txs(master_dir.path(), 1).await;

        let target = tempfile::tempdir().unwrap();
        std::fs::write(target.path().join("stray"), b"x").unwrap();
        let result = full(&master, target.path(), options()).await;
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_incremental_catches_up() {
        let master_dir = tempfile::tempdir().unwrap();
        let master = master_with_txs(master_dir.path(), 3).await;

        let target = tempfile::tempdir().unwrap();
        let copy = target.path().join("backup");
        full(&master, &copy, options()).await.unwrap();

        for _ in 0..4 {
            master.store().commit(DEFAULT_RESOURCE, 1, b"later".to_vec()).await.unwrap();
        }

        let store = LocalStore::open(&copy, options()).await.unwrap();
        let report = incremental(&master, &store).await.unwrap();
        assert_eq!(report.files, 0);
        assert!(report
            .last_txs
            .contains(&(DEFAULT_RESOURCE.to_string(), 7)));
        assert_eq!(store.master_for_committed_tx(DEFAULT_RESOURCE, 7).await.unwrap(), 1);
    }
}
