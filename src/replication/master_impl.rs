//! Master Implementation
//!
//! Serves the replication RPC from the master's own store. Every reply
//! carries the transactions the requester's cursor says it is missing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::cursor::ReplicationCursor;
use super::locks::LockManager;
use super::master::{Master, StoreWriter};
use super::types::{EntityKind, IdAllocation, IdType, LockMode, LockResult, ResourceTx, Response};
use crate::cluster::Broker;
use crate::error::{Error, Result};
use crate::store::{is_known_resource, LocalStore, DEFAULT_RESOURCE};

/// Wrap `payload` with every transaction `cursor` has not applied
pub async fn pack_response<T>(store: &LocalStore, cursor: &ReplicationCursor, payload: T) -> Result<Response<T>> {
    let mut transactions = Vec::new();
    for (resource, last_applied) in cursor.txs() {
        if !is_known_resource(resource) {
            tracing::debug!("Ignoring unknown resource {} in cursor", resource);
            continue;
        }
        for tx in store.txs_after(resource, *last_applied).await? {
            transactions.push(ResourceTx {
                resource: resource.clone(),
                tx,
            });
        }
    }
    Ok(Response {
        payload,
        transactions,
    })
}

/// Stream a consistent snapshot of `store` into `writer`. The reply
/// carries whatever was committed after the snapshot.
pub async fn copy_local_store(store: &LocalStore, writer: &mut dyn StoreWriter) -> Result<Response<()>> {
    let snapshot = store.snapshot_for_copy().await?;
    for (path, data) in &snapshot.files {
        writer.write(path, data).await?;
    }
    writer.done().await?;

    tracing::info!(
        "Copied {} files of {} at {:?}",
        snapshot.files.len(),
        store.dir().display(),
        snapshot.last_txs
    );

    let cursor = ReplicationCursor::new(0, -1, 0, snapshot.last_txs);
    pack_response(store, &cursor, ()).await
}

/// [`Master`] backed by the local store
pub struct MasterImpl {
    store: Arc<LocalStore>,
    machine_id: i32,
    locks: LockManager,
    /// Serializes id allocation and relationship type creation
    allocation: Mutex<()>,
    broker: Option<Arc<dyn Broker>>,
    shut_down: AtomicBool,
}

impl MasterImpl {
    /// Serve `store` as master `machine_id`
    pub fn new(store: Arc<LocalStore>, machine_id: i32, lock_timeout: Duration) -> Self {
        Self {
            store,
            machine_id,
            locks: LockManager::new(lock_timeout),
            allocation: Mutex::new(()),
            broker: None,
            shut_down: AtomicBool::new(false),
        }
    }

    /// Publish the last committed tx to `broker` after every commit
    pub fn with_broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Store being served
    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    /// Locks currently held by slave transactions
    pub fn locked_count(&self) -> usize {
        self.locks.locked_count()
    }

    /// Release locks of transactions that sent nothing for `max_idle`
    pub fn reap_idle_locks(&self, max_idle: Duration) -> usize {
        self.locks.reap_idle(max_idle)
    }

    fn check_running(&self) -> Result<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            Err(Error::ShuttingDown)
        } else {
            Ok(())
        }
    }

    async fn allocate(&self, id_type: IdType) -> Result<IdAllocation> {
        let _guard = self.allocation.lock().await;
        let meta = self.store.meta().await?;
        let code = id_type.code();
        let grab = id_type.grab_size();

        let defragmented_ids = meta.take_free_ids(code, grab).await?;
        let remaining = grab - defragmented_ids.len();
        let range_start = meta.high_id(code).await?;
        let high = meta.raise_high_id(code, range_start + remaining as i64).await?;

        let allocation = IdAllocation {
            defrag_count: defragmented_ids.len() as i64,
            defragmented_ids,
            range_start,
            range_length: remaining as u32,
            highest_id_in_use: high - 1,
        };
        tracing::debug!(
            "Allocated {} {:?} ids ({} reused), highest in use {}",
            allocation.len(),
            id_type,
            allocation.defrag_count,
            allocation.highest_id_in_use
        );
        Ok(allocation)
    }
}

#[async_trait]
impl Master for MasterImpl {
    async fn allocate_ids(&self, id_type: IdType) -> Result<Response<IdAllocation>> {
        self.check_running()?;
        Ok(Response::bare(self.allocate(id_type).await?))
    }

    async fn create_relationship_type(&self, cursor: &ReplicationCursor, name: &str) -> Result<Response<i32>> {
        self.check_running()?;
        self.locks.observe(&cursor.owner());
        let type_id = {
            let _guard = self.allocation.lock().await;
            let meta = self.store.meta().await?;
            match meta.relationship_type(name).await? {
                Some(id) => id,
                None => meta.create_relationship_type(name).await?,
            }
        };
        pack_response(&self.store, cursor, type_id).await
    }

    async fn acquire_lock(
        &self,
        cursor: &ReplicationCursor,
        kind: EntityKind,
        mode: LockMode,
        ids: &[i64],
    ) -> Result<Response<LockResult>> {
        self.check_running()?;
        self.locks.observe(&cursor.owner());
        let result = self.locks.acquire(cursor.owner(), kind, mode, ids).await;
        pack_response(&self.store, cursor, result).await
    }

    async fn commit_single_resource_transaction(
        &self,
        cursor: &ReplicationCursor,
        resource: &str,
        data: Vec<u8>,
    ) -> Result<Response<i64>> {
        self.check_running()?;
        self.locks.observe(&cursor.owner());
        let tx_id = self.store.commit(resource, self.machine_id, data).await?;
        tracing::debug!("Committed {} tx {} for machine {}", resource, tx_id, cursor.machine_id);

        if resource == DEFAULT_RESOURCE {
            if let Some(broker) = &self.broker {
                if let Err(e) = broker.set_last_committed_tx(tx_id, self.machine_id).await {
                    tracing::warn!("Failed to publish committed tx {}: {}", tx_id, e);
                }
            }
        }

        pack_response(&self.store, cursor, tx_id).await
    }

    async fn finish_transaction(&self, cursor: &ReplicationCursor) -> Result<Response<()>> {
        self.locks.observe(&cursor.owner());
        let released = self.locks.release_all(&cursor.owner());
        tracing::trace!("Finished tx {:?}, released {} locks", cursor.owner(), released);
        pack_response(&self.store, cursor, ()).await
    }

    async fn pull_updates(&self, cursor: &ReplicationCursor) -> Result<Response<()>> {
        self.check_running()?;
        self.locks.observe(&cursor.owner());
        pack_response(&self.store, cursor, ()).await
    }

    async fn get_master_id_for_committed_tx(&self, tx_id: i64) -> Result<Response<i32>> {
        let master_id = self.store.master_for_committed_tx(DEFAULT_RESOURCE, tx_id).await?;
        Ok(Response::bare(master_id))
    }

    async fn copy_store(&self, _cursor: &ReplicationCursor, writer: &mut dyn StoreWriter) -> Result<Response<()>> {
        self.check_running()?;
        copy_local_store(&self.store, writer).await
    }

    async fn shutdown(&self) {
        if !self.shut_down.swap(true, Ordering::SeqCst) {
            tracing::info!("Master {} stopped serving {}", self.machine_id, self.store.dir().display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::master::DirStoreWriter;
    use crate::replication::types::LockStatus;
    use crate::store::local::StoreOptions;
    use crate::store::{StoreId, INDEX_RESOURCE};

    async fn master(dir: &std::path::Path) -> MasterImpl {
        let store = LocalStore::create(dir, StoreId::new(), StoreOptions::default())
            .await
            .unwrap();
        MasterImpl::new(Arc::new(store), 1, Duration::from_millis(100))
    }

    fn cursor(graph: i64) -> ReplicationCursor {
        ReplicationCursor::new(10, 2, 1, vec![(DEFAULT_RESOURCE.to_string(), graph)])
    }

    #[tokio::test]
    async fn test_allocations_are_disjoint() {
        let dir = tempfile::tempdir().unwrap();
        let master = master(dir.path()).await;

        let first = master.allocate_ids(IdType::Node).await.unwrap().payload;
        let second = master.allocate_ids(IdType::Node).await.unwrap().payload;

        let a: Vec<i64> = first.ids().collect();
        let b: Vec<i64> = second.ids().collect();
        assert_eq!(a.len(), 1000);
        assert!(a.iter().all(|id| !b.contains(id)));
        assert!(second.highest_id_in_use >= first.highest_id_in_use);
        assert_eq!(second.range_start, 1000);
    }

    #[tokio::test]
    async fn test_allocation_reuses_freed_ids() {
        let dir = tempfile::tempdir().unwrap();
        let master = master(dir.path()).await;
        master.allocate_ids(IdType::PropertyIndex).await.unwrap();

        let meta = master.store().meta().await.unwrap();
        meta.free_ids(IdType::PropertyIndex.code(), &[3, 9]).await.unwrap();

        let next = master.allocate_ids(IdType::PropertyIndex).await.unwrap().payload;
        assert_eq!(next.defragmented_ids, vec![3, 9]);
        assert_eq!(next.defrag_count, 2);
        assert_eq!(next.range_start, 50);
        assert_eq!(next.range_length, 48);
        assert_eq!(next.highest_id_in_use, 97);
    }

    #[tokio::test]
    async fn test_commit_piggybacks_missing_transactions() {
        let dir = tempfile::tempdir().unwrap();
        let master = master(dir.path()).await;

        master.store().commit(DEFAULT_RESOURCE, 1, b"one".to_vec()).await.unwrap();
        let response = master
            .commit_single_resource_transaction(&cursor(0), DEFAULT_RESOURCE, b"two".to_vec())
            .await
            .unwrap();

        assert_eq!(response.payload, 2);
        let ids: Vec<i64> = response.transactions.iter().map(|t| t.tx.tx_id).collect();
        assert_eq!(ids, vec![1, 2]);

        let caught_up = master.pull_updates(&cursor(2)).await.unwrap();
        assert!(caught_up.transactions.is_empty());
    }

    #[tokio::test]
    async fn test_relationship_types_are_stable() {
        let dir = tempfile::tempdir().unwrap();
        let master = master(dir.path()).await;
        let knows = master.create_relationship_type(&cursor(0), "KNOWS").await.unwrap().payload;
        let likes = master.create_relationship_type(&cursor(0), "LIKES").await.unwrap().payload;
        let again = master.create_relationship_type(&cursor(0), "KNOWS").await.unwrap().payload;
        assert_eq!(knows, again);
        assert_ne!(knows, likes);
    }

    #[tokio::test]
    async fn test_finish_releases_locks() {
        let dir = tempfile::tempdir().unwrap();
        let master = master(dir.path()).await;
        let tx = cursor(0);

        let locked = master.acquire_node_write_lock(&tx, &[1, 2]).await.unwrap().payload;
        assert_eq!(locked.status, LockStatus::Ok);
        let other = tx.with_event(2);
        let blocked = master.acquire_node_read_lock(&other, &[1]).await.unwrap().payload;
        assert_eq!(blocked.status, LockStatus::NotLocked);

        master.finish_transaction(&tx).await.unwrap();
        assert_eq!(master.locked_count(), 0);
        let granted = master.acquire_node_read_lock(&other, &[1]).await.unwrap().payload;
        assert_eq!(granted.status, LockStatus::Ok);
    }

    #[tokio::test]
    async fn test_restarted_slave_frees_its_old_locks() {
        let dir = tempfile::tempdir().unwrap();
        let master = master(dir.path()).await;
        let crashed = cursor(0);
        master.acquire_node_write_lock(&crashed, &[7]).await.unwrap();
        assert_eq!(master.locked_count(), 1);

        let restarted = ReplicationCursor::new(11, 2, 0, vec![(DEFAULT_RESOURCE.to_string(), 0)]);
        master.pull_updates(&restarted).await.unwrap();
        assert_eq!(master.locked_count(), 0);
    }

    #[tokio::test]
    async fn test_copy_store_then_apply_matches_master() {
        let dir = tempfile::tempdir().unwrap();
        let master = master(dir.path()).await;
        for i in 0..5 {
            master.store().commit(DEFAULT_RESOURCE, 1, vec![i]).await.unwrap();
        }
        master.store().commit(INDEX_RESOURCE, 1, b"idx".to_vec()).await.unwrap();

        let target = tempfile::tempdir().unwrap();
        let mut writer = DirStoreWriter::new(target.path());
        let response = master.copy_store(&ReplicationCursor::empty(), &mut writer).await.unwrap();
        assert!(writer.files() >= 1);

        for resource in crate::store::RESOURCES {
            crate::store::txlog::position_after_copy(target.path(), resource).unwrap();
        }
        let copy = LocalStore::open(target.path(), StoreOptions::default()).await.unwrap();
        for entry in &response.transactions {
            copy.apply_transaction(&entry.resource, &entry.tx).await.unwrap();
        }

        assert_eq!(copy.store_id(), master.store().store_id());
        assert_eq!(copy.last_committed_tx(DEFAULT_RESOURCE).await.unwrap(), 5);
        assert_eq!(copy.last_committed_tx(INDEX_RESOURCE).await.unwrap(), 1);
        assert_eq!(copy.master_for_committed_tx(DEFAULT_RESOURCE, 5).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_refuses_requests() {
        let dir = tempfile::tempdir().unwrap();
        let master = master(dir.path()).await;
        master.shutdown().await;
        assert!(matches!(master.allocate_ids(IdType::Node).await, Err(Error::ShuttingDown)));
    }
}
