//! Master Client
//!
//! [`Master`] implementation used by slaves. Each call encodes a request,
//! waits for the response within the read timeout and decodes the
//! envelope. Transport failures tell the role state machine to reevaluate.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use super::cursor::ReplicationCursor;
use super::master::{Master, StoreWriter};
use super::protocol::{self, Request, RequestType};
use super::transport::MasterTransport;
use super::types::{EntityKind, IdAllocation, IdType, LockMode, LockResult, ResourceTx, Response};
use crate::cluster::ClusterEvent;
use crate::error::{Error, Result};
use crate::store::StoreId;

/// Client side of the master protocol
pub struct MasterClient {
    transport: Arc<dyn MasterTransport>,
    store_id: Option<StoreId>,
    read_timeout: Duration,
    lock_read_timeout: Duration,
    events: Option<mpsc::UnboundedSender<ClusterEvent>>,
}

impl MasterClient {
    /// Create a client. `store_id` is the identity the master must serve;
    /// without one only store copies and master id lookups work.
    pub fn new(
        transport: Arc<dyn MasterTransport>,
        store_id: Option<StoreId>,
        read_timeout: Duration,
        lock_read_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            store_id,
            read_timeout,
            lock_read_timeout,
            events: None,
        }
    }

    /// Report transport failures on `events`
    pub fn with_events(mut self, events: mpsc::UnboundedSender<ClusterEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Master address
    pub fn address(&self) -> &str {
        self.transport.address()
    }

    async fn call(
        &self,
        kind: RequestType,
        cursor: &ReplicationCursor,
        payload: Bytes,
        copy_sink: Option<&mut dyn StoreWriter>,
    ) -> Result<(Vec<ResourceTx>, Bytes)> {
        let body = Request::new(kind, self.store_id, cursor, payload).encode()?;

        let exchange = self.transport.call(body, copy_sink);
        let outcome = if kind == RequestType::CopyStore {
            // a copy takes as long as the store is large
            Some(exchange.await)
        } else {
            let limit = if kind.is_lock() {
                self.lock_read_timeout
            } else {
                self.read_timeout
            };
            tokio::time::timeout(limit, exchange).await.ok()
        };

        let reply = match outcome {
            Some(Ok(reply)) => reply,
            Some(Err(e)) if e.is_connectivity() => return Err(self.lost(kind, e)),
            Some(Err(e)) => return Err(e),
            None => {
                let e = Error::ConnectionTimeout(self.transport.address().to_string());
                return Err(self.lost(kind, e));
            }
        };

        protocol::decode_response(&reply)
    }

    fn lost(&self, kind: RequestType, error: Error) -> Error {
        tracing::warn!("{:?} to master {} failed: {}", kind, self.transport.address(), error);
        if let Some(events) = &self.events {
            let _ = events.send(ClusterEvent::Reevaluate(format!(
                "master {} unreachable: {}",
                self.transport.address(),
                error
            )));
        }
        error
    }
}

#[async_trait]
impl Master for MasterClient {
    async fn allocate_ids(&self, id_type: IdType) -> Result<Response<IdAllocation>> {
        let (transactions, payload) = self
            .call(
                RequestType::AllocateIds,
                &ReplicationCursor::empty(),
                protocol::encode_id_type(id_type),
                None,
            )
            .await?;
        Ok(Response {
            payload: protocol::decode_id_allocation(&payload)?,
            transactions,
        })
    }

    async fn create_relationship_type(&self, cursor: &ReplicationCursor, name: &str) -> Result<Response<i32>> {
        let (transactions, payload) = self
            .call(
                RequestType::CreateRelationshipType,
                cursor,
                protocol::encode_string(name),
                None,
            )
            .await?;
        Ok(Response {
            payload: protocol::decode_i32(&payload)?,
            transactions,
        })
    }

    async fn acquire_lock(
        &self,
        cursor: &ReplicationCursor,
        kind: EntityKind,
        mode: LockMode,
        ids: &[i64],
    ) -> Result<Response<LockResult>> {
        let request = match (kind, mode) {
            (EntityKind::Node, LockMode::Write) => RequestType::AcquireNodeWriteLock,
            (EntityKind::Node, LockMode::Read) => RequestType::AcquireNodeReadLock,
            (EntityKind::Relationship, LockMode::Write) => RequestType::AcquireRelationshipWriteLock,
            (EntityKind::Relationship, LockMode::Read) => RequestType::AcquireRelationshipReadLock,
        };
        let (transactions, payload) = self.call(request, cursor, protocol::encode_ids(ids), None).await?;
        Ok(Response {
            payload: protocol::decode_lock_result(&payload)?,
            transactions,
        })
    }

    async fn commit_single_resource_transaction(
        &self,
        cursor: &ReplicationCursor,
        resource: &str,
        data: Vec<u8>,
    ) -> Result<Response<i64>> {
        let body = protocol::encode_commit(resource, &data)?;
        let (transactions, payload) = self.call(RequestType::Commit, cursor, body, None).await?;
        Ok(Response {
            payload: protocol::decode_i64(&payload)?,
            transactions,
        })
    }

    async fn finish_transaction(&self, cursor: &ReplicationCursor) -> Result<Response<()>> {
        let (transactions, _) = self.call(RequestType::FinishTx, cursor, Bytes::new(), None).await?;
        Ok(Response {
            payload: (),
            transactions,
        })
    }

    async fn pull_updates(&self, cursor: &ReplicationCursor) -> Result<Response<()>> {
        let (transactions, _) = self.call(RequestType::PullUpdates, cursor, Bytes::new(), None).await?;
        Ok(Response {
            payload: (),
            transactions,
        })
    }

    async fn get_master_id_for_committed_tx(&self, tx_id: i64) -> Result<Response<i32>> {
        let (transactions, payload) = self
            .call(
                RequestType::GetMasterIdForTx,
                &ReplicationCursor::empty(),
                protocol::encode_i64(tx_id),
                None,
            )
            .await?;
        Ok(Response {
            payload: protocol::decode_i32(&payload)?,
            transactions,
        })
    }

    async fn copy_store(&self, cursor: &ReplicationCursor, writer: &mut dyn StoreWriter) -> Result<Response<()>> {
        let (transactions, _) = self
            .call(RequestType::CopyStore, cursor, Bytes::new(), Some(writer))
            .await?;
        Ok(Response {
            payload: (),
            transactions,
        })
    }

    async fn shutdown(&self) {
        self.transport.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::master_impl::MasterImpl;
    use crate::replication::server::{MasterServer, ServerMode};
    use crate::replication::transport::{InProcessNetwork, MasterNetwork, TcpNetwork};
    use crate::replication::types::LockStatus;
    use crate::store::local::StoreOptions;
    use crate::store::{LocalStore, DEFAULT_RESOURCE};

    async fn serving(dir: &std::path::Path, network: &InProcessNetwork) -> (StoreId, Arc<MasterServer>) {
        let store_id = StoreId::new();
        let store = LocalStore::create(dir, store_id, StoreOptions::default()).await.unwrap();
        let master = MasterImpl::new(Arc::new(store), 0, Duration::from_millis(100));
        let server = Arc::new(MasterServer::new(ServerMode::Master, Arc::new(master), 4));
        network.serve("master:1", Arc::clone(&server)).await.unwrap();
        (store_id, server)
    }

    fn client(network: &InProcessNetwork, store_id: Option<StoreId>) -> MasterClient {
        MasterClient::new(
            network.connect("master:1"),
            store_id,
            Duration::from_secs(5),
            Duration::from_secs(5),
        )
    }

    fn cursor(tx: i64) -> ReplicationCursor {
        ReplicationCursor::new(7, 1, 1, vec![(DEFAULT_RESOURCE.to_string(), tx)])
    }

    #[tokio::test]
    async fn test_commit_and_pull_through_client() {
        let dir = tempfile::tempdir().unwrap();
        let network = InProcessNetwork::new();
        let (store_id, _server) = serving(dir.path(), &network).await;
        let client = client(&network, Some(store_id));

        let committed = client
            .commit_single_resource_transaction(&cursor(0), DEFAULT_RESOURCE, b"tx".to_vec())
            .await
            .unwrap();
        assert_eq!(committed.payload, 1);
        assert_eq!(committed.transactions.len(), 1);

        let pulled = client.pull_updates(&cursor(0)).await.unwrap();
        assert_eq!(pulled.transactions[0].tx.data, b"tx");

        let allocation = client.allocate_ids(IdType::Relationship).await.unwrap().payload;
        assert_eq!(allocation.len(), 1000);

        let lock = client.acquire_node_write_lock(&cursor(1), &[4]).await.unwrap().payload;
        assert_eq!(lock.status, LockStatus::Ok);
        client.finish_transaction(&cursor(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_wrong_store_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let network = InProcessNetwork::new();
        let (_store_id, _server) = serving(dir.path(), &network).await;
        let client = client(&network, Some(StoreId::new()));

        let err = client.pull_updates(&cursor(0)).await.unwrap_err();
        assert!(matches!(err, Error::StoreMismatch { .. }));
    }

    #[tokio::test]
    async fn test_unreachable_master_asks_for_reevaluation() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let network = TcpNetwork::new(Duration::from_millis(200));
        let client = MasterClient::new(
            network.connect("127.0.0.1:1"),
            Some(StoreId::new()),
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
        .with_events(tx);

        let err = client.pull_updates(&cursor(0)).await.unwrap_err();
        assert!(err.is_connectivity());
        assert!(matches!(rx.try_recv(), Ok(ClusterEvent::Reevaluate(_))));
    }
}
