//! Master Server
//!
//! Decodes master protocol requests, checks the store identity and hands
//! them to the [`MasterImpl`]. The same server, in backup mode, lets any
//! node serve store copies and update pulls from its local store.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncWrite;
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex, OwnedSemaphorePermit, Semaphore};

use super::master::{Master, StoreWriter};
use super::master_impl::MasterImpl;
use super::protocol::{self, CopyFrame, Request, RequestType};
use super::types::{EntityKind, LockMode};
use crate::error::{Error, Result};
use crate::network::{is_eof, read_frame, write_frame, NetworkServer, ServerHandle};

/// What a server answers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerMode {
    /// Every request type
    Master,
    /// Store copies and update pulls only
    Backup,
}

impl ServerMode {
    fn serves(self, kind: RequestType) -> bool {
        match self {
            ServerMode::Master => true,
            ServerMode::Backup => matches!(kind, RequestType::CopyStore | RequestType::PullUpdates),
        }
    }

    fn name(self) -> &'static str {
        match self {
            ServerMode::Master => "Master server",
            ServerMode::Backup => "Backup server",
        }
    }
}

/// Request dispatcher shared by every connection
pub struct MasterServer {
    mode: ServerMode,
    master: Arc<MasterImpl>,
    /// Concurrent requests allowed per requesting machine
    max_channels: usize,
    channels: Mutex<HashMap<i32, Arc<Semaphore>>>,
}

impl MasterServer {
    /// Create a server
    pub fn new(mode: ServerMode, master: Arc<MasterImpl>, max_channels: usize) -> Self {
        Self {
            mode,
            master,
            max_channels: max_channels.max(1),
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Serving mode
    pub fn mode(&self) -> ServerMode {
        self.mode
    }

    /// Master implementation behind this server
    pub fn master(&self) -> &Arc<MasterImpl> {
        &self.master
    }

    /// Answer one request body. Store copies stream their files into
    /// `copy_sink` before the returned response.
    pub async fn handle(&self, body: &[u8], copy_sink: &mut dyn StoreWriter) -> Bytes {
        match self.dispatch(body, copy_sink).await {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!("{} refused request: {}", self.mode.name(), e);
                protocol::encode_error(&e)
            }
        }
    }

    async fn dispatch(&self, body: &[u8], copy_sink: &mut dyn StoreWriter) -> Result<Bytes> {
        let request = Request::decode(body)?;
        let kind = request.kind;

        if !self.mode.serves(kind) {
            return Err(protocol::not_served(kind));
        }

        if let Some(expected) = request.store_id {
            let actual = self.master.store().store_id();
            if expected != actual {
                return Err(Error::StoreMismatch {
                    expected: expected.to_string(),
                    actual: actual.to_string(),
                });
            }
        }

        let cursor = request.cursor.unwrap_or_else(super::cursor::ReplicationCursor::empty);
        let _permit = self.channel(cursor.machine_id).await?;
        let payload = &request.payload[..];
        let master = &self.master;

        match kind {
            RequestType::AllocateIds => {
                let id_type = protocol::decode_id_type(payload)?;
                let response = master.allocate_ids(id_type).await?;
                protocol::encode_response(&response.transactions, &protocol::encode_id_allocation(&response.payload))
            }
            RequestType::CreateRelationshipType => {
                let name = protocol::decode_string(payload)?;
                let response = master.create_relationship_type(&cursor, &name).await?;
                protocol::encode_response(&response.transactions, &protocol::encode_i32(response.payload))
            }
            RequestType::AcquireNodeWriteLock
            | RequestType::AcquireNodeReadLock
            | RequestType::AcquireRelationshipWriteLock
            | RequestType::AcquireRelationshipReadLock => {
                let (entity, mode) = lock_target(kind);
                let ids = protocol::decode_ids(payload)?;
                let response = master.acquire_lock(&cursor, entity, mode, &ids).await?;
                protocol::encode_response(&response.transactions, &protocol::encode_lock_result(&response.payload))
            }
            RequestType::Commit => {
                let (resource, data) = protocol::decode_commit(payload)?;
                let response = master
                    .commit_single_resource_transaction(&cursor, &resource, data)
                    .await?;
                protocol::encode_response(&response.transactions, &protocol::encode_i64(response.payload))
            }
            RequestType::PullUpdates => {
                let response = master.pull_updates(&cursor).await?;
                protocol::encode_response(&response.transactions, &[])
            }
            RequestType::FinishTx => {
                let response = master.finish_transaction(&cursor).await?;
                protocol::encode_response(&response.transactions, &[])
            }
            RequestType::GetMasterIdForTx => {
                let tx_id = protocol::decode_i64(payload)?;
                let response = master.get_master_id_for_committed_tx(tx_id).await?;
                protocol::encode_response(&response.transactions, &protocol::encode_i32(response.payload))
            }
            RequestType::CopyStore => {
                let mut sink = SentinelWriter {
                    inner: copy_sink,
                    finished: false,
                };
                let result = master.copy_store(&cursor, &mut sink).await;
                if !sink.finished {
                    if let Err(e) = sink.inner.done().await {
                        tracing::warn!("Failed to end aborted store copy: {}", e);
                    }
                }
                let response = result?;
                protocol::encode_response(&response.transactions, &[])
            }
        }
    }

    async fn channel(&self, machine_id: i32) -> Result<Option<OwnedSemaphorePermit>> {
        if machine_id < 0 {
            return Ok(None);
        }
        let semaphore = {
            let mut channels = self.channels.lock().await;
            Arc::clone(
                channels
                    .entry(machine_id)
                    .or_insert_with(|| Arc::new(Semaphore::new(self.max_channels))),
            )
        };
        let permit = semaphore
            .acquire_owned()
            .await
            .map_err(|_| Error::ShuttingDown)?;
        Ok(Some(permit))
    }

    /// Listen on `bind_address`
    pub async fn start(self: Arc<Self>, bind_address: &str) -> Result<ServerHandle> {
        let listener = NetworkServer::bind(self.mode.name(), bind_address).await?;
        Ok(listener.start(move |socket, peer, shutdown| {
            let server = Arc::clone(&self);
            async move { server.serve_connection(socket, peer, shutdown).await }
        }))
    }

    async fn serve_connection(
        &self,
        mut socket: TcpStream,
        peer: String,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        tracing::debug!("{} accepted {}", self.mode.name(), peer);
        loop {
            let body = tokio::select! {
                frame = read_frame(&mut socket) => match frame {
                    Ok(body) => body,
                    Err(e) if is_eof(&e) => break,
                    Err(e) => return Err(e),
                },
                _ = shutdown.changed() => break,
            };

            let response = {
                let mut sink = FrameWriter { socket: &mut socket };
                self.handle(&body, &mut sink).await
            };
            write_frame(&mut socket, &response).await?;
        }
        tracing::debug!("{} closed connection from {}", self.mode.name(), peer);
        Ok(())
    }
}

fn lock_target(kind: RequestType) -> (EntityKind, LockMode) {
    match kind {
        RequestType::AcquireNodeWriteLock => (EntityKind::Node, LockMode::Write),
        RequestType::AcquireNodeReadLock => (EntityKind::Node, LockMode::Read),
        RequestType::AcquireRelationshipWriteLock => (EntityKind::Relationship, LockMode::Write),
        _ => (EntityKind::Relationship, LockMode::Read),
    }
}

/// Makes sure a copy stream always ends with its sentinel
struct SentinelWriter<'a> {
    inner: &'a mut dyn StoreWriter,
    finished: bool,
}

#[async_trait]
impl StoreWriter for SentinelWriter<'_> {
    async fn write(&mut self, path: &str, data: &[u8]) -> Result<()> {
        self.inner.write(path, data).await
    }

    async fn done(&mut self) -> Result<()> {
        self.finished = true;
        self.inner.done().await
    }
}

/// Streams copied files as frames on the connection
struct FrameWriter<'a, S> {
    socket: &'a mut S,
}

#[async_trait]
impl<S: AsyncWrite + Unpin + Send> StoreWriter for FrameWriter<'_, S> {
    async fn write(&mut self, path: &str, data: &[u8]) -> Result<()> {
        let frame = CopyFrame::File {
            path: path.to_string(),
            data: data.to_vec(),
        };
        write_frame(&mut *self.socket, &frame.encode()).await
    }

    async fn done(&mut self) -> Result<()> {
        write_frame(&mut *self.socket, &CopyFrame::End.encode()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::cursor::ReplicationCursor;
    use crate::replication::master::DirStoreWriter;
    use crate::replication::types::IdType;
    use crate::store::local::StoreOptions;
    use crate::store::{LocalStore, StoreId, DEFAULT_RESOURCE};
    use std::time::Duration;

    async fn server(dir: &std::path::Path, mode: ServerMode) -> MasterServer {
        let store = LocalStore::create(dir, StoreId::new(), StoreOptions::default())
            .await
            .unwrap();
        let master = MasterImpl::new(Arc::new(store), 1, Duration::from_millis(100));
        MasterServer::new(mode, Arc::new(master), 4)
    }

    fn cursor() -> ReplicationCursor {
        ReplicationCursor::new(5, 2, 0, vec![(DEFAULT_RESOURCE.to_string(), 0)])
    }

    #[tokio::test]
    async fn test_store_mismatch_refused() {
        let dir = tempfile::tempdir().unwrap();
        let server = server(dir.path(), ServerMode::Master).await;
        let other = StoreId::new();
        let body = Request::new(RequestType::PullUpdates, Some(other), &cursor(), Bytes::new())
            .encode()
            .unwrap();

        let mut sink = DirStoreWriter::new(dir.path().join("unused"));
        let response = server.handle(&body, &mut sink).await;
        assert!(matches!(
            protocol::decode_response(&response),
            Err(Error::StoreMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_master_id_lookup_skips_store_check() {
        let dir = tempfile::tempdir().unwrap();
        let server = server(dir.path(), ServerMode::Master).await;
        server.master().store().commit(DEFAULT_RESOURCE, 1, b"x".to_vec()).await.unwrap();

        let body = Request::new(RequestType::GetMasterIdForTx, None, &cursor(), protocol::encode_i64(1))
            .encode()
            .unwrap();
        let mut sink = DirStoreWriter::new(dir.path().join("unused"));
        let (_, payload) = protocol::decode_response(&server.handle(&body, &mut sink).await).unwrap();
        assert_eq!(protocol::decode_i32(&payload).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_backup_mode_serves_copy_only() {
        let dir = tempfile::tempdir().unwrap();
        let server = server(dir.path(), ServerMode::Backup).await;
        let store_id = server.master().store().store_id();

        let body = Request::new(
            RequestType::AllocateIds,
            Some(store_id),
            &cursor(),
            protocol::encode_id_type(IdType::Node),
        )
        .encode()
        .unwrap();
        let target = tempfile::tempdir().unwrap();
        let mut sink = DirStoreWriter::new(target.path());
        assert!(matches!(
            protocol::decode_response(&server.handle(&body, &mut sink).await),
            Err(Error::Remote { .. })
        ));

        let body = Request::new(RequestType::CopyStore, None, &ReplicationCursor::empty(), Bytes::new())
            .encode()
            .unwrap();
        let response = server.handle(&body, &mut sink).await;
        assert!(protocol::decode_response(&response).is_ok());
        assert!(sink.files() >= 1);
    }

    #[tokio::test]
    async fn test_failed_copy_still_sends_sentinel() {
        struct Failing {
            ended: bool,
        }

        #[async_trait]
        impl StoreWriter for Failing {
            async fn write(&mut self, _path: &str, _data: &[u8]) -> Result<()> {
                Err(Error::Internal("disk full".into()))
            }

            async fn done(&mut self) -> Result<()> {
                self.ended = true;
                Ok(())
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let server = server(dir.path(), ServerMode::Master).await;
        let body = Request::new(RequestType::CopyStore, None, &ReplicationCursor::empty(), Bytes::new())
            .encode()
            .unwrap();

        let mut sink = Failing { ended: false };
        let response = server.handle(&body, &mut sink).await;
        assert!(protocol::decode_response(&response).is_err());
        assert!(sink.ended);
    }
}
