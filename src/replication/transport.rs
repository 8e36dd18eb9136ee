//! Master Transports
//!
//! How a client reaches a master server: pooled TCP connections in
//! production, or a direct call into a registered server when every node
//! runs in one process.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::TcpStream;

use super::master::StoreWriter;
use super::protocol::CopyFrame;
use super::server::MasterServer;
use crate::error::{Error, Result};
use crate::network::{read_frame, write_frame, ConnectionPool, ServerHandle};

/// Idle connections kept per master
const MAX_IDLE_CONNECTIONS: usize = 8;

/// One request/response exchange with a master
#[async_trait]
pub trait MasterTransport: Send + Sync {
    /// Address of the master
    fn address(&self) -> &str;

    /// Send a request body and wait for its response body. Copy requests
    /// stream their files into `copy_sink` first.
    async fn call(&self, body: Bytes, copy_sink: Option<&mut dyn StoreWriter>) -> Result<Bytes>;

    /// Drop every open connection
    async fn close(&self);
}

/// Serving and connecting on one kind of network
#[async_trait]
pub trait MasterNetwork: Send + Sync {
    /// Serve `server` on `address`
    async fn serve(&self, address: &str, server: Arc<MasterServer>) -> Result<ServingHandle>;

    /// Transport to the server on `address`
    fn connect(&self, address: &str) -> Arc<dyn MasterTransport>;
}

/// A running server, stopped explicitly
pub enum ServingHandle {
    Tcp(ServerHandle),
    InProcess { network: InProcessNetwork, address: String },
}

impl ServingHandle {
    /// Stop serving
    pub async fn stop(self) {
        match self {
            ServingHandle::Tcp(handle) => handle.stop().await,
            ServingHandle::InProcess { network, address } => network.unregister(&address),
        }
    }
}

/// TCP network
#[derive(Debug, Clone)]
pub struct TcpNetwork {
    connect_timeout: Duration,
}

impl TcpNetwork {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl MasterNetwork for TcpNetwork {
    async fn serve(&self, address: &str, server: Arc<MasterServer>) -> Result<ServingHandle> {
        Ok(ServingHandle::Tcp(server.start(address).await?))
    }

    fn connect(&self, address: &str) -> Arc<dyn MasterTransport> {
        Arc::new(TcpTransport::new(address, self.connect_timeout))
    }
}

/// Pooled TCP connections to one master
pub struct TcpTransport {
    pool: ConnectionPool,
}

impl TcpTransport {
    pub fn new(address: &str, connect_timeout: Duration) -> Self {
        Self {
            pool: ConnectionPool::new(address, connect_timeout, MAX_IDLE_CONNECTIONS),
        }
    }

    fn lost(&self, error: Error) -> Error {
        match error {
            Error::Io(e) => Error::ConnectionFailed {
                address: self.pool.address().to_string(),
                reason: e.to_string(),
            },
            other => other,
        }
    }

    async fn exchange(
        &self,
        stream: &mut TcpStream,
        body: &[u8],
        copy_sink: Option<&mut dyn StoreWriter>,
    ) -> Result<Bytes> {
        write_frame(stream, body).await.map_err(|e| self.lost(e))?;

        if let Some(sink) = copy_sink {
            loop {
                let frame = read_frame(stream).await.map_err(|e| self.lost(e))?;
                match CopyFrame::decode(&frame)? {
                    CopyFrame::File { path, data } => sink.write(&path, &data).await?,
                    CopyFrame::End => {
                        sink.done().await?;
                        break;
                    }
                }
            }
        }

        read_frame(stream).await.map_err(|e| self.lost(e))
    }
}

#[async_trait]
impl MasterTransport for TcpTransport {
    fn address(&self) -> &str {
        self.pool.address()
    }

    async fn call(&self, body: Bytes, copy_sink: Option<&mut dyn StoreWriter>) -> Result<Bytes> {
        let mut stream = self.pool.checkout().await?;
        let response = self.exchange(&mut stream, &body, copy_sink).await?;
        // only a connection that completed its exchange goes back
        self.pool.checkin(stream).await;
        Ok(response)
    }

    async fn close(&self) {
        self.pool.close_all().await;
    }
}

/// Registry of servers reachable in this process, keyed by address
#[derive(Clone, Default)]
pub struct InProcessNetwork {
    servers: Arc<Mutex<HashMap<String, Arc<MasterServer>>>>,
}

impl InProcessNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn servers(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<MasterServer>>> {
        self.servers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make `server` reachable on `address`
    pub fn register(&self, address: &str, server: Arc<MasterServer>) {
        self.servers().insert(address.to_string(), server);
    }

    /// Make `address` unreachable
    pub fn unregister(&self, address: &str) {
        self.servers().remove(address);
    }

    fn lookup(&self, address: &str) -> Option<Arc<MasterServer>> {
        self.servers().get(address).cloned()
    }
}

#[async_trait]
impl MasterNetwork for InProcessNetwork {
    async fn serve(&self, address: &str, server: Arc<MasterServer>) -> Result<ServingHandle> {
        self.register(address, server);
        Ok(ServingHandle::InProcess {
            network: self.clone(),
            address: address.to_string(),
        })
    }

    fn connect(&self, address: &str) -> Arc<dyn MasterTransport> {
        Arc::new(InProcessTransport {
            network: self.clone(),
            address: address.to_string(),
        })
    }
}

/// Direct calls into a registered server
pub struct InProcessTransport {
    network: InProcessNetwork,
    address: String,
}

/// Sink for requests that never stream files
struct NoCopy;

#[async_trait]
impl StoreWriter for NoCopy {
    async fn write(&mut self, path: &str, _data: &[u8]) -> Result<()> {
        Err(Error::Protocol(format!("Unexpected copied file {}", path)))
    }

    async fn done(&mut self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl MasterTransport for InProcessTransport {
    fn address(&self) -> &str {
        &self.address
    }

    async fn call(&self, body: Bytes, copy_sink: Option<&mut dyn StoreWriter>) -> Result<Bytes> {
        let server = self.network.lookup(&self.address).ok_or_else(|| Error::ConnectionFailed {
            address: self.address.clone(),
            reason: "no server registered".into(),
        })?;
        let response = match copy_sink {
            Some(sink) => server.handle(&body, sink).await,
            None => server.handle(&body, &mut NoCopy).await,
        };
        Ok(response)
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::cursor::ReplicationCursor;
    use crate::replication::master::DirStoreWriter;
    use crate::replication::master_impl::MasterImpl;
    use crate::replication::protocol::{self, Request, RequestType};
    use crate::replication::server::ServerMode;
    use crate::store::local::StoreOptions;
    use crate::store::{LocalStore, StoreId, DEFAULT_RESOURCE};

    async fn server(dir: &std::path::Path) -> Arc<MasterServer> {
        let store = LocalStore::create(dir, StoreId::new(), StoreOptions::default())
            .await
            .unwrap();
        store.commit(DEFAULT_RESOURCE, 0, b"seed".to_vec()).await.unwrap();
        let master = MasterImpl::new(Arc::new(store), 0, Duration::from_millis(100));
        Arc::new(MasterServer::new(ServerMode::Master, Arc::new(master), 4))
    }

    fn copy_request() -> Bytes {
        Request::new(RequestType::CopyStore, None, &ReplicationCursor::empty(), Bytes::new())
            .encode()
            .unwrap()
    }

    #[tokio::test]
    async fn test_tcp_copy_streams_files() {
        let dir = tempfile::tempdir().unwrap();
        let server = server(dir.path()).await;
        let handle = Arc::clone(&server).start("127.0.0.1:0").await.unwrap();
        let address = handle.local_addr().to_string();

        let transport = TcpTransport::new(&address, Duration::from_secs(1));
        let target = tempfile::tempdir().unwrap();
        let mut sink = DirStoreWriter::new(target.path());
        let response = transport.call(copy_request(), Some(&mut sink)).await.unwrap();
        assert!(protocol::decode_response(&response).is_ok());
        assert!(target.path().join(crate::store::META_FILE).exists());

        // the connection is reused for the next request
        let body = Request::new(RequestType::GetMasterIdForTx, None, &ReplicationCursor::empty(), protocol::encode_i64(1))
            .encode()
            .unwrap();
        let (_, payload) = protocol::decode_response(&transport.call(body, None).await.unwrap()).unwrap();
        assert_eq!(protocol::decode_i32(&payload).unwrap(), 0);

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_unreachable_tcp_master() {
        let transport = TcpTransport::new("127.0.0.1:1", Duration::from_millis(200));
        let err = transport.call(copy_request(), None).await.unwrap_err();
        assert!(err.is_connectivity());
    }

    #[tokio::test]
    async fn test_in_process_registry() {
        let dir = tempfile::tempdir().unwrap();
        let network = InProcessNetwork::new();
        let handle = network.serve("node-0:6361", server(dir.path()).await).await.unwrap();

        let transport = network.connect("node-0:6361");
        let target = tempfile::tempdir().unwrap();
        let mut sink = DirStoreWriter::new(target.path());
        assert!(transport.call(copy_request(), Some(&mut sink)).await.is_ok());

        handle.stop().await;
        let err = transport.call(copy_request(), None).await.unwrap_err();
        assert!(err.is_connectivity());
    }
}
