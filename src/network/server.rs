//! Network Server
//!
//! TCP accept loop shared by the master protocol server and the backup
//! endpoint.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::Result;

/// Bound listener waiting to be started
pub struct NetworkServer {
    /// Listener
    listener: TcpListener,
    /// Actual bound address (resolves port 0)
    local_addr: SocketAddr,
    /// Name used in log lines
    name: &'static str,
}

/// Handle to a running server
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl NetworkServer {
    /// Bind a listener
    pub async fn bind(name: &'static str, bind_address: &str) -> Result<Self> {
        let listener = TcpListener::bind(bind_address).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!("{} listening on {}", name, local_addr);

        Ok(Self {
            listener,
            local_addr,
            name,
        })
    }

    /// Get the bound address
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Start accepting connections, spawning `handler` for each one
    pub fn start<H, F>(self, handler: H) -> ServerHandle
    where
        H: Fn(TcpStream, String, watch::Receiver<bool>) -> F + Send + Sync + 'static,
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let handler = Arc::new(handler);
        let local_addr = self.local_addr;
        let name = self.name;
        let listener = self.listener;
        let conn_shutdown = shutdown_rx.clone();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((socket, addr)) => {
                                let peer_addr = addr.to_string();
                                let handler = Arc::clone(&handler);
                                let shutdown = conn_shutdown.clone();
                                let _ = socket.set_nodelay(true);

                                tokio::spawn(async move {
                                    if let Err(e) = handler(socket, peer_addr.clone(), shutdown).await {
                                        tracing::warn!("{} connection error from {}: {}", name, peer_addr, e);
                                    }
                                });
                            }
                            Err(e) => {
                                tracing::error!("{} accept error: {}", name, e);
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }

            tracing::info!("{} on {} stopped", name, local_addr);
        });

        ServerHandle {
            local_addr,
            shutdown: shutdown_tx,
            task,
        }
    }
}

impl ServerHandle {
    /// Get the bound address
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and signal open connections to close
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{read_frame, write_frame};

    #[tokio::test]
    async fn test_server_echo_and_stop() {
        let server = NetworkServer::bind("test server", "127.0.0.1:0").await.unwrap();
        let addr = server.local_addr();

        let handle = server.start(|mut socket, _peer, _shutdown| async move {
            let body = read_frame(&mut socket).await?;
            write_frame(&mut socket, &body).await
        });

        let mut stream = TcpStream::connect(addr).await.unwrap();
        write_frame(&mut stream, b"ping").await.unwrap();
        let reply = read_frame(&mut stream).await.unwrap();
        assert_eq!(&reply[..], b"ping");

        handle.stop().await;
    }
}
