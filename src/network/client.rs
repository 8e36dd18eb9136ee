//! Network Client
//!
//! Pooled TCP connections to a single peer.

use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::error::{Error, Result};

/// Idle pool entry
struct PoolEntry {
    stream: TcpStream,
    last_used: Instant,
}

/// Connection pool for one peer address
pub struct ConnectionPool {
    /// Peer address
    address: String,
    /// Idle connections
    idle: Mutex<Vec<PoolEntry>>,
    /// Connection timeout
    connect_timeout: Duration,
    /// Max idle connections kept
    max_idle: usize,
}

impl ConnectionPool {
    /// Create a new pool
    pub fn new(address: impl Into<String>, connect_timeout: Duration, max_idle: usize) -> Self {
        Self {
            address: address.into(),
            idle: Mutex::new(Vec::new()),
            connect_timeout,
            max_idle,
        }
    }

    /// Peer address
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Take an idle connection or open a new one
    pub async fn checkout(&self) -> Result<TcpStream> {
        if let Some(entry) = self.idle.lock().await.pop() {
            return Ok(entry.stream);
        }
        connect(&self.address, self.connect_timeout).await
    }

    /// Return a healthy connection to the pool
    pub async fn checkin(&self, stream: TcpStream) {
        let mut idle = self.idle.lock().await;
        if idle.len() < self.max_idle {
            idle.push(PoolEntry {
                stream,
                last_used: Instant::now(),
            });
        }
    }

    /// Clean up stale connections
    pub async fn cleanup_stale(&self, max_idle: Duration) {
        let mut idle = self.idle.lock().await;
        let now = Instant::now();
        idle.retain(|e| now.duration_since(e.last_used) <= max_idle);
    }

    /// Close all connections
    pub async fn close_all(&self) {
        self.idle.lock().await.clear();
    }

    /// Get idle connection count
    pub async fn idle_count(&self) -> usize {
        self.idle.lock().await.len()
    }
}

/// Connect to an address with a timeout
pub async fn connect(address: &str, connect_timeout: Duration) -> Result<TcpStream> {
    let result = timeout(connect_timeout, TcpStream::connect(address)).await;

    match result {
        Ok(Ok(stream)) => {
            stream.set_nodelay(true)?;
            Ok(stream)
        }
        Ok(Err(e)) => Err(Error::ConnectionFailed {
            address: address.to_string(),
            reason: e.to_string(),
        }),
        Err(_) => Err(Error::ConnectionTimeout(address.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_connection_failure() {
        let pool = ConnectionPool::new("127.0.0.1:1", Duration::from_millis(200), 2);
        let result = pool.checkout().await;
        assert!(result.unwrap_err().is_connectivity());
    }

    #[tokio::test]
    async fn test_checkin_reuses_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let pool = ConnectionPool::new(addr, Duration::from_secs(1), 1);
        let first = pool.checkout().await.unwrap();
        let second = pool.checkout().await.unwrap();
        pool.checkin(first).await;
        pool.checkin(second).await;
        assert_eq!(pool.idle_count().await, 1);

        pool.close_all().await;
        assert_eq!(pool.idle_count().await, 0);
    }
}
