//! ZooKeeper Connector
//!
//! Serves the coordination contract from a ZooKeeper ensemble. The client
//! is blocking, so every call runs on the blocking pool. Watches left by
//! reads fire through the session's default watcher onto the event channel.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use zookeeper::{Acl, KeeperState, WatchedEventType, ZkError, ZkResult, ZooKeeper};

use super::coordination::{CoordinationSession, Connector, CreateMode, WatchedEvent};
use crate::error::{Error, Result};

static LAST_SESSION: AtomicI64 = AtomicI64::new(0);

/// Local handle id, unique and increasing within the process
fn next_session_id() -> i64 {
    let now = chrono::Utc::now().timestamp_millis();
    let mut last = LAST_SESSION.load(Ordering::SeqCst);
    loop {
        let candidate = now.max(last + 1);
        match LAST_SESSION.compare_exchange(last, candidate, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => return candidate,
            Err(current) => last = current,
        }
    }
}

/// Opens sessions against a ZooKeeper ensemble
pub struct ZkConnector {
    connect_string: String,
    connect_timeout: Duration,
}

impl ZkConnector {
    /// Create a connector for `addresses` (`host:port` each)
    pub fn new(addresses: Vec<String>, connect_timeout: Duration) -> Self {
        Self {
            connect_string: addresses.join(","),
            connect_timeout,
        }
    }

    /// Connect string handed to the client
    pub fn connect_string(&self) -> &str {
        &self.connect_string
    }
}

#[async_trait]
impl Connector for ZkConnector {
    async fn connect(
        &self,
        session_timeout: Duration,
    ) -> Result<(Arc<dyn CoordinationSession>, mpsc::UnboundedReceiver<WatchedEvent>)> {
        if self.connect_string.is_empty() {
            return Err(Error::Connectivity("no coordinators configured".into()));
        }

        let session_id = next_session_id();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let hosts = self.connect_string.clone();
        let watcher = move |event: zookeeper::WatchedEvent| {
            if let Some(event) = translate_event(session_id, &event) {
                let _ = events_tx.send(event);
            }
        };

        let zk = tokio::task::spawn_blocking(move || ZooKeeper::connect(&hosts, session_timeout, watcher))
            .await
            .map_err(|e| Error::Internal(format!("Coordination connect task failed: {}", e)))?
            .map_err(|e| Error::Connectivity(format!("{}: {:?}", self.connect_string, e)))?;

        let session = ZkSession {
            session_id,
            zk: Arc::new(zk),
            closed: AtomicBool::new(false),
        };

        // the client connects lazily, so wait for one round trip
        match tokio::time::timeout(self.connect_timeout, session.exists("/", false)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                session.shut().await;
                return Err(e);
            }
            Err(_) => {
                session.shut().await;
                return Err(Error::Connectivity(format!(
                    "no session with {} within {:?}",
                    self.connect_string, self.connect_timeout
                )));
            }
        }

        tracing::debug!("Coordination session {} established with {}", session_id, self.connect_string);
        Ok((Arc::new(session), events_rx))
    }
}

/// Open ZooKeeper session
pub struct ZkSession {
    session_id: i64,
    zk: Arc<ZooKeeper>,
    closed: AtomicBool,
}

impl ZkSession {
    async fn call<T, F>(&self, path: &str, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&ZooKeeper) -> ZkResult<T> + Send + 'static,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::SessionExpired);
        }
        let zk = Arc::clone(&self.zk);
        tokio::task::spawn_blocking(move || op(&zk))
            .await
            .map_err(|e| Error::Internal(format!("Coordination call failed: {}", e)))?
            .map_err(|e| translate_error(e, path))
    }

    async fn shut(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let zk = Arc::clone(&self.zk);
        match tokio::task::spawn_blocking(move || zk.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!("Error closing coordination session {}: {:?}", self.session_id, e),
            Err(e) => tracing::debug!("Close task for session {} failed: {}", self.session_id, e),
        }
    }
}

#[async_trait]
impl CoordinationSession for ZkSession {
    fn session_id(&self) -> i64 {
        self.session_id
    }

    async fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> Result<String> {
        let target = path.to_string();
        let mode = match mode {
            CreateMode::Persistent => zookeeper::CreateMode::Persistent,
            CreateMode::Ephemeral => zookeeper::CreateMode::Ephemeral,
            CreateMode::EphemeralSequential => zookeeper::CreateMode::EphemeralSequential,
        };
        self.call(path, move |zk| zk.create(&target, data, Acl::open_unsafe().clone(), mode))
            .await
    }

    async fn get_data(&self, path: &str, watch: bool) -> Result<Vec<u8>> {
        let target = path.to_string();
        let (data, _stat) = self.call(path, move |zk| zk.get_data(&target, watch)).await?;
        Ok(data)
    }

    async fn set_data(&self, path: &str, data: Vec<u8>) -> Result<()> {
        let target = path.to_string();
        self.call(path, move |zk| zk.set_data(&target, data, None)).await?;
        Ok(())
    }

    async fn exists(&self, path: &str, watch: bool) -> Result<bool> {
        let target = path.to_string();
        let stat = self.call(path, move |zk| zk.exists(&target, watch)).await?;
        Ok(stat.is_some())
    }

    async fn get_children(&self, path: &str, watch: bool) -> Result<Vec<String>> {
        let target = path.to_string();
        self.call(path, move |zk| zk.get_children(&target, watch)).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let target = path.to_string();
        self.call(path, move |zk| zk.delete(&target, None)).await
    }

    async fn close(&self) -> Result<()> {
        self.shut().await;
        Ok(())
    }
}

fn translate_event(session_id: i64, event: &zookeeper::WatchedEvent) -> Option<WatchedEvent> {
    if let Some(path) = event.path.clone() {
        return match event.event_type {
            WatchedEventType::NodeCreated => Some(WatchedEvent::NodeCreated(path)),
            WatchedEventType::NodeDeleted => Some(WatchedEvent::NodeDeleted(path)),
            WatchedEventType::NodeDataChanged => Some(WatchedEvent::NodeDataChanged(path)),
            WatchedEventType::NodeChildrenChanged => Some(WatchedEvent::NodeChildrenChanged(path)),
            _ => None,
        };
    }

    match event.keeper_state {
        KeeperState::SyncConnected => Some(WatchedEvent::SyncConnected { session_id }),
        KeeperState::Disconnected => Some(WatchedEvent::Disconnected),
        KeeperState::Expired => Some(WatchedEvent::Expired),
        _ => None,
    }
}

fn translate_error(error: ZkError, path: &str) -> Error {
    match error {
        ZkError::NoNode => Error::NoNode(path.to_string()),
        ZkError::NodeExists => Error::NodeExists(path.to_string()),
        ZkError::SessionExpired => Error::SessionExpired,
        ZkError::ConnectionLoss | ZkError::OperationTimeout => {
            Error::Connectivity(format!("{:?} on {}", error, path))
        }
        other => Error::Internal(format!("Coordination call on {} failed: {:?}", path, other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(event_type: WatchedEventType, keeper_state: KeeperState, path: Option<&str>) -> zookeeper::WatchedEvent {
        zookeeper::WatchedEvent {
            event_type,
            keeper_state,
            path: path.map(str::to_string),
        }
    }

    #[test]
    fn test_state_events() {
        let connected = event(WatchedEventType::None, KeeperState::SyncConnected, None);
        assert_eq!(
            translate_event(42, &connected),
            Some(WatchedEvent::SyncConnected { session_id: 42 })
        );

        let lost = event(WatchedEventType::None, KeeperState::Disconnected, None);
        assert_eq!(translate_event(42, &lost), Some(WatchedEvent::Disconnected));

        let expired = event(WatchedEventType::None, KeeperState::Expired, None);
        assert_eq!(translate_event(42, &expired), Some(WatchedEvent::Expired));
    }

    #[test]
    fn test_watch_events_carry_path() {
        let changed = event(
            WatchedEventType::NodeDataChanged,
            KeeperState::SyncConnected,
            Some("/wolfgraph/c1/master"),
        );
        assert_eq!(
            translate_event(1, &changed),
            Some(WatchedEvent::NodeDataChanged("/wolfgraph/c1/master".into()))
        );

        let members = event(
            WatchedEventType::NodeChildrenChanged,
            KeeperState::SyncConnected,
            Some("/wolfgraph/c1/members"),
        );
        assert_eq!(
            translate_event(1, &members),
            Some(WatchedEvent::NodeChildrenChanged("/wolfgraph/c1/members".into()))
        );
    }

    #[test]
    fn test_error_translation() {
        assert!(matches!(translate_error(ZkError::NoNode, "/a"), Error::NoNode(p) if p == "/a"));
        assert!(matches!(translate_error(ZkError::NodeExists, "/a"), Error::NodeExists(p) if p == "/a"));
        assert!(matches!(translate_error(ZkError::SessionExpired, "/a"), Error::SessionExpired));
        assert!(translate_error(ZkError::ConnectionLoss, "/a").is_connectivity());
        assert!(!translate_error(ZkError::NotEmpty, "/a").is_connectivity());
    }

    #[test]
    fn test_session_ids_increase() {
        let first = next_session_id();
        let second = next_session_id();
        assert!(second > first);
    }

    #[tokio::test]
    async fn test_connect_without_coordinators() {
        let connector = ZkConnector::new(Vec::new(), Duration::from_millis(100));
        let result = connector.connect(Duration::from_secs(1)).await;
        assert!(matches!(result, Err(Error::Connectivity(_))));
    }

    #[test]
    fn test_connect_string() {
        let connector = ZkConnector::new(
            vec!["zk1:2181".into(), "zk2:2181".into()],
            Duration::from_secs(1),
        );
        assert_eq!(connector.connect_string(), "zk1:2181,zk2:2181");
    }
}
