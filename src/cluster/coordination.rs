//! Coordination Service Contract
//!
//! The small subset of a hierarchical coordination service the broker
//! needs: byte records keyed by path, ephemeral and sequential nodes, and
//! one-shot watches. [`DataTree`] holds the shared semantics; [`Ensemble`]
//! serves them in process and [`ZkConnector`](super::ZkConnector) maps them
//! onto a ZooKeeper ensemble.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};

use crate::error::{Error, Result};

/// Node lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CreateMode {
    /// Survives the creating session
    Persistent,
    /// Removed when the creating session ends
    Ephemeral,
    /// Ephemeral, with a ten digit sequence number appended to the name
    EphemeralSequential,
}

impl CreateMode {
    fn is_ephemeral(&self) -> bool {
        !matches!(self, CreateMode::Persistent)
    }
}

/// Event delivered on a session's event channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatchedEvent {
    /// Session established
    SyncConnected { session_id: i64 },
    /// Connection lost, session may still be alive
    Disconnected,
    /// Session gone, its ephemeral nodes are deleted
    Expired,
    /// Watched node was created
    NodeCreated(String),
    /// Watched node was deleted
    NodeDeleted(String),
    /// Watched node's data changed
    NodeDataChanged(String),
    /// Watched node's children changed
    NodeChildrenChanged(String),
}

/// An open coordination session
#[async_trait]
pub trait CoordinationSession: Send + Sync {
    /// Session id
    fn session_id(&self) -> i64;

    /// Create a node, returning its actual path
    async fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> Result<String>;

    /// Read a node, optionally leaving a data watch
    async fn get_data(&self, path: &str, watch: bool) -> Result<Vec<u8>>;

    /// Replace a node's data
    async fn set_data(&self, path: &str, data: Vec<u8>) -> Result<()>;

    /// Check for a node, optionally leaving a data watch
    async fn exists(&self, path: &str, watch: bool) -> Result<bool>;

    /// List child names, optionally leaving a child watch
    async fn get_children(&self, path: &str, watch: bool) -> Result<Vec<String>>;

    /// Delete a node without children
    async fn delete(&self, path: &str) -> Result<()>;

    /// End the session
    async fn close(&self) -> Result<()>;
}

/// Opens sessions against a coordination service
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a session. `SyncConnected` is the first event on the channel.
    async fn connect(
        &self,
        session_timeout: Duration,
    ) -> Result<(Arc<dyn CoordinationSession>, mpsc::UnboundedReceiver<WatchedEvent>)>;
}

/// Events to deliver, addressed by session id
pub type Fired = Vec<(i64, WatchedEvent)>;

#[derive(Debug, Clone)]
struct Node {
    data: Vec<u8>,
    owner: Option<i64>,
}

/// Node tree with watches
#[derive(Debug, Default)]
pub struct DataTree {
    nodes: BTreeMap<String, Node>,
    sequences: HashMap<String, i64>,
    data_watches: HashMap<String, HashSet<i64>>,
    child_watches: HashMap<String, HashSet<i64>>,
}

impl DataTree {
    /// Create an empty tree
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a node owned by `session`
    pub fn create(
        &mut self,
        session: i64,
        path: &str,
        data: Vec<u8>,
        mode: CreateMode,
    ) -> Result<(String, Fired)> {
        validate_path(path)?;
        let parent = parent_of(path);
        if parent != "/" && !self.nodes.contains_key(parent) {
            return Err(Error::NoNode(parent.to_string()));
        }

        let actual = match mode {
            CreateMode::EphemeralSequential => {
                let counter = self.sequences.entry(parent.to_string()).or_insert(0);
                let seq = *counter;
                *counter += 1;
                format!("{}{:010}", path, seq)
            }
            _ => path.to_string(),
        };

        if self.nodes.contains_key(&actual) {
            return Err(Error::NodeExists(actual));
        }

        self.nodes.insert(
            actual.clone(),
            Node {
                data,
                owner: mode.is_ephemeral().then_some(session),
            },
        );

        let mut fired = self.fire_data(&actual, WatchedEvent::NodeCreated(actual.clone()));
        fired.extend(self.fire_children(parent));
        Ok((actual, fired))
    }

    /// Read a node's data
    pub fn get_data(&mut self, session: i64, path: &str, watch: bool) -> Result<Vec<u8>> {
        let data = self
            .nodes
            .get(path)
            .map(|n| n.data.clone())
            .ok_or_else(|| Error::NoNode(path.to_string()))?;
        if watch {
            self.data_watches.entry(path.to_string()).or_default().insert(session);
        }
        Ok(data)
    }

    /// Replace a node's data
    pub fn set_data(&mut self, path: &str, data: Vec<u8>) -> Result<Fired> {
        let node = self
            .nodes
            .get_mut(path)
            .ok_or_else(|| Error::NoNode(path.to_string()))?;
        node.data = data;
        Ok(self.fire_data(path, WatchedEvent::NodeDataChanged(path.to_string())))
    }

    /// Check for a node. A watch is left whether or not it exists.
    pub fn exists(&mut self, session: i64, path: &str, watch: bool) -> bool {
        if watch {
            self.data_watches.entry(path.to_string()).or_default().insert(session);
        }
        self.nodes.contains_key(path)
    }

    /// Sorted child names of a node
    pub fn get_children(&mut self, session: i64, path: &str, watch: bool) -> Result<Vec<String>> {
        if path != "/" && !self.nodes.contains_key(path) {
            return Err(Error::NoNode(path.to_string()));
        }
        if watch {
            self.child_watches.entry(path.to_string()).or_default().insert(session);
        }
        Ok(self.children_of(path))
    }

    /// Delete a node without children
    pub fn delete(&mut self, path: &str) -> Result<Fired> {
        if !self.nodes.contains_key(path) {
            return Err(Error::NoNode(path.to_string()));
        }
        if !self.children_of(path).is_empty() {
            return Err(Error::Internal(format!("Node {} has children", path)));
        }
        self.nodes.remove(path);

        let mut fired = self.fire_data(path, WatchedEvent::NodeDeleted(path.to_string()));
        fired.extend(self.fire_children(parent_of(path)));
        Ok(fired)
    }

    /// Drop a session: delete its ephemeral nodes and forget its watches
    pub fn remove_session(&mut self, session: i64) -> Fired {
        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, n)| n.owner == Some(session))
            .map(|(p, _)| p.clone())
            .collect();

        for watchers in self.data_watches.values_mut() {
            watchers.remove(&session);
        }
        for watchers in self.child_watches.values_mut() {
            watchers.remove(&session);
        }

        let mut fired = Vec::new();
        for path in owned {
            if let Ok(events) = self.delete(&path) {
                fired.extend(events);
            }
        }
        fired
    }

    fn children_of(&self, path: &str) -> Vec<String> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{}/", path)
        };
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(p, _)| p.starts_with(&prefix))
            .filter_map(|(p, _)| {
                let rest = &p[prefix.len()..];
                (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
            })
            .collect()
    }

    fn fire_data(&mut self, path: &str, event: WatchedEvent) -> Fired {
        self.data_watches
            .remove(path)
            .unwrap_or_default()
            .into_iter()
            .map(|session| (session, event.clone()))
            .collect()
    }

    fn fire_children(&mut self, parent: &str) -> Fired {
        let event = WatchedEvent::NodeChildrenChanged(parent.to_string());
        self.child_watches
            .remove(parent)
            .unwrap_or_default()
            .into_iter()
            .map(|session| (session, event.clone()))
            .collect()
    }
}

fn validate_path(path: &str) -> Result<()> {
    if !path.starts_with('/') || path.len() < 2 || path.ends_with('/') || path.contains("//") {
        return Err(Error::Internal(format!("Invalid coordination path '{}'", path)));
    }
    Ok(())
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

/// Create a persistent node, treating "already exists" as success
pub async fn ensure_node(session: &dyn CoordinationSession, path: &str, data: Vec<u8>) -> Result<()> {
    match session.create(path, data, CreateMode::Persistent).await {
        Ok(_) | Err(Error::NodeExists(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

struct EnsembleState {
    tree: DataTree,
    sessions: HashMap<i64, mpsc::UnboundedSender<WatchedEvent>>,
    next_session: i64,
    reachable: bool,
}

impl EnsembleState {
    fn dispatch(&self, fired: Fired) {
        for (session, event) in fired {
            if let Some(events) = self.sessions.get(&session) {
                let _ = events.send(event);
            }
        }
    }

    fn check(&self, session: i64) -> Result<()> {
        if !self.reachable {
            return Err(Error::Connectivity("ensemble unreachable".into()));
        }
        if !self.sessions.contains_key(&session) {
            return Err(Error::SessionExpired);
        }
        Ok(())
    }
}

/// In-process coordination service shared by every node of a test cluster
#[derive(Clone)]
pub struct Ensemble {
    state: Arc<Mutex<EnsembleState>>,
}

impl Default for Ensemble {
    fn default() -> Self {
        Self::new()
    }
}

impl Ensemble {
    /// Create an empty ensemble
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(EnsembleState {
                tree: DataTree::new(),
                sessions: HashMap::new(),
                next_session: 1,
                reachable: true,
            })),
        }
    }

    /// Expire a session as if its heartbeats stopped
    pub async fn expire_session(&self, session_id: i64) {
        let mut state = self.state.lock().await;
        let fired = state.tree.remove_session(session_id);
        if let Some(events) = state.sessions.remove(&session_id) {
            let _ = events.send(WatchedEvent::Expired);
        }
        state.dispatch(fired);
        tracing::debug!("Expired coordination session {}", session_id);
    }

    /// Make every operation fail with a connectivity error, or recover
    pub async fn set_reachable(&self, reachable: bool) {
        self.state.lock().await.reachable = reachable;
    }

    /// Ids of live sessions
    pub async fn sessions(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.state.lock().await.sessions.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Read a node outside any session
    pub async fn read(&self, path: &str) -> Result<Vec<u8>> {
        self.state.lock().await.tree.get_data(0, path, false)
    }
}

#[async_trait]
impl Connector for Ensemble {
    async fn connect(
        &self,
        _session_timeout: Duration,
    ) -> Result<(Arc<dyn CoordinationSession>, mpsc::UnboundedReceiver<WatchedEvent>)> {
        let mut state = self.state.lock().await;
        if !state.reachable {
            return Err(Error::Connectivity("ensemble unreachable".into()));
        }

        let session_id = state.next_session;
        state.next_session += 1;

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(WatchedEvent::SyncConnected { session_id });
        state.sessions.insert(session_id, tx);

        let session = InMemorySession {
            ensemble: self.clone(),
            session_id,
        };
        Ok((Arc::new(session), rx))
    }
}

/// Session on an [`Ensemble`]
pub struct InMemorySession {
    ensemble: Ensemble,
    session_id: i64,
}

#[async_trait]
impl CoordinationSession for InMemorySession {
    fn session_id(&self) -> i64 {
        self.session_id
    }

    async fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> Result<String> {
        let mut state = self.ensemble.state.lock().await;
        state.check(self.session_id)?;
        let (actual, fired) = state.tree.create(self.session_id, path, data, mode)?;
        state.dispatch(fired);
        Ok(actual)
    }

    async fn get_data(&self, path: &str, watch: bool) -> Result<Vec<u8>> {
        let mut state = self.ensemble.state.lock().await;
        state.check(self.session_id)?;
        state.tree.get_data(self.session_id, path, watch)
    }

    async fn set_data(&self, path: &str, data: Vec<u8>) -> Result<()> {
        let mut state = self.ensemble.state.lock().await;
        state.check(self.session_id)?;
        let fired = state.tree.set_data(path, data)?;
        state.dispatch(fired);
        Ok(())
    }

    async fn exists(&self, path: &str, watch: bool) -> Result<bool> {
        let mut state = self.ensemble.state.lock().await;
        state.check(self.session_id)?;
        Ok(state.tree.exists(self.session_id, path, watch))
    }

    async fn get_children(&self, path: &str, watch: bool) -> Result<Vec<String>> {
        let mut state = self.ensemble.state.lock().await;
        state.check(self.session_id)?;
        state.tree.get_children(self.session_id, path, watch)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let mut state = self.ensemble.state.lock().await;
        state.check(self.session_id)?;
        let fired = state.tree.delete(path)?;
        state.dispatch(fired);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.ensemble.state.lock().await;
        let fired = state.tree.remove_session(self.session_id);
        state.sessions.remove(&self.session_id);
        state.dispatch(fired);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential_names() {
        let mut tree = DataTree::new();
        tree.create(1, "/c", vec![], CreateMode::Persistent).unwrap();
        let (a, _) = tree.create(1, "/c/1_", vec![], CreateMode::EphemeralSequential).unwrap();
        let (b, _) = tree.create(2, "/c/2_", vec![], CreateMode::EphemeralSequential).unwrap();
        assert_eq!(a, "/c/1_0000000000");
        assert_eq!(b, "/c/2_0000000001");
        assert_eq!(tree.get_children(1, "/c", false).unwrap(), vec!["1_0000000000", "2_0000000001"]);
    }

    #[test]
    fn test_missing_parent() {
        let mut tree = DataTree::new();
        assert!(matches!(
            tree.create(1, "/a/b", vec![], CreateMode::Persistent),
            Err(Error::NoNode(_))
        ));
    }

    #[test]
    fn test_watches_fire_once() {
        let mut tree = DataTree::new();
        tree.create(1, "/n", vec![1], CreateMode::Persistent).unwrap();
        tree.get_data(7, "/n", true).unwrap();

        let fired = tree.set_data("/n", vec![2]).unwrap();
        assert_eq!(fired, vec![(7, WatchedEvent::NodeDataChanged("/n".into()))]);
        assert!(tree.set_data("/n", vec![3]).unwrap().is_empty());
    }

    #[test]
    fn test_session_removal_deletes_ephemerals() {
        let mut tree = DataTree::new();
        tree.create(1, "/c", vec![], CreateMode::Persistent).unwrap();
        tree.create(2, "/c/e", vec![], CreateMode::Ephemeral).unwrap();
        tree.get_children(1, "/c", true).unwrap();

        let fired = tree.remove_session(2);
        assert!(fired.contains(&(1, WatchedEvent::NodeChildrenChanged("/c".into()))));
        assert!(!tree.exists(1, "/c/e", false));
        assert!(tree.exists(1, "/c", false));
    }

    #[tokio::test]
    async fn test_ensemble_expiry() {
        let ensemble = Ensemble::new();
        let (s1, mut e1) = ensemble.connect(Duration::from_secs(1)).await.unwrap();
        let (s2, _e2) = ensemble.connect(Duration::from_secs(1)).await.unwrap();
        assert!(matches!(e1.recv().await, Some(WatchedEvent::SyncConnected { .. })));

        s1.create("/r", vec![], CreateMode::Persistent).await.unwrap();
        s2.create("/r/x", vec![9], CreateMode::Ephemeral).await.unwrap();
        assert!(s1.exists("/r/x", true).await.unwrap());

        ensemble.expire_session(s2.session_id()).await;
        assert_eq!(e1.recv().await, Some(WatchedEvent::NodeDeleted("/r/x".into())));
        assert!(matches!(s2.get_data("/r", false).await, Err(Error::SessionExpired)));
        assert_eq!(ensemble.sessions().await, vec![s1.session_id()]);
    }

    #[tokio::test]
    async fn test_unreachable_ensemble() {
        let ensemble = Ensemble::new();
        let (s1, _e1) = ensemble.connect(Duration::from_secs(1)).await.unwrap();
        ensemble.set_reachable(false).await;
        assert!(s1.exists("/x", false).await.unwrap_err().is_connectivity());
        assert!(ensemble.connect(Duration::from_secs(1)).await.is_err());
    }
}
