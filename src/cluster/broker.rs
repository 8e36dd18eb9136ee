//! Coordination Broker
//!
//! Everything a node learns about its cluster comes through here: who the
//! master is, whether a cluster identity already exists, and when it is
//! time to reevaluate. The broker owns the coordination session, keeps the
//! node's records registered across reconnects and turns watch events into
//! [`ClusterEvent`]s for the role state machine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use super::coordination::{ensure_node, CoordinationSession, Connector, CreateMode, WatchedEvent};
use super::machine::{Machine, NO_MACHINE};
use super::selector::{latest_per_machine, select_master};
use crate::error::{Error, Result};
use crate::store::{StoreId, NO_MASTER};

/// Delay before reconnecting after a lost session
const RECONNECT_DELAY: Duration = Duration::from_millis(250);

/// Notification for the role state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterEvent {
    /// The coordination view names this master; reevaluate against it
    MasterChanged(Machine),
    /// Something failed talking to the master; refresh and reevaluate
    Reevaluate(String),
    /// The store refused writes; restart it
    KernelPanic(String),
}

/// Connection metadata a node publishes after every restart
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    /// Machine id
    pub machine_id: i32,
    /// Current role
    pub role: String,
    /// Master protocol address
    pub address: String,
    /// Backup endpoint port, 0 if none
    pub backup_port: i32,
    /// Store identity, if a store is open
    pub store_id: Option<String>,
}

/// A member as shown by `status`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberView {
    /// Member record
    pub machine: Machine,
    /// Published connection metadata
    pub info: Option<ConnectionInfo>,
}

/// Coordination facts the role state machine relies on
#[async_trait]
pub trait Broker: Send + Sync {
    /// This node's machine id
    fn my_machine_id(&self) -> i32;

    /// Last known master, without contacting the coordination service
    fn master_cached(&self) -> Machine;

    /// Recompute the master from the coordination service
    async fn master_forced(&self) -> Result<Machine>;

    /// Persist `candidate` as the cluster's store identity unless one
    /// exists. Returns whichever identity is stored.
    async fn create_cluster_or_join(&self, candidate: StoreId) -> Result<StoreId>;

    /// Register this node's member record with its last committed tx
    async fn register_self(&self, last_committed_tx: i64, master_for_tx: i32) -> Result<()>;

    /// Update the member record's last committed tx
    async fn set_last_committed_tx(&self, last_committed_tx: i64, master_for_tx: i32) -> Result<()>;

    /// Tell the cluster that `machine_id` should be master
    async fn notify_master_change(&self, machine_id: i32) -> Result<()>;

    /// Announce that this node now serves as master
    async fn rebind_as_master(&self) -> Result<()>;

    /// Publish connection metadata
    async fn set_connection_information(&self, info: ConnectionInfo) -> Result<()>;

    /// Every member with its published metadata
    async fn cluster_view(&self) -> Result<Vec<MemberView>>;

    /// Close the session and stop event delivery
    async fn shutdown(&self);
}

/// Paths under the cluster root
#[derive(Debug, Clone)]
struct Paths {
    root: String,
    store_id: String,
    members: String,
    ha_servers: String,
    master_notify: String,
    master_rebound: String,
}

impl Paths {
    fn new(cluster_name: &str) -> Self {
        let root = format!("/{}", cluster_name);
        Self {
            store_id: format!("{}/store-id", root),
            members: format!("{}/members", root),
            ha_servers: format!("{}/ha-servers", root),
            master_notify: format!("{}/master-notify", root),
            master_rebound: format!("{}/master-rebound", root),
            root,
        }
    }

    fn ha_server(&self, machine_id: i32) -> String {
        format!("{}/{}", self.ha_servers, machine_id)
    }

    fn ha_server_info(&self, machine_id: i32) -> String {
        format!("{}/{}-info", self.ha_servers, machine_id)
    }
}

/// Read-only access to a cluster's records. Tools use it to look at a
/// cluster without registering as a member.
#[derive(Debug, Clone)]
pub struct ClusterReader {
    paths: Paths,
}

impl ClusterReader {
    pub fn new(cluster_name: &str) -> Self {
        Self {
            paths: Paths::new(cluster_name),
        }
    }

    /// Current members, one record per machine
    pub async fn members(&self, session: &dyn CoordinationSession) -> Result<Vec<Machine>> {
        let mut records = Vec::new();
        let children = match session.get_children(&self.paths.members, false).await {
            Ok(children) => children,
            Err(Error::NoNode(_)) => return Ok(records),
            Err(e) => return Err(e),
        };
        for child in children {
            let Some((id, seq)) = parse_member_name(&child) else {
                tracing::warn!("Ignoring malformed member record {}", child);
                continue;
            };
            let path = format!("{}/{}", self.paths.members, child);
            let data = match session.get_data(&path, false).await {
                Ok(data) => data,
                Err(Error::NoNode(_)) => continue,
                Err(e) => return Err(e),
            };
            match decode_member(&data) {
                Ok((tx, master_for)) => records.push(Machine::new(id, seq, tx, master_for)),
                Err(e) => tracing::warn!("Ignoring unreadable member record {}: {}", child, e),
            }
        }
        Ok(latest_per_machine(records))
    }

    /// Selected master with its published address
    pub async fn master(&self, session: &dyn CoordinationSession) -> Result<Machine> {
        let machines = self.members(session).await?;
        let master = select_master(&machines);
        if master.is_none() {
            return Ok(master);
        }
        self.with_address(session, master).await
    }

    /// Attach the published address of `machine`, if any
    pub async fn with_address(&self, session: &dyn CoordinationSession, machine: Machine) -> Result<Machine> {
        match session.get_data(&self.paths.ha_server(machine.id), false).await {
            Ok(data) => {
                let (backup_port, address) = decode_ha_server(&data)?;
                Ok(machine.with_address(address, backup_port))
            }
            Err(Error::NoNode(_)) => Ok(machine),
            Err(e) => Err(e),
        }
    }

    /// Every member with its published connection metadata
    pub async fn view(&self, session: &dyn CoordinationSession) -> Result<Vec<MemberView>> {
        let machines = self.members(session).await?;
        let mut view = Vec::with_capacity(machines.len());
        for machine in machines {
            let machine = self.with_address(session, machine).await?;
            let info = match session.get_data(&self.paths.ha_server_info(machine.id), false).await {
                Ok(data) => serde_json::from_slice(&data).ok(),
                Err(_) => None,
            };
            view.push(MemberView { machine, info });
        }
        Ok(view)
    }
}

/// Broker settings
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// This node's machine id
    pub machine_id: i32,
    /// Coordination root name
    pub cluster_name: String,
    /// Master protocol address to publish
    pub ha_server: String,
    /// Backup port to publish, 0 if none
    pub backup_port: i32,
    /// Coordination session timeout
    pub session_timeout: Duration,
}

struct BrokerState {
    session: Option<Arc<dyn CoordinationSession>>,
    /// Session id the setup last ran for, 0 before the first session
    handled_session: i64,
    member_path: Option<String>,
    last_tx: i64,
    master_for_tx: i32,
    connection_info: Option<ConnectionInfo>,
}

/// [`Broker`] backed by a coordination service
pub struct CoordinatedBroker {
    config: BrokerConfig,
    paths: Paths,
    reader: ClusterReader,
    connector: Arc<dyn Connector>,
    state: Mutex<BrokerState>,
    master: watch::Sender<Machine>,
    connected: watch::Sender<Option<i64>>,
    events: mpsc::UnboundedSender<ClusterEvent>,
    pump: std::sync::Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl CoordinatedBroker {
    /// Create the broker and start its session pump
    pub fn start(
        config: BrokerConfig,
        connector: Arc<dyn Connector>,
        events: mpsc::UnboundedSender<ClusterEvent>,
    ) -> Arc<Self> {
        let (master, _) = watch::channel(NO_MACHINE);
        let (connected, _) = watch::channel(None);

        let broker = Arc::new(Self {
            paths: Paths::new(&config.cluster_name),
            reader: ClusterReader::new(&config.cluster_name),
            config,
            connector,
            state: Mutex::new(BrokerState {
                session: None,
                handled_session: 0,
                member_path: None,
                last_tx: -1,
                master_for_tx: NO_MASTER,
                connection_info: None,
            }),
            master,
            connected,
            events,
            pump: std::sync::Mutex::new(None),
            shut_down: AtomicBool::new(false),
        });

        let pump = tokio::spawn(Arc::clone(&broker).run());
        if let Ok(mut slot) = broker.pump.lock() {
            *slot = Some(pump);
        }

        broker
    }

    /// Session id of the live session, if connected
    pub fn session_id(&self) -> Option<i64> {
        *self.connected.borrow()
    }

    async fn run(self: Arc<Self>) {
        while !self.shut_down.load(Ordering::SeqCst) {
            let (session, mut events) = match self.connector.connect(self.config.session_timeout).await {
                Ok(opened) => opened,
                Err(e) => {
                    tracing::warn!("Unable to reach coordination service: {}", e);
                    tokio::time::sleep(RECONNECT_DELAY).await;
                    continue;
                }
            };
            self.state.lock().await.session = Some(session);

            while let Some(event) = events.recv().await {
                let result = match &event {
                    WatchedEvent::SyncConnected { session_id } => self.on_sync_connected(*session_id).await,
                    WatchedEvent::NodeDataChanged(path) => self.on_data_changed(path).await,
                    WatchedEvent::NodeChildrenChanged(path) => self.on_members_changed(path).await,
                    WatchedEvent::Expired => break,
                    WatchedEvent::Disconnected => {
                        tracing::warn!("Disconnected from coordination service");
                        Ok(())
                    }
                    other => {
                        tracing::trace!("Ignoring coordination event {:?}", other);
                        Ok(())
                    }
                };

                if let Err(e) = result {
                    tracing::warn!("Error handling coordination event {:?}: {}", event, e);
                }
            }

            if self.shut_down.load(Ordering::SeqCst) {
                break;
            }

            tracing::warn!("Coordination session expired, reconnecting");
            self.connected.send_replace(None);
            self.state.lock().await.session = None;
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    }

    async fn on_sync_connected(&self, session_id: i64) -> Result<()> {
        let session = self.session().await?;
        let previous = self.state.lock().await.handled_session;
        let new_session = previous != session_id;

        if new_session {
            self.setup(session.as_ref()).await?;
        }

        let master = self.read_master(session.as_ref()).await?;
        let changed = master.id != self.master.borrow().id;
        if new_session || changed {
            self.write_notify(session.as_ref(), master.id).await?;
            self.master.send_replace(master.clone());
        }

        self.state.lock().await.handled_session = session_id;
        self.connected.send_replace(Some(session_id));

        if (new_session || changed) && previous != 0 {
            tracing::info!("Coordination session {} established, master is {}", session_id, master);
            let _ = self.events.send(ClusterEvent::MasterChanged(master));
        }
        Ok(())
    }

    /// Create the cluster layout and this node's records for a new session
    async fn setup(&self, session: &dyn CoordinationSession) -> Result<()> {
        let my_id = self.config.machine_id;

        ensure_node(session, &self.paths.root, Vec::new()).await?;
        ensure_node(session, &self.paths.members, Vec::new()).await?;
        ensure_node(session, &self.paths.ha_servers, Vec::new()).await?;
        ensure_node(session, &self.paths.master_notify, encode_machine_id(NO_MACHINE.id)).await?;
        ensure_node(session, &self.paths.master_rebound, encode_machine_id(NO_MACHINE.id)).await?;

        // Records left by an earlier session of ours that has not expired yet
        let prefix = format!("{}_", my_id);
        for child in session.get_children(&self.paths.members, false).await? {
            if child.starts_with(&prefix) {
                let path = format!("{}/{}", self.paths.members, child);
                match session.delete(&path).await {
                    Ok(()) | Err(Error::NoNode(_)) => {}
                    Err(e) => return Err(e),
                }
            }
        }

        let ha_server = self.paths.ha_server(my_id);
        match session.delete(&ha_server).await {
            Ok(()) | Err(Error::NoNode(_)) => {}
            Err(e) => return Err(e),
        }
        session
            .create(
                &ha_server,
                encode_ha_server(&self.config.ha_server, self.config.backup_port)?,
                CreateMode::Ephemeral,
            )
            .await?;

        // Held across the create so a concurrent tx update lands on the new record
        let (member_path, info) = {
            let mut state = self.state.lock().await;
            let member_path = session
                .create(
                    &format!("{}/{}", self.paths.members, prefix),
                    encode_member(state.last_tx, state.master_for_tx),
                    CreateMode::EphemeralSequential,
                )
                .await?;
            state.member_path = Some(member_path.clone());
            (member_path, state.connection_info.clone())
        };

        if let Some(info) = info {
            self.write_info(session, &info).await?;
        }

        session.get_data(&self.paths.master_notify, true).await?;
        session.get_data(&self.paths.master_rebound, true).await?;
        session.get_children(&self.paths.members, true).await?;

        tracing::info!("Registered as {} in cluster {}", member_path, self.config.cluster_name);
        Ok(())
    }

    async fn on_data_changed(&self, path: &str) -> Result<()> {
        let session = self.session().await?;
        let my_id = self.config.machine_id;

        if path == self.paths.master_notify {
            session.get_data(path, true).await?;
            let master = self.refresh(session.as_ref()).await?;
            if master.id == my_id {
                tracing::info!("Master notification names this node");
                let _ = self.events.send(ClusterEvent::MasterChanged(master));
            }
        } else if path == self.paths.master_rebound {
            session.get_data(path, true).await?;
            let master = self.refresh(session.as_ref()).await?;
            if master.id != my_id {
                tracing::info!("Master rebound to {}", master);
                let _ = self.events.send(ClusterEvent::MasterChanged(master));
            }
        }
        Ok(())
    }

    async fn on_members_changed(&self, path: &str) -> Result<()> {
        if path != self.paths.members {
            return Ok(());
        }
        let session = self.session().await?;
        session.get_children(path, true).await?;

        let previous = self.master.borrow().id;
        let master = self.refresh(session.as_ref()).await?;
        if master.id != previous {
            tracing::info!("Membership changed, master moves from {} to {}", previous, master.id);
            self.write_notify(session.as_ref(), master.id).await?;
        }
        Ok(())
    }

    async fn session(&self) -> Result<Arc<dyn CoordinationSession>> {
        self.state
            .lock()
            .await
            .session
            .clone()
            .ok_or_else(|| Error::Connectivity("no coordination session".into()))
    }

    /// Block until a session is established, bounded by the session timeout
    async fn wait_for_sync_connected(&self) -> Result<Arc<dyn CoordinationSession>> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }

        let mut connected = self.connected.subscribe();
        let wait = connected.wait_for(|session| session.is_some());
        let ready = matches!(tokio::time::timeout(self.config.session_timeout, wait).await, Ok(Ok(_)));
        if !ready {
            return Err(Error::Connectivity(format!(
                "no coordination session within {:?}",
                self.config.session_timeout
            )));
        }
        self.session().await
    }

    async fn refresh(&self, session: &dyn CoordinationSession) -> Result<Machine> {
        let master = self.read_master(session).await?;
        self.master.send_replace(master.clone());
        Ok(master)
    }

    async fn read_master(&self, session: &dyn CoordinationSession) -> Result<Machine> {
        self.reader.master(session).await
    }

    async fn write_notify(&self, session: &dyn CoordinationSession, machine_id: i32) -> Result<()> {
        let current = session.get_data(&self.paths.master_notify, false).await?;
        if decode_machine_id(&current).ok() != Some(machine_id) {
            session
                .set_data(&self.paths.master_notify, encode_machine_id(machine_id))
                .await?;
        }
        Ok(())
    }

    async fn write_info(&self, session: &dyn CoordinationSession, info: &ConnectionInfo) -> Result<()> {
        let path = self.paths.ha_server_info(self.config.machine_id);
        let data = serde_json::to_vec(info).map_err(|e| Error::Internal(e.to_string()))?;
        match session.set_data(&path, data.clone()).await {
            Ok(()) => Ok(()),
            Err(Error::NoNode(_)) => session.create(&path, data, CreateMode::Ephemeral).await.map(|_| ()),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl Broker for CoordinatedBroker {
    fn my_machine_id(&self) -> i32 {
        self.config.machine_id
    }

    fn master_cached(&self) -> Machine {
        self.master.borrow().clone()
    }

    async fn master_forced(&self) -> Result<Machine> {
        let session = self.wait_for_sync_connected().await?;
        self.refresh(session.as_ref()).await
    }

    async fn create_cluster_or_join(&self, candidate: StoreId) -> Result<StoreId> {
        let session = self.wait_for_sync_connected().await?;
        ensure_node(session.as_ref(), &self.paths.root, Vec::new()).await?;

        match session
            .create(&self.paths.store_id, candidate.to_bytes().to_vec(), CreateMode::Persistent)
            .await
        {
            Ok(_) => {
                tracing::info!("Created cluster {} with store {}", self.config.cluster_name, candidate);
                Ok(candidate)
            }
            Err(Error::NodeExists(_)) => {
                let data = session.get_data(&self.paths.store_id, false).await?;
                let existing = StoreId::from_bytes(&data)?;
                tracing::info!("Cluster {} already exists with store {}", self.config.cluster_name, existing);
                Ok(existing)
            }
            Err(e) => Err(e),
        }
    }

    async fn register_self(&self, last_committed_tx: i64, master_for_tx: i32) -> Result<()> {
        self.set_last_committed_tx(last_committed_tx, master_for_tx).await
    }

    async fn set_last_committed_tx(&self, last_committed_tx: i64, master_for_tx: i32) -> Result<()> {
        let mut state = self.state.lock().await;
        state.last_tx = last_committed_tx;
        state.master_for_tx = master_for_tx;

        // Without a session the values go out with the next setup
        let (Some(member_path), Some(session)) = (state.member_path.clone(), state.session.clone()) else {
            return Ok(());
        };
        session
            .set_data(&member_path, encode_member(last_committed_tx, master_for_tx))
            .await
    }

    async fn notify_master_change(&self, machine_id: i32) -> Result<()> {
        let session = self.wait_for_sync_connected().await?;
        self.write_notify(session.as_ref(), machine_id).await
    }

    async fn rebind_as_master(&self) -> Result<()> {
        let session = self.wait_for_sync_connected().await?;
        session
            .set_data(&self.paths.master_rebound, encode_machine_id(self.config.machine_id))
            .await
    }

    async fn set_connection_information(&self, info: ConnectionInfo) -> Result<()> {
        self.state.lock().await.connection_info = Some(info.clone());
        let session = self.wait_for_sync_connected().await?;
        self.write_info(session.as_ref(), &info).await
    }

    async fn cluster_view(&self) -> Result<Vec<MemberView>> {
        let session = self.wait_for_sync_connected().await?;
        self.reader.view(session.as_ref()).await
    }

    async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let pump = self.pump.lock().ok().and_then(|mut slot| slot.take());
        if let Some(pump) = pump {
            pump.abort();
        }

        let session = self.state.lock().await.session.take();
        if let Some(session) = session {
            if let Err(e) = session.close().await {
                tracing::warn!("Error closing coordination session: {}", e);
            }
        }
        self.connected.send_replace(None);
        tracing::info!("Coordination broker stopped");
    }
}

/// Split a member node name `{id}_{seq}`
fn parse_member_name(name: &str) -> Option<(i32, i64)> {
    let (id, seq) = name.split_once('_')?;
    Some((id.parse().ok()?, seq.parse().ok()?))
}

fn encode_member(last_tx: i64, master_for_tx: i32) -> Vec<u8> {
    let mut data = Vec::with_capacity(12);
    data.extend_from_slice(&last_tx.to_be_bytes());
    data.extend_from_slice(&master_for_tx.to_be_bytes());
    data
}

fn decode_member(data: &[u8]) -> Result<(i64, i32)> {
    let mut reader = data;
    let tx = reader.read_i64::<BigEndian>()?;
    let master_for = reader.read_i32::<BigEndian>()?;
    Ok((tx, master_for))
}

fn encode_machine_id(machine_id: i32) -> Vec<u8> {
    machine_id.to_be_bytes().to_vec()
}

fn decode_machine_id(data: &[u8]) -> Result<i32> {
    let mut reader = data;
    Ok(reader.read_i32::<BigEndian>()?)
}

/// Backup port, then the length-prefixed address
pub fn encode_ha_server(address: &str, backup_port: i32) -> Result<Vec<u8>> {
    let mut data = Vec::with_capacity(6 + address.len());
    data.write_i32::<BigEndian>(backup_port)?;
    let len = u16::try_from(address.len())
        .map_err(|_| Error::Config(format!("Address too long: {}", address)))?;
    data.write_u16::<BigEndian>(len)?;
    data.extend_from_slice(address.as_bytes());
    Ok(data)
}

/// Parse an ha-server record into (backup port, address)
pub fn decode_ha_server(data: &[u8]) -> Result<(i32, String)> {
    let mut reader = data;
    let backup_port = reader.read_i32::<BigEndian>()?;
    let len = reader.read_u16::<BigEndian>()? as usize;
    if reader.len() < len {
        return Err(Error::Protocol("Truncated ha-server record".into()));
    }
    let address = String::from_utf8(reader[..len].to_vec())
        .map_err(|e| Error::Protocol(format!("Bad ha-server address: {}", e)))?;
    Ok((backup_port, address))
}
