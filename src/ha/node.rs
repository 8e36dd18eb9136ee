//! HA Node
//!
//! The role state machine. A node joins or initializes its cluster at
//! startup, then reevaluates its role whenever the broker reports a master
//! change. Every transition runs under one lock over [`RoleState`], so at
//! most one reevaluation is in flight and a role swap is all-or-nothing.
//!
//! Writes from the storage engine go through [`HaNode`] as well: on the
//! master they are served locally, on a slave they are forwarded and the
//! piggybacked transactions applied before the result is returned.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;

use super::bootstrap;
use super::branch::{self, BranchOutcome, BranchedDataPolicy};
use super::ids::SlaveIdAllocator;
use super::role::{Role, RoleState};
use crate::cluster::{Broker, BrokerConfig, ClusterEvent, ConnectionInfo, Connector, CoordinatedBroker, Machine, NO_MACHINE};
use crate::config::{SlaveUpdateMode, WolfGraphConfig};
use crate::error::{Error, Result};
use crate::replication::{
    apply_response, current_cursor, EntityKind, IdType, LockMode, Master, MasterClient, MasterImpl, MasterNetwork,
    MasterServer, ReplicationCursor, Response, ServerMode,
};
use crate::store::local::StoreOptions;
use crate::store::{store_exists, LocalStore, StoreId, DEFAULT_RESOURCE, NO_MASTER};

/// Pause between join or init attempts at startup
const JOIN_RETRY_INTERVAL: Duration = Duration::from_millis(300);

/// Settings of one HA node
#[derive(Debug, Clone)]
pub struct HaNodeConfig {
    pub machine_id: i32,
    pub cluster_name: String,
    pub data_dir: PathBuf,
    /// Address the master protocol binds to
    pub bind_address: String,
    /// Address published for other members
    pub advertise_address: String,
    /// Bind address of the backup endpoint, if enabled
    pub backup_address: Option<String>,
    pub backup_port: i32,
    pub allow_init_cluster: bool,
    pub pull_interval: Option<Duration>,
    pub branched_data_policy: BranchedDataPolicy,
    pub update_mode: SlaveUpdateMode,
    pub coordinator_timeout: Duration,
    pub read_timeout: Duration,
    pub lock_read_timeout: Duration,
    pub lock_timeout: Duration,
    pub join_timeout: Duration,
    pub copy_store_attempts: u32,
    pub copy_store_retry_interval: Duration,
    pub max_concurrent_channels: usize,
    pub store_options: StoreOptions,
}

impl From<&WolfGraphConfig> for HaNodeConfig {
    fn from(config: &WolfGraphConfig) -> Self {
        Self {
            machine_id: config.node.server_id,
            cluster_name: config.ha.cluster_name.clone(),
            data_dir: config.data_dir().clone(),
            bind_address: config.ha.server.clone(),
            advertise_address: config.advertise_address().to_string(),
            backup_address: config.backup_address(),
            backup_port: i32::from(config.ha.backup_port),
            allow_init_cluster: config.ha.allow_init_cluster,
            pull_interval: config.pull_interval(),
            branched_data_policy: config.ha.branched_data_policy,
            update_mode: config.ha.slave_coordinator_update_mode,
            coordinator_timeout: config.coordinator_timeout(),
            read_timeout: config.read_timeout(),
            lock_read_timeout: config.lock_read_timeout(),
            lock_timeout: config.lock_timeout(),
            join_timeout: config.join_timeout(),
            copy_store_attempts: config.ha.copy_store_attempts,
            copy_store_retry_interval: config.copy_store_retry_interval(),
            max_concurrent_channels: config.ha.max_concurrent_channels_per_slave,
            store_options: StoreOptions::from(&config.store),
        }
    }
}

/// Store and rpc of the running role, taken out of the lock for one call
struct Bound {
    role: Role,
    store: Arc<LocalStore>,
    rpc: Arc<dyn Master>,
}

/// A highly available graph store node
pub struct HaNode {
    config: HaNodeConfig,
    broker: Arc<dyn Broker>,
    network: Arc<dyn MasterNetwork>,
    state: Mutex<RoleState>,
    ids: SlaveIdAllocator,
    events: mpsc::UnboundedSender<ClusterEvent>,
    /// Wakes the async coordinator reporter
    report: Arc<Notify>,
    /// Startup time, used as the cursor session id
    session_id: i64,
    next_event: AtomicI64,
    copies: AtomicU64,
    event_loop: std::sync::Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
    me: Weak<HaNode>,
}

impl HaNode {
    /// Start a node: join or initialize the cluster, take a role and begin
    /// reacting to cluster events.
    pub async fn start(
        config: HaNodeConfig,
        connector: Arc<dyn Connector>,
        network: Arc<dyn MasterNetwork>,
    ) -> Result<Arc<Self>> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let broker = CoordinatedBroker::start(
            BrokerConfig {
                machine_id: config.machine_id,
                cluster_name: config.cluster_name.clone(),
                ha_server: config.advertise_address.clone(),
                backup_port: config.backup_port,
                session_timeout: config.coordinator_timeout,
            },
            connector,
            events_tx.clone(),
        );

        let node = Arc::new_cyclic(|me| Self {
            config,
            broker,
            network,
            state: Mutex::new(RoleState::default()),
            ids: SlaveIdAllocator::new(),
            events: events_tx,
            report: Arc::new(Notify::new()),
            session_id: chrono::Utc::now().timestamp_millis(),
            next_event: AtomicI64::new(1),
            copies: AtomicU64::new(0),
            event_loop: std::sync::Mutex::new(None),
            closed: AtomicBool::new(false),
            me: me.clone(),
        });

        tracing::info!(
            "Starting node {} in cluster {}",
            node.config.machine_id,
            node.config.cluster_name
        );

        if let Err(e) = node.startup().await {
            tracing::error!("Node {} failed to start: {}", node.config.machine_id, e);
            node.shutdown().await;
            return Err(e);
        }

        let handle = tokio::spawn(Self::run_events(Arc::downgrade(&node), events_rx));
        if let Ok(mut slot) = node.event_loop.lock() {
            *slot = Some(handle);
        }

        Ok(node)
    }

    async fn startup(&self) -> Result<()> {
        if !store_exists(&self.config.data_dir) {
            self.join_or_init().await?;
        }

        // The member record must reflect the store before anyone selects
        let store = LocalStore::open(&self.config.data_dir, self.config.store_options).await?;
        let published = self.publish_position(&store).await;
        store.close().await?;
        if let Err(e) = published {
            tracing::warn!("Unable to publish last committed tx: {}", e);
        }

        match self.new_master(None).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_connectivity() => {
                tracing::warn!("Initial reevaluation failed, retrying in the background: {}", e);
                let _ = self.events.send(ClusterEvent::Reevaluate(e.to_string()));
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Copy the store from the current master, or create the cluster if
    /// none exists and this node may
    async fn join_or_init(&self) -> Result<()> {
        let deadline = Instant::now() + self.config.join_timeout;
        let mut last_error: Option<Error> = None;

        loop {
            match self.try_join_or_init().await {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                Err(e) => {
                    tracing::debug!("Join attempt failed: {}", e);
                    last_error = Some(e);
                }
            }

            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(JOIN_RETRY_INTERVAL).await;
        }

        let reason = match last_error {
            Some(e) => format!("no store after {:?}, last error: {}", self.config.join_timeout, e),
            None => format!("no master found within {:?}", self.config.join_timeout),
        };
        Err(Error::BootstrapTimeout(reason))
    }

    async fn try_join_or_init(&self) -> Result<bool> {
        let master = self.broker.master_forced().await?;
        if !master.is_none() && master.id != self.config.machine_id {
            tracing::info!("Joining cluster through master {}", master);
            self.copy_store_from(&master).await?;
            return Ok(true);
        }

        if !self.config.allow_init_cluster {
            return Ok(false);
        }

        let candidate = StoreId::new();
        let cluster_store = self.broker.create_cluster_or_join(candidate).await?;
        if cluster_store != candidate {
            return Ok(false);
        }

        tokio::fs::create_dir_all(&self.config.data_dir).await?;
        let store = LocalStore::create(&self.config.data_dir, candidate, self.config.store_options).await?;
        store.close().await?;
        tracing::info!("Initialized cluster {} with store {}", self.config.cluster_name, candidate);
        Ok(true)
    }

    async fn run_events(me: Weak<HaNode>, mut events: mpsc::UnboundedReceiver<ClusterEvent>) {
        let mut pending = VecDeque::new();
        loop {
            let event = match pending.pop_front() {
                Some(event) => event,
                None => match events.recv().await {
                    Some(event) => event,
                    None => break,
                },
            };

            let Some(node) = me.upgrade() else { break };
            if node.is_closed() {
                break;
            }

            let unreachable = node.handle_event(event).await.is_err_and(|e| e.is_connectivity());
            if unreachable {
                let delay = node.config.copy_store_retry_interval;
                drop(node);
                tokio::time::sleep(delay).await;

                // failures reported while waiting collapse into one retry
                while let Ok(event) = events.try_recv() {
                    if !matches!(event, ClusterEvent::Reevaluate(_)) {
                        pending.push_back(event);
                    }
                }
                pending.push_back(ClusterEvent::Reevaluate("retry after connectivity failure".into()));
            }
        }
        tracing::debug!("Cluster event loop stopped");
    }

    async fn handle_event(&self, event: ClusterEvent) -> Result<()> {
        let result = match event {
            ClusterEvent::MasterChanged(master) => {
                tracing::debug!("Master change reported: {}", master);
                self.new_master(Some(master)).await
            }
            ClusterEvent::Reevaluate(reason) => {
                tracing::info!("Reevaluating: {}", reason);
                self.new_master(None).await
            }
            ClusterEvent::KernelPanic(reason) => {
                self.kernel_panic(&reason).await;
                Ok(())
            }
        };

        if let Err(e) = &result {
            tracing::warn!("Reevaluation failed: {}", e);
        }
        result
    }

    /// Reevaluate against `master`, or a freshly selected one. Branched
    /// data gets one recovery: the policy runs, a fresh copy is taken and
    /// the reevaluation is repeated.
    pub async fn new_master(&self, master: Option<Machine>) -> Result<()> {
        let mut state = self.state.lock().await;
        match self.do_new_master(&mut state, master.clone()).await {
            Err(e) if e.is_branched() => {
                tracing::warn!("{}, replacing local store", e);
                self.fresh_store_from_master(&mut state, master).await?;
                self.do_new_master(&mut state, None).await
            }
            other => other,
        }
    }

    async fn do_new_master(&self, state: &mut RoleState, master: Option<Machine>) -> Result<()> {
        if state.role == Role::ShuttingDown {
            return Err(Error::ShuttingDown);
        }

        match self.reevaluate(state, master).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_connectivity() => {
                if let Err(refresh) = self.broker.master_forced().await {
                    tracing::debug!("Master refresh failed: {}", refresh);
                }
                Err(e)
            }
            Err(e) if e.is_branched() => {
                self.internal_shutdown(state, false).await;
                state.cause_of_shutdown = Some(e.to_string());
                Err(e)
            }
            Err(e) => {
                tracing::error!("Reevaluation failed, stopping role: {}", e);
                self.internal_shutdown(state, false).await;
                state.cause_of_shutdown = Some(e.to_string());
                Err(e)
            }
        }
    }

    async fn reevaluate(&self, state: &mut RoleState, master: Option<Machine>) -> Result<()> {
        let master = match master {
            Some(master) if !master.is_none() => master,
            _ => self.broker.master_forced().await?,
        };
        if master.is_none() {
            return Err(Error::Connectivity("no master elected yet".into()));
        }

        let me = self.config.machine_id;
        let mut restarted = false;

        if master.id == me {
            if state.role != Role::Master || !state.is_running() {
                self.internal_shutdown(state, true).await;
                self.start_as_master(state, &master).await?;
                restarted = true;
            }
            self.broker.rebind_as_master().await?;
        } else {
            self.broker.notify_master_change(master.id).await?;
            if state.role != Role::Slave || !state.is_running() {
                self.internal_shutdown(state, true).await;
                self.start_as_slave(state, &master).await?;
                restarted = true;
            } else if state.master.id != master.id || state.master.address != master.address {
                self.rebind_slave(state, &master).await?;
            } else {
                self.ids.forget();
            }
            self.ensure_not_branched(state).await?;
        }

        if restarted {
            self.publish_connection_info(state).await;
        }
        Ok(())
    }

    async fn start_as_master(&self, state: &mut RoleState, master: &Machine) -> Result<()> {
        tracing::info!("Starting as master");
        let store = Arc::new(LocalStore::open(&self.config.data_dir, self.config.store_options).await?);
        let master_impl = Arc::new(
            MasterImpl::new(Arc::clone(&store), self.config.machine_id, self.config.lock_timeout)
                .with_broker(Arc::clone(&self.broker)),
        );
        let server = Arc::new(MasterServer::new(
            ServerMode::Master,
            Arc::clone(&master_impl),
            self.config.max_concurrent_channels,
        ));

        let handle = match self.network.serve(&self.config.bind_address, server).await {
            Ok(handle) => handle,
            Err(e) => {
                if let Err(close) = store.close().await {
                    tracing::warn!("Error closing store: {}", close);
                }
                return Err(e);
            }
        };

        state.lock_reaper = Some(self.spawn_lock_reaper(Arc::clone(&master_impl)));
        let rpc: Arc<dyn Master> = master_impl;
        self.ids.forget();
        state.store = Some(Arc::clone(&store));
        state.rpc = Some(rpc);
        state.master_server = Some(handle);
        state.master = master.clone();
        state.role = Role::Master;
        self.start_backup(state, &store).await;

        self.publish_position(&store).await?;
        tracing::info!(
            "Serving as master on {} with store {}",
            self.config.bind_address,
            store.store_id()
        );
        Ok(())
    }

    async fn start_as_slave(&self, state: &mut RoleState, master: &Machine) -> Result<()> {
        tracing::info!("Starting as slave of {}", master);
        let address = master_address(master)?;
        let store = Arc::new(LocalStore::open(&self.config.data_dir, self.config.store_options).await?);
        let rpc: Arc<dyn Master> = Arc::new(self.client_for(&address, Some(store.store_id()), true));

        self.ids.forget();
        state.store = Some(Arc::clone(&store));
        state.rpc = Some(rpc);
        state.master = master.clone();
        state.role = Role::Slave;
        self.start_backup(state, &store).await;

        if let Some(interval) = self.config.pull_interval {
            state.puller = Some(self.spawn_puller(interval));
        }
        if self.config.update_mode == SlaveUpdateMode::Async {
            state.reporter = Some(self.spawn_reporter());
        }

        if let Err(e) = self.publish_position(&store).await {
            tracing::warn!("Unable to publish last committed tx: {}", e);
        }
        Ok(())
    }

    /// Point a running slave at another master without touching its store
    async fn rebind_slave(&self, state: &mut RoleState, master: &Machine) -> Result<()> {
        let address = master_address(master)?;
        let store = state.store.clone().ok_or(Error::StoreClosed)?;
        tracing::info!("Following new master {} at {}", master.id, address);

        let rpc: Arc<dyn Master> = Arc::new(self.client_for(&address, Some(store.store_id()), true));
        if let Some(previous) = state.rpc.replace(rpc) {
            previous.shutdown().await;
        }
        state.master = master.clone();
        self.ids.forget();
        Ok(())
    }

    async fn start_backup(&self, state: &mut RoleState, store: &Arc<LocalStore>) {
        let Some(address) = self.config.backup_address.as_deref() else {
            return;
        };
        let backup = Arc::new(MasterImpl::new(
            Arc::clone(store),
            self.config.machine_id,
            self.config.lock_timeout,
        ));
        let server = Arc::new(MasterServer::new(
            ServerMode::Backup,
            backup,
            self.config.max_concurrent_channels,
        ));
        match self.network.serve(address, server).await {
            Ok(handle) => state.backup_server = Some(handle),
            Err(e) => tracing::warn!("Backup endpoint on {} not started: {}", address, e),
        }
    }

    /// Compare who committed our last transaction with what the master says
    async fn ensure_not_branched(&self, state: &RoleState) -> Result<()> {
        let (store, rpc) = state.bound()?;
        let last = store.last_committed_tx(DEFAULT_RESOURCE).await?;

        let mine = match store.master_for_committed_tx(DEFAULT_RESOURCE, last).await {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!("Unable to read master for local tx {}, skipping branch check: {}", last, e);
                return Ok(());
            }
        };

        let theirs = match rpc.get_master_id_for_committed_tx(last).await {
            Ok(response) => response.payload,
            Err(Error::TxNotFound { .. }) => {
                return Err(Error::BranchedData(format!(
                    "tx {} committed under master {} is unknown to the master",
                    last, mine
                )));
            }
            Err(e) => return Err(e),
        };

        if mine == NO_MASTER || mine == theirs {
            tracing::info!("Store consistent with master at tx {} (master {})", last, theirs);
            Ok(())
        } else {
            Err(Error::BranchedData(format!(
                "tx {} was committed under master {} here but under {} on the master",
                last, mine, theirs
            )))
        }
    }

    /// Clear the local store per policy and copy a fresh one
    async fn fresh_store_from_master(&self, state: &mut RoleState, master: Option<Machine>) -> Result<()> {
        self.internal_shutdown(state, false).await;

        let policy = self.config.branched_data_policy;
        let now = chrono::Utc::now().timestamp_millis();
        if policy.handle(&self.config.data_dir, now)? == BranchOutcome::Shutdown {
            let cause = "branched data with shutdown policy".to_string();
            tracing::error!("Stopping node: {}", cause);
            self.shutdown_locked(state, Some(cause.clone())).await;
            return Err(Error::BranchedData(cause));
        }

        let me = self.config.machine_id;
        let mut master = match master {
            Some(master) if !master.is_none() && master.id != me => master,
            _ => self.broker.master_forced().await?,
        };

        let attempts = self.config.copy_store_attempts.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            match self.copy_store_from(&master).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!("Store copy attempt {}/{} from {} failed: {}", attempt, attempts, master, e);
                    last_error = Some(e);
                }
            }

            if attempt < attempts {
                tokio::time::sleep(self.config.copy_store_retry_interval).await;
                match self.broker.master_forced().await {
                    Ok(current) => master = current,
                    Err(e) => tracing::debug!("Master refresh failed: {}", e),
                }
            }
        }

        let reason = last_error.map(|e| e.to_string()).unwrap_or_default();
        Err(Error::CopyFailed(format!("gave up after {} attempts: {}", attempts, reason)))
    }

    async fn copy_store_from(&self, master: &Machine) -> Result<()> {
        let address = master_address(master)?;

        // leftovers of an earlier failed attempt
        let leftovers = BranchedDataPolicy::KeepNone.plan(&self.config.data_dir, 0)?;
        branch::execute(&leftovers);

        let client = self.client_for(&address, None, false);
        let copied = bootstrap::copy_from_master(
            &client,
            &self.config.data_dir,
            self.config.machine_id,
            self.config.store_options,
        )
        .await;
        client.shutdown().await;

        let store = copied?;
        let last = store.last_committed_tx(DEFAULT_RESOURCE).await;
        store.close().await?;

        self.copies.fetch_add(1, Ordering::SeqCst);
        tracing::info!(
            "Copied store from master {} at {}, last committed tx {:?}",
            master.id,
            address,
            last
        );
        Ok(())
    }

    /// Stop everything the current role holds. Failures are logged and
    /// the remaining steps still run.
    async fn internal_shutdown(&self, state: &mut RoleState, rotate_logs: bool) {
        if let Some(puller) = state.puller.take() {
            puller.abort();
        }
        if let Some(reporter) = state.reporter.take() {
            reporter.abort();
        }
        if let Some(reaper) = state.lock_reaper.take() {
            reaper.abort();
        }
        if let Some(server) = state.master_server.take() {
            server.stop().await;
        }
        if let Some(server) = state.backup_server.take() {
            server.stop().await;
        }
        if let Some(rpc) = state.rpc.take() {
            rpc.shutdown().await;
        }
        if let Some(store) = state.store.take() {
            if rotate_logs {
                if let Err(e) = store.rotate_logs().await {
                    tracing::warn!("Unable to rotate logs of {}: {}", store.dir().display(), e);
                }
            }
            if let Err(e) = store.close().await {
                tracing::warn!("Error closing store {}: {}", store.dir().display(), e);
            }
        }

        if state.role != Role::Uninitialized && state.role != Role::ShuttingDown {
            tracing::info!("Stopped {} role", state.role);
            state.role = Role::Uninitialized;
        }
        state.master = NO_MACHINE;
    }

    /// Restart the store after it refused writes
    async fn kernel_panic(&self, reason: &str) {
        tracing::error!("Kernel panic, restarting store: {}", reason);
        {
            let mut state = self.state.lock().await;
            if state.role == Role::ShuttingDown {
                return;
            }
            self.internal_shutdown(&mut state, true).await;
            state.cause_of_shutdown = Some(reason.to_string());
        }

        if let Err(e) = self.new_master(None).await {
            tracing::error!("Restart after kernel panic failed: {}", e);
        }
    }

    async fn publish_connection_info(&self, state: &RoleState) {
        let info = ConnectionInfo {
            machine_id: self.config.machine_id,
            role: state.role.to_string(),
            address: self.config.advertise_address.clone(),
            backup_port: self.config.backup_port,
            store_id: state.store.as_ref().map(|store| store.store_id().to_string()),
        };
        if let Err(e) = self.broker.set_connection_information(info).await {
            tracing::warn!("Unable to publish connection information: {}", e);
        }
    }

    async fn publish_position(&self, store: &LocalStore) -> Result<()> {
        let last = store.last_committed_tx(DEFAULT_RESOURCE).await?;
        let master_for = store
            .master_for_committed_tx(DEFAULT_RESOURCE, last)
            .await
            .unwrap_or(NO_MASTER);
        self.broker.set_last_committed_tx(last, master_for).await
    }

    fn client_for(&self, address: &str, store_id: Option<StoreId>, report_failures: bool) -> MasterClient {
        let client = MasterClient::new(
            self.network.connect(address),
            store_id,
            self.config.read_timeout,
            self.config.lock_read_timeout,
        );
        if report_failures {
            client.with_events(self.events.clone())
        } else {
            client
        }
    }

    fn spawn_puller(&self, interval: Duration) -> JoinHandle<()> {
        let me = self.me.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(node) = me.upgrade() else { break };
                if let Err(e) = node.pull_updates().await {
                    tracing::debug!("Pulling updates failed: {}", e);
                }
            }
        })
    }

    fn spawn_reporter(&self) -> JoinHandle<()> {
        let me = self.me.clone();
        let report = Arc::clone(&self.report);
        tokio::spawn(async move {
            loop {
                report.notified().await;
                let Some(node) = me.upgrade() else { break };
                let store = node.state.lock().await.store.clone();
                if let Some(store) = store {
                    if let Err(e) = node.publish_position(&store).await {
                        tracing::debug!("Reporting last committed tx failed: {}", e);
                    }
                }
            }
        })
    }

    /// Free locks of slave transactions silent for longer than a request
    /// may take, such as those of a crashed slave
    fn spawn_lock_reaper(&self, master: Arc<MasterImpl>) -> JoinHandle<()> {
        let max_idle = self.config.read_timeout;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval((max_idle / 2).max(Duration::from_millis(10)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                master.reap_idle_locks(max_idle);
            }
        })
    }

    async fn bound(&self) -> Result<Bound> {
        let state = self.state.lock().await;
        let (store, rpc) = state.bound()?;
        Ok(Bound {
            role: state.role,
            store,
            rpc,
        })
    }

    async fn cursor(&self, store: &LocalStore, event_id: i64) -> Result<ReplicationCursor> {
        current_cursor(store, self.session_id, self.config.machine_id, event_id).await
    }

    /// Apply what a response carries, then publish per the update mode
    async fn receive<T>(&self, bound: &Bound, cursor: &mut ReplicationCursor, response: Response<T>) -> Result<T> {
        let received = !response.transactions.is_empty();
        match apply_response(&bound.store, cursor, response).await {
            Ok(payload) => {
                if received && bound.role == Role::Slave {
                    self.after_apply(&bound.store).await;
                }
                Ok(payload)
            }
            Err(e) => {
                if e.is_kernel_panic() {
                    let _ = self.events.send(ClusterEvent::KernelPanic(e.to_string()));
                } else if matches!(e, Error::TxGap { .. }) {
                    let _ = self.events.send(ClusterEvent::Reevaluate(e.to_string()));
                }
                Err(e)
            }
        }
    }

    async fn after_apply(&self, store: &LocalStore) {
        match self.config.update_mode {
            SlaveUpdateMode::Sync => {
                if let Err(e) = self.publish_position(store).await {
                    tracing::debug!("Publishing last committed tx failed: {}", e);
                }
            }
            SlaveUpdateMode::Async => self.report.notify_one(),
            SlaveUpdateMode::None => {}
        }
    }

    /// New transaction (event) id for lock ownership
    pub fn begin_tx(&self) -> i64 {
        self.next_event.fetch_add(1, Ordering::SeqCst)
    }

    /// Next id of `id_type`, from the cached block or a new allocation
    pub async fn allocate_id(&self, id_type: IdType) -> Result<i64> {
        if let Some(id) = self.ids.take(id_type) {
            return Ok(id);
        }

        let bound = self.bound().await?;
        let allocation = bound.rpc.allocate_ids(id_type).await?.payload;
        if bound.role == Role::Slave {
            let meta = bound.store.meta().await?;
            meta.raise_high_id(id_type.code(), allocation.highest_id_in_use + 1).await?;
        }

        self.ids.fill(id_type, &allocation);
        self.ids
            .take(id_type)
            .ok_or_else(|| Error::Internal(format!("master granted no {:?} ids", id_type)))
    }

    /// Return an id for reuse. Only the master keeps free lists.
    pub async fn free_id(&self, id_type: IdType, id: i64) -> Result<()> {
        let bound = self.bound().await?;
        if bound.role != Role::Master {
            return Ok(());
        }
        bound.store.meta().await?.free_ids(id_type.code(), &[id]).await
    }

    /// Id of a relationship type, created on the master if new
    pub async fn create_relationship_type(&self, name: &str) -> Result<i32> {
        let bound = self.bound().await?;
        let meta = bound.store.meta().await?;
        if let Some(id) = meta.relationship_type(name).await? {
            return Ok(id);
        }

        let mut cursor = self.cursor(&bound.store, self.begin_tx()).await?;
        let response = bound.rpc.create_relationship_type(&cursor, name).await?;
        let id = self.receive(&bound, &mut cursor, response).await?;
        if bound.role == Role::Slave {
            meta.record_relationship_type(name, id).await?;
        }
        Ok(id)
    }

    /// Lock entities for transaction `event_id`
    pub async fn acquire_lock(&self, event_id: i64, kind: EntityKind, mode: LockMode, ids: &[i64]) -> Result<()> {
        let bound = self.bound().await?;
        let mut cursor = self.cursor(&bound.store, event_id).await?;
        let response = bound.rpc.acquire_lock(&cursor, kind, mode, ids).await?;
        self.receive(&bound, &mut cursor, response).await?.into_result()
    }

    /// Commit a transaction through the master. Returns the tx id the
    /// master assigned; the tx is applied locally before returning.
    pub async fn commit(&self, event_id: i64, resource: &str, data: Vec<u8>) -> Result<i64> {
        let bound = self.bound().await?;
        let mut cursor = self.cursor(&bound.store, event_id).await?;
        let response = bound
            .rpc
            .commit_single_resource_transaction(&cursor, resource, data)
            .await?;
        self.receive(&bound, &mut cursor, response).await
    }

    /// End transaction `event_id`, releasing its locks
    pub async fn finish_tx(&self, event_id: i64) -> Result<()> {
        let bound = self.bound().await?;
        let mut cursor = self.cursor(&bound.store, event_id).await?;
        let response = bound.rpc.finish_transaction(&cursor).await?;
        self.receive(&bound, &mut cursor, response).await
    }

    /// Fetch and apply everything the master has that this node lacks
    pub async fn pull_updates(&self) -> Result<()> {
        let bound = self.bound().await?;
        if bound.role != Role::Slave {
            return Ok(());
        }
        let mut cursor = self.cursor(&bound.store, 0).await?;
        let response = bound.rpc.pull_updates(&cursor).await?;
        self.receive(&bound, &mut cursor, response).await
    }

    /// Last committed tx of `resource` in the local store
    pub async fn last_committed_tx(&self, resource: &str) -> Result<i64> {
        let store = self.store().await.ok_or(Error::StoreClosed)?;
        store.last_committed_tx(resource).await
    }

    pub async fn role(&self) -> Role {
        self.state.lock().await.role
    }

    pub async fn is_master(&self) -> bool {
        self.role().await == Role::Master
    }

    /// Master the current role is bound to
    pub async fn master(&self) -> Machine {
        self.state.lock().await.master.clone()
    }

    /// Store handle of the current role
    pub async fn store(&self) -> Option<Arc<LocalStore>> {
        self.state.lock().await.store.clone()
    }

    pub async fn cause_of_shutdown(&self) -> Option<String> {
        self.state.lock().await.cause_of_shutdown.clone()
    }

    pub fn machine_id(&self) -> i32 {
        self.config.machine_id
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// Full store copies taken since startup
    pub fn store_copy_count(&self) -> u64 {
        self.copies.load(Ordering::SeqCst)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop the node for good. Later calls are no-ops.
    pub async fn shutdown(&self) {
        if self.is_closed() {
            return;
        }
        let event_loop = self.event_loop.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = event_loop {
            handle.abort();
        }

        let mut state = self.state.lock().await;
        self.shutdown_locked(&mut state, None).await;
    }

    async fn shutdown_locked(&self, state: &mut RoleState, cause: Option<String>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.internal_shutdown(state, false).await;
        state.role = Role::ShuttingDown;
        if cause.is_some() {
            state.cause_of_shutdown = cause;
        }
        self.broker.shutdown().await;
        tracing::info!("Node {} shut down", self.config.machine_id);
    }
}

fn master_address(master: &Machine) -> Result<String> {
    master
        .address
        .clone()
        .ok_or_else(|| Error::Connectivity(format!("master {} has not published an address", master.id)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    use crate::cluster::Ensemble;
    use crate::replication::InProcessNetwork;
    use crate::store::INDEX_RESOURCE;

    fn config(dir: &Path, id: i32) -> HaNodeConfig {
        let address = format!("node-{}:6361", id);
        HaNodeConfig {
            machine_id: id,
            cluster_name: "test.ha".into(),
            data_dir: dir.to_path_buf(),
            bind_address: address.clone(),
            advertise_address: address,
            backup_address: None,
            backup_port: 0,
            allow_init_cluster: true,
            pull_interval: None,
            branched_data_policy: BranchedDataPolicy::KeepAll,
            update_mode: SlaveUpdateMode::Sync,
            coordinator_timeout: Duration::from_secs(2),
            read_timeout: Duration::from_secs(2),
            lock_read_timeout: Duration::from_secs(2),
            lock_timeout: Duration::from_secs(2),
            join_timeout: Duration::from_secs(10),
            copy_store_attempts: 5,
            copy_store_retry_interval: Duration::from_millis(100),
            max_concurrent_channels: 20,
            store_options: StoreOptions {
                compression: true,
                fsync: false,
            },
        }
    }

    async fn seed_store(dir: &Path, store_id: StoreId, master_id: i32, txs: usize) {
        let store = LocalStore::create(dir, store_id, StoreOptions::default()).await.unwrap();
        for i in 0..txs {
            store.commit(DEFAULT_RESOURCE, master_id, vec![i as u8; 8]).await.unwrap();
        }
        store.close().await.unwrap();
    }

    async fn start(ensemble: &Ensemble, network: &InProcessNetwork, config: HaNodeConfig) -> Result<Arc<HaNode>> {
        HaNode::start(config, Arc::new(ensemble.clone()), Arc::new(network.clone())).await
    }

    async fn wait_for_role(node: &HaNode, role: Role) -> bool {
        for _ in 0..100 {
            if node.role().await == role {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    fn archives(dir: &Path) -> Vec<PathBuf> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(branch::BRANCH_PREFIX))
            })
            .collect()
    }

    #[tokio::test]
    async fn test_branched_slave_recovers_with_one_copy() {
        let ensemble = Ensemble::new();
        let network = InProcessNetwork::new();
        let master_dir = tempfile::tempdir().unwrap();
        let slave_dir = tempfile::tempdir().unwrap();

        let store_id = StoreId::new();
        seed_store(master_dir.path(), store_id, 2, 101).await;
        seed_store(slave_dir.path(), store_id, 1, 100).await;

        let master = start(&ensemble, &network, config(master_dir.path(), 2)).await.unwrap();
        assert_eq!(master.role().await, Role::Master);

        let slave = start(&ensemble, &network, config(slave_dir.path(), 1)).await.unwrap();
        assert_eq!(slave.role().await, Role::Slave);
        assert_eq!(slave.store_copy_count(), 1);
        assert_eq!(slave.last_committed_tx(DEFAULT_RESOURCE).await.unwrap(), 101);

        let archived = archives(slave_dir.path());
        assert_eq!(archived.len(), 1);
        assert!(archived[0].join("neostore.db").exists());

        slave.shutdown().await;
        master.shutdown().await;
    }

    #[tokio::test]
    async fn test_consistent_slave_keeps_store() {
        let ensemble = Ensemble::new();
        let network = InProcessNetwork::new();
        let master_dir = tempfile::tempdir().unwrap();
        let slave_dir = tempfile::tempdir().unwrap();
        seed_store(master_dir.path(), StoreId::new(), 2, 5).await;

        let master = start(&ensemble, &network, config(master_dir.path(), 2)).await.unwrap();
        let slave = start(&ensemble, &network, config(slave_dir.path(), 1)).await.unwrap();
        assert_eq!(slave.role().await, Role::Slave);
        assert_eq!(slave.store_copy_count(), 1);
        assert!(archives(slave_dir.path()).is_empty());

        let before = slave.store().await.unwrap();
        let bound_master = slave.master().await;
        assert_eq!(bound_master.id, 2);

        slave.new_master(Some(bound_master)).await.unwrap();
        let after = slave.store().await.unwrap();
        assert!(Arc::ptr_eq(&before, &after));
        assert_eq!(slave.store_copy_count(), 1);

        slave.shutdown().await;
        master.shutdown().await;
    }

    #[tokio::test]
    async fn test_writes_through_slave() {
        let ensemble = Ensemble::new();
        let network = InProcessNetwork::new();
        let master_dir = tempfile::tempdir().unwrap();
        let slave_dir = tempfile::tempdir().unwrap();
        seed_store(master_dir.path(), StoreId::new(), 2, 5).await;

        let master = start(&ensemble, &network, config(master_dir.path(), 2)).await.unwrap();
        let slave = start(&ensemble, &network, config(slave_dir.path(), 1)).await.unwrap();

        let event = slave.begin_tx();
        slave
            .acquire_lock(event, EntityKind::Node, LockMode::Write, &[1, 2])
            .await
            .unwrap();
        let tx = slave.commit(event, DEFAULT_RESOURCE, b"from slave".to_vec()).await.unwrap();
        slave.finish_tx(event).await.unwrap();

        assert_eq!(tx, 6);
        assert_eq!(slave.last_committed_tx(DEFAULT_RESOURCE).await.unwrap(), 6);
        assert_eq!(master.last_committed_tx(DEFAULT_RESOURCE).await.unwrap(), 6);

        // a master commit reaches the slave on its next pull
        let event = master.begin_tx();
        master.commit(event, INDEX_RESOURCE, b"from master".to_vec()).await.unwrap();
        master.finish_tx(event).await.unwrap();
        slave.pull_updates().await.unwrap();
        assert_eq!(slave.last_committed_tx(INDEX_RESOURCE).await.unwrap(), 1);

        let from_slave = slave.allocate_id(IdType::Node).await.unwrap();
        let from_master = master.allocate_id(IdType::Node).await.unwrap();
        assert_ne!(from_slave, from_master);

        let knows = slave.create_relationship_type("KNOWS").await.unwrap();
        assert_eq!(master.create_relationship_type("KNOWS").await.unwrap(), knows);
        assert_eq!(slave.create_relationship_type("KNOWS").await.unwrap(), knows);

        slave.shutdown().await;
        master.shutdown().await;
    }

    #[tokio::test]
    async fn test_locks_of_crashed_slave_are_reaped() {
        let ensemble = Ensemble::new();
        let network = InProcessNetwork::new();
        let master_dir = tempfile::tempdir().unwrap();
        let slave_dir = tempfile::tempdir().unwrap();
        seed_store(master_dir.path(), StoreId::new(), 2, 3).await;

        let mut master_config = config(master_dir.path(), 2);
        master_config.read_timeout = Duration::from_millis(300);
        let master = start(&ensemble, &network, master_config).await.unwrap();
        let slave = start(&ensemble, &network, config(slave_dir.path(), 1)).await.unwrap();

        let event = slave.begin_tx();
        slave
            .acquire_lock(event, EntityKind::Node, LockMode::Write, &[7])
            .await
            .unwrap();
        slave.shutdown().await;

        let event = master.begin_tx();
        master
            .acquire_lock(event, EntityKind::Node, LockMode::Write, &[7])
            .await
            .unwrap();
        master.finish_tx(event).await.unwrap();

        master.shutdown().await;
    }

    #[tokio::test]
    async fn test_restarted_slave_releases_earlier_locks() {
        let ensemble = Ensemble::new();
        let network = InProcessNetwork::new();
        let master_dir = tempfile::tempdir().unwrap();
        let slave_dir = tempfile::tempdir().unwrap();
        seed_store(master_dir.path(), StoreId::new(), 2, 3).await;

        let mut master_config = config(master_dir.path(), 2);
        master_config.lock_timeout = Duration::from_millis(300);
        let master = start(&ensemble, &network, master_config).await.unwrap();
        let slave = start(&ensemble, &network, config(slave_dir.path(), 1)).await.unwrap();

        let event = slave.begin_tx();
        slave
            .acquire_lock(event, EntityKind::Node, LockMode::Write, &[7])
            .await
            .unwrap();
        slave.shutdown().await;
        drop(slave);

        tokio::time::sleep(Duration::from_millis(10)).await;
        let slave = start(&ensemble, &network, config(slave_dir.path(), 1)).await.unwrap();
        assert_eq!(slave.role().await, Role::Slave);
        slave.pull_updates().await.unwrap();

        let event = master.begin_tx();
        master
            .acquire_lock(event, EntityKind::Node, LockMode::Write, &[7])
            .await
            .unwrap();

        slave.shutdown().await;
        master.shutdown().await;
    }

    #[tokio::test]
    async fn test_slave_takes_over_when_master_leaves() {
        let ensemble = Ensemble::new();
        let network = InProcessNetwork::new();
        let master_dir = tempfile::tempdir().unwrap();
        let slave_dir = tempfile::tempdir().unwrap();
        seed_store(master_dir.path(), StoreId::new(), 2, 3).await;

        let master = start(&ensemble, &network, config(master_dir.path(), 2)).await.unwrap();
        let slave = start(&ensemble, &network, config(slave_dir.path(), 1)).await.unwrap();
        assert_eq!(slave.role().await, Role::Slave);

        master.shutdown().await;
        assert!(wait_for_role(&slave, Role::Master).await);

        let event = slave.begin_tx();
        let tx = slave.commit(event, DEFAULT_RESOURCE, b"after failover".to_vec()).await.unwrap();
        assert_eq!(tx, 4);

        slave.shutdown().await;
    }

    #[tokio::test]
    async fn test_two_fresh_nodes_form_one_cluster() {
        let ensemble = Ensemble::new();
        let network = InProcessNetwork::new();
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();

        let (a, b) = tokio::join!(
            start(&ensemble, &network, config(dir_a.path(), 1)),
            start(&ensemble, &network, config(dir_b.path(), 2)),
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        let roles = [a.role().await, b.role().await];
        assert!(roles.contains(&Role::Master));
        assert!(roles.contains(&Role::Slave));

        let store_a = a.store().await.unwrap().store_id();
        let store_b = b.store().await.unwrap().store_id();
        assert_eq!(store_a, store_b);

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn test_no_master_and_no_init_times_out() {
        let ensemble = Ensemble::new();
        let network = InProcessNetwork::new();
        let dir = tempfile::tempdir().unwrap();

        let mut config = config(dir.path(), 1);
        config.allow_init_cluster = false;
        config.join_timeout = Duration::from_millis(500);

        let result = start(&ensemble, &network, config).await;
        assert!(matches!(result, Err(Error::BootstrapTimeout(_))));
        assert!(!store_exists(dir.path()));
    }

    #[tokio::test]
    async fn test_branch_check_skipped_without_local_history() {
        let ensemble = Ensemble::new();
        let network = InProcessNetwork::new();
        let master_dir = tempfile::tempdir().unwrap();
        let slave_dir = tempfile::tempdir().unwrap();

        let store_id = StoreId::new();
        seed_store(master_dir.path(), store_id, 2, 3).await;

        // same tx under another master, but the segment that recorded it is gone
        seed_store(slave_dir.path(), store_id, 1, 3).await;
        let store = LocalStore::open(slave_dir.path(), StoreOptions::default()).await.unwrap();
        store.rotate_logs().await.unwrap();
        store.close().await.unwrap();
        std::fs::remove_file(slave_dir.path().join("graph.log.0")).unwrap();

        let master = start(&ensemble, &network, config(master_dir.path(), 2)).await.unwrap();
        let slave = start(&ensemble, &network, config(slave_dir.path(), 1)).await.unwrap();

        assert_eq!(slave.role().await, Role::Slave);
        assert_eq!(slave.store_copy_count(), 0);
        assert!(archives(slave_dir.path()).is_empty());
        let store = slave.store().await.unwrap();
        assert!(store.master_for_committed_tx(DEFAULT_RESOURCE, 3).await.is_err());

        slave.shutdown().await;
        master.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_policy_stops_node() {
        let ensemble = Ensemble::new();
        let network = InProcessNetwork::new();
        let master_dir = tempfile::tempdir().unwrap();
        let slave_dir = tempfile::tempdir().unwrap();

        let store_id = StoreId::new();
        seed_store(master_dir.path(), store_id, 2, 11).await;
        seed_store(slave_dir.path(), store_id, 1, 10).await;

        let master = start(&ensemble, &network, config(master_dir.path(), 2)).await.unwrap();

        let mut slave_config = config(slave_dir.path(), 1);
        slave_config.branched_data_policy = BranchedDataPolicy::Shutdown;
        let result = start(&ensemble, &network, slave_config).await;
        assert!(matches!(result, Err(Error::BranchedData(_))));
        assert!(store_exists(slave_dir.path()));
        assert!(archives(slave_dir.path()).is_empty());

        master.shutdown().await;
    }
}
