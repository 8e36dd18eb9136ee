//! WolfGraph - Highly Available Graph Store Replication
//!
//! The replication and failover core of a distributed graph store. A set
//! of peer nodes elects one writable master through a coordination
//! service; every other node is a slave that forwards writes to the master
//! and applies the transactions the master piggybacks on each reply.
//!
//! # Architecture
//!
//! Membership lives in the coordination service. The master is a pure
//! function of the observed members: highest committed transaction first,
//! then the incumbent, then the earliest joiner. Nodes reevaluate their
//! role whenever the broker reports a change.
//!
//! # Features
//!
//! - Deterministic master selection with incumbent preference
//! - Master protocol with transaction piggybacking on every response
//! - Full store copy and log positioning for joining nodes
//! - Branched data detection with archive, prune or stop policies
//! - Online backup endpoint and backup tool
//! - ZooKeeper-backed coordination, with an in-process ensemble for tests

pub mod config;
pub mod error;
pub mod network;
pub mod store;
pub mod cluster;
pub mod replication;
pub mod ha;

pub use config::WolfGraphConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::WolfGraphConfig;
    pub use crate::error::{Error, Result};
    pub use crate::cluster::{Broker, ClusterEvent, Machine};
    pub use crate::ha::{BranchedDataPolicy, HaNode, HaNodeConfig, Role};
    pub use crate::replication::{Master, MasterClient, ReplicationCursor};
    pub use crate::store::{LocalStore, StoreId};
}
