//! Cluster Module
//!
//! Membership, master selection and the coordination sessions the node
//! uses to find its peers.

pub mod broker;
pub mod coordination;
pub mod machine;
pub mod selector;
pub mod zk;

pub use broker::{Broker, BrokerConfig, ClusterEvent, ClusterReader, ConnectionInfo, CoordinatedBroker, MemberView};
pub use coordination::{CoordinationSession, Connector, CreateMode, Ensemble, WatchedEvent};
pub use machine::{Machine, NO_MACHINE};
pub use selector::select_master;
pub use zk::ZkConnector;
