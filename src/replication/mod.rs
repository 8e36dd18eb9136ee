//! Replication Module
//!
//! The master protocol: the [`Master`] RPC surface, its server and client
//! sides, and the transports between them. Every response piggybacks the
//! transactions the requester's [`ReplicationCursor`] is missing.

pub mod apply;
pub mod client;
pub mod cursor;
pub mod locks;
pub mod master;
pub mod master_impl;
pub mod protocol;
pub mod server;
pub mod transport;
pub mod types;

pub use apply::{apply_response, current_cursor};
pub use client::MasterClient;
pub use cursor::{ReplicationCursor, TxOwner};
pub use locks::LockManager;
pub use master::{DirStoreWriter, Master, StoreWriter};
pub use master_impl::MasterImpl;
pub use server::{MasterServer, ServerMode};
pub use transport::{InProcessNetwork, MasterNetwork, MasterTransport, ServingHandle, TcpNetwork};
pub use types::{EntityKind, IdAllocation, IdType, LockMode, LockResult, LockStatus, ResourceTx, Response};
