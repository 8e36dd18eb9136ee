//! Local Store
//!
//! The transactional data source a node owns while it holds a role:
//! per-resource transaction logs plus an embedded metadata database with
//! the store identity, id generator state and relationship types.
//!
//! # Layout
//!
//! ```text
//! <store dir>/
//!   neostore.db        store identity, ids, relationship types (SQLite)
//!   graph.log.0        sealed transaction log segment
//!   graph.log.1        active transaction log segment
//!   index.log.0        ...
//!   messages.log       diagnostics, never part of a store copy
//!   branched-<millis>/ archived diverged stores
//! ```

pub mod local;
pub mod meta;
pub mod segment;
pub mod txlog;

pub use local::{LocalStore, StoreSnapshot};
pub use meta::MetaStore;
pub use txlog::TxLog;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

use crate::error::{Error, Result};

/// Transaction id every store starts from
pub const BASE_TX_ID: i64 = 0;

/// Master id recorded for transactions that no master produced
pub const NO_MASTER: i32 = -1;

/// Name of the primary graph resource
pub const DEFAULT_RESOURCE: &str = "graph";

/// Name of the index resource
pub const INDEX_RESOURCE: &str = "index";

/// All resources a store carries, in a fixed order
pub const RESOURCES: [&str; 2] = [DEFAULT_RESOURCE, INDEX_RESOURCE];

/// Metadata file whose presence marks an existing store
pub const META_FILE: &str = "neostore.db";

/// Diagnostics file kept out of copies and branch handling
pub const MESSAGES_LOG: &str = "messages.log";

/// Version of the on-disk store layout
pub const STORE_VERSION: i64 = 1;

/// Identity of a cluster's store lineage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StoreId {
    /// Creation time in milliseconds since the epoch
    pub creation_time: i64,
    /// Random component
    pub random_id: i64,
    /// Store layout version
    pub store_version: i64,
}

impl StoreId {
    /// Serialized size in bytes
    pub const SIZE: usize = 24;

    /// Create a fresh store id
    pub fn new() -> Self {
        Self {
            creation_time: chrono::Utc::now().timestamp_millis(),
            random_id: rand::random::<i64>(),
            store_version: STORE_VERSION,
        }
    }

    /// Serialize as three big-endian i64 values
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..8].copy_from_slice(&self.creation_time.to_be_bytes());
        bytes[8..16].copy_from_slice(&self.random_id.to_be_bytes());
        bytes[16..24].copy_from_slice(&self.store_version.to_be_bytes());
        bytes
    }

    /// Parse from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(Error::Protocol(format!(
                "Store id needs {} bytes, got {}",
                Self::SIZE,
                bytes.len()
            )));
        }
        let read = |range: std::ops::Range<usize>| {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&bytes[range]);
            i64::from_be_bytes(buf)
        };
        Ok(Self {
            creation_time: read(0..8),
            random_id: read(8..16),
            store_version: read(16..24),
        })
    }
}

impl Default for StoreId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "StoreId[time:{}, id:{:x}, v:{}]",
            self.creation_time, self.random_id, self.store_version
        )
    }
}

/// A committed transaction as it travels between stores
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxRecord {
    /// Transaction id, dense per resource
    pub tx_id: i64,
    /// Machine id of the master that committed it
    pub master_id: i32,
    /// Opaque transaction body
    pub data: Vec<u8>,
}

impl TxRecord {
    /// Create a new record
    pub fn new(tx_id: i64, master_id: i32, data: Vec<u8>) -> Self {
        Self {
            tx_id,
            master_id,
            data,
        }
    }
}

/// Check whether a directory already holds a store
pub fn store_exists(dir: &Path) -> bool {
    dir.join(META_FILE).exists()
}

/// Check whether a resource name is known
pub fn is_known_resource(resource: &str) -> bool {
    RESOURCES.contains(&resource)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_id_bytes() {
        let id = StoreId::new();
        let parsed = StoreId::from_bytes(&id.to_bytes()).unwrap();
        assert_eq!(id, parsed);
        assert_eq!(parsed.store_version, STORE_VERSION);
    }

    #[test]
    fn test_store_id_short_input() {
        assert!(StoreId::from_bytes(&[0u8; 10]).is_err());
    }

    #[test]
    fn test_fresh_ids_differ() {
        assert_ne!(StoreId::new(), StoreId::new());
    }

    #[test]
    fn test_store_exists() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!store_exists(dir.path()));
        std::fs::write(dir.path().join(META_FILE), b"").unwrap();
        assert!(store_exists(dir.path()));
    }
}
