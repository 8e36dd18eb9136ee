//! Replication Value Types

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::store::TxRecord;

/// Kinds of primary-key id handed out by the master
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum IdType {
    Node = 0,
    Relationship = 1,
    Property = 2,
    StringBlock = 3,
    ArrayBlock = 4,
    PropertyIndex = 5,
    PropertyIndexBlock = 6,
    RelationshipType = 7,
    RelationshipTypeBlock = 8,
}

impl IdType {
    /// Every id type
    pub const ALL: [IdType; 9] = [
        IdType::Node,
        IdType::Relationship,
        IdType::Property,
        IdType::StringBlock,
        IdType::ArrayBlock,
        IdType::PropertyIndex,
        IdType::PropertyIndexBlock,
        IdType::RelationshipType,
        IdType::RelationshipTypeBlock,
    ];

    /// Wire code
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Parse a wire code
    pub fn from_code(code: u8) -> Result<Self> {
        Self::ALL
            .get(code as usize)
            .copied()
            .ok_or_else(|| Error::Protocol(format!("Unknown id type {}", code)))
    }

    /// Number of ids granted per allocation
    pub fn grab_size(self) -> usize {
        match self {
            IdType::PropertyIndex => 50,
            _ => 1000,
        }
    }
}

/// A block of ids granted to a requester
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdAllocation {
    /// Reused ids, handed out before the range
    pub defragmented_ids: Vec<i64>,
    /// First id of the fresh range
    pub range_start: i64,
    /// Length of the fresh range
    pub range_length: u32,
    /// Highest id in use after this allocation
    pub highest_id_in_use: i64,
    /// Number of defragmented ids
    pub defrag_count: i64,
}

impl IdAllocation {
    /// Total number of ids in the allocation
    pub fn len(&self) -> usize {
        self.defragmented_ids.len() + self.range_length as usize
    }

    /// True if the allocation grants nothing
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every id in hand-out order
    pub fn ids(&self) -> impl Iterator<Item = i64> + '_ {
        let range = self.range_start..self.range_start + self.range_length as i64;
        self.defragmented_ids.iter().copied().chain(range)
    }
}

/// Outcome of a lock request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum LockStatus {
    /// Granted
    Ok = 0,
    /// Not granted within the lock timeout
    NotLocked = 1,
    /// Granting would close a wait cycle
    Deadlock = 2,
}

impl LockStatus {
    /// Parse a wire code
    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(LockStatus::Ok),
            1 => Ok(LockStatus::NotLocked),
            2 => Ok(LockStatus::Deadlock),
            other => Err(Error::Protocol(format!("Unknown lock status {}", other))),
        }
    }
}

/// Result of a lock request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockResult {
    /// Status
    pub status: LockStatus,
    /// Explanation, set for deadlocks
    pub message: Option<String>,
}

impl LockResult {
    /// Lock granted
    pub fn ok() -> Self {
        Self {
            status: LockStatus::Ok,
            message: None,
        }
    }

    /// Lock not granted in time
    pub fn not_locked() -> Self {
        Self {
            status: LockStatus::NotLocked,
            message: None,
        }
    }

    /// Lock would deadlock
    pub fn deadlock(message: impl Into<String>) -> Self {
        Self {
            status: LockStatus::Deadlock,
            message: Some(message.into()),
        }
    }

    /// Turn a refused lock into the matching error
    pub fn into_result(self) -> Result<()> {
        match self.status {
            LockStatus::Ok => Ok(()),
            LockStatus::NotLocked => Err(Error::LockTimeout("lock not granted by master".into())),
            LockStatus::Deadlock => Err(Error::Deadlock(
                self.message.unwrap_or_else(|| "deadlock detected on master".into()),
            )),
        }
    }
}

/// Entity a lock protects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Node,
    Relationship,
}

/// Lock mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockMode {
    Read,
    Write,
}

/// Transaction piggybacked on a response, tagged with its resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceTx {
    /// Resource name
    pub resource: String,
    /// Transaction
    pub tx: TxRecord,
}

/// Reply from the master: the payload plus every transaction the
/// requester has not applied yet. The transactions must be applied, in
/// order, before the payload is trusted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response<T> {
    /// Type-specific result
    pub payload: T,
    /// Outstanding transactions, ordered per resource
    pub transactions: Vec<ResourceTx>,
}

impl<T> Response<T> {
    /// Response without piggybacked transactions
    pub fn bare(payload: T) -> Self {
        Self {
            payload,
            transactions: Vec::new(),
        }
    }

    /// Replace the payload, keeping the transactions
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Response<U> {
        Response {
            payload: f(self.payload),
            transactions: self.transactions,
        }
    }
}
