//! Machine Records
//!
//! Snapshot of one cluster member as observed through the coordination
//! service.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One observed cluster member
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Machine {
    /// Configured machine id
    pub id: i32,
    /// Join order assigned by the coordination service
    pub sequence_id: i64,
    /// Last committed transaction of the default resource
    pub last_committed_tx: i64,
    /// Master that committed `last_committed_tx`
    pub master_for_committed_tx: i32,
    /// Master protocol address (host:port), if published
    pub address: Option<String>,
    /// Backup endpoint port, 0 if none
    pub backup_port: i32,
}

/// Sentinel returned when no member is known
pub const NO_MACHINE: Machine = Machine {
    id: -1,
    sequence_id: -1,
    last_committed_tx: -1,
    master_for_committed_tx: -1,
    address: None,
    backup_port: 0,
};

impl Machine {
    /// Create a member record without connection details
    pub fn new(id: i32, sequence_id: i64, last_committed_tx: i64, master_for_committed_tx: i32) -> Self {
        Self {
            id,
            sequence_id,
            last_committed_tx,
            master_for_committed_tx,
            address: None,
            backup_port: 0,
        }
    }

    /// Attach connection details
    pub fn with_address(mut self, address: impl Into<String>, backup_port: i32) -> Self {
        self.address = Some(address.into());
        self.backup_port = backup_port;
        self
    }

    /// True for the "no machine" sentinel
    pub fn is_none(&self) -> bool {
        self.id == NO_MACHINE.id
    }

    /// Whether this member committed its own last transaction as master
    pub fn was_committing_master(&self) -> bool {
        self.master_for_committed_tx == self.id
    }

    /// Host of the master address combined with the backup port
    pub fn backup_address(&self) -> Option<String> {
        if self.backup_port <= 0 {
            return None;
        }
        let address = self.address.as_deref()?;
        let host = address.rsplit_once(':').map(|(h, _)| h).unwrap_or(address);
        Some(format!("{}:{}", host, self.backup_port))
    }
}

impl PartialEq for Machine {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Machine {}

impl fmt::Display for Machine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            return write!(f, "MachineInfo[none]");
        }
        write!(
            f,
            "MachineInfo[ID:{}, sequence:{}, last tx:{}, server:{}]",
            self.id,
            self.sequence_id,
            self.last_committed_tx,
            self.address.as_deref().unwrap_or("?")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equality_by_id() {
        let a = Machine::new(1, 0, 10, 1);
        let b = Machine::new(1, 5, 99, 2).with_address("h:1", 2);
        assert_eq!(a, b);
        assert_ne!(a, NO_MACHINE);
    }

    #[test]
    fn test_was_committing_master() {
        assert!(Machine::new(3, 0, 10, 3).was_committing_master());
        assert!(!Machine::new(3, 0, 10, 1).was_committing_master());
    }

    #[test]
    fn test_backup_address() {
        let m = Machine::new(1, 0, 0, -1).with_address("10.0.0.5:6361", 6362);
        assert_eq!(m.backup_address().as_deref(), Some("10.0.0.5:6362"));
        assert!(Machine::new(1, 0, 0, -1).backup_address().is_none());
        assert!(NO_MACHINE.is_none());
    }
}
