//! Node Roles
//!
//! Everything a role owns lives in one [`RoleState`] behind the node's
//! role-transition lock, so a role swap replaces all of it at once.

use std::fmt;
use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::cluster::{Machine, NO_MACHINE};
use crate::error::{Error, Result};
use crate::replication::{Master, ServingHandle};
use crate::store::LocalStore;

/// Role of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// No store open
    Uninitialized,
    /// Accepting writes and serving the master protocol
    Master,
    /// Replicating from a master
    Slave,
    /// Stopped for good
    ShuttingDown,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Uninitialized => "uninitialized",
            Role::Master => "master",
            Role::Slave => "slave",
            Role::ShuttingDown => "shutting_down",
        };
        f.write_str(name)
    }
}

/// What the current role holds
pub struct RoleState {
    pub role: Role,
    /// Open store, owned by the current role
    pub store: Option<Arc<LocalStore>>,
    /// Replication RPC: the local master implementation, or a client
    /// bound to the remote master
    pub rpc: Option<Arc<dyn Master>>,
    /// Master the rpc is bound to
    pub master: Machine,
    pub master_server: Option<ServingHandle>,
    pub backup_server: Option<ServingHandle>,
    pub puller: Option<JoinHandle<()>>,
    pub reporter: Option<JoinHandle<()>>,
    /// Releases locks of slave transactions that went quiet
    pub lock_reaper: Option<JoinHandle<()>>,
    /// Why the node last stopped its role
    pub cause_of_shutdown: Option<String>,
}

impl Default for RoleState {
    fn default() -> Self {
        Self {
            role: Role::Uninitialized,
            store: None,
            rpc: None,
            master: NO_MACHINE,
            master_server: None,
            backup_server: None,
            puller: None,
            reporter: None,
            lock_reaper: None,
            cause_of_shutdown: None,
        }
    }
}

impl RoleState {
    /// Store and rpc of a running role
    pub fn bound(&self) -> Result<(Arc<LocalStore>, Arc<dyn Master>)> {
        match (&self.role, &self.store, &self.rpc) {
            (Role::ShuttingDown, _, _) => Err(Error::ShuttingDown),
            (_, Some(store), Some(rpc)) => Ok((Arc::clone(store), Arc::clone(rpc))),
            _ => Err(Error::NoMaster),
        }
    }

    /// Whether the role holds a store
    pub fn is_running(&self) -> bool {
        self.store.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_names() {
        assert_eq!(Role::Master.to_string(), "master");
        assert_eq!(Role::ShuttingDown.to_string(), "shutting_down");
    }

    #[test]
    fn test_unbound_state() {
        let mut state = RoleState::default();
        assert!(matches!(state.bound(), Err(Error::NoMaster)));
        state.role = Role::ShuttingDown;
        assert!(matches!(state.bound(), Err(Error::ShuttingDown)));
        assert!(!state.is_running());
    }
}
