//! High Availability Module
//!
//! The role state machine and what it needs around it: branched data
//! handling, store bootstrap and the slave id cache.

pub mod bootstrap;
pub mod branch;
pub mod ids;
pub mod node;
pub mod role;

pub use bootstrap::BootstrapReport;
pub use branch::{BranchAction, BranchOutcome, BranchedDataPolicy};
pub use ids::SlaveIdAllocator;
pub use node::{HaNode, HaNodeConfig};
pub use role::{Role, RoleState};
