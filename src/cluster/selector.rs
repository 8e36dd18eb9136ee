//! Master Selection
//!
//! Deterministic choice of the master from a membership snapshot. The
//! member with the highest committed transaction wins; ties go to the
//! member that committed its own last transaction as master, then to the
//! earliest joiner. Among several members that each committed their last
//! transaction as master, the latest joiner wins.

use std::collections::HashMap;

use super::machine::{Machine, NO_MACHINE};

/// Pick the master among `machines`, or [`NO_MACHINE`] if there are none
pub fn select_master(machines: &[Machine]) -> Machine {
    // fold in join order so the outcome never depends on the input order
    let mut ordered: Vec<&Machine> = machines.iter().collect();
    ordered.sort_by_key(|m| (m.sequence_id, m.id));

    let mut best: Option<&Machine> = None;
    let mut highest_tx = -1i64;
    let mut lowest_seq = i64::MAX;

    for candidate in ordered {
        if candidate.last_committed_tx < highest_tx {
            continue;
        }

        let best_was_master = best.map(|b| b.was_committing_master()).unwrap_or(false);
        let replaces = candidate.last_committed_tx > highest_tx
            || candidate.was_committing_master()
            || (!best_was_master && candidate.sequence_id < lowest_seq);

        if replaces {
            best = Some(candidate);
            lowest_seq = candidate.sequence_id;
            highest_tx = candidate.last_committed_tx;
        }
    }

    best.cloned().unwrap_or(NO_MACHINE)
}

/// Collapse several records of the same machine to the one with the
/// highest sequence id, ordered by sequence id
pub fn latest_per_machine(records: Vec<Machine>) -> Vec<Machine> {
    let mut latest: HashMap<i32, Machine> = HashMap::new();
    for record in records {
        match latest.get(&record.id) {
            Some(existing) if existing.sequence_id >= record.sequence_id => {}
            _ => {
                latest.insert(record.id, record);
            }
        }
    }

    let mut machines: Vec<Machine> = latest.into_values().collect();
    machines.sort_by_key(|m| m.sequence_id);
    machines
}
