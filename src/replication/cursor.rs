//! Replication Cursor
//!
//! How far a requester has applied each resource's transaction stream.
//! Sent with every request so the master can piggyback what is missing.

use serde::{Deserialize, Serialize};

/// Identity of one transaction on the requesting side, used as lock owner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxOwner {
    /// Requester session (its startup time)
    pub session_id: i64,
    /// Requester machine id
    pub machine_id: i32,
    /// Requester-local transaction id
    pub event_id: i64,
}

/// Per-resource last applied transaction of a requester
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationCursor {
    /// Requester session (its startup time)
    pub session_id: i64,
    /// Requester machine id
    pub machine_id: i32,
    /// Requester-local transaction id, 0 outside transactions
    pub event_id: i64,
    /// Last applied tx per resource, one entry per resource, sorted by name
    txs: Vec<(String, i64)>,
}

impl ReplicationCursor {
    /// Create a cursor. Duplicate resources keep their highest tx.
    pub fn new(
        session_id: i64,
        machine_id: i32,
        event_id: i64,
        txs: impl IntoIterator<Item = (String, i64)>,
    ) -> Self {
        let mut cursor = Self {
            session_id,
            machine_id,
            event_id,
            txs: Vec::new(),
        };
        for (resource, tx) in txs {
            cursor.advance(&resource, tx);
        }
        cursor
    }

    /// Cursor of a requester with nothing applied and no identity
    pub fn empty() -> Self {
        Self::new(0, -1, 0, Vec::new())
    }

    /// Same requester, different transaction
    pub fn with_event(&self, event_id: i64) -> Self {
        Self {
            event_id,
            ..self.clone()
        }
    }

    /// Lock owner key
    pub fn owner(&self) -> TxOwner {
        TxOwner {
            session_id: self.session_id,
            machine_id: self.machine_id,
            event_id: self.event_id,
        }
    }

    /// Last applied tx of a resource
    pub fn last_applied(&self, resource: &str) -> Option<i64> {
        self.txs
            .binary_search_by(|(r, _)| r.as_str().cmp(resource))
            .ok()
            .map(|idx| self.txs[idx].1)
    }

    /// Every (resource, last applied tx) pair
    pub fn txs(&self) -> &[(String, i64)] {
        &self.txs
    }

    /// Raise the last applied tx of a resource. Never moves backwards;
    /// returns whether the cursor changed.
    pub fn advance(&mut self, resource: &str, tx_id: i64) -> bool {
        match self.txs.binary_search_by(|(r, _)| r.as_str().cmp(resource)) {
            Ok(idx) => {
                if tx_id > self.txs[idx].1 {
                    self.txs[idx].1 = tx_id;
                    true
                } else {
                    false
                }
            }
            Err(idx) => {
                self.txs.insert(idx, (resource.to_string(), tx_id));
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_per_resource() {
        let cursor = ReplicationCursor::new(
            1,
            2,
            3,
            vec![
                ("index".to_string(), 4),
                ("graph".to_string(), 10),
                ("graph".to_string(), 7),
            ],
        );
        assert_eq!(cursor.txs(), &[("graph".to_string(), 10), ("index".to_string(), 4)]);
    }

    #[test]
    fn test_advance_is_monotonic() {
        let mut cursor = ReplicationCursor::new(1, 2, 0, vec![("graph".to_string(), 5)]);
        assert!(cursor.advance("graph", 6));
        assert!(!cursor.advance("graph", 3));
        assert_eq!(cursor.last_applied("graph"), Some(6));
        assert!(cursor.advance("index", 0));
        assert_eq!(cursor.last_applied("index"), Some(0));
        assert_eq!(cursor.last_applied("other"), None);
    }

    #[test]
    fn test_owner_follows_event() {
        let cursor = ReplicationCursor::new(9, 1, 0, Vec::new());
        let tx = cursor.with_event(4);
        assert_eq!(tx.owner().event_id, 4);
        assert_ne!(cursor.owner(), tx.owner());
    }
}
