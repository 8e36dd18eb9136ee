//! Lock Manager
//!
//! Reentrant read/write locks on nodes and relationships, held on behalf
//! of slave transactions. A waiting request records which lock it waits
//! for; before it blocks, the wait-for graph is searched for a cycle back
//! to the requester.
//!
//! Locks of a slave that crashed are never finished. They are released
//! when the slave comes back under a new session, or by [`LockManager::reap_idle`]
//! once their owner has been silent for too long.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use super::cursor::TxOwner;
use super::types::{EntityKind, LockMode, LockResult, LockStatus};

/// A lockable entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockKey {
    pub kind: EntityKind,
    pub id: i64,
}

#[derive(Debug, Default)]
struct Holders {
    readers: HashMap<TxOwner, u32>,
    writer: Option<(TxOwner, u32)>,
}

impl Holders {
    fn grantable(&self, owner: &TxOwner, mode: LockMode) -> bool {
        let writer_ok = match &self.writer {
            Some((holder, _)) => holder == owner,
            None => true,
        };
        match mode {
            LockMode::Read => writer_ok,
            LockMode::Write => writer_ok && self.readers.keys().all(|r| r == owner),
        }
    }

    fn grant(&mut self, owner: TxOwner, mode: LockMode) {
        match mode {
            LockMode::Read => *self.readers.entry(owner).or_insert(0) += 1,
            LockMode::Write => match &mut self.writer {
                Some((_, count)) => *count += 1,
                None => self.writer = Some((owner, 1)),
            },
        }
    }

    /// Owners that keep `owner` from getting the lock in `mode`
    fn blockers(&self, owner: &TxOwner, mode: LockMode) -> Vec<TxOwner> {
        let mut blockers = Vec::new();
        if let Some((holder, _)) = &self.writer {
            if holder != owner {
                blockers.push(*holder);
            }
        }
        if mode == LockMode::Write {
            blockers.extend(self.readers.keys().filter(|r| *r != owner).copied());
        }
        blockers
    }

    fn release(&mut self, owner: &TxOwner) {
        self.readers.remove(owner);
        if matches!(&self.writer, Some((holder, _)) if holder == owner) {
            self.writer = None;
        }
    }

    fn is_free(&self) -> bool {
        self.readers.is_empty() && self.writer.is_none()
    }
}

#[derive(Debug, Default)]
struct LockTable {
    locks: HashMap<LockKey, Holders>,
    held: HashMap<TxOwner, HashSet<LockKey>>,
    waiting: HashMap<TxOwner, (LockKey, LockMode)>,
    /// Last request of each owner holding locks
    last_seen: HashMap<TxOwner, Instant>,
    /// Latest session per requesting machine
    sessions: HashMap<i32, i64>,
}

impl LockTable {
    fn try_grant(&mut self, owner: TxOwner, key: LockKey, mode: LockMode) -> bool {
        let holders = self.locks.entry(key).or_default();
        if !holders.grantable(&owner, mode) {
            return false;
        }
        holders.grant(owner, mode);
        self.held.entry(owner).or_default().insert(key);
        self.last_seen.insert(owner, Instant::now());
        true
    }

    fn release(&mut self, owner: &TxOwner) -> usize {
        self.waiting.remove(owner);
        self.last_seen.remove(owner);
        let keys = self.held.remove(owner).unwrap_or_default();
        for key in &keys {
            let free = match self.locks.get_mut(key) {
                Some(holders) => {
                    holders.release(owner);
                    holders.is_free()
                }
                None => false,
            };
            if free {
                self.locks.remove(key);
            }
        }
        keys.len()
    }

    /// Search the wait-for graph for a path from `start` back to itself
    fn find_cycle(&self, start: &TxOwner) -> Option<Vec<TxOwner>> {
        let mut visited = HashSet::new();
        let mut path = vec![*start];
        if self.dfs(start, start, &mut visited, &mut path) {
            Some(path)
        } else {
            None
        }
    }

    fn dfs(
        &self,
        node: &TxOwner,
        start: &TxOwner,
        visited: &mut HashSet<TxOwner>,
        path: &mut Vec<TxOwner>,
    ) -> bool {
        if !visited.insert(*node) {
            return false;
        }

        let Some((key, mode)) = self.waiting.get(node) else {
            return false;
        };
        let Some(holders) = self.locks.get(key) else {
            return false;
        };

        for next in holders.blockers(node, *mode) {
            path.push(next);
            if next == *start || self.dfs(&next, start, visited, path) {
                return true;
            }
            path.pop();
        }
        false
    }
}

/// Lock table with blocking, timeout and deadlock detection
pub struct LockManager {
    table: Mutex<LockTable>,
    released: Notify,
    timeout: Duration,
}

impl LockManager {
    /// Create a lock manager; requests not granted within `timeout` are
    /// refused as not locked
    pub fn new(timeout: Duration) -> Self {
        Self {
            table: Mutex::new(LockTable::default()),
            released: Notify::new(),
            timeout,
        }
    }

    fn table(&self) -> MutexGuard<'_, LockTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lock every id in order. Stops at the first refusal; locks taken
    /// before it stay held until the owner finishes.
    pub async fn acquire(&self, owner: TxOwner, kind: EntityKind, mode: LockMode, ids: &[i64]) -> LockResult {
        let deadline = Instant::now() + self.timeout;
        for id in ids {
            let result = self.acquire_one(owner, LockKey { kind, id: *id }, mode, deadline).await;
            if result.status != LockStatus::Ok {
                return result;
            }
        }
        LockResult::ok()
    }

    async fn acquire_one(&self, owner: TxOwner, key: LockKey, mode: LockMode, deadline: Instant) -> LockResult {
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut table = self.table();
                if table.try_grant(owner, key, mode) {
                    table.waiting.remove(&owner);
                    return LockResult::ok();
                }

                table.waiting.insert(owner, (key, mode));
                if let Some(cycle) = table.find_cycle(&owner) {
                    table.waiting.remove(&owner);
                    let chain = cycle
                        .iter()
                        .map(|o| format!("{}:{}:{}", o.machine_id, o.session_id, o.event_id))
                        .collect::<Vec<_>>()
                        .join(" -> ");
                    tracing::debug!("Deadlock on {:?} {}: {}", key.kind, key.id, chain);
                    return LockResult::deadlock(format!(
                        "{:?} lock on {:?} {} would deadlock: {}",
                        mode, key.kind, key.id, chain
                    ));
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                self.table().waiting.remove(&owner);
                tracing::debug!("{:?} lock on {:?} {} timed out", mode, key.kind, key.id);
                return LockResult::not_locked();
            }
        }
    }

    /// Release every lock `owner` holds
    pub fn release_all(&self, owner: &TxOwner) -> usize {
        let released = self.table().release(owner);
        if released > 0 {
            self.released.notify_waiters();
        }
        released
    }

    /// Record a request from `owner`. Returns the number of locks freed
    /// because the owner's machine restarted under a newer session.
    pub fn observe(&self, owner: &TxOwner) -> usize {
        if owner.machine_id < 0 {
            return 0;
        }

        let released = {
            let mut table = self.table();
            if table.held.contains_key(owner) {
                table.last_seen.insert(*owner, Instant::now());
            }

            let previous = table.sessions.get(&owner.machine_id).copied();
            match previous {
                Some(session) if session >= owner.session_id => 0,
                _ => {
                    table.sessions.insert(owner.machine_id, owner.session_id);
                    let stale: Vec<TxOwner> = table
                        .held
                        .keys()
                        .filter(|o| o.machine_id == owner.machine_id && o.session_id < owner.session_id)
                        .copied()
                        .collect();
                    stale.iter().map(|o| table.release(o)).sum::<usize>()
                }
            }
        };

        if released > 0 {
            tracing::info!(
                "Machine {} started session {}, released {} locks of its earlier session",
                owner.machine_id,
                owner.session_id,
                released
            );
            self.released.notify_waiters();
        }
        released
    }

    /// Release the locks of owners that sent nothing for `max_idle` and
    /// are not waiting for a lock
    pub fn reap_idle(&self, max_idle: Duration) -> usize {
        let now = Instant::now();
        let released = {
            let mut table = self.table();
            let idle: Vec<TxOwner> = table
                .last_seen
                .iter()
                .filter(|(owner, seen)| !table.waiting.contains_key(*owner) && now.duration_since(**seen) >= max_idle)
                .map(|(owner, _)| *owner)
                .collect();
            for owner in &idle {
                tracing::warn!(
                    "Releasing locks of tx {}:{}:{}, idle for more than {:?}",
                    owner.machine_id,
                    owner.session_id,
                    owner.event_id,
                    max_idle
                );
            }
            idle.iter().map(|o| table.release(o)).sum::<usize>()
        };

        if released > 0 {
            self.released.notify_waiters();
        }
        released
    }

    /// Number of locked entities
    pub fn locked_count(&self) -> usize {
        self.table().locks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn owner(event_id: i64) -> TxOwner {
        TxOwner {
            session_id: 1,
            machine_id: 1,
            event_id,
        }
    }

    fn remote(machine_id: i32, session_id: i64, event_id: i64) -> TxOwner {
        TxOwner {
            session_id,
            machine_id,
            event_id,
        }
    }

    #[tokio::test]
    async fn test_shared_reads_exclusive_write() {
        let locks = LockManager::new(Duration::from_millis(50));
        assert!(locks.acquire(owner(1), EntityKind::Node, LockMode::Read, &[7]).await.status == LockStatus::Ok);
        assert!(locks.acquire(owner(2), EntityKind::Node, LockMode::Read, &[7]).await.status == LockStatus::Ok);

        let write = locks.acquire(owner(3), EntityKind::Node, LockMode::Write, &[7]).await;
        assert_eq!(write.status, LockStatus::NotLocked);

        // same id, other entity kind
        let other = locks.acquire(owner(3), EntityKind::Relationship, LockMode::Write, &[7]).await;
        assert_eq!(other.status, LockStatus::Ok);
    }

    #[tokio::test]
    async fn test_reentrant_and_upgrade() {
        let locks = LockManager::new(Duration::from_millis(50));
        let me = owner(1);
        assert_eq!(locks.acquire(me, EntityKind::Node, LockMode::Read, &[1]).await.status, LockStatus::Ok);
        assert_eq!(locks.acquire(me, EntityKind::Node, LockMode::Write, &[1]).await.status, LockStatus::Ok);
        assert_eq!(locks.acquire(me, EntityKind::Node, LockMode::Write, &[1]).await.status, LockStatus::Ok);
        assert_eq!(locks.release_all(&me), 1);
        assert_eq!(locks.locked_count(), 0);
    }

    #[tokio::test]
    async fn test_waiter_granted_after_release() {
        let locks = Arc::new(LockManager::new(Duration::from_secs(5)));
        locks.acquire(owner(1), EntityKind::Node, LockMode::Write, &[1]).await;

        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move { locks.acquire(owner(2), EntityKind::Node, LockMode::Write, &[1]).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        locks.release_all(&owner(1));
        assert_eq!(waiter.await.unwrap().status, LockStatus::Ok);
    }

    #[tokio::test]
    async fn test_deadlock_detected() {
        let locks = Arc::new(LockManager::new(Duration::from_secs(5)));
        locks.acquire(owner(1), EntityKind::Node, LockMode::Write, &[1]).await;
        locks.acquire(owner(2), EntityKind::Node, LockMode::Write, &[2]).await;

        let first = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move { locks.acquire(owner(1), EntityKind::Node, LockMode::Write, &[2]).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let second = locks.acquire(owner(2), EntityKind::Node, LockMode::Write, &[1]).await;
        assert_eq!(second.status, LockStatus::Deadlock);
        assert!(second.message.is_some());

        locks.release_all(&owner(2));
        assert_eq!(first.await.unwrap().status, LockStatus::Ok);
    }

    #[tokio::test]
    async fn test_new_session_releases_earlier_locks() {
        let locks = LockManager::new(Duration::from_millis(50));
        let before_restart = remote(3, 100, 1);
        locks.observe(&before_restart);
        locks.acquire(before_restart, EntityKind::Node, LockMode::Write, &[7, 8]).await;

        // a late request of the old session changes nothing
        assert_eq!(locks.observe(&remote(3, 99, 4)), 0);
        assert_eq!(locks.observe(&remote(4, 200, 1)), 0);
        assert_eq!(locks.locked_count(), 2);

        assert_eq!(locks.observe(&remote(3, 101, 1)), 2);
        assert_eq!(locks.locked_count(), 0);
        let next = locks.acquire(remote(4, 200, 1), EntityKind::Node, LockMode::Write, &[7]).await;
        assert_eq!(next.status, LockStatus::Ok);
    }

    #[tokio::test]
    async fn test_idle_owner_reaped() {
        let locks = LockManager::new(Duration::from_millis(50));
        locks.acquire(owner(1), EntityKind::Node, LockMode::Write, &[1]).await;
        assert_eq!(locks.reap_idle(Duration::from_secs(60)), 0);

        tokio::time::sleep(Duration::from_millis(30)).await;
        locks.acquire(owner(2), EntityKind::Node, LockMode::Read, &[2]).await;
        assert_eq!(locks.reap_idle(Duration::from_millis(20)), 1);
        assert_eq!(locks.locked_count(), 1);

        let granted = locks.acquire(owner(3), EntityKind::Node, LockMode::Write, &[1]).await;
        assert_eq!(granted.status, LockStatus::Ok);
    }
}
