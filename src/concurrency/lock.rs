//! Page-level strict two-phase locking.
//!
//! Transactions take shared or exclusive locks as they touch pages and drop
//! them all together at commit or abort. There is no wait-for graph: a
//! blocked request gives up after a randomized deadline and the caller is
//! expected to abort its whole transaction. That breaks deadlocks without
//! fairness guarantees and can, in rare upgrade races, abort transactions
//! that were not actually deadlocked.

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::PageId;
use crate::transaction::TransactionId;
use log::{trace, warn};
use parking_lot::{Condvar, Mutex};
use rand::Rng;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// How often a blocked waiter re-checks the lock state even without a
/// release notification.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Wait deadline per acquire: `ABORT_BASE + uniform(0..=ABORT_JITTER_MS)`.
const ABORT_BASE: Duration = Duration::from_millis(200);
const ABORT_JITTER_MS: u64 = 200;

/// Lock modes a transaction can request on a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// One granted lock, as tracked in the per-transaction set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockRecord {
    pub page_id: PageId,
    pub mode: LockMode,
}

#[derive(Default)]
struct LockTables {
    /// Shared holders per page.
    shared: HashMap<PageId, Vec<TransactionId>>,
    /// Exclusive holder per page (zero or one entry).
    exclusive: HashMap<PageId, Vec<TransactionId>>,
    /// Everything a transaction holds, for commit/abort cleanup.
    by_txn: HashMap<TransactionId, Vec<LockRecord>>,
}

impl LockTables {
    fn grantable(&self, txn: TransactionId, page_id: PageId, mode: LockMode) -> bool {
        let exclusive = self
            .exclusive
            .get(&page_id)
            .map(|v| v.as_slice())
            .unwrap_or(&[]);
        match mode {
            // A shared request only waits for a foreign exclusive holder.
            LockMode::Shared => exclusive.is_empty() || exclusive[0] == txn,
            // An exclusive request waits for any foreign holder; a sole
            // shared holder upgrades in place.
            LockMode::Exclusive => {
                if let Some(&holder) = exclusive.first() {
                    return holder == txn;
                }
                self.shared
                    .get(&page_id)
                    .map_or(true, |holders| holders.iter().all(|&t| t == txn))
            }
        }
    }

    fn record(&mut self, txn: TransactionId, page_id: PageId, mode: LockMode) {
        let holders = match mode {
            LockMode::Shared => self.shared.entry(page_id).or_default(),
            LockMode::Exclusive => self.exclusive.entry(page_id).or_default(),
        };
        if !holders.contains(&txn) {
            holders.push(txn);
        }

        let records = self.by_txn.entry(txn).or_default();
        let record = LockRecord { page_id, mode };
        if !records.contains(&record) {
            records.push(record);
        }
    }

    fn remove(&mut self, txn: TransactionId, page_id: PageId) {
        if let Some(holders) = self.shared.get_mut(&page_id) {
            holders.retain(|&t| t != txn);
            if holders.is_empty() {
                self.shared.remove(&page_id);
            }
        }
        if let Some(holders) = self.exclusive.get_mut(&page_id) {
            holders.retain(|&t| t != txn);
            if holders.is_empty() {
                self.exclusive.remove(&page_id);
            }
        }
        if let Some(records) = self.by_txn.get_mut(&txn) {
            records.retain(|r| r.page_id != page_id);
            if records.is_empty() {
                self.by_txn.remove(&txn);
            }
        }
    }
}

/// Grants, tracks, and releases page locks.
///
/// All state sits under one mutex; blocked acquires wait on a condvar that
/// every release notifies, re-polling on `POLL_INTERVAL`. Whichever waiter
/// observes the lock available first wins; there is no FIFO order.
pub struct LockManager {
    state: Mutex<LockTables>,
    released: Condvar,
    base_timeout: Duration,
    jitter_ms: u64,
}

impl LockManager {
    pub fn new() -> Self {
        Self::with_timeout(ABORT_BASE, Duration::from_millis(ABORT_JITTER_MS))
    }

    /// Overrides the wait deadline, mainly to keep tests fast.
    pub fn with_timeout(base: Duration, jitter: Duration) -> Self {
        Self {
            state: Mutex::new(LockTables::default()),
            released: Condvar::new(),
            base_timeout: base,
            jitter_ms: jitter.as_millis() as u64,
        }
    }

    fn wait_budget(&self) -> Duration {
        let jitter = rand::thread_rng().gen_range(0..=self.jitter_ms);
        self.base_timeout + Duration::from_millis(jitter)
    }

    /// Blocks until the lock is granted or the randomized deadline passes.
    ///
    /// Reentrant requests never block: an exclusive holder gets shared
    /// immediately, and a transaction holding the only shared lock upgrades
    /// to exclusive in place. On timeout the caller must abort the whole
    /// transaction; the request itself leaves no trace.
    pub fn acquire(
        &self,
        txn: TransactionId,
        page_id: PageId,
        mode: LockMode,
    ) -> StorageResult<()> {
        let deadline = Instant::now() + self.wait_budget();
        let mut tables = self.state.lock();
        loop {
            if tables.grantable(txn, page_id, mode) {
                tables.record(txn, page_id, mode);
                trace!("{} acquired {:?} on {}", txn, mode, page_id);
                return Ok(());
            }
            if Instant::now() >= deadline {
                warn!("{} timed out waiting for {:?} on {}", txn, mode, page_id);
                return Err(StorageError::LockTimeout { txn, page_id });
            }
            self.released.wait_for(&mut tables, POLL_INTERVAL);
        }
    }

    /// Drops every lock the transaction holds on the page and wakes waiters.
    pub fn release(&self, txn: TransactionId, page_id: PageId) {
        let mut tables = self.state.lock();
        tables.remove(txn, page_id);
        drop(tables);
        self.released.notify_all();
    }

    /// Drops all of the transaction's locks and wakes waiters.
    pub fn release_all(&self, txn: TransactionId) {
        let mut tables = self.state.lock();
        if let Some(records) = tables.by_txn.remove(&txn) {
            for record in records {
                if let Some(holders) = tables.shared.get_mut(&record.page_id) {
                    holders.retain(|&t| t != txn);
                    if holders.is_empty() {
                        tables.shared.remove(&record.page_id);
                    }
                }
                if let Some(holders) = tables.exclusive.get_mut(&record.page_id) {
                    holders.retain(|&t| t != txn);
                    if holders.is_empty() {
                        tables.exclusive.remove(&record.page_id);
                    }
                }
            }
        }
        drop(tables);
        self.released.notify_all();
    }

    /// Whether the transaction holds any lock on the page.
    pub fn holds_lock(&self, txn: TransactionId, page_id: PageId) -> bool {
        self.state
            .lock()
            .by_txn
            .get(&txn)
            .map_or(false, |records| {
                records.iter().any(|r| r.page_id == page_id)
            })
    }

    /// Whether any transaction holds the page exclusively.
    pub fn has_exclusive_holder(&self, page_id: PageId) -> bool {
        self.state
            .lock()
            .exclusive
            .get(&page_id)
            .map_or(false, |holders| !holders.is_empty())
    }

    /// Snapshot of the transaction's lock set.
    pub fn records_for(&self, txn: TransactionId) -> Vec<LockRecord> {
        self.state
            .lock()
            .by_txn
            .get(&txn)
            .cloned()
            .unwrap_or_default()
    }

    /// Snapshot of the page's (shared, exclusive) holder sets, for
    /// diagnostics and invariant checks.
    pub fn holders(&self, page_id: PageId) -> (Vec<TransactionId>, Vec<TransactionId>) {
        let tables = self.state.lock();
        (
            tables.shared.get(&page_id).cloned().unwrap_or_default(),
            tables.exclusive.get(&page_id).cloned().unwrap_or_default(),
        )
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::TableId;
    use std::sync::Arc;
    use std::thread;

    fn page(n: usize) -> PageId {
        PageId::new(TableId(1), n)
    }

    fn fast_manager() -> LockManager {
        LockManager::with_timeout(Duration::from_millis(100), Duration::from_millis(0))
    }

    #[test]
    fn test_shared_locks_coexist() -> StorageResult<()> {
        let manager = fast_manager();
        let (t1, t2) = (TransactionId::new(1), TransactionId::new(2));

        manager.acquire(t1, page(0), LockMode::Shared)?;
        manager.acquire(t2, page(0), LockMode::Shared)?;

        assert!(manager.holds_lock(t1, page(0)));
        assert!(manager.holds_lock(t2, page(0)));
        let (shared, exclusive) = manager.holders(page(0));
        assert_eq!(shared.len(), 2);
        assert!(exclusive.is_empty());
        Ok(())
    }

    #[test]
    fn test_exclusive_blocks_shared() -> StorageResult<()> {
        let manager = fast_manager();
        let (t1, t2) = (TransactionId::new(1), TransactionId::new(2));

        manager.acquire(t1, page(0), LockMode::Exclusive)?;
        let result = manager.acquire(t2, page(0), LockMode::Shared);
        assert!(matches!(result, Err(StorageError::LockTimeout { .. })));
        assert!(result.unwrap_err().is_transient());
        Ok(())
    }

    #[test]
    fn test_shared_blocks_foreign_exclusive() -> StorageResult<()> {
        let manager = fast_manager();
        let (t1, t2) = (TransactionId::new(1), TransactionId::new(2));

        manager.acquire(t1, page(0), LockMode::Shared)?;
        assert!(matches!(
            manager.acquire(t2, page(0), LockMode::Exclusive),
            Err(StorageError::LockTimeout { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_reentrant_shared_under_exclusive() -> StorageResult<()> {
        let manager = fast_manager();
        let t1 = TransactionId::new(1);

        manager.acquire(t1, page(0), LockMode::Exclusive)?;
        manager.acquire(t1, page(0), LockMode::Shared)?;

        let records = manager.records_for(t1);
        assert_eq!(records.len(), 2);
        Ok(())
    }

    #[test]
    fn test_sole_shared_holder_upgrades() -> StorageResult<()> {
        let manager = fast_manager();
        let t1 = TransactionId::new(1);

        manager.acquire(t1, page(0), LockMode::Shared)?;
        manager.acquire(t1, page(0), LockMode::Exclusive)?;

        let (shared, exclusive) = manager.holders(page(0));
        assert_eq!(shared, vec![t1]);
        assert_eq!(exclusive, vec![t1]);
        Ok(())
    }

    #[test]
    fn test_contended_upgrade_times_out() -> StorageResult<()> {
        let manager = fast_manager();
        let (t1, t2) = (TransactionId::new(1), TransactionId::new(2));

        manager.acquire(t1, page(0), LockMode::Shared)?;
        manager.acquire(t2, page(0), LockMode::Shared)?;
        assert!(matches!(
            manager.acquire(t1, page(0), LockMode::Exclusive),
            Err(StorageError::LockTimeout { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_upgrade_proceeds_after_other_reader_leaves() -> StorageResult<()> {
        let manager = Arc::new(LockManager::with_timeout(
            Duration::from_millis(2000),
            Duration::from_millis(0),
        ));
        let (t1, t2) = (TransactionId::new(1), TransactionId::new(2));

        manager.acquire(t1, page(0), LockMode::Shared)?;
        manager.acquire(t2, page(0), LockMode::Shared)?;

        let m = Arc::clone(&manager);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            m.release(t2, page(0));
        });

        manager.acquire(t1, page(0), LockMode::Exclusive)?;
        handle.join().unwrap();

        let (_, exclusive) = manager.holders(page(0));
        assert_eq!(exclusive, vec![t1]);
        Ok(())
    }

    #[test]
    fn test_release_wakes_waiter() -> StorageResult<()> {
        let manager = Arc::new(LockManager::with_timeout(
            Duration::from_millis(2000),
            Duration::from_millis(0),
        ));
        let (t1, t2) = (TransactionId::new(1), TransactionId::new(2));

        manager.acquire(t1, page(0), LockMode::Exclusive)?;

        let m = Arc::clone(&manager);
        let waiter = thread::spawn(move || m.acquire(t2, page(0), LockMode::Shared));

        thread::sleep(Duration::from_millis(50));
        manager.release_all(t1);

        assert!(waiter.join().unwrap().is_ok());
        assert!(manager.holds_lock(t2, page(0)));
        Ok(())
    }

    #[test]
    fn test_release_all_clears_everything() -> StorageResult<()> {
        let manager = fast_manager();
        let t1 = TransactionId::new(1);

        manager.acquire(t1, page(0), LockMode::Shared)?;
        manager.acquire(t1, page(1), LockMode::Exclusive)?;
        manager.acquire(t1, page(1), LockMode::Shared)?;
        assert_eq!(manager.records_for(t1).len(), 3);

        manager.release_all(t1);
        assert!(manager.records_for(t1).is_empty());
        assert!(!manager.holds_lock(t1, page(0)));
        assert!(!manager.holds_lock(t1, page(1)));
        Ok(())
    }

    #[test]
    fn test_mutual_exclusion_invariant() -> StorageResult<()> {
        // Hammer one page from several threads; after every grant the
        // exclusive holder set must have at most one entry and never coexist
        // with foreign shared holders.
        let manager = Arc::new(LockManager::with_timeout(
            Duration::from_millis(500),
            Duration::from_millis(100),
        ));
        let mut handles = vec![];

        for i in 0..8u64 {
            let m = Arc::clone(&manager);
            handles.push(thread::spawn(move || {
                let txn = TransactionId::new(i + 1);
                for _ in 0..20 {
                    let mode = if i % 2 == 0 {
                        LockMode::Exclusive
                    } else {
                        LockMode::Shared
                    };
                    if m.acquire(txn, page(0), mode).is_ok() {
                        let (shared, exclusive) = m.holders(page(0));
                        assert!(exclusive.len() <= 1);
                        if let Some(&holder) = exclusive.first() {
                            assert!(shared.iter().all(|&t| t == holder));
                        }
                        m.release(txn, page(0));
                    }
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }
        Ok(())
    }
}
