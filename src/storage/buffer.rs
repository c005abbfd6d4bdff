//! The buffer pool: page cache, lock coordinator, and transaction
//! commit/abort hook.
//!
//! One pool owns all of its state and is shared with every collaborator as a
//! cheap cloneable handle; there is no process-wide static. Cache lookups,
//! eviction, and the IO they trigger all run under one pool mutex with short
//! critical sections; only lock waits suspend the caller.

use crate::access::scan::SeqScan;
use crate::access::tuple::{RecordId, Tuple};
use crate::concurrency::lock::{LockManager, LockMode};
use crate::storage::disk::HeapFile;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::{HeapPage, PageId, TableId};
use crate::transaction::TransactionId;
use dashmap::DashMap;
use log::{debug, trace};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Default cache capacity in pages.
pub const DEFAULT_CAPACITY: usize = 50;

struct PageCache {
    pages: HashMap<PageId, Arc<RwLock<HeapPage>>>,
    /// Last-touched tick per cached page; the minimum is the LRU victim.
    recency: HashMap<PageId, u64>,
    tick: u64,
}

impl PageCache {
    fn touch(&mut self, page_id: PageId) {
        self.recency.insert(page_id, self.tick);
        self.tick += 1;
    }
}

/// Caches pages, enforces strict 2PL through its lock manager, and carries
/// transactions through commit and abort.
///
/// Eviction is NO-STEAL: a dirty page is never written out (or dropped) on
/// behalf of the cache, only by its own transaction's commit-time flush.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    capacity: usize,
    tables: DashMap<TableId, Arc<HeapFile>>,
    locks: LockManager,
    cache: Mutex<PageCache>,
}

impl BufferPool {
    pub fn new(capacity: usize) -> Self {
        Self::with_lock_manager(capacity, LockManager::new())
    }

    /// Overrides the lock-wait deadline, mainly to keep tests fast.
    pub fn with_lock_timeout(capacity: usize, base: Duration, jitter: Duration) -> Self {
        Self::with_lock_manager(capacity, LockManager::with_timeout(base, jitter))
    }

    fn with_lock_manager(capacity: usize, locks: LockManager) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                capacity,
                tables: DashMap::new(),
                locks,
                cache: Mutex::new(PageCache {
                    pages: HashMap::with_capacity(capacity),
                    recency: HashMap::with_capacity(capacity),
                    tick: 0,
                }),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Makes a heap file reachable through its table id. Stands in for the
    /// catalog, which lives outside this crate.
    pub fn register_table(&self, file: Arc<HeapFile>) -> TableId {
        let table_id = file.table_id();
        self.inner.tables.insert(table_id, file);
        table_id
    }

    pub fn table(&self, table_id: TableId) -> StorageResult<Arc<HeapFile>> {
        self.inner
            .tables
            .get(&table_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(StorageError::UnknownTable(table_id))
    }

    /// Acquires the requested lock (blocking, randomized timeout) and returns
    /// the cached page, loading it from the heap file on a miss and evicting
    /// first when the cache is full.
    ///
    /// If loading fails after the lock was granted, the lock stays recorded;
    /// the caller aborts the transaction and cleanup drops it.
    pub fn get_page(
        &self,
        txn: TransactionId,
        page_id: PageId,
        mode: LockMode,
    ) -> StorageResult<Arc<RwLock<HeapPage>>> {
        self.inner.locks.acquire(txn, page_id, mode)?;

        let mut cache = self.inner.cache.lock();
        if let Some(page) = cache.pages.get(&page_id).map(Arc::clone) {
            cache.touch(page_id);
            return Ok(page);
        }

        if cache.pages.len() >= self.inner.capacity {
            self.evict_page(&mut cache)?;
        }

        let file = self.table(page_id.table_id)?;
        let page = Arc::new(RwLock::new(file.read_page(page_id)?));
        cache.pages.insert(page_id, Arc::clone(&page));
        cache.touch(page_id);
        trace!("{}: loaded {} into cache", txn, page_id);
        Ok(page)
    }

    /// Inserts the tuple through the owning heap file. The modified page ends
    /// up exclusive-locked, cached, and dirty under `txn`; the dirty mark is
    /// set under the same write-lock hold that mutates the page.
    pub fn insert_tuple(
        &self,
        txn: TransactionId,
        table_id: TableId,
        tuple: &Tuple,
    ) -> StorageResult<RecordId> {
        let file = self.table(table_id)?;
        file.insert_tuple(self, txn, tuple)
    }

    /// Deletes the tuple named by its record id through the owning heap file.
    pub fn delete_tuple(&self, txn: TransactionId, tuple: &Tuple) -> StorageResult<()> {
        let record_id = tuple.record_id().ok_or(StorageError::MissingRecordId)?;
        let file = self.table(record_id.page_id.table_id)?;
        file.delete_tuple(self, txn, tuple)
    }

    /// Drops the lock record for this (transaction, page) pair and wakes
    /// waiters. Breaking 2PL early is only safe when the page was not
    /// modified; the scan iterator relies on it.
    pub fn release_page(&self, txn: TransactionId, page_id: PageId) {
        self.inner.locks.release(txn, page_id);
    }

    /// Whether the transaction holds any lock on the page.
    pub fn holds_lock(&self, txn: TransactionId, page_id: PageId) -> bool {
        self.inner.locks.holds_lock(txn, page_id)
    }

    /// Commits or aborts: commit flushes every exclusively-held page, abort
    /// discards them (they may have been mutated in place without a dirty
    /// mark). Either way, all of the transaction's locks are released.
    pub fn transaction_complete(&self, txn: TransactionId, commit: bool) -> StorageResult<()> {
        if commit {
            self.flush_pages(txn)?;
        } else {
            for record in self.inner.locks.records_for(txn) {
                if record.mode == LockMode::Exclusive {
                    self.discard_page(record.page_id);
                }
            }
        }
        self.inner.locks.release_all(txn);
        debug!(
            "{} {}",
            txn,
            if commit { "committed" } else { "aborted" }
        );
        Ok(())
    }

    /// Writes the page through its heap file if dirty and clears the mark.
    /// A failed write leaves the page dirty and cached for a later retry.
    pub fn flush_page(&self, page_id: PageId) -> StorageResult<()> {
        let cache = self.inner.cache.lock();
        if let Some(page) = cache.pages.get(&page_id).map(Arc::clone) {
            let mut page = page.write();
            if page.dirtied_by().is_some() {
                let file = self.table(page_id.table_id)?;
                file.write_page(&page)?;
                page.mark_dirty(None);
                trace!("flushed {}", page_id);
            }
        }
        Ok(())
    }

    /// Flushes every dirty page the transaction holds exclusively.
    pub fn flush_pages(&self, txn: TransactionId) -> StorageResult<()> {
        for record in self.inner.locks.records_for(txn) {
            if record.mode == LockMode::Exclusive {
                self.flush_page(record.page_id)?;
            }
        }
        Ok(())
    }

    /// Flushes every dirty page in the cache. Writes uncommitted data, so it
    /// has no place in normal NO-STEAL operation; shutdown only.
    pub fn flush_all_pages(&self) -> StorageResult<()> {
        let page_ids: Vec<PageId> = {
            let cache = self.inner.cache.lock();
            cache.pages.keys().copied().collect()
        };
        for page_id in page_ids {
            self.flush_page(page_id)?;
        }
        Ok(())
    }

    /// Drops a cached page without flushing. Used by abort and by callers
    /// that need a guaranteed reread from disk.
    pub fn discard_page(&self, page_id: PageId) {
        let mut cache = self.inner.cache.lock();
        if cache.pages.remove(&page_id).is_some() {
            cache.recency.remove(&page_id);
            debug!("discarded {}", page_id);
        }
    }

    /// Per-table row-iterator factory.
    pub fn scan(&self, txn: TransactionId, table_id: TableId) -> StorageResult<SeqScan> {
        let file = self.table(table_id)?;
        Ok(SeqScan::new(self.clone(), file, txn))
    }

    /// Number of pages currently cached.
    pub fn cached_pages(&self) -> usize {
        self.inner.cache.lock().pages.len()
    }

    pub fn contains_page(&self, page_id: PageId) -> bool {
        self.inner.cache.lock().pages.contains_key(&page_id)
    }

    /// Evicts the least-recently-used clean page that no transaction holds
    /// exclusively. Dirty pages are never eligible (NO-STEAL), and a clean
    /// page under an exclusive lock may be mutated in place at any moment;
    /// evicting it would detach that mutation from the cache. No candidate →
    /// the triggering operation fails with `ResourceExhausted`.
    fn evict_page(&self, cache: &mut PageCache) -> StorageResult<()> {
        let victim = cache
            .pages
            .iter()
            .filter(|(page_id, page)| {
                page.read().dirtied_by().is_none()
                    && !self.inner.locks.has_exclusive_holder(**page_id)
            })
            .map(|(&page_id, _)| (page_id, cache.recency[&page_id]))
            .min_by_key(|&(_, tick)| tick)
            .map(|(page_id, _)| page_id)
            .ok_or(StorageError::ResourceExhausted)?;

        cache.pages.remove(&victim);
        cache.recency.remove(&victim);
        debug!("evicted {}", victim);
        Ok(())
    }
}
