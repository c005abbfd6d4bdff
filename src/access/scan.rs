//! Sequential scan over a table's rows.

use crate::access::tuple::Tuple;
use crate::concurrency::lock::LockMode;
use crate::storage::buffer::BufferPool;
use crate::storage::disk::HeapFile;
use crate::storage::error::StorageResult;
use crate::storage::page::PageId;
use crate::transaction::TransactionId;
use std::collections::VecDeque;
use std::sync::Arc;

/// Forward-only iterator over every row of a heap file, in page and slot
/// order.
///
/// Holds a shared lock on one page at a time: when a page's rows are
/// exhausted the lock is dropped and the next page is shared-locked. This is
/// a deliberate relaxation of strict 2PL for read traffic; the lock on the
/// final visited page is kept until the transaction completes. Not
/// restartable except through `rewind`.
pub struct SeqScan {
    pool: BufferPool,
    file: Arc<HeapFile>,
    txn: TransactionId,
    state: Option<ScanState>,
}

struct ScanState {
    total_pages: usize,
    page_no: usize,
    buffered: VecDeque<Tuple>,
}

impl SeqScan {
    /// Creates a closed scan; call `open` before `next`.
    pub fn new(pool: BufferPool, file: Arc<HeapFile>, txn: TransactionId) -> Self {
        Self {
            pool,
            file,
            txn,
            state: None,
        }
    }

    /// Positions the scan at page 0.
    pub fn open(&mut self) -> StorageResult<()> {
        let total_pages = self.file.num_pages()?;
        let buffered = if total_pages > 0 {
            self.page_tuples(0)?
        } else {
            VecDeque::new()
        };
        self.state = Some(ScanState {
            total_pages,
            page_no: 0,
            buffered,
        });
        Ok(())
    }

    /// Returns the next row, or `None` once the table is exhausted (and
    /// always after `close`).
    pub fn next(&mut self) -> StorageResult<Option<Tuple>> {
        loop {
            let page_no = match &mut self.state {
                None => return Ok(None),
                Some(state) => {
                    if let Some(tuple) = state.buffered.pop_front() {
                        return Ok(Some(tuple));
                    }
                    if state.page_no + 1 >= state.total_pages {
                        return Ok(None);
                    }
                    state.page_no
                }
            };

            // Done with this page; trade its shared lock for the next one.
            self.pool.release_page(self.txn, self.page_id(page_no));
            let buffered = self.page_tuples(page_no + 1)?;
            if let Some(state) = &mut self.state {
                state.page_no = page_no + 1;
                state.buffered = buffered;
            }
        }
    }

    /// Closes and reopens from page 0.
    pub fn rewind(&mut self) -> StorageResult<()> {
        self.close();
        self.open()
    }

    /// Ends iteration. Locks taken by the scan stay with the transaction.
    pub fn close(&mut self) {
        self.state = None;
    }

    fn page_id(&self, page_no: usize) -> PageId {
        PageId::new(self.file.table_id(), page_no)
    }

    /// Shared-locks the page and snapshots its occupied rows in slot order.
    fn page_tuples(&self, page_no: usize) -> StorageResult<VecDeque<Tuple>> {
        let page = self
            .pool
            .get_page(self.txn, self.page_id(page_no), LockMode::Shared)?;
        let page = page.read();
        Ok(page.iter().cloned().collect())
    }
}
