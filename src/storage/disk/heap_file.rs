//! Heap files: one sequence of fixed-size pages per table on disk.

use crate::access::schema::Schema;
use crate::access::tuple::{RecordId, Tuple};
use crate::concurrency::lock::LockMode;
use crate::storage::buffer::BufferPool;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::{HeapPage, PageId, TableId, PAGE_SIZE};
use crate::transaction::TransactionId;
use log::debug;
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::fs::{File, OpenOptions};
use std::hash::{Hash, Hasher};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// A table's backing store. Page `i` occupies bytes
/// `[i * PAGE_SIZE, (i + 1) * PAGE_SIZE)` of the file.
///
/// Tuple-level operations go through the buffer pool so that every touched
/// page is locked and cached; only raw page IO and the append in
/// `insert_tuple` hit the file directly.
pub struct HeapFile {
    file: Mutex<File>,
    path: PathBuf,
    schema: Schema,
    table_id: TableId,
}

impl HeapFile {
    /// Creates a new, empty heap file.
    pub fn create(path: &Path, schema: Schema) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Self::from_parts(file, path, schema)
    }

    /// Opens an existing heap file.
    pub fn open(path: &Path, schema: Schema) -> StorageResult<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Self::from_parts(file, path, schema)
    }

    fn from_parts(file: File, path: &Path, schema: Schema) -> StorageResult<Self> {
        let path = path.canonicalize()?;
        let table_id = stable_table_id(&path);
        Ok(Self {
            file: Mutex::new(file),
            path,
            schema,
            table_id,
        })
    }

    /// The stable identifier derived from this file's canonical path.
    pub fn table_id(&self) -> TableId {
        self.table_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Fixed serialized row width for this table.
    pub fn row_width(&self) -> usize {
        self.schema.row_width()
    }

    /// Number of whole pages currently in the file.
    pub fn num_pages(&self) -> StorageResult<usize> {
        let len = self.file.lock().metadata()?.len();
        Ok((len / PAGE_SIZE as u64) as usize)
    }

    /// Reads and parses the page at `page_id`'s offset. Fails if the file is
    /// shorter than the page requires.
    pub fn read_page(&self, page_id: PageId) -> StorageResult<HeapPage> {
        if page_id.table_id != self.table_id {
            return Err(StorageError::UnknownTable(page_id.table_id));
        }

        let offset = (page_id.page_no * PAGE_SIZE) as u64;
        let mut file = self.file.lock();
        let len = file.metadata()?.len();
        if offset + PAGE_SIZE as u64 > len {
            return Err(StorageError::InvalidPage {
                page_id,
                reason: format!("offset {} beyond end of file ({} bytes)", offset, len),
            });
        }

        let mut buf = vec![0u8; PAGE_SIZE];
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buf)?;
        drop(file);

        HeapPage::parse(page_id, self.schema.clone(), &buf)
    }

    /// Serializes the page back to its offset and syncs the file.
    pub fn write_page(&self, page: &HeapPage) -> StorageResult<()> {
        let page_id = page.page_id();
        if page_id.table_id != self.table_id {
            return Err(StorageError::UnknownTable(page_id.table_id));
        }

        let offset = (page_id.page_no * PAGE_SIZE) as u64;
        let data = page.to_bytes();
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&data)?;
        file.sync_all()?;
        Ok(())
    }

    /// Appends one empty page at the current end of the file. The file mutex
    /// is held across the length check and the write, so concurrent appends
    /// get distinct page numbers and never land on an existing page.
    fn append_empty_page(&self) -> StorageResult<PageId> {
        let mut file = self.file.lock();
        let len = file.metadata()?.len();
        let page_no = (len / PAGE_SIZE as u64) as usize;
        let page_id = PageId::new(self.table_id, page_no);
        let data = HeapPage::new(page_id, self.schema.clone()).to_bytes();
        file.seek(SeekFrom::Start((page_no * PAGE_SIZE) as u64))?;
        file.write_all(&data)?;
        file.sync_all()?;
        Ok(page_id)
    }

    /// Inserts the tuple into the first page with a free slot, appending a
    /// fresh page if every existing one is full. Visited pages are
    /// exclusive-locked through the pool; pages that turn out to be full are
    /// released again before moving on.
    ///
    /// The chosen page is mutated and marked dirty under one write-lock hold,
    /// so it is never observable in a modified-but-clean state.
    pub fn insert_tuple(
        &self,
        pool: &BufferPool,
        txn: TransactionId,
        tuple: &Tuple,
    ) -> StorageResult<RecordId> {
        if tuple.schema() != &self.schema {
            return Err(StorageError::SchemaMismatch);
        }

        for page_no in 0..self.num_pages()? {
            let page_id = PageId::new(self.table_id, page_no);
            let page = pool.get_page(txn, page_id, LockMode::Exclusive)?;
            {
                let mut page = page.write();
                if page.has_free_slot() {
                    let record_id = page.insert_tuple(tuple.clone())?;
                    page.mark_dirty(Some(txn));
                    return Ok(record_id);
                }
            }
            pool.release_page(txn, page_id);
        }

        // No room anywhere. Append an empty page (durable before anyone can
        // see it), then fetch it through the pool so it ends up locked and
        // cached like any other page.
        let new_page_id = self.append_empty_page()?;
        debug!("{}: allocated {}", txn, new_page_id);

        let page = pool.get_page(txn, new_page_id, LockMode::Exclusive)?;
        let mut page = page.write();
        let record_id = page.insert_tuple(tuple.clone())?;
        page.mark_dirty(Some(txn));
        Ok(record_id)
    }

    /// Clears the slot named by the tuple's record id, marking the page dirty
    /// under the same write-lock hold.
    pub fn delete_tuple(
        &self,
        pool: &BufferPool,
        txn: TransactionId,
        tuple: &Tuple,
    ) -> StorageResult<()> {
        let record_id = tuple.record_id().ok_or(StorageError::MissingRecordId)?;
        let page = pool.get_page(txn, record_id.page_id, LockMode::Exclusive)?;
        let mut page = page.write();
        page.delete_tuple(tuple)?;
        page.mark_dirty(Some(txn));
        Ok(())
    }
}

fn stable_table_id(path: &Path) -> TableId {
    // DefaultHasher with default keys is deterministic across runs, so the
    // id survives process restarts as long as the path does.
    let mut hasher = DefaultHasher::new();
    path.hash(&mut hasher);
    TableId(hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::schema::FieldType;
    use crate::access::tuple::Field;
    use tempfile::tempdir;

    fn int_schema() -> Schema {
        Schema::new(vec![FieldType::Int, FieldType::Int])
    }

    #[test]
    fn test_create_and_reopen() -> StorageResult<()> {
        let dir = tempdir()?;
        let path = dir.path().join("t.dat");

        let id = {
            let file = HeapFile::create(&path, int_schema())?;
            assert_eq!(file.num_pages()?, 0);
            file.table_id()
        };

        let file = HeapFile::open(&path, int_schema())?;
        assert_eq!(file.table_id(), id);
        Ok(())
    }

    #[test]
    fn test_distinct_paths_distinct_ids() -> StorageResult<()> {
        let dir = tempdir()?;
        let a = HeapFile::create(&dir.path().join("a.dat"), int_schema())?;
        let b = HeapFile::create(&dir.path().join("b.dat"), int_schema())?;
        assert_ne!(a.table_id(), b.table_id());
        Ok(())
    }

    #[test]
    fn test_page_round_trip_through_file() -> StorageResult<()> {
        let dir = tempdir()?;
        let file = HeapFile::create(&dir.path().join("t.dat"), int_schema())?;

        let page_id = PageId::new(file.table_id(), 0);
        let mut page = HeapPage::new(page_id, int_schema());
        for i in 0..5 {
            page.insert_tuple(
                Tuple::new(int_schema(), vec![Field::Int(i), Field::Int(-i)]).unwrap(),
            )?;
        }
        file.write_page(&page)?;
        assert_eq!(file.num_pages()?, 1);

        let reread = file.read_page(page_id)?;
        assert_eq!(reread.occupied_slots(), 5);
        let original: Vec<_> = page.iter().cloned().collect();
        let parsed: Vec<_> = reread.iter().cloned().collect();
        assert_eq!(original, parsed);
        Ok(())
    }

    #[test]
    fn test_concurrent_appends_get_distinct_pages() -> StorageResult<()> {
        use std::sync::Arc;
        use std::thread;

        let dir = tempdir()?;
        let file = Arc::new(HeapFile::create(&dir.path().join("t.dat"), int_schema())?);

        let mut handles = vec![];
        for _ in 0..8 {
            let file = Arc::clone(&file);
            handles.push(thread::spawn(move || file.append_empty_page()));
        }
        let mut page_nos = handles
            .into_iter()
            .map(|h| h.join().unwrap().map(|id| id.page_no))
            .collect::<StorageResult<Vec<_>>>()?;
        page_nos.sort_unstable();

        assert_eq!(page_nos, (0..8).collect::<Vec<_>>());
        assert_eq!(file.num_pages()?, 8);
        Ok(())
    }

    #[test]
    fn test_append_never_lands_on_existing_page() -> StorageResult<()> {
        let dir = tempdir()?;
        let file = HeapFile::create(&dir.path().join("t.dat"), int_schema())?;

        let page_id = PageId::new(file.table_id(), 0);
        let mut page = HeapPage::new(page_id, int_schema());
        page.insert_tuple(
            Tuple::new(int_schema(), vec![Field::Int(1), Field::Int(2)]).unwrap(),
        )?;
        file.write_page(&page)?;

        let appended = file.append_empty_page()?;
        assert_eq!(appended.page_no, 1);
        assert_eq!(file.read_page(page_id)?.occupied_slots(), 1);
        assert_eq!(file.read_page(appended)?.occupied_slots(), 0);
        Ok(())
    }

    #[test]
    fn test_read_past_end_fails() -> StorageResult<()> {
        let dir = tempdir()?;
        let file = HeapFile::create(&dir.path().join("t.dat"), int_schema())?;
        let result = file.read_page(PageId::new(file.table_id(), 3));
        assert!(matches!(result, Err(StorageError::InvalidPage { .. })));
        Ok(())
    }

    #[test]
    fn test_foreign_page_id_rejected() -> StorageResult<()> {
        let dir = tempdir()?;
        let file = HeapFile::create(&dir.path().join("t.dat"), int_schema())?;
        let result = file.read_page(PageId::new(TableId(0xDEAD), 0));
        assert!(matches!(result, Err(StorageError::UnknownTable(_))));
        Ok(())
    }
}
