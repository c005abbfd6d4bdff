//! Slotted heap pages: an occupancy bitmap followed by fixed-width row slots.

use crate::access::schema::Schema;
use crate::access::tuple::{RecordId, Tuple};
use crate::storage::error::{StorageError, StorageResult};
use crate::transaction::TransactionId;

/// Bytes per page, including the header bitmap.
pub const PAGE_SIZE: usize = 4096;

/// Identifies a table. Derived from a stable hash of the backing file's
/// canonical path, so it is constant for the file's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TableId(pub u64);

impl std::fmt::Display for TableId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "table {:#x}", self.0)
    }
}

/// Addresses one fixed-size page within one table's file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageId {
    pub table_id: TableId,
    pub page_no: usize,
}

impl PageId {
    pub fn new(table_id: TableId, page_no: usize) -> Self {
        Self { table_id, page_no }
    }
}

impl std::fmt::Display for PageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "page {}/{}", self.table_id, self.page_no)
    }
}

/// Number of row slots a page holds for the given row width: the largest N
/// with `N * row_width + ceil(N / 8) <= PAGE_SIZE`.
pub fn slot_count(row_width: usize) -> usize {
    (PAGE_SIZE * 8) / (row_width * 8 + 1)
}

/// Size of the occupancy bitmap in bytes.
pub fn header_size(slot_count: usize) -> usize {
    slot_count.div_ceil(8)
}

/// In-memory image of one page: parsed slots plus dirty bookkeeping.
///
/// The durable form is `to_bytes`/`parse`: `header_size` bitmap bytes (bit
/// `s` lives in byte `s / 8` at position `s % 8`), then `slot_count`
/// contiguous fixed-width slots. Free slots serialize as zeros.
#[derive(Debug, Clone)]
pub struct HeapPage {
    page_id: PageId,
    schema: Schema,
    slots: Vec<Option<Tuple>>,
    dirtied_by: Option<TransactionId>,
}

impl HeapPage {
    /// Creates an empty page.
    pub fn new(page_id: PageId, schema: Schema) -> Self {
        let slots = vec![None; slot_count(schema.row_width())];
        Self {
            page_id,
            schema,
            slots,
            dirtied_by: None,
        }
    }

    /// Parses a page from its durable byte image.
    pub fn parse(page_id: PageId, schema: Schema, data: &[u8]) -> StorageResult<Self> {
        if data.len() != PAGE_SIZE {
            return Err(StorageError::InvalidPage {
                page_id,
                reason: format!("expected {} bytes, got {}", PAGE_SIZE, data.len()),
            });
        }

        let row_width = schema.row_width();
        let count = slot_count(row_width);
        let header = header_size(count);

        let mut slots = Vec::with_capacity(count);
        for slot in 0..count {
            if data[slot / 8] & (1 << (slot % 8)) == 0 {
                slots.push(None);
                continue;
            }
            let offset = header + slot * row_width;
            let mut tuple = Tuple::read_from(&schema, &data[offset..offset + row_width])?;
            tuple.set_record_id(Some(RecordId::new(page_id, slot)));
            slots.push(Some(tuple));
        }

        Ok(Self {
            page_id,
            schema,
            slots,
            dirtied_by: None,
        })
    }

    /// Serializes the bitmap and slot region into a fresh PAGE_SIZE buffer.
    pub fn to_bytes(&self) -> Vec<u8> {
        let row_width = self.schema.row_width();
        let header = header_size(self.slots.len());
        let mut data = vec![0u8; PAGE_SIZE];

        for (slot, tuple) in self.slots.iter().enumerate() {
            if let Some(tuple) = tuple {
                data[slot / 8] |= 1 << (slot % 8);
                let offset = header + slot * row_width;
                tuple.write_to(&mut data[offset..offset + row_width]);
            }
        }
        data
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn occupied_slots(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn free_slots(&self) -> usize {
        self.slots.len() - self.occupied_slots()
    }

    pub fn has_free_slot(&self) -> bool {
        self.slots.iter().any(|s| s.is_none())
    }

    /// Inserts the row into the first free slot and stamps its record id.
    pub fn insert_tuple(&mut self, mut tuple: Tuple) -> StorageResult<RecordId> {
        if tuple.schema() != &self.schema {
            return Err(StorageError::SchemaMismatch);
        }
        let slot = self
            .slots
            .iter()
            .position(|s| s.is_none())
            .ok_or(StorageError::PageFull(self.page_id))?;

        let record_id = RecordId::new(self.page_id, slot);
        tuple.set_record_id(Some(record_id));
        self.slots[slot] = Some(tuple);
        Ok(record_id)
    }

    /// Clears the slot named by the tuple's record id. Fails if the record id
    /// addresses another page or the slot does not hold this row.
    pub fn delete_tuple(&mut self, tuple: &Tuple) -> StorageResult<()> {
        let record_id = tuple.record_id().ok_or(StorageError::MissingRecordId)?;
        if record_id.page_id != self.page_id || record_id.slot >= self.slots.len() {
            return Err(StorageError::TupleNotFound {
                page_id: record_id.page_id,
                slot: record_id.slot,
            });
        }
        match &self.slots[record_id.slot] {
            Some(stored) if stored == tuple => {
                self.slots[record_id.slot] = None;
                Ok(())
            }
            _ => Err(StorageError::TupleNotFound {
                page_id: record_id.page_id,
                slot: record_id.slot,
            }),
        }
    }

    /// Records which transaction dirtied the page, or clears the mark.
    pub fn mark_dirty(&mut self, txn: Option<TransactionId>) {
        self.dirtied_by = txn;
    }

    /// The transaction that last dirtied this page, if any.
    pub fn dirtied_by(&self) -> Option<TransactionId> {
        self.dirtied_by
    }

    /// Yields occupied rows in slot order.
    pub fn iter(&self) -> impl Iterator<Item = &Tuple> {
        self.slots.iter().filter_map(|s| s.as_ref())
    }
}
