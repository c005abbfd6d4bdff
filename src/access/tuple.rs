//! Fixed-width rows and the values they hold.

use crate::access::schema::{FieldType, Schema};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::PageId;
use std::hash::{Hash, Hasher};

/// Identifies a row's storage location: a page plus a slot within it.
///
/// Valid from the moment the row is inserted until its slot bit is cleared
/// by a delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordId {
    pub page_id: PageId,
    pub slot: usize,
}

impl RecordId {
    pub fn new(page_id: PageId, slot: usize) -> Self {
        Self { page_id, slot }
    }
}

/// A single field value. The union is closed: collaborators (joins,
/// aggregates) rely on `Eq` and `Hash` agreeing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Field {
    Int(i32),
    /// String value plus its declared maximum width. The value never exceeds
    /// the width; `Field::str` truncates at construction.
    Str(String, usize),
}

impl Field {
    /// Builds a string field, truncating the value to `max_len` bytes.
    pub fn str(value: impl Into<String>, max_len: usize) -> Self {
        let mut value = value.into();
        if value.len() > max_len {
            let mut end = max_len;
            while !value.is_char_boundary(end) {
                end -= 1;
            }
            value.truncate(end);
        }
        Field::Str(value, max_len)
    }

    pub fn field_type(&self) -> FieldType {
        match self {
            Field::Int(_) => FieldType::Int,
            Field::Str(_, max_len) => FieldType::Str(*max_len),
        }
    }

    pub fn width(&self) -> usize {
        self.field_type().width()
    }

    /// Serializes the field into `buf`, which must be exactly `self.width()`
    /// bytes. Unused string bytes are zeroed.
    pub fn write_to(&self, buf: &mut [u8]) {
        debug_assert_eq!(buf.len(), self.width());
        match self {
            Field::Int(v) => buf.copy_from_slice(&v.to_le_bytes()),
            Field::Str(s, max_len) => {
                // A hand-built Field can exceed its declared width;
                // `Tuple::new` rejects those, and the clamp keeps this from
                // writing past the slot.
                let bytes = &s.as_bytes()[..s.len().min(*max_len)];
                buf.fill(0);
                buf[..4].copy_from_slice(&(bytes.len() as u32).to_le_bytes());
                buf[4..4 + bytes.len()].copy_from_slice(bytes);
            }
        }
    }

    /// Parses a field of the given type from `buf` (exactly the type's
    /// width).
    pub fn read_from(field_type: FieldType, buf: &[u8]) -> StorageResult<Field> {
        debug_assert_eq!(buf.len(), field_type.width());
        match field_type {
            FieldType::Int => {
                let mut bytes = [0u8; 4];
                bytes.copy_from_slice(&buf[..4]);
                Ok(Field::Int(i32::from_le_bytes(bytes)))
            }
            FieldType::Str(max_len) => {
                let mut len_bytes = [0u8; 4];
                len_bytes.copy_from_slice(&buf[..4]);
                let len = u32::from_le_bytes(len_bytes) as usize;
                if len > max_len {
                    return Err(StorageError::InvalidField(format!(
                        "string length {} exceeds declared width {}",
                        len, max_len
                    )));
                }
                let value = std::str::from_utf8(&buf[4..4 + len])
                    .map_err(|e| StorageError::InvalidField(e.to_string()))?;
                Ok(Field::Str(value.to_string(), max_len))
            }
        }
    }
}

impl std::fmt::Display for Field {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Field::Int(v) => write!(f, "{}", v),
            Field::Str(s, _) => write!(f, "{}", s),
        }
    }
}

/// An ordered sequence of field values conforming to a schema, plus the
/// record id once the row has been persisted.
///
/// Equality and hashing cover the schema and fields only; the record id is
/// storage bookkeeping and takes no part.
#[derive(Debug, Clone)]
pub struct Tuple {
    schema: Schema,
    fields: Vec<Field>,
    record_id: Option<RecordId>,
}

impl Tuple {
    /// Creates a tuple, checking the fields against the schema positionally.
    pub fn new(schema: Schema, fields: Vec<Field>) -> StorageResult<Self> {
        if fields.len() != schema.num_fields() {
            return Err(StorageError::SchemaMismatch);
        }
        for (field, field_type) in fields.iter().zip(schema.types()) {
            if field.field_type() != field_type {
                return Err(StorageError::SchemaMismatch);
            }
            if let Field::Str(s, max_len) = field {
                if s.len() > *max_len {
                    return Err(StorageError::InvalidField(format!(
                        "string length {} exceeds declared width {}",
                        s.len(),
                        max_len
                    )));
                }
            }
        }
        Ok(Self {
            schema,
            fields,
            record_id: None,
        })
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn field(&self, i: usize) -> Option<&Field> {
        self.fields.get(i)
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn record_id(&self) -> Option<RecordId> {
        self.record_id
    }

    pub fn set_record_id(&mut self, record_id: Option<RecordId>) {
        self.record_id = record_id;
    }

    /// Serializes the row into `buf`, which must be exactly the schema's row
    /// width.
    pub fn write_to(&self, buf: &mut [u8]) {
        debug_assert_eq!(buf.len(), self.schema.row_width());
        let mut offset = 0;
        for field in &self.fields {
            let width = field.width();
            field.write_to(&mut buf[offset..offset + width]);
            offset += width;
        }
    }

    /// Parses a row from `buf` (exactly the schema's row width). The result
    /// carries no record id; the page stamps it.
    pub fn read_from(schema: &Schema, buf: &[u8]) -> StorageResult<Tuple> {
        debug_assert_eq!(buf.len(), schema.row_width());
        let mut fields = Vec::with_capacity(schema.num_fields());
        let mut offset = 0;
        for field_type in schema.types() {
            let width = field_type.width();
            fields.push(Field::read_from(field_type, &buf[offset..offset + width])?);
            offset += width;
        }
        Ok(Tuple {
            schema: schema.clone(),
            fields,
            record_id: None,
        })
    }
}

impl PartialEq for Tuple {
    fn eq(&self, other: &Self) -> bool {
        self.schema == other.schema && self.fields == other.fields
    }
}

impl Eq for Tuple {}

impl Hash for Tuple {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.schema.hash(state);
        self.fields.hash(state);
    }
}

impl std::fmt::Display for Tuple {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, field) in self.fields.iter().enumerate() {
            if i > 0 {
                write!(f, "\t")?;
            }
            write!(f, "{}", field)?;
        }
        Ok(())
    }
}
