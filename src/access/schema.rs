//! Schema descriptors for fixed-width rows.

use std::hash::{Hash, Hasher};

/// Types a field can take. Every type has a fixed serialized width, so a
/// schema always describes a fixed-width row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    /// 4-byte signed integer.
    Int,
    /// String of at most `max_len` bytes, stored as a 4-byte length prefix
    /// followed by `max_len` bytes (zero padded).
    Str(usize),
}

impl FieldType {
    /// Serialized width in bytes.
    pub fn width(&self) -> usize {
        match self {
            FieldType::Int => 4,
            FieldType::Str(max_len) => 4 + max_len,
        }
    }
}

/// An ordered sequence of field types with optional column names.
///
/// Two schemas compare equal iff their type sequences match positionally;
/// names are ignored by both `Eq` and `Hash`.
#[derive(Debug, Clone)]
pub struct Schema {
    fields: Vec<(FieldType, Option<String>)>,
}

impl Schema {
    /// Creates a schema with anonymous fields.
    pub fn new(types: Vec<FieldType>) -> Self {
        Self {
            fields: types.into_iter().map(|t| (t, None)).collect(),
        }
    }

    /// Creates a schema with named fields.
    pub fn with_names(fields: Vec<(FieldType, Option<String>)>) -> Self {
        Self { fields }
    }

    pub fn num_fields(&self) -> usize {
        self.fields.len()
    }

    pub fn field_type(&self, i: usize) -> Option<FieldType> {
        self.fields.get(i).map(|(t, _)| *t)
    }

    pub fn field_name(&self, i: usize) -> Option<&str> {
        self.fields.get(i).and_then(|(_, n)| n.as_deref())
    }

    /// Index of the first field with the given name.
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields
            .iter()
            .position(|(_, n)| n.as_deref() == Some(name))
    }

    pub fn types(&self) -> impl Iterator<Item = FieldType> + '_ {
        self.fields.iter().map(|(t, _)| *t)
    }

    /// Fixed serialized row width in bytes.
    pub fn row_width(&self) -> usize {
        self.fields.iter().map(|(t, _)| t.width()).sum()
    }

    /// Concatenates two schemas positionally: all of `a`'s fields followed by
    /// all of `b`'s.
    pub fn merge(a: &Schema, b: &Schema) -> Schema {
        let mut fields = a.fields.clone();
        fields.extend(b.fields.iter().cloned());
        Schema { fields }
    }
}

impl PartialEq for Schema {
    fn eq(&self, other: &Self) -> bool {
        self.num_fields() == other.num_fields() && self.types().eq(other.types())
    }
}

impl Eq for Schema {}

impl Hash for Schema {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for t in self.types() {
            t.hash(state);
        }
    }
}

impl std::fmt::Display for Schema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, (t, name)) in self.fields.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match t {
                FieldType::Int => write!(f, "INT")?,
                FieldType::Str(n) => write!(f, "STR({})", n)?,
            }
            if let Some(name) = name {
                write!(f, "({})", name)?;
            }
        }
        Ok(())
    }
}
