pub mod scan;
pub mod schema;
pub mod tuple;

pub use scan::SeqScan;
pub use schema::{FieldType, Schema};
pub use tuple::{Field, RecordId, Tuple};
