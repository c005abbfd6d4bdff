pub mod buffer;
pub mod disk;
pub mod error;
pub mod page;

pub use buffer::BufferPool;
pub use disk::HeapFile;
pub use error::{StorageError, StorageResult};
pub use page::{HeapPage, PageId, TableId, PAGE_SIZE};
