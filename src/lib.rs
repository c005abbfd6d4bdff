pub mod access;
pub mod concurrency;
pub mod storage;
pub mod transaction;
