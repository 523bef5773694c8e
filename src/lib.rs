pub mod access;
pub mod concurrency;
pub mod storage;
