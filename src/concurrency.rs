//! Concurrency control: tuple-level locking under two-phase locking with
//! wait-die deadlock prevention, and the transaction state it drives.

pub mod lock;
pub mod transaction;

pub use lock::LockManager;
pub use transaction::{Transaction, TransactionState};
