//! Persistent stores: the main transaction store and the duplicate-token
//! registry. Both sit on SQLite behind a `parking_lot::Mutex`; the registry
//! also has an in-memory implementation for tests.

pub mod token_registry;
pub mod transaction_store;

pub use token_registry::{
    MemoryTokenRegistry, RegisterOutcome, SqliteTokenRegistry, TokenRegistry,
};
pub use transaction_store::TransactionStore;
