pub mod export;
pub mod sqlite_store;
pub mod store;

pub use sqlite_store::SqliteStore;
pub use store::{ChatStore, MemoryStore, StoredSession};
