mod memory;
mod schema;
mod sqlite;
mod store;
mod types;

pub use memory::{MemoryStore, MemoryTransaction};
pub use schema::Database;
pub use sqlite::SqliteTransaction;
pub use store::{Store, StoreTransaction};
pub use types::{DatabaseError, Feed, Item, StoreError};
