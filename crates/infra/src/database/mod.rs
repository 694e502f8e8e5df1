//! SQLite persistence layer
//!
//! A shared [`DbManager`] owns the connection pool; one repository per store
//! port runs its blocking work on the tokio blocking pool.

mod entity_store;
mod history_repository;
mod kv_repository;
mod manager;
mod outbox_repository;

pub use entity_store::SqliteLocalStore;
pub use history_repository::SqliteHistoryRepository;
pub use kv_repository::SqliteKvRepository;
pub use manager::{validated_table_name, DbConnection, DbManager};
pub use outbox_repository::SqliteOutboxRepository;
