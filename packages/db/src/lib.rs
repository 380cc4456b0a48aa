//! SurrealDB persistence for job executions and logs.
//!
//! # Features
//!
//! - `memory` (default): in-memory storage for tests and standalone runs
//! - `rocksdb`: RocksDB file-based storage

mod connection;
mod schema;
mod store;
pub mod repositories;

pub use connection::{Database, DbConfig, DbError, get_db, init_db};
pub use schema::init_schema;
pub use store::SurrealStore;

/// Connect and create the schema.
///
/// Call once at startup, before any repository is used.
pub async fn init(config: DbConfig) -> Result<(), DbError> {
    init_db(config).await?;
    init_schema().await?;
    Ok(())
}
