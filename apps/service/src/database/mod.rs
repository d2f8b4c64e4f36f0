/// Database layer
///
/// libsql-backed implementations of the engine's asset, config and history
/// stores, plus the maintenance operations the CLI needs.

pub mod repository;
pub mod migrations;
pub mod models;

pub use repository::DatabaseImpl;

use anyhow::Result;

/// Initialize database with schema
pub async fn initialize_database(conn: &libsql::Connection) -> Result<()> {
    migrations::run_migrations(conn).await
}
