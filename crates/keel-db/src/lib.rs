//! Build history storage for the Keel CI server.
//!
//! Provides [`keel_core::BuildStore`] implementations: an in-memory store
//! and a SQLite store backed by sqlx.

pub mod error;
pub mod memory;
pub mod sqlite;

pub use error::{DbError, DbResult};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use keel_core::BuildStore;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

/// Database setting that selects the in-memory store.
pub const MEMORY: &str = "memory";

/// Create a new database connection pool.
pub async fn create_pool(database_url: &str) -> DbResult<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

    // An in-memory database lives as long as its only connection
    let in_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
    let pool = if in_memory {
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?
    } else {
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?
    };
    Ok(pool)
}

/// Run database migrations.
pub async fn run_migrations(pool: &SqlitePool) -> DbResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Open the store a `database` setting points at.
pub async fn open_store(database: &str) -> DbResult<Arc<dyn BuildStore>> {
    if database == MEMORY {
        info!("Using in-memory build store");
        return Ok(Arc::new(MemoryStore::new()));
    }

    info!(database = %database, "Opening SQLite build store");
    let pool = create_pool(database).await?;
    run_migrations(&pool).await?;
    Ok(Arc::new(SqliteStore::new(pool)))
}
