use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use tracing::info;

use crate::config::DatabaseConfig;
use crate::errors::Result;

pub type DbPool = SqlitePool;

/// Creates the embedded SQLite pool and runs pending migrations. WAL mode
/// is enabled so reads aren't blocked behind the writer used by the
/// applier's transactions.
pub async fn create_pool(config: &DatabaseConfig) -> Result<DbPool> {
    info!("opening database at {}", config.url);

    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.url)
        .await?;

    sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;
    sqlx::query("PRAGMA foreign_keys = ON").execute(&pool).await?;

    sqlx::migrate!("./migrations").run(&pool).await?;

    info!("database ready");
    Ok(pool)
}
