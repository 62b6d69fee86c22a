//! SQLite pool helpers and error mapping.

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

use crate::error::EngineError;

/// Conservative bound on bind parameters per statement. SQLite's default
/// limit is 32766; bulk inserts size their chunks so a single statement
/// stays under this.
pub const SQLITE_BIND_LIMIT: usize = 32_000;

/// Open a pool against the cache database. `sqlite::memory:` urls must use
/// a single connection, otherwise every connection sees its own database.
pub async fn connect(url: &str, max_connections: u32) -> Result<SqlitePool, sqlx::Error> {
    let options: SqliteConnectOptions = url.parse::<SqliteConnectOptions>()?.create_if_missing(true);
    SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await
}

pub fn map_sqlx_error(err: sqlx::Error) -> EngineError {
    match err {
        sqlx::Error::Database(db) if db.message().contains("UNIQUE constraint failed") => {
            EngineError::storage(format!("unique constraint violated: {}", db.message()))
        }
        sqlx::Error::PoolTimedOut => EngineError::storage("connection pool timed out"),
        other => EngineError::storage(other.to_string()),
    }
}
