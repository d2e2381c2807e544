//! SQLite connection pool and schema bootstrap

use anyhow::{Context, Result};
use diesel::prelude::*;
use diesel::r2d2::{self, ConnectionManager, CustomizeConnection, PooledConnection};
use diesel::sql_query;

use crate::error::{EscrowError, EscrowResult};

pub type DbPool = r2d2::Pool<ConnectionManager<SqliteConnection>>;
pub type DbConn = PooledConnection<ConnectionManager<SqliteConnection>>;

/// Applies per-connection PRAGMAs on acquire
#[derive(Debug, Clone)]
struct SqlitePragmaCustomizer;

impl CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for SqlitePragmaCustomizer {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> Result<(), diesel::r2d2::Error> {
        // Wait up to 5 seconds for locks instead of failing immediately
        sql_query("PRAGMA busy_timeout = 5000;")
            .execute(conn)
            .map_err(diesel::r2d2::Error::QueryError)?;

        sql_query("PRAGMA journal_mode = WAL;")
            .execute(conn)
            .map_err(diesel::r2d2::Error::QueryError)?;

        sql_query("PRAGMA synchronous = NORMAL;")
            .execute(conn)
            .map_err(diesel::r2d2::Error::QueryError)?;

        sql_query("PRAGMA foreign_keys = ON;")
            .execute(conn)
            .map_err(diesel::r2d2::Error::QueryError)?;

        Ok(())
    }
}

/// Create a database connection pool.
///
/// # Arguments
/// * `database_url` - Path to the SQLite database file (or `:memory:`)
/// * `max_size` - Maximum pooled connections
pub fn create_pool(database_url: &str, max_size: u32) -> Result<DbPool> {
    let manager = ConnectionManager::<SqliteConnection>::new(database_url);

    r2d2::Pool::builder()
        .max_size(max_size)
        .connection_timeout(std::time::Duration::from_secs(30))
        .connection_customizer(Box::new(SqlitePragmaCustomizer))
        .build(manager)
        .context("Failed to create database connection pool")
}

/// Checked-out connection with the pool error mapped into the taxonomy.
pub fn get_conn(pool: &DbPool) -> EscrowResult<DbConn> {
    pool.get().map_err(|e| EscrowError::Pool(e.to_string()))
}

/// Run a blocking diesel closure on the blocking thread pool.
///
/// All database access from async code goes through here so diesel never
/// blocks a runtime worker.
pub async fn with_conn<T, F>(pool: &DbPool, f: F) -> EscrowResult<T>
where
    F: FnOnce(&mut SqliteConnection) -> EscrowResult<T> + Send + 'static,
    T: Send + 'static,
{
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || {
        let mut conn = get_conn(&pool)?;
        f(&mut conn)
    })
    .await
    .map_err(|e| EscrowError::Internal(format!("blocking task join error: {e}")))?
}

/// Create the escrows table and its indexes if they do not exist.
///
/// Idempotent; runs at startup and in test setup.
pub fn initialize_schema(pool: &DbPool) -> Result<()> {
    let mut conn = pool.get().context("Failed to get DB connection")?;

    sql_query(
        "CREATE TABLE IF NOT EXISTS escrows (
            id TEXT PRIMARY KEY NOT NULL,
            ledger_escrow_id BIGINT,
            seller_address TEXT NOT NULL,
            buyer_address TEXT,
            buyer_token TEXT,
            item_name TEXT NOT NULL,
            item_description TEXT,
            settlement_token TEXT NOT NULL,
            settlement_amount BIGINT NOT NULL,
            fiat_amount BIGINT NOT NULL,
            fiat_currency TEXT NOT NULL,
            release_duration_secs BIGINT NOT NULL,
            release_time TIMESTAMP,
            status TEXT NOT NULL,
            created_at TIMESTAMP NOT NULL,
            updated_at TIMESTAMP NOT NULL,
            funded_at TIMESTAMP,
            shipped_at TIMESTAMP,
            delivered_at TIMESTAMP,
            released_at TIMESTAMP,
            disputed_at TIMESTAMP,
            auto_release_at TIMESTAMP,
            shipment_proof TEXT,
            dispute_reason TEXT,
            dispute_resolution TEXT
        );",
    )
    .execute(&mut conn)
    .context("Failed to create escrows table")?;

    sql_query("CREATE INDEX IF NOT EXISTS idx_escrows_status ON escrows (status);")
        .execute(&mut conn)
        .context("Failed to create status index")?;

    sql_query("CREATE INDEX IF NOT EXISTS idx_escrows_seller ON escrows (seller_address);")
        .execute(&mut conn)
        .context("Failed to create seller index")?;

    Ok(())
}
