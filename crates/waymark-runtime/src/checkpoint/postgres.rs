//! PostgreSQL checkpoint store.
//!
//! Keeps a single `(version, dirty)` row in a configurable table and can hold a
//! session advisory lock so that only one process migrates a stream at a time.

use std::future::Future;
use std::pin::Pin;

use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use waymark_core::checkpoint::{Checkpoint, CheckpointStore};
use waymark_core::config::{validate_table_name, CheckpointConfig};
use waymark_core::error::{MigrateError, Result};

/// Salt mixed into every advisory lock key ("WAYMARK" in hex).
const LOCK_SALT: i64 = 0x5741_594D_4152_4B;

/// Checkpoint store backed by a PostgreSQL table.
pub struct PgCheckpointStore {
    pool: PgPool,
    table: String,
    advisory_lock: bool,
    lock_id: i64,
    /// Connection holding the advisory lock; session locks are per connection.
    lock_conn: Mutex<Option<PoolConnection<Postgres>>>,
}

impl PgCheckpointStore {
    /// Create a store for `table`. Advisory locking is off.
    pub fn new(pool: PgPool, table: impl Into<String>) -> Result<Self> {
        let table = table.into();
        validate_table_name(&table)?;
        let lock_id = advisory_lock_id(&table);

        Ok(Self {
            pool,
            table,
            advisory_lock: false,
            lock_id,
            lock_conn: Mutex::new(None),
        })
    }

    /// Create a store from configuration.
    pub fn from_config(pool: PgPool, config: &CheckpointConfig) -> Result<Self> {
        Ok(Self::new(pool, config.table_name.clone())?.with_advisory_lock(config.advisory_lock))
    }

    /// Enable or disable the session advisory lock.
    pub fn with_advisory_lock(mut self, enabled: bool) -> Self {
        self.advisory_lock = enabled;
        self
    }

    /// Name of the checkpoint table.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Key used for `pg_advisory_lock`.
    pub fn lock_id(&self) -> i64 {
        self.lock_id
    }

    async fn update(&self, index: u32, dirty: bool) -> Result<()> {
        let sql = format!("UPDATE {} SET version = $1, dirty = $2", self.table);
        let result = sqlx::query(&sql)
            .bind(i64::from(index))
            .bind(dirty)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                MigrateError::Persistence(format!(
                    "Failed to update checkpoint to {}: {}",
                    index, e
                ))
            })?;

        if result.rows_affected() == 0 {
            return Err(MigrateError::Persistence(format!(
                "Checkpoint row missing from {}",
                self.table
            )));
        }
        Ok(())
    }
}

impl CheckpointStore for PgCheckpointStore {
    fn ensure_schema(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let sql = format!(
                r#"
                CREATE TABLE IF NOT EXISTS {} (
                    version BIGINT NOT NULL DEFAULT 0,
                    dirty BOOLEAN NOT NULL DEFAULT TRUE
                )
                "#,
                self.table
            );
            sqlx::query(&sql).execute(&self.pool).await.map_err(|e| {
                MigrateError::Persistence(format!("Failed to create checkpoint table: {}", e))
            })?;
            Ok(())
        })
    }

    fn read_or_init(&self) -> Pin<Box<dyn Future<Output = Result<Checkpoint>> + Send + '_>> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await.map_err(|e| {
                MigrateError::Persistence(format!("Failed to begin checkpoint read: {}", e))
            })?;

            // Serializes concurrent first-run initializers.
            let lock_sql = format!("LOCK TABLE {} IN SHARE ROW EXCLUSIVE MODE", self.table);
            sqlx::query(&lock_sql)
                .execute(&mut *tx)
                .await
                .map_err(|e| {
                    MigrateError::Persistence(format!("Failed to lock checkpoint table: {}", e))
                })?;

            let select_sql = format!("SELECT version, dirty FROM {} LIMIT 2", self.table);
            let rows: Vec<(i64, bool)> = sqlx::query_as(&select_sql)
                .fetch_all(&mut *tx)
                .await
                .map_err(|e| {
                    MigrateError::Persistence(format!("Failed to read checkpoint: {}", e))
                })?;

            let checkpoint = match rows.as_slice() {
                [] => {
                    debug!("Initializing checkpoint in {}", self.table);
                    let insert_sql = format!(
                        "INSERT INTO {} (version, dirty) VALUES (0, FALSE)",
                        self.table
                    );
                    sqlx::query(&insert_sql)
                        .execute(&mut *tx)
                        .await
                        .map_err(|e| {
                            MigrateError::Persistence(format!(
                                "Failed to initialize checkpoint: {}",
                                e
                            ))
                        })?;
                    Checkpoint::initial()
                }
                [(version, dirty)] => Checkpoint {
                    version: version_from_row(*version)?,
                    dirty: *dirty,
                },
                _ => {
                    return Err(MigrateError::Persistence(format!(
                        "Table {} holds more than one checkpoint row",
                        self.table
                    )))
                }
            };

            tx.commit().await.map_err(|e| {
                MigrateError::Persistence(format!("Failed to commit checkpoint read: {}", e))
            })?;

            Ok(checkpoint)
        })
    }

    fn current(&self) -> Pin<Box<dyn Future<Output = Result<Option<Checkpoint>>> + Send + '_>> {
        Box::pin(async move {
            let exists: bool = sqlx::query_scalar("SELECT to_regclass($1) IS NOT NULL")
                .bind(&self.table)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| {
                    MigrateError::Persistence(format!("Failed to look up checkpoint table: {}", e))
                })?;
            if !exists {
                return Ok(None);
            }

            let sql = format!("SELECT version, dirty FROM {} LIMIT 1", self.table);
            let row: Option<(i64, bool)> = sqlx::query_as(&sql)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| {
                    MigrateError::Persistence(format!("Failed to read checkpoint: {}", e))
                })?;

            match row {
                Some((version, dirty)) => Ok(Some(Checkpoint {
                    version: version_from_row(version)?,
                    dirty,
                })),
                None => Ok(None),
            }
        })
    }

    fn advance(&self, index: u32) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(self.update(index, false))
    }

    fn mark_dirty(&self, index: u32) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(self.update(index, true))
    }

    fn lock(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            if !self.advisory_lock {
                return Ok(());
            }

            let mut slot = self.lock_conn.lock().await;
            if slot.is_some() {
                return Ok(());
            }

            debug!("Acquiring migration lock {} for {}", self.lock_id, self.table);
            let mut conn = self.pool.acquire().await.map_err(|e| {
                MigrateError::Persistence(format!("Failed to acquire lock connection: {}", e))
            })?;
            sqlx::query("SELECT pg_advisory_lock($1)")
                .bind(self.lock_id)
                .execute(&mut *conn)
                .await
                .map_err(|e| {
                    MigrateError::Persistence(format!("Failed to acquire migration lock: {}", e))
                })?;
            debug!("Migration lock acquired");

            *slot = Some(conn);
            Ok(())
        })
    }

    fn unlock(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let Some(mut conn) = self.lock_conn.lock().await.take() else {
                return Ok(());
            };

            let released: bool = match sqlx::query_scalar("SELECT pg_advisory_unlock($1)")
                .bind(self.lock_id)
                .fetch_one(&mut *conn)
                .await
            {
                Ok(released) => released,
                Err(e) => {
                    // The session still owns the lock; it must not go back to the pool.
                    if let Err(close_err) = conn.close().await {
                        warn!("Failed to close migration lock connection: {}", close_err);
                    }
                    return Err(MigrateError::Persistence(format!(
                        "Failed to release migration lock: {}",
                        e
                    )));
                }
            };
            if !released {
                warn!("Migration lock {} was not held by this session", self.lock_id);
            }
            debug!("Migration lock released");
            Ok(())
        })
    }
}

fn version_from_row(version: i64) -> Result<u32> {
    u32::try_from(version).map_err(|_| {
        MigrateError::Persistence(format!("Checkpoint version {} is out of range", version))
    })
}

/// Stable advisory lock key for a table name (FNV-1a).
fn advisory_lock_id(table: &str) -> i64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in table.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    (hash as i64) ^ LOCK_SALT
}
