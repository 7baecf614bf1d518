use super::{Driver, DriverOptions, MigrationLock, ScriptRunner, VersionStore, split_table_name};
use crate::core::{Dialect, MigrateError, Result, SqlScript, VersionState};
use async_trait::async_trait;
use chrono::Utc;
use futures::future::BoxFuture;
use log::{debug, warn};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
use sqlx::{ConnectOptions, Connection, Executor};
use std::time::Duration;

/// Busy wait applied while polling for the lock row, in milliseconds.
///
/// The connection's own busy timeout still applies to scripts; a lock
/// attempt that meets a writer gives up quickly and lets the polling loop
/// in `lock::acquire` enforce the caller's timeout.
const LOCK_BUSY_TIMEOUT_MS: i64 = 50;

/// SQLite driver.
///
/// SQLite has no advisory locks, so the migration lock is a row in a
/// dedicated table carrying a heartbeat timestamp. A row whose heartbeat is
/// older than `DriverOptions::lock_ttl` belongs to a crashed process and is
/// reclaimed by the next contender.
pub struct SqliteDriver {
    conn: SqliteConnection,
    options: DriverOptions,
}

impl SqliteDriver {
    /// Opens a connection from a `sqlite:` url.
    pub async fn connect(url: &str, options: DriverOptions) -> Result<Self> {
        let conn = SqliteConnection::connect(url)
            .await
            .map_err(MigrateError::Connect)?;
        Ok(Self::from_connection(conn, options))
    }

    /// Opens a connection from explicit connect options.
    pub async fn connect_with(
        connect_options: &SqliteConnectOptions,
        options: DriverOptions,
    ) -> Result<Self> {
        let conn = connect_options
            .connect()
            .await
            .map_err(MigrateError::Connect)?;
        Ok(Self::from_connection(conn, options))
    }

    /// Wraps an already open connection.
    pub fn from_connection(conn: SqliteConnection, options: DriverOptions) -> Self {
        Self { conn, options }
    }

    pub fn connection(&mut self) -> &mut SqliteConnection {
        &mut self.conn
    }

    pub fn into_inner(self) -> SqliteConnection {
        self.conn
    }

    async fn table_exists(&mut self, table: &str) -> Result<bool> {
        let (schema, name) = split_table_name(table);
        let sql = format!(
            "SELECT COUNT(*) FROM {}.sqlite_master WHERE type = 'table' AND name = ?",
            schema.unwrap_or("main")
        );
        let count: i64 = sqlx::query_scalar(&sql)
            .bind(name)
            .fetch_one(&mut self.conn)
            .await
            .map_err(MigrateError::store("read version"))?;
        Ok(count > 0)
    }

    async fn set_busy_timeout(&mut self, millis: i64) -> std::result::Result<(), sqlx::Error> {
        sqlx::query(&format!("PRAGMA busy_timeout = {}", millis))
            .execute(&mut self.conn)
            .await?;
        Ok(())
    }

    async fn claim_lock_row(&mut self, owner: &str) -> std::result::Result<bool, sqlx::Error> {
        let table = self.options.lock_table.clone();
        let now = Utc::now().timestamp_millis();

        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {} (id INTEGER PRIMARY KEY, owner TEXT NOT NULL, heartbeat_at BIGINT NOT NULL)",
            table
        ))
        .execute(&mut self.conn)
        .await?;

        let reclaimed = sqlx::query(&format!(
            "DELETE FROM {} WHERE id = 1 AND heartbeat_at < ?",
            table
        ))
        .bind(now.saturating_sub(self.ttl_millis()))
        .execute(&mut self.conn)
        .await?;
        if reclaimed.rows_affected() > 0 {
            warn!("Reclaimed abandoned migration lock in '{}'", table);
        }

        sqlx::query(&format!(
            "INSERT OR IGNORE INTO {} (id, owner, heartbeat_at) VALUES (1, ?, ?)",
            table
        ))
        .bind(owner)
        .bind(now)
        .execute(&mut self.conn)
        .await?;

        let holder: Option<String> =
            sqlx::query_scalar(&format!("SELECT owner FROM {} WHERE id = 1", table))
                .fetch_optional(&mut self.conn)
                .await?;

        debug!("Lock '{}' held by {:?}", table, holder);
        Ok(holder.as_deref() == Some(owner))
    }

    fn ttl_millis(&self) -> i64 {
        i64::try_from(self.options.lock_ttl.as_millis()).unwrap_or(i64::MAX)
    }
}

/// SQLITE_BUSY or SQLITE_LOCKED, including their extended codes.
fn is_busy(err: &sqlx::Error) -> bool {
    let sqlx::Error::Database(db) = err else {
        return false;
    };
    db.code()
        .and_then(|code| code.parse::<i32>().ok())
        .is_some_and(|code| matches!(code & 0xff, 5 | 6))
}

async fn write_state(
    conn: &mut SqliteConnection,
    table: &str,
    state: VersionState,
) -> std::result::Result<(), sqlx::Error> {
    let sql = format!(
        "INSERT INTO {} (id, version, dirty, updated_at) VALUES (1, ?, ?, ?) \
         ON CONFLICT(id) DO UPDATE SET version = excluded.version, dirty = excluded.dirty, updated_at = excluded.updated_at",
        table
    );
    sqlx::query(&sql)
        .bind(state.version)
        .bind(state.dirty)
        .bind(Utc::now())
        .execute(&mut *conn)
        .await?;
    Ok(())
}

#[async_trait]
impl VersionStore for SqliteDriver {
    async fn ensure_initialized(&mut self) -> Result<()> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (id INTEGER PRIMARY KEY, version BIGINT, dirty BOOLEAN NOT NULL, updated_at TIMESTAMP NOT NULL)",
            self.options.migrations_table
        );
        sqlx::query(&sql)
            .execute(&mut self.conn)
            .await
            .map_err(MigrateError::store("initialize version table"))?;
        Ok(())
    }

    async fn read_version(&mut self) -> Result<VersionState> {
        let table = self.options.migrations_table.clone();
        if !self.table_exists(&table).await? {
            return Ok(VersionState::default());
        }

        let sql = format!("SELECT version, dirty FROM {} WHERE id = 1", table);
        let row: Option<(Option<i64>, bool)> = sqlx::query_as(&sql)
            .fetch_optional(&mut self.conn)
            .await
            .map_err(MigrateError::store("read version"))?;

        Ok(row
            .map(|(version, dirty)| VersionState { version, dirty })
            .unwrap_or_default())
    }

    async fn write_version(&mut self, state: VersionState) -> Result<()> {
        write_state(&mut self.conn, &self.options.migrations_table, state)
            .await
            .map_err(MigrateError::store("write version"))
    }
}

#[async_trait]
impl MigrationLock for SqliteDriver {
    async fn try_lock(&mut self, owner: &str) -> Result<bool> {
        let busy_timeout: i64 = sqlx::query_scalar("PRAGMA busy_timeout")
            .fetch_one(&mut self.conn)
            .await
            .map_err(MigrateError::store("acquire lock"))?;
        self.set_busy_timeout(LOCK_BUSY_TIMEOUT_MS)
            .await
            .map_err(MigrateError::store("acquire lock"))?;

        let attempt = self.claim_lock_row(owner).await;
        self.set_busy_timeout(busy_timeout)
            .await
            .map_err(MigrateError::store("acquire lock"))?;

        match attempt {
            Ok(acquired) => Ok(acquired),
            Err(err) if is_busy(&err) => {
                debug!("Lock table busy, another run is writing: {}", err);
                Ok(false)
            }
            Err(err) => Err(MigrateError::store("acquire lock")(err)),
        }
    }

    async fn refresh_lock(&mut self, owner: &str) -> Result<()> {
        let result = sqlx::query(&format!(
            "UPDATE {} SET heartbeat_at = ? WHERE id = 1 AND owner = ?",
            self.options.lock_table
        ))
        .bind(Utc::now().timestamp_millis())
        .bind(owner)
        .execute(&mut self.conn)
        .await
        .map_err(MigrateError::store("refresh lock"))?;

        if result.rows_affected() == 0 {
            warn!("Migration lock was reclaimed by another process");
            return Err(MigrateError::LockBusy {
                waited: Duration::ZERO,
            });
        }
        Ok(())
    }

    async fn unlock(&mut self, owner: &str) -> Result<()> {
        sqlx::query(&format!(
            "DELETE FROM {} WHERE id = 1 AND owner = ?",
            self.options.lock_table
        ))
        .bind(owner)
        .execute(&mut self.conn)
        .await
        .map_err(MigrateError::store("release lock"))?;
        Ok(())
    }
}

#[async_trait]
impl ScriptRunner for SqliteDriver {
    async fn run_script(
        &mut self,
        script: &SqlScript,
        outcome: VersionState,
    ) -> std::result::Result<(), sqlx::Error> {
        let mut tx = self.conn.begin().await?;
        let conn: &mut SqliteConnection = &mut tx;
        if !script.is_blank() {
            conn.execute(script.as_str()).await?;
        }
        write_state(conn, &self.options.migrations_table, outcome).await?;
        tx.commit().await
    }
}

impl Driver for SqliteDriver {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn close(self: Box<Self>) -> BoxFuture<'static, Result<()>> {
        let driver = *self;
        Box::pin(async move {
            driver
                .conn
                .close()
                .await
                .map_err(MigrateError::store("close connection"))
        })
    }
}
