use super::{Driver, DriverOptions, MigrationLock, ScriptRunner, VersionStore};
use crate::core::{Dialect, MigrateError, Result, SqlScript, VersionState};
use async_trait::async_trait;
use chrono::Utc;
use futures::future::BoxFuture;
use log::{debug, warn};
use sqlx::postgres::PgConnection;
use sqlx::{Connection, Executor};

/// PostgreSQL driver.
///
/// Scripts run in a transaction together with their version record. The
/// migration lock is a session advisory lock keyed on the lock name and the
/// current database.
pub struct PostgresDriver {
    conn: PgConnection,
    options: DriverOptions,
}

const LOCK_KEY: &str = "hashtext($1 || ':' || current_database())::bigint";

impl PostgresDriver {
    /// Opens a connection from a `postgres://` url.
    pub async fn connect(url: &str, options: DriverOptions) -> Result<Self> {
        let conn = PgConnection::connect(url)
            .await
            .map_err(MigrateError::Connect)?;
        Ok(Self::from_connection(conn, options))
    }

    pub fn from_connection(conn: PgConnection, options: DriverOptions) -> Self {
        Self { conn, options }
    }

    pub fn connection(&mut self) -> &mut PgConnection {
        &mut self.conn
    }

    pub fn into_inner(self) -> PgConnection {
        self.conn
    }
}

async fn write_state(
    conn: &mut PgConnection,
    table: &str,
    state: VersionState,
) -> std::result::Result<(), sqlx::Error> {
    let sql = format!(
        "INSERT INTO {} (id, version, dirty, updated_at) VALUES (1, $1, $2, $3) \
         ON CONFLICT (id) DO UPDATE SET version = EXCLUDED.version, dirty = EXCLUDED.dirty, updated_at = EXCLUDED.updated_at",
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
impl VersionStore for PostgresDriver {
    async fn ensure_initialized(&mut self) -> Result<()> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (id INTEGER PRIMARY KEY, version BIGINT, dirty BOOLEAN NOT NULL, updated_at TIMESTAMPTZ NOT NULL)",
            self.options.migrations_table
        );
        sqlx::query(&sql)
            .execute(&mut self.conn)
            .await
            .map_err(MigrateError::store("initialize version table"))?;
        Ok(())
    }

    async fn read_version(&mut self) -> Result<VersionState> {
        let exists: bool = sqlx::query_scalar("SELECT to_regclass($1) IS NOT NULL")
            .bind(&self.options.migrations_table)
            .fetch_one(&mut self.conn)
            .await
            .map_err(MigrateError::store("read version"))?;
        if !exists {
            return Ok(VersionState::default());
        }

        let sql = format!(
            "SELECT version, dirty FROM {} WHERE id = 1",
            self.options.migrations_table
        );
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
impl MigrationLock for PostgresDriver {
    async fn try_lock(&mut self, owner: &str) -> Result<bool> {
        let acquired: bool =
            sqlx::query_scalar(&format!("SELECT pg_try_advisory_lock({})", LOCK_KEY))
                .bind(&self.options.lock_name)
                .fetch_one(&mut self.conn)
                .await
                .map_err(MigrateError::store("acquire lock"))?;

        debug!("pg_try_advisory_lock for {} returned {}", owner, acquired);
        Ok(acquired)
    }

    async fn unlock(&mut self, _owner: &str) -> Result<()> {
        let released: bool =
            sqlx::query_scalar(&format!("SELECT pg_advisory_unlock({})", LOCK_KEY))
                .bind(&self.options.lock_name)
                .fetch_one(&mut self.conn)
                .await
                .map_err(MigrateError::store("release lock"))?;

        if !released {
            warn!(
                "Advisory lock '{}' was not held by this session",
                self.options.lock_name
            );
        }
        Ok(())
    }
}

#[async_trait]
impl ScriptRunner for PostgresDriver {
    async fn run_script(
        &mut self,
        script: &SqlScript,
        outcome: VersionState,
    ) -> std::result::Result<(), sqlx::Error> {
        let mut tx = self.conn.begin().await?;
        let conn: &mut PgConnection = &mut tx;
        if !script.is_blank() {
            conn.execute(script.as_str()).await?;
        }
        write_state(conn, &self.options.migrations_table, outcome).await?;
        tx.commit().await
    }
}

impl Driver for PostgresDriver {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
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
