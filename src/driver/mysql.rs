use super::{Driver, DriverOptions, MigrationLock, ScriptRunner, VersionStore, split_table_name};
use crate::core::{Dialect, MigrateError, Result, SqlScript, VersionState};
use async_trait::async_trait;
use chrono::Utc;
use futures::future::BoxFuture;
use log::{debug, warn};
use sqlx::mysql::MySqlConnection;
use sqlx::{Connection, Executor};

/// MySQL / MariaDB driver.
///
/// MySQL commits DDL implicitly, so a script and its version record can not
/// share a transaction. The engine writes a dirty marker before each script
/// and this driver writes the clean record right after it.
///
/// The migration lock is a named lock (`GET_LOCK`) scoped to the session and
/// to the current database; the server frees it when the connection drops.
pub struct MySqlDriver {
    conn: MySqlConnection,
    options: DriverOptions,
}

impl MySqlDriver {
    /// Opens a connection from a `mysql://` url.
    pub async fn connect(url: &str, options: DriverOptions) -> Result<Self> {
        let conn = MySqlConnection::connect(url)
            .await
            .map_err(MigrateError::Connect)?;
        Ok(Self::from_connection(conn, options))
    }

    pub fn from_connection(conn: MySqlConnection, options: DriverOptions) -> Self {
        Self { conn, options }
    }

    pub fn connection(&mut self) -> &mut MySqlConnection {
        &mut self.conn
    }

    pub fn into_inner(self) -> MySqlConnection {
        self.conn
    }
}

/// Interprets a `RELEASE_LOCK` result: 1 released, 0 held by another
/// session, NULL no such lock.
fn lock_released(status: Option<i64>, lock_name: &str) -> bool {
    match status {
        Some(1) => true,
        Some(_) => {
            warn!("Migration lock '{}' is held by another session", lock_name);
            false
        }
        None => {
            warn!("Migration lock '{}' was not held at release", lock_name);
            false
        }
    }
}

async fn write_state(
    conn: &mut MySqlConnection,
    table: &str,
    state: VersionState,
) -> std::result::Result<(), sqlx::Error> {
    let sql = format!(
        "INSERT INTO {} (id, version, dirty, updated_at) VALUES (1, ?, ?, ?) \
         ON DUPLICATE KEY UPDATE version = VALUES(version), dirty = VALUES(dirty), updated_at = VALUES(updated_at)",
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
impl VersionStore for MySqlDriver {
    async fn ensure_initialized(&mut self) -> Result<()> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (id INT NOT NULL PRIMARY KEY, version BIGINT NULL, dirty BOOLEAN NOT NULL, updated_at TIMESTAMP NOT NULL)",
            self.options.migrations_table
        );
        sqlx::query(&sql)
            .execute(&mut self.conn)
            .await
            .map_err(MigrateError::store("initialize version table"))?;
        Ok(())
    }

    async fn read_version(&mut self) -> Result<VersionState> {
        let (schema, table) = split_table_name(&self.options.migrations_table);
        let exists: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM information_schema.tables WHERE table_schema = COALESCE(?, DATABASE()) AND table_name = ?",
        )
        .bind(schema)
        .bind(table)
        .fetch_one(&mut self.conn)
        .await
        .map_err(MigrateError::store("read version"))?;
        if exists == 0 {
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
impl MigrationLock for MySqlDriver {
    async fn try_lock(&mut self, owner: &str) -> Result<bool> {
        let acquired: Option<i64> = sqlx::query_scalar(
            "SELECT CAST(GET_LOCK(CONCAT(?, ':', COALESCE(DATABASE(), '')), 0) AS SIGNED)",
        )
        .bind(&self.options.lock_name)
        .fetch_one(&mut self.conn)
        .await
        .map_err(MigrateError::store("acquire lock"))?;

        debug!("GET_LOCK for {} returned {:?}", owner, acquired);
        Ok(acquired == Some(1))
    }

    async fn unlock(&mut self, _owner: &str) -> Result<()> {
        let status: Option<i64> = sqlx::query_scalar(
            "SELECT CAST(RELEASE_LOCK(CONCAT(?, ':', COALESCE(DATABASE(), ''))) AS SIGNED)",
        )
        .bind(&self.options.lock_name)
        .fetch_one(&mut self.conn)
        .await
        .map_err(MigrateError::store("release lock"))?;

        lock_released(status, &self.options.lock_name);
        Ok(())
    }
}

#[async_trait]
impl ScriptRunner for MySqlDriver {
    async fn run_script(
        &mut self,
        script: &SqlScript,
        outcome: VersionState,
    ) -> std::result::Result<(), sqlx::Error> {
        let conn = &mut self.conn;
        if !script.is_blank() {
            conn.execute(script.as_str()).await?;
        }
        write_state(conn, &self.options.migrations_table, outcome).await
    }
}

impl Driver for MySqlDriver {
    fn dialect(&self) -> Dialect {
        Dialect::MySql
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_status() {
        assert!(lock_released(Some(1), "rustmigrate"));
        assert!(!lock_released(Some(0), "rustmigrate"));
        assert!(!lock_released(None, "rustmigrate"));
    }
}
