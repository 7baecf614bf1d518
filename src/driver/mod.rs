// ============================================================================
// Dialect Drivers
// ============================================================================
//
// A driver owns one database connection and provides the three capabilities
// the engine needs from it: the version store, the cross-process lock and
// script execution. Adding a dialect means implementing these traits; the
// engine itself never matches on the dialect.

pub mod mysql;
pub mod postgres;
pub mod sqlite;

pub use mysql::MySqlDriver;
pub use postgres::PostgresDriver;
pub use sqlite::SqliteDriver;

use crate::core::{Dialect, Result, SqlScript, VersionState};
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::time::Duration;

pub const DEFAULT_MIGRATIONS_TABLE: &str = "schema_migrations";
pub const DEFAULT_LOCK_TABLE: &str = "schema_migrations_lock";
pub const DEFAULT_LOCK_NAME: &str = "rustmigrate";

/// Durable `{version, dirty}` record inside the target database.
#[async_trait]
pub trait VersionStore: Send {
    /// Creates the version table if it does not exist yet.
    async fn ensure_initialized(&mut self) -> Result<()>;

    /// Reads the current state. A missing table reads as "nothing applied".
    async fn read_version(&mut self) -> Result<VersionState>;

    /// Overwrites the single state row.
    async fn write_version(&mut self, state: VersionState) -> Result<()>;
}

/// Cross-process mutual exclusion for migration runs.
#[async_trait]
pub trait MigrationLock: Send {
    /// Attempts to take the lock for `owner` without waiting.
    async fn try_lock(&mut self, owner: &str) -> Result<bool>;

    /// Keeps a held lock alive. Session-scoped locks need nothing here.
    async fn refresh_lock(&mut self, _owner: &str) -> Result<()> {
        Ok(())
    }

    async fn unlock(&mut self, owner: &str) -> Result<()>;
}

/// Executes migration scripts.
#[async_trait]
pub trait ScriptRunner: Send {
    /// Runs `script` and records `outcome` in the version store.
    ///
    /// Dialects with transactional DDL do both in one transaction, so a
    /// failing script leaves neither schema changes nor a new version behind.
    /// Other dialects run the script and then write the record.
    async fn run_script(
        &mut self,
        script: &SqlScript,
        outcome: VersionState,
    ) -> std::result::Result<(), sqlx::Error>;
}

/// A database connection usable by the migration engine.
pub trait Driver: VersionStore + MigrationLock + ScriptRunner {
    fn dialect(&self) -> Dialect;

    /// Closes the underlying connection.
    fn close(self: Box<Self>) -> BoxFuture<'static, Result<()>>;
}

/// Names and timings shared by all drivers.
#[derive(Debug, Clone)]
pub struct DriverOptions {
    /// Table holding the version row.
    pub migrations_table: String,
    /// Table holding the lock row (dialects without advisory locks).
    pub lock_table: String,
    /// Name of the advisory lock (dialects with advisory locks).
    pub lock_name: String,
    /// A lock row whose heartbeat is older than this is considered abandoned.
    pub lock_ttl: Duration,
}

/// Splits `schema.table` into its parts; unqualified names have no schema.
pub(crate) fn split_table_name(name: &str) -> (Option<&str>, &str) {
    match name.split_once('.') {
        Some((schema, table)) => (Some(schema), table),
        None => (None, name),
    }
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            migrations_table: DEFAULT_MIGRATIONS_TABLE.to_string(),
            lock_table: DEFAULT_LOCK_TABLE.to_string(),
            lock_name: DEFAULT_LOCK_NAME.to_string(),
            lock_ttl: Duration::from_secs(600),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_table_name() {
        assert_eq!(split_table_name("schema_migrations"), (None, "schema_migrations"));
        assert_eq!(split_table_name("meta.versions"), (Some("meta"), "versions"));
    }
}
