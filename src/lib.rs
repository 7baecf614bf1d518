// ============================================================================
// rustmigrate Library
// ============================================================================
//
// Versioned SQL schema migrations: an ordered source of paired up/down
// scripts, a single-row version store with a dirty flag inside the target
// database, and a cross-process lock around every run.

pub mod connection;
pub mod core;
pub mod driver;
pub mod engine;
pub mod lock;
pub mod source;

// Re-export main types for convenience
pub use crate::core::{
    AppliedVersion, Dialect, Direction, MigrateError, MigrationStep, Result, SqlScript, Version,
    VersionState,
};
pub use crate::connection::{config::MigrationConfig, connect, invoke};
pub use driver::{
    Driver, DriverOptions, MigrationLock, MySqlDriver, PostgresDriver, ScriptRunner, SqliteDriver,
    VersionStore,
};
pub use engine::{Command, MigrationPlan, MigrationReport, Migrator, PlannedStep, StepStatus};
pub use lock::{LockHandle, LockOptions};
pub use source::{FileSource, MemorySource, MigrationSource};

// Cancellation handle accepted by `Migrator::with_cancellation`
pub use tokio_util::sync::CancellationToken;
