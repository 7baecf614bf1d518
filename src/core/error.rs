use super::types::{Direction, Version, display_version};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MigrateError {
    #[error("Cannot read migration source '{}': {source}", path.display())]
    SourceRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid migration source entry '{entry}': {reason}")]
    SourceFormat { entry: String, reason: String },

    #[error("Migration step {0} not found in source")]
    StepNotFound(Version),

    #[error("Version store unavailable during {operation}: {source}")]
    StoreUnavailable {
        operation: &'static str,
        #[source]
        source: sqlx::Error,
    },

    #[error("Migration lock is held by another process (gave up after {waited:?})")]
    LockBusy { waited: Duration },

    #[error(
        "Database is dirty at version {}; inspect the schema manually and force a version to continue",
        display_version(*version)
    )]
    DirtyState { version: Option<Version> },

    #[error("Migration {version} ({direction}) failed: {source}")]
    StepApplication {
        version: Version,
        direction: Direction,
        #[source]
        source: sqlx::Error,
    },

    #[error("Migration run cancelled at version {}", display_version(*version))]
    Cancelled { version: Option<Version> },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Cannot connect to database: {0}")]
    Connect(#[source] sqlx::Error),
}

impl MigrateError {
    pub(crate) fn store(operation: &'static str) -> impl FnOnce(sqlx::Error) -> Self {
        move |source| Self::StoreUnavailable { operation, source }
    }

    /// True when this error left (or found) the version store marked dirty.
    pub fn is_dirty(&self) -> bool {
        matches!(self, Self::DirtyState { .. } | Self::StepApplication { .. })
    }

    /// The migration version this error is about, if any.
    pub fn version(&self) -> Option<Version> {
        match self {
            Self::StepNotFound(version) => Some(*version),
            Self::StepApplication { version, .. } => Some(*version),
            Self::DirtyState { version } | Self::Cancelled { version } => *version,
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, MigrateError>;
