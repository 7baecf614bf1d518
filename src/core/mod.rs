pub mod error;
pub mod types;

pub use error::{MigrateError, Result};
pub use types::{AppliedVersion, Dialect, Direction, MigrationStep, SqlScript, Version, VersionState};
