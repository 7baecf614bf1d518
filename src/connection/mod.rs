pub mod config;

use crate::core::{Dialect, MigrateError, Result, VersionState};
use crate::driver::{Driver, MySqlDriver, PostgresDriver, SqliteDriver};
use crate::engine::{Command, MigrationReport, Migrator};
use crate::source::FileSource;
use config::MigrationConfig;
use tracing::{info, warn};

/// Opens a driver for the configured dialect.
pub async fn connect(config: &MigrationConfig) -> Result<Box<dyn Driver>> {
    config.validate().map_err(MigrateError::Config)?;
    let dialect = config.resolved_dialect()?;
    let options = config.driver_options();

    info!(
        %dialect,
        url = %config.redacted_url(),
        environment = %config.environment,
        "connecting to database"
    );

    let driver: Box<dyn Driver> = match dialect {
        Dialect::MySql => Box::new(MySqlDriver::connect(&config.database_url, options).await?),
        Dialect::Postgres => {
            Box::new(PostgresDriver::connect(&config.database_url, options).await?)
        }
        Dialect::Sqlite => Box::new(SqliteDriver::connect(&config.database_url, options).await?),
    };
    Ok(driver)
}

/// Runs one command end to end: connect, migrate from
/// `config.migration_dir`, close.
///
/// Never fails outright; setup errors are returned inside the report.
pub async fn invoke(config: &MigrationConfig, command: Command) -> MigrationReport {
    let mut driver = match connect(config).await {
        Ok(driver) => driver,
        Err(err) => return MigrationReport::failure(command, VersionState::default(), err),
    };

    let migrator = Migrator::new(FileSource::new(&config.migration_dir))
        .with_lock_options(config.lock_options());
    let report = migrator.run(driver.as_mut(), command).await;

    if let Err(err) = driver.close().await {
        warn!(error = %err, "failed to close database connection");
    }
    report
}
