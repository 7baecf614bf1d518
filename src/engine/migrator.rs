// ============================================================================
// Migration Engine
// ============================================================================

use super::plan::{MigrationPlan, PlannedStep};
use super::report::{Command, MigrationReport, StepStatus};
use crate::core::{AppliedVersion, Direction, MigrateError, Result, Version, VersionState};
use crate::driver::Driver;
use crate::lock::{self, LockHandle, LockOptions};
use crate::source::MigrationSource;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span, warn};

#[derive(Debug, Clone, Copy)]
enum Operation {
    Apply(Direction),
    Force(Option<Version>),
}

/// Applies migrations from a source to a database.
///
/// Every mutating call holds the migration lock for its whole duration and
/// releases it on every exit path, including panics inside a driver. Steps
/// run strictly one after another on the borrowed connection.
///
/// # Examples
///
/// ```no_run
/// use rustmigrate::{FileSource, Migrator, SqliteDriver, DriverOptions};
///
/// # async fn run() -> rustmigrate::Result<()> {
/// let mut driver = SqliteDriver::connect("sqlite://app.db", DriverOptions::default()).await?;
/// let migrator = Migrator::new(FileSource::new("db/migrations"));
///
/// let applied = migrator.migrate_up(&mut driver).await?;
/// println!("schema at {:?}", applied);
/// # Ok(())
/// # }
/// ```
pub struct Migrator<S> {
    source: S,
    lock_options: LockOptions,
    cancel: CancellationToken,
}

impl<S: MigrationSource> Migrator<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            lock_options: LockOptions::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_lock_options(mut self, options: LockOptions) -> Self {
        self.lock_options = options;
        self
    }

    /// Stops a run before its next step once `token` is cancelled. A step
    /// that already started always runs to completion.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Applies every pending step in ascending order.
    ///
    /// Returns the highest applied version; when nothing is pending this is
    /// the unchanged current version. A failing script marks its version
    /// dirty and stops the run.
    pub async fn migrate_up<D>(&self, driver: &mut D) -> Result<AppliedVersion>
    where
        D: Driver + ?Sized,
    {
        let state = self
            .locked(driver, Operation::Apply(Direction::Up))
            .await?;
        Ok(state.version)
    }

    /// Rolls back the current version only, never more than one step.
    ///
    /// Returns the version now applied (the preceding source version, or
    /// `None`). A no-op when nothing is applied.
    pub async fn migrate_down<D>(&self, driver: &mut D) -> Result<AppliedVersion>
    where
        D: Driver + ?Sized,
    {
        let state = self
            .locked(driver, Operation::Apply(Direction::Down))
            .await?;
        Ok(state.version)
    }

    /// Reads the version store without taking the lock.
    pub async fn current_version<D>(&self, driver: &mut D) -> Result<VersionState>
    where
        D: Driver + ?Sized,
    {
        driver.read_version().await
    }

    /// Records `version` as applied and clean without running any script.
    ///
    /// This is the only way to clear a dirty state; use it after checking
    /// the schema by hand.
    pub async fn force<D>(&self, driver: &mut D, version: Option<Version>) -> Result<VersionState>
    where
        D: Driver + ?Sized,
    {
        self.locked(driver, Operation::Force(version)).await
    }

    /// Lists every source step with its applied flag.
    pub async fn status<D>(&self, driver: &mut D) -> Result<Vec<StepStatus>>
    where
        D: Driver + ?Sized,
    {
        let state = driver.read_version().await?;
        let steps = self.source.list().await?;

        Ok(steps
            .into_iter()
            .map(|step| StepStatus {
                applied: state.version.is_some_and(|current| step.version <= current),
                dirty: state.dirty && state.version == Some(step.version),
                version: step.version,
                name: step.name,
            })
            .collect())
    }

    /// Runs `command` and reports the resulting store state.
    ///
    /// The state in the report is always re-read from the store; if that
    /// read fails the failure is reported instead of a guessed version.
    pub async fn run<D>(&self, driver: &mut D, command: Command) -> MigrationReport
    where
        D: Driver + ?Sized,
    {
        let result = match command {
            Command::Up => self.migrate_up(&mut *driver).await.map(|_| ()),
            Command::Down => self.migrate_down(&mut *driver).await.map(|_| ()),
            Command::Version => Ok(()),
            Command::Force(version) => self.force(&mut *driver, version).await.map(|_| ()),
        };

        match (result, driver.read_version().await) {
            (Ok(()), Ok(state)) => MigrationReport::success(command, state),
            (Ok(()), Err(read_err)) => {
                MigrationReport::failure(command, VersionState::default(), read_err)
            }
            (Err(err), Ok(state)) => MigrationReport::failure(command, state, err),
            (Err(err), Err(read_err)) => {
                warn!(error = %read_err, "could not read version after failed run");
                let state = VersionState {
                    version: err.version(),
                    dirty: err.is_dirty(),
                };
                MigrationReport::failure(command, state, err)
            }
        }
    }

    async fn locked<D>(&self, driver: &mut D, operation: Operation) -> Result<VersionState>
    where
        D: Driver + ?Sized,
    {
        let span = info_span!("migrate", ?operation, dialect = %driver.dialect());

        async move {
            let handle = lock::acquire(&mut *driver, &self.lock_options).await?;
            let outcome = AssertUnwindSafe(self.execute(&mut *driver, &handle, operation))
                .catch_unwind()
                .await;
            let released = lock::release(&mut *driver, handle).await;

            match outcome {
                Err(panic) => {
                    if let Err(err) = released {
                        error!(error = %err, "failed to release migration lock after panic");
                    }
                    std::panic::resume_unwind(panic)
                }
                Ok(Err(err)) => {
                    if let Err(release_err) = released {
                        error!(error = %release_err, "failed to release migration lock");
                    }
                    Err(err)
                }
                Ok(Ok(state)) => {
                    released?;
                    Ok(state)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn execute<D>(
        &self,
        driver: &mut D,
        handle: &LockHandle,
        operation: Operation,
    ) -> Result<VersionState>
    where
        D: Driver + ?Sized,
    {
        driver.ensure_initialized().await?;
        let state = driver.read_version().await?;

        let direction = match operation {
            Operation::Force(version) => return self.force_locked(driver, state, version).await,
            Operation::Apply(direction) => direction,
        };

        if state.dirty {
            error!(%state, "refusing to migrate a dirty database");
            return Err(MigrateError::DirtyState {
                version: state.version,
            });
        }

        let steps = self.source.list().await?;
        let plan = match direction {
            Direction::Up => MigrationPlan::up(&steps, state.version)?,
            Direction::Down => MigrationPlan::down(&steps, state.version)?,
        };

        if plan.is_empty() {
            info!(%state, "no migrations to apply");
            return Ok(state);
        }

        info!(%state, steps = plan.len(), %direction, "migration plan computed");
        let mut current = state;
        for planned in plan.steps() {
            if self.cancel.is_cancelled() {
                warn!(%current, "migration run cancelled before next step");
                return Err(MigrateError::Cancelled {
                    version: current.version,
                });
            }
            driver.refresh_lock(handle.owner()).await?;
            current = self.apply_step(driver, planned).await?;
        }

        info!(%current, "migrations committed");
        Ok(current)
    }

    async fn apply_step<D>(&self, driver: &mut D, planned: &PlannedStep) -> Result<VersionState>
    where
        D: Driver + ?Sized,
    {
        let version = planned.step.version;
        let direction = planned.direction;
        let outcome = VersionState::clean(planned.outcome);
        let started = Instant::now();
        info!(version, %direction, name = %planned.step.name, "applying migration");

        // Without transactional DDL a crash mid-script must leave a trace.
        if !driver.dialect().transactional_ddl() {
            driver.write_version(VersionState::dirty(version)).await?;
        }

        match driver.run_script(planned.step.script(direction), outcome).await {
            Ok(()) => {
                info!(version, %direction, elapsed = ?started.elapsed(), "migration applied");
                Ok(outcome)
            }
            Err(source) => {
                error!(version, %direction, error = %source, "migration failed, marking dirty");
                if let Err(mark_err) = driver.write_version(VersionState::dirty(version)).await {
                    error!(version, error = %mark_err, "could not record dirty state");
                }
                Err(MigrateError::StepApplication {
                    version,
                    direction,
                    source,
                })
            }
        }
    }

    async fn force_locked<D>(
        &self,
        driver: &mut D,
        previous: VersionState,
        version: Option<Version>,
    ) -> Result<VersionState>
    where
        D: Driver + ?Sized,
    {
        if let Some(version) = version {
            self.source.load_step(version).await?;
        }

        let forced = VersionState::clean(version);
        driver.write_version(forced).await?;
        warn!(%previous, %forced, "version forced by operator");
        Ok(forced)
    }
}
