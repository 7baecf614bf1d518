// ============================================================================
// Migration Sources
// ============================================================================

pub mod file;
pub mod memory;

pub use file::FileSource;
pub use memory::MemorySource;

use crate::core::{MigrateError, MigrationStep, Result, Version};
use async_trait::async_trait;

/// An ordered, read-only collection of migration steps.
#[async_trait]
pub trait MigrationSource: Send + Sync {
    /// Returns every step sorted ascending by version.
    async fn list(&self) -> Result<Vec<MigrationStep>>;

    /// Returns the step with exactly this version.
    async fn load_step(&self, version: Version) -> Result<MigrationStep> {
        self.list()
            .await?
            .into_iter()
            .find(|step| step.version == version)
            .ok_or(MigrateError::StepNotFound(version))
    }
}

#[async_trait]
impl<S: MigrationSource + ?Sized> MigrationSource for Box<S> {
    async fn list(&self) -> Result<Vec<MigrationStep>> {
        (**self).list().await
    }

    async fn load_step(&self, version: Version) -> Result<MigrationStep> {
        (**self).load_step(version).await
    }
}

/// Sorts steps and rejects duplicate versions.
pub(crate) fn into_ordered(mut steps: Vec<MigrationStep>) -> Result<Vec<MigrationStep>> {
    steps.sort_by_key(|step| step.version);
    for pair in steps.windows(2) {
        if pair[0].version == pair[1].version {
            return Err(MigrateError::SourceFormat {
                entry: pair[1].version.to_string(),
                reason: format!(
                    "duplicate migration version {} ('{}' and '{}')",
                    pair[1].version, pair[0].name, pair[1].name
                ),
            });
        }
    }
    Ok(steps)
}
