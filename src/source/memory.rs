use super::{MigrationSource, into_ordered};
use crate::core::{MigrationStep, Result, SqlScript, Version};
use async_trait::async_trait;

/// Migration source holding its steps in memory.
///
/// Useful for migrations embedded in a binary with `include_str!`.
/// Duplicate versions are accepted while building and reported by `list()`,
/// the same way a directory with two files for one version is.
///
/// # Examples
///
/// ```
/// use rustmigrate::MemorySource;
///
/// let source = MemorySource::new()
///     .with_step(1, "create_users", "CREATE TABLE users (id INTEGER)", "DROP TABLE users")
///     .with_step(2, "add_email", "ALTER TABLE users ADD COLUMN email TEXT", "");
/// assert_eq!(source.len(), 2);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    steps: Vec<MigrationStep>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_step(
        mut self,
        version: Version,
        name: impl Into<String>,
        up: impl Into<SqlScript>,
        down: impl Into<SqlScript>,
    ) -> Self {
        self.push(MigrationStep::new(version, name, up, down));
        self
    }

    pub fn push(&mut self, step: MigrationStep) {
        self.steps.push(step);
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl FromIterator<MigrationStep> for MemorySource {
    fn from_iter<I: IntoIterator<Item = MigrationStep>>(iter: I) -> Self {
        Self {
            steps: iter.into_iter().collect(),
        }
    }
}

#[async_trait]
impl MigrationSource for MemorySource {
    async fn list(&self) -> Result<Vec<MigrationStep>> {
        into_ordered(self.steps.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::MigrateError;

    #[tokio::test]
    async fn test_list_sorts_by_version() {
        let source = MemorySource::new()
            .with_step(3, "c", "SELECT 3", "")
            .with_step(1, "a", "SELECT 1", "")
            .with_step(2, "b", "SELECT 2", "");

        let versions: Vec<_> = source.list().await.unwrap().iter().map(|s| s.version).collect();
        assert_eq!(versions, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_duplicate_version_is_format_error() {
        let source = MemorySource::new()
            .with_step(1, "first", "SELECT 1", "")
            .with_step(1, "second", "SELECT 1", "");

        let err = source.list().await.unwrap_err();
        assert!(matches!(err, MigrateError::SourceFormat { .. }));
    }

    #[tokio::test]
    async fn test_load_step() {
        let source = MemorySource::new().with_step(7, "seven", "SELECT 7", "SELECT -7");

        let step = source.load_step(7).await.unwrap();
        assert_eq!(step.name, "seven");
        assert_eq!(step.down.as_str(), "SELECT -7");

        assert!(matches!(
            source.load_step(8).await,
            Err(MigrateError::StepNotFound(8))
        ));
    }
}
