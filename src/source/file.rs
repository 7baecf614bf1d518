use super::{MigrationSource, into_ordered};
use crate::core::{Direction, MigrateError, MigrationStep, Result, SqlScript, Version};
use async_trait::async_trait;
use lazy_static::lazy_static;
use log::debug;
use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;

lazy_static! {
    static ref MIGRATION_FILE: Regex =
        Regex::new(r"^([0-9]+)_(.*)\.(up|down)\.sql$").expect("valid migration file pattern");
}

/// Migration source backed by a directory of paired scripts:
///
/// ```text
/// db/migrations/
///   20240101120000_create_users.up.sql
///   20240101120000_create_users.down.sql
///   20240102093000_add_email.up.sql
///   20240102093000_add_email.down.sql
/// ```
///
/// Files without a `.sql` extension and subdirectories are ignored. A `.sql`
/// file that does not follow the `{version}_{name}.{up|down}.sql` convention
/// is a format error rather than being skipped silently.
#[derive(Debug, Clone)]
pub struct FileSource {
    dir: PathBuf,
}

#[derive(Default)]
struct PendingPair {
    name: String,
    up: Option<SqlScript>,
    down: Option<SqlScript>,
}

impl FileSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn read_script(&self, path: &Path) -> Result<SqlScript> {
        let sql = fs::read_to_string(path)
            .await
            .map_err(|source| MigrateError::SourceRead {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(SqlScript::new(sql))
    }
}

/// Parses `{version}_{name}.{up|down}.sql` into its parts.
fn parse_file_name(file_name: &str) -> Result<(Version, String, Direction)> {
    let captures = MIGRATION_FILE
        .captures(file_name)
        .ok_or_else(|| MigrateError::SourceFormat {
            entry: file_name.to_string(),
            reason: "expected '{version}_{name}.up.sql' or '{version}_{name}.down.sql'".into(),
        })?;

    let version = captures[1]
        .parse::<Version>()
        .map_err(|err| MigrateError::SourceFormat {
            entry: file_name.to_string(),
            reason: format!("version prefix '{}' is not a valid integer: {}", &captures[1], err),
        })?;

    let direction = if &captures[3] == "up" {
        Direction::Up
    } else {
        Direction::Down
    };

    Ok((version, captures[2].to_string(), direction))
}

#[async_trait]
impl MigrationSource for FileSource {
    async fn list(&self) -> Result<Vec<MigrationStep>> {
        let read_err = |source| MigrateError::SourceRead {
            path: self.dir.clone(),
            source,
        };

        let mut entries = fs::read_dir(&self.dir).await.map_err(read_err)?;
        let mut pairs = BTreeMap::<Version, PendingPair>::new();

        while let Some(entry) = entries.next_entry().await.map_err(read_err)? {
            let path = entry.path();
            let file_type = entry.file_type().await.map_err(read_err)?;
            if file_type.is_dir() {
                continue;
            }

            let Some(file_name) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            if !file_name.ends_with(".sql") {
                debug!("Skipping non-migration file {}", path.display());
                continue;
            }

            let (version, name, direction) = parse_file_name(file_name)?;
            let pair = pairs.entry(version).or_insert_with(|| PendingPair {
                name: name.clone(),
                ..Default::default()
            });

            if pair.name != name {
                return Err(MigrateError::SourceFormat {
                    entry: file_name.to_string(),
                    reason: format!(
                        "duplicate migration version {} ('{}' and '{}')",
                        version, pair.name, name
                    ),
                });
            }

            let slot = match direction {
                Direction::Up => &mut pair.up,
                Direction::Down => &mut pair.down,
            };
            if slot.is_some() {
                return Err(MigrateError::SourceFormat {
                    entry: file_name.to_string(),
                    reason: format!("duplicate {} script for version {}", direction, version),
                });
            }
            *slot = Some(self.read_script(&path).await?);
        }

        let mut steps = Vec::with_capacity(pairs.len());
        for (version, pair) in pairs {
            let (Some(up), Some(down)) = (pair.up, pair.down) else {
                return Err(MigrateError::SourceFormat {
                    entry: format!("{}_{}", version, pair.name),
                    reason: "migration is missing its paired up/down script".into(),
                });
            };
            steps.push(MigrationStep {
                version,
                name: pair.name,
                up,
                down,
            });
        }

        debug!("Loaded {} migrations from {}", steps.len(), self.dir.display());
        into_ordered(steps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_file_name() {
        let (version, name, direction) =
            parse_file_name("20240101120000_create_users.up.sql").unwrap();
        assert_eq!(version, 20240101120000);
        assert_eq!(name, "create_users");
        assert_eq!(direction, Direction::Up);

        let (version, name, direction) = parse_file_name("2_add.email.down.sql").unwrap();
        assert_eq!(version, 2);
        assert_eq!(name, "add.email");
        assert_eq!(direction, Direction::Down);
    }

    #[test]
    fn test_parse_file_name_rejects_bad_prefix() {
        assert!(matches!(
            parse_file_name("v1_create.up.sql"),
            Err(MigrateError::SourceFormat { .. })
        ));
        assert!(matches!(
            parse_file_name("1_create.sideways.sql"),
            Err(MigrateError::SourceFormat { .. })
        ));
        assert!(matches!(
            parse_file_name("99999999999999999999_overflow.up.sql"),
            Err(MigrateError::SourceFormat { .. })
        ));
    }

    #[tokio::test]
    async fn test_missing_directory_is_read_error() {
        let source = FileSource::new("/nonexistent/rustmigrate/migrations");
        let err = source.list().await.unwrap_err();
        assert!(matches!(err, MigrateError::SourceRead { .. }));
    }
}
