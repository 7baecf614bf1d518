use crate::core::{AppliedVersion, MigrateError, Result, Version, VersionState};
use crate::core::types::display_version;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;

/// What the caller asked the engine to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Command {
    Up,
    Down,
    Version,
    /// Operator override: record this version as applied and clean.
    Force(Option<Version>),
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Command::Up => write!(f, "up"),
            Command::Down => write!(f, "down"),
            Command::Version => write!(f, "version"),
            Command::Force(version) => write!(f, "force {}", display_version(*version)),
        }
    }
}

/// Result of one invocation, for the caller to render.
#[derive(Debug)]
pub struct MigrationReport {
    pub command: Command,
    pub applied_version: AppliedVersion,
    pub dirty: bool,
    pub error: Option<MigrateError>,
}

impl MigrationReport {
    pub(crate) fn success(command: Command, state: VersionState) -> Self {
        Self {
            command,
            applied_version: state.version,
            dirty: state.dirty,
            error: None,
        }
    }

    pub(crate) fn failure(command: Command, state: VersionState, error: MigrateError) -> Self {
        Self {
            command,
            applied_version: state.version,
            dirty: state.dirty,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn state(&self) -> VersionState {
        VersionState {
            version: self.applied_version,
            dirty: self.dirty,
        }
    }

    pub fn into_result(self) -> Result<VersionState> {
        let state = self.state();
        match self.error {
            Some(err) => Err(err),
            None => Ok(state),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "command": self.command.to_string(),
            "applied_version": self.applied_version,
            "dirty": self.dirty,
            "error": self.error.as_ref().map(|err| err.to_string()),
        })
    }
}

impl fmt::Display for MigrationReport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Database migration version {}, {}",
            display_version(self.applied_version),
            if self.dirty { "dirty" } else { "clean" }
        )?;
        if let Some(err) = &self.error {
            write!(f, "; {} failed: {}", self.command, err)?;
        }
        Ok(())
    }
}

/// One source step compared against the version store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepStatus {
    pub version: Version,
    pub name: String,
    pub applied: bool,
    pub dirty: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_display() {
        let ok = MigrationReport::success(Command::Up, VersionState::clean(Some(3)));
        assert_eq!(ok.to_string(), "Database migration version 3, clean");

        let failed = MigrationReport::failure(
            Command::Up,
            VersionState::dirty(2),
            MigrateError::DirtyState { version: Some(2) },
        );
        assert!(failed.to_string().starts_with("Database migration version 2, dirty; up failed"));
    }

    #[test]
    fn test_report_json() {
        let report = MigrationReport::success(Command::Force(None), VersionState::default());
        let value = report.to_json();
        assert_eq!(value["command"], "force none");
        assert!(value["applied_version"].is_null());
        assert_eq!(value["dirty"], false);
        assert!(value["error"].is_null());
    }

    #[test]
    fn test_into_result() {
        let report = MigrationReport::success(Command::Version, VersionState::clean(Some(1)));
        assert_eq!(report.into_result().unwrap(), VersionState::clean(Some(1)));

        let report = MigrationReport::failure(
            Command::Down,
            VersionState::default(),
            MigrateError::Config("bad".into()),
        );
        assert!(matches!(report.into_result(), Err(MigrateError::Config(_))));
    }
}
