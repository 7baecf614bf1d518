use crate::core::{Direction, MigrateError, MigrationStep, Result, Version};

/// A step scheduled for execution together with the version the store
/// records once it succeeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedStep {
    pub step: MigrationStep,
    pub direction: Direction,
    pub outcome: Option<Version>,
}

/// Ordered steps needed to move from the current version in one direction.
///
/// Plans are derived from the source and the version store on every run and
/// never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationPlan {
    direction: Direction,
    steps: Vec<PlannedStep>,
}

fn ensure_known(steps: &[MigrationStep], current: Version) -> Result<usize> {
    steps
        .iter()
        .position(|step| step.version == current)
        .ok_or(MigrateError::StepNotFound(current))
}

impl MigrationPlan {
    /// Every step after `current`, ascending. `steps` must be sorted.
    ///
    /// An applied version that is missing from the source is an error: the
    /// source must never silently drop applied versions.
    pub fn up(steps: &[MigrationStep], current: Option<Version>) -> Result<Self> {
        debug_assert!(steps.windows(2).all(|w| w[0].version < w[1].version));

        let start = match current {
            Some(version) => ensure_known(steps, version)? + 1,
            None => 0,
        };

        let planned = steps[start..]
            .iter()
            .map(|step| PlannedStep {
                step: step.clone(),
                direction: Direction::Up,
                outcome: Some(step.version),
            })
            .collect();

        Ok(Self {
            direction: Direction::Up,
            steps: planned,
        })
    }

    /// The single step at `current`, rolling back to the preceding source
    /// version (or none). Empty when nothing is applied.
    pub fn down(steps: &[MigrationStep], current: Option<Version>) -> Result<Self> {
        debug_assert!(steps.windows(2).all(|w| w[0].version < w[1].version));

        let Some(version) = current else {
            return Ok(Self {
                direction: Direction::Down,
                steps: Vec::new(),
            });
        };

        let index = ensure_known(steps, version)?;
        let previous = index.checked_sub(1).map(|i| steps[i].version);

        Ok(Self {
            direction: Direction::Down,
            steps: vec![PlannedStep {
                step: steps[index].clone(),
                direction: Direction::Down,
                outcome: previous,
            }],
        })
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn steps(&self) -> &[PlannedStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Version recorded once the whole plan has been applied.
    pub fn target(&self) -> Option<Option<Version>> {
        self.steps.last().map(|planned| planned.outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn steps(versions: &[Version]) -> Vec<MigrationStep> {
        versions
            .iter()
            .map(|v| MigrationStep::new(*v, format!("m{}", v), format!("UP {}", v), format!("DOWN {}", v)))
            .collect()
    }

    fn versions(plan: &MigrationPlan) -> Vec<Version> {
        plan.steps().iter().map(|p| p.step.version).collect()
    }

    #[test]
    fn test_up_from_nothing_applies_everything() {
        let plan = MigrationPlan::up(&steps(&[1, 2, 3]), None).unwrap();
        assert_eq!(versions(&plan), vec![1, 2, 3]);
        assert_eq!(plan.target(), Some(Some(3)));
        assert!(plan.steps().iter().all(|p| p.direction == Direction::Up));
    }

    #[test]
    fn test_up_skips_applied_steps() {
        let plan = MigrationPlan::up(&steps(&[10, 20, 30]), Some(20)).unwrap();
        assert_eq!(versions(&plan), vec![30]);
    }

    #[test]
    fn test_up_at_latest_is_empty() {
        let plan = MigrationPlan::up(&steps(&[1, 2]), Some(2)).unwrap();
        assert!(plan.is_empty());
        assert_eq!(plan.target(), None);
    }

    #[test]
    fn test_up_rejects_unknown_applied_version() {
        let err = MigrationPlan::up(&steps(&[1, 3]), Some(2)).unwrap_err();
        assert!(matches!(err, MigrateError::StepNotFound(2)));
    }

    #[test]
    fn test_down_steps_back_exactly_one() {
        let plan = MigrationPlan::down(&steps(&[1, 5, 9]), Some(9)).unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.steps()[0].step.version, 9);
        assert_eq!(plan.steps()[0].outcome, Some(5));
        assert_eq!(plan.direction(), Direction::Down);
    }

    #[test]
    fn test_down_from_first_step_reaches_none() {
        let plan = MigrationPlan::down(&steps(&[1, 2]), Some(1)).unwrap();
        assert_eq!(plan.target(), Some(None));
    }

    #[test]
    fn test_down_with_nothing_applied_is_empty() {
        assert!(MigrationPlan::down(&steps(&[1]), None).unwrap().is_empty());
    }

    #[test]
    fn test_down_rejects_unknown_applied_version() {
        let err = MigrationPlan::down(&steps(&[1, 2]), Some(7)).unwrap_err();
        assert!(matches!(err, MigrateError::StepNotFound(7)));
    }
}
