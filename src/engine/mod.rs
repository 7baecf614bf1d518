pub mod migrator;
pub mod plan;
pub mod report;

pub use migrator::Migrator;
pub use plan::{MigrationPlan, PlannedStep};
pub use report::{Command, MigrationReport, StepStatus};
