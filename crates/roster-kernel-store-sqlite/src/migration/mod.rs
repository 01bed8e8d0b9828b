//! Ordered, idempotent schema migrations gated by the integrity auditor.

mod apply;
mod executor;
mod planner;
mod rebuild;
mod step;

pub use executor::{MigrationExecutor, MigrationReport, StepReport, StepStatus};
pub use planner::{MigrationPlan, MigrationPlanner, PlannedStep, StepPlan};
pub use step::{ColumnDef, ColumnRef, ConstraintDef, Migration, MigrationStep, OnDelete};
