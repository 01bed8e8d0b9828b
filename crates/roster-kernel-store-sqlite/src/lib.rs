//! SQLite binding of the roster kernel: schema, identifier resolution,
//! referential-integrity auditing, gated migrations and the entity
//! repository.

mod auditor;
mod ddl;
mod error;
mod migration;
mod repository;
mod resolver;
mod schema;
mod store;

pub use auditor::{
    foreign_key_name, AuditReport, ColumnDependency, ForeignKeyAudit, ForeignKeyRef,
    IntegrityAuditor, OrphanRow, QueryHints,
};
pub use migration::{
    ColumnDef, ColumnRef, ConstraintDef, Migration, MigrationExecutor, MigrationPlan,
    MigrationPlanner, MigrationReport, MigrationStep, OnDelete, PlannedStep, StepPlan, StepReport,
    StepStatus,
};
pub use repository::EntityRepository;
pub use resolver::IdentifierResolver;
pub use schema::{quote, schema_fingerprint, validate_identifier, LATEST_SCHEMA_VERSION};
pub use store::{ForeignKeyViolation, IntegrityReport, SchemaStatus, Store};
