//! Domain model shared by the roster-kernel crates: business identifiers,
//! entity records, the error taxonomy, configuration, and retry policy.

mod config;
mod entity;
mod error;
mod ids;
mod retry;

pub use config::{
    DeletionConfig, EntityDeleteMode, IdentifierConfig, KernelConfig, MigrationConfig,
    RelationshipPolicy, StoreConfig, DEFAULT_BACKFILL_BATCH_SIZE, IN_MEMORY_PATH,
};
pub use entity::{
    BehaviorCategory, BehaviorRecord, BehaviorRecordPatch, Class, ClassPatch, CounselingSession,
    CounselingSessionPatch, DeleteMode, DeleteOutcome, DeletePolicy, EntityPatch, EntityRecord,
    EntityRef, NewBehaviorRecord, NewClass, NewCounselingSession, NewEntity, NewStudent, NewUser,
    Relationship, SessionStatus, Student, StudentPatch, User, UserPatch, MAX_GRADE_LEVEL,
    MIN_GRADE_LEVEL, RELATIONSHIPS,
};
pub use error::{KernelError, KernelResult};
pub use ids::{BusinessId, EntityKind, IdScheme, UserRole, MAX_ID_YEAR, MIN_ID_YEAR};
pub use retry::RetryPolicy;
