//! CRUD surface keyed by business identifiers.
//!
//! Each write runs in one `BEGIN IMMEDIATE` transaction that spans
//! identifier resolution, role checks, minting and the write itself, and is
//! retried as a whole on transient store errors. Reads run in a deferred
//! transaction so resolution and load see the same snapshot.

mod delete;
mod records;

use roster_kernel_core::{
    BehaviorRecord, BehaviorRecordPatch, Class, ClassPatch, CounselingSession,
    CounselingSessionPatch, DeleteOutcome, DeletionConfig, EntityKind, EntityPatch, EntityRecord,
    KernelConfig, KernelError, KernelResult, NewBehaviorRecord, NewClass, NewCounselingSession,
    NewEntity, NewStudent, NewUser, RetryPolicy, Student, StudentPatch, User, UserPatch,
};
use rusqlite::{Connection, Transaction};
use tracing::debug;

use crate::auditor::IntegrityAuditor;
use crate::error::StoreResultExt;
use crate::resolver::IdentifierResolver;
use crate::store::Store;

use self::delete::Deletion;
use self::records::live_key;

pub struct EntityRepository<'s> {
    store: &'s Store,
    resolver: IdentifierResolver,
    auditor: IntegrityAuditor,
    deletion: DeletionConfig,
    retry: RetryPolicy,
}

impl<'s> EntityRepository<'s> {
    #[must_use]
    pub fn new(store: &'s Store, config: &KernelConfig) -> Self {
        Self {
            store,
            resolver: IdentifierResolver::new(config.identifiers.clone()),
            auditor: IntegrityAuditor::new(),
            deletion: config.deletion.clone(),
            retry: config.retry,
        }
    }

    #[must_use]
    pub fn resolver(&self) -> &IdentifierResolver {
        &self.resolver
    }

    fn write<T>(
        &self,
        operation: &str,
        mut body: impl FnMut(&Transaction<'_>) -> KernelResult<T>,
    ) -> KernelResult<T> {
        self.retry.execute(operation, || {
            let tx = self.store.write_transaction()?;
            let value = body(&tx)?;
            tx.commit().map_store(&format!("commit {operation}"))?;
            Ok(value)
        })
    }

    fn read_tx<T>(
        &self,
        operation: &str,
        mut body: impl FnMut(&Transaction<'_>) -> KernelResult<T>,
    ) -> KernelResult<T> {
        self.retry.execute(operation, || {
            let tx = self.store.read_transaction()?;
            let value = body(&tx)?;
            tx.commit().map_store(&format!("finish {operation}"))?;
            Ok(value)
        })
    }

    fn read_with<T>(
        &self,
        entity: EntityKind,
        raw: &str,
        load: fn(&Connection, i64) -> KernelResult<T>,
    ) -> KernelResult<T> {
        self.read_tx("read", |tx| {
            let key = live_key(tx, &self.resolver, entity, raw)?;
            debug!(%entity, business_id = raw, "read");
            load(tx, key)
        })
    }

    // Generic surface.

    /// Validate, resolve references, mint an identifier and insert.
    ///
    /// # Errors
    /// `InvalidArgument` for bad fields or role violations, `NotFound` for
    /// unknown references, `Conflict` when minting fails.
    pub fn create(&self, input: &NewEntity) -> KernelResult<EntityRecord> {
        Ok(match input {
            NewEntity::User(user) => EntityRecord::User(self.create_user(user)?),
            NewEntity::Student(student) => EntityRecord::Student(self.create_student(student)?),
            NewEntity::Class(class) => EntityRecord::Class(self.create_class(class)?),
            NewEntity::CounselingSession(session) => {
                EntityRecord::CounselingSession(self.create_counseling_session(session)?)
            }
            NewEntity::BehaviorRecord(record) => {
                EntityRecord::BehaviorRecord(self.create_behavior_record(record)?)
            }
        })
    }

    /// # Errors
    /// `InvalidArgument` for a malformed identifier, `NotFound` when absent
    /// or soft-deleted.
    pub fn read(&self, entity: EntityKind, business_id: &str) -> KernelResult<EntityRecord> {
        Ok(match entity {
            EntityKind::User => EntityRecord::User(self.read_user(business_id)?),
            EntityKind::Student => EntityRecord::Student(self.read_student(business_id)?),
            EntityKind::Class => EntityRecord::Class(self.read_class(business_id)?),
            EntityKind::CounselingSession => {
                EntityRecord::CounselingSession(self.read_counseling_session(business_id)?)
            }
            EntityKind::BehaviorRecord => {
                EntityRecord::BehaviorRecord(self.read_behavior_record(business_id)?)
            }
        })
    }

    /// # Errors
    /// `InvalidArgument` when the patch targets another entity kind or a
    /// changed reference breaks a role constraint; `NotFound` for unknown
    /// identifiers.
    pub fn update(
        &self,
        entity: EntityKind,
        business_id: &str,
        patch: &EntityPatch,
    ) -> KernelResult<EntityRecord> {
        if patch.kind() != entity {
            return Err(KernelError::invalid(
                "patch",
                format!("a {} patch cannot update a {entity}", patch.kind()),
            ));
        }
        Ok(match patch {
            EntityPatch::User(p) => EntityRecord::User(self.update_user(business_id, p)?),
            EntityPatch::Student(p) => EntityRecord::Student(self.update_student(business_id, p)?),
            EntityPatch::Class(p) => EntityRecord::Class(self.update_class(business_id, p)?),
            EntityPatch::CounselingSession(p) => {
                EntityRecord::CounselingSession(self.update_counseling_session(business_id, p)?)
            }
            EntityPatch::BehaviorRecord(p) => {
                EntityRecord::BehaviorRecord(self.update_behavior_record(business_id, p)?)
            }
        })
    }

    /// Delete per the configured mode and relationship policies.
    ///
    /// # Errors
    /// `Conflict` when a `Restrict` relationship still has children,
    /// `NotFound` for unknown identifiers.
    pub fn delete(&self, entity: EntityKind, business_id: &str) -> KernelResult<DeleteOutcome> {
        self.write("delete", |tx| {
            let key = live_key(tx, &self.resolver, entity, business_id)?;
            Deletion::new(tx, &self.resolver, self.auditor, &self.deletion).run(entity, key)
        })
    }

    // Typed surface.

    /// # Errors
    /// As [`Self::create`].
    pub fn create_user(&self, input: &NewUser) -> KernelResult<User> {
        self.write("create user", |tx| {
            let key = records::insert_user(tx, &self.resolver, input)?;
            records::load_user(tx, key)
        })
    }

    /// # Errors
    /// As [`Self::create`].
    pub fn create_class(&self, input: &NewClass) -> KernelResult<Class> {
        self.write("create class", |tx| {
            let key = records::insert_class(tx, &self.resolver, input)?;
            records::load_class(tx, key)
        })
    }

    /// # Errors
    /// As [`Self::create`]; the owning user must have role student.
    pub fn create_student(&self, input: &NewStudent) -> KernelResult<Student> {
        self.write("create student", |tx| {
            let key = records::insert_student(tx, &self.resolver, input)?;
            records::load_student(tx, key)
        })
    }

    /// # Errors
    /// As [`Self::create`]; the counselor must be staff.
    pub fn create_counseling_session(
        &self,
        input: &NewCounselingSession,
    ) -> KernelResult<CounselingSession> {
        self.write("create counseling session", |tx| {
            let key = records::insert_session(tx, &self.resolver, input)?;
            records::load_session(tx, key)
        })
    }

    /// # Errors
    /// As [`Self::create`]; the reporter must be staff.
    pub fn create_behavior_record(&self, input: &NewBehaviorRecord) -> KernelResult<BehaviorRecord> {
        self.write("create behavior record", |tx| {
            let key = records::insert_behavior_record(tx, &self.resolver, input)?;
            records::load_behavior_record(tx, key)
        })
    }

    /// # Errors
    /// As [`Self::read`].
    pub fn read_user(&self, business_id: &str) -> KernelResult<User> {
        self.read_with(EntityKind::User, business_id, records::load_user)
    }

    /// # Errors
    /// As [`Self::read`].
    pub fn read_class(&self, business_id: &str) -> KernelResult<Class> {
        self.read_with(EntityKind::Class, business_id, records::load_class)
    }

    /// # Errors
    /// As [`Self::read`].
    pub fn read_student(&self, business_id: &str) -> KernelResult<Student> {
        self.read_with(EntityKind::Student, business_id, records::load_student)
    }

    /// # Errors
    /// As [`Self::read`].
    pub fn read_counseling_session(&self, business_id: &str) -> KernelResult<CounselingSession> {
        self.read_with(EntityKind::CounselingSession, business_id, records::load_session)
    }

    /// # Errors
    /// As [`Self::read`].
    pub fn read_behavior_record(&self, business_id: &str) -> KernelResult<BehaviorRecord> {
        self.read_with(EntityKind::BehaviorRecord, business_id, records::load_behavior_record)
    }

    /// # Errors
    /// As [`Self::update`].
    pub fn update_user(&self, business_id: &str, patch: &UserPatch) -> KernelResult<User> {
        self.write("update user", |tx| {
            let key = live_key(tx, &self.resolver, EntityKind::User, business_id)?;
            records::patch_user(tx, key, patch)?;
            records::load_user(tx, key)
        })
    }

    /// # Errors
    /// As [`Self::update`].
    pub fn update_class(&self, business_id: &str, patch: &ClassPatch) -> KernelResult<Class> {
        self.write("update class", |tx| {
            let key = live_key(tx, &self.resolver, EntityKind::Class, business_id)?;
            records::patch_class(tx, key, patch)?;
            records::load_class(tx, key)
        })
    }

    /// # Errors
    /// As [`Self::update`].
    pub fn update_student(&self, business_id: &str, patch: &StudentPatch) -> KernelResult<Student> {
        self.write("update student", |tx| {
            let key = live_key(tx, &self.resolver, EntityKind::Student, business_id)?;
            records::patch_student(tx, &self.resolver, key, patch)?;
            records::load_student(tx, key)
        })
    }

    /// # Errors
    /// As [`Self::update`].
    pub fn update_counseling_session(
        &self,
        business_id: &str,
        patch: &CounselingSessionPatch,
    ) -> KernelResult<CounselingSession> {
        self.write("update counseling session", |tx| {
            let key = live_key(tx, &self.resolver, EntityKind::CounselingSession, business_id)?;
            records::patch_session(tx, &self.resolver, key, patch)?;
            records::load_session(tx, key)
        })
    }

    /// # Errors
    /// As [`Self::update`].
    pub fn update_behavior_record(
        &self,
        business_id: &str,
        patch: &BehaviorRecordPatch,
    ) -> KernelResult<BehaviorRecord> {
        self.write("update behavior record", |tx| {
            let key = live_key(tx, &self.resolver, EntityKind::BehaviorRecord, business_id)?;
            records::patch_behavior_record(tx, key, patch)?;
            records::load_behavior_record(tx, key)
        })
    }

    /// Live sessions of a student, earliest first.
    ///
    /// # Errors
    /// `NotFound` when the student is unknown or soft-deleted.
    pub fn list_sessions_for_student(&self, student_code: &str) -> KernelResult<Vec<CounselingSession>> {
        self.read_tx("list sessions", |tx| {
            let student = live_key(tx, &self.resolver, EntityKind::Student, student_code)?;
            records::session_keys_for_student(tx, student)?
                .into_iter()
                .map(|key| records::load_session(tx, key))
                .collect()
        })
    }

    /// Live behavior records of a student, oldest first.
    ///
    /// # Errors
    /// `NotFound` when the student is unknown or soft-deleted.
    pub fn list_behavior_records_for_student(
        &self,
        student_code: &str,
    ) -> KernelResult<Vec<BehaviorRecord>> {
        self.read_tx("list behavior records", |tx| {
            let student = live_key(tx, &self.resolver, EntityKind::Student, student_code)?;
            records::behavior_keys_for_student(tx, student)?
                .into_iter()
                .map(|key| records::load_behavior_record(tx, key))
                .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use roster_kernel_core::{
        BehaviorCategory, DeleteMode, DeletePolicy, EntityDeleteMode, IdentifierConfig,
        RelationshipPolicy, SessionStatus, StoreConfig, UserRole,
    };
    use time::macros::datetime;

    use super::*;

    fn config() -> KernelConfig {
        KernelConfig {
            identifiers: IdentifierConfig { year_override: Some(2025) },
            ..KernelConfig::default()
        }
    }

    fn migrated() -> KernelResult<Store> {
        let store = Store::open_in_memory()?;
        store.migrate()?;
        Ok(store)
    }

    struct Fixture {
        student_user: User,
        counselor: User,
        class: Class,
        student: Student,
    }

    fn seed(repo: &EntityRepository<'_>) -> KernelResult<Fixture> {
        let student_user = repo.create_user(&NewUser {
            role: UserRole::Student,
            display_name: "Ana Lima".to_string(),
            email: Some("ana@school.example".to_string()),
        })?;
        let counselor = repo.create_user(&NewUser {
            role: UserRole::Counselor,
            display_name: "Rui Costa".to_string(),
            email: None,
        })?;
        let class = repo.create_class(&NewClass {
            name: "7A".to_string(),
            grade_level: 7,
            school_code: "SCH-01".to_string(),
        })?;
        let student = repo.create_student(&NewStudent {
            user_code: student_user.user_code.to_string(),
            class_code: Some(class.class_code.to_string()),
            full_name: "Ana Lima".to_string(),
        })?;
        Ok(Fixture { student_user, counselor, class, student })
    }

    fn new_session(fixture: &Fixture, counselor_code: &str) -> NewCounselingSession {
        NewCounselingSession {
            student_code: fixture.student.student_code.to_string(),
            counselor_code: counselor_code.to_string(),
            scheduled_at: datetime!(2025-03-10 09:30 UTC),
            topic: "Study habits".to_string(),
            notes: None,
        }
    }

    #[test]
    fn create_flow_mints_identifiers_and_joins_references() -> KernelResult<()> {
        let store = migrated()?;
        let repo = EntityRepository::new(&store, &config());
        let fixture = seed(&repo)?;

        assert_eq!(fixture.student_user.user_code.as_str(), "STU-2025-0001");
        assert_eq!(fixture.counselor.user_code.as_str(), "CNS-2025-001");
        assert_eq!(fixture.class.class_code.as_str(), "CLS-2025-001");
        assert_eq!(fixture.student.student_code.as_str(), "SID-2025-0001");
        assert_eq!(fixture.student.user_code, fixture.student_user.user_code);
        assert_eq!(fixture.student.class_code.as_ref(), Some(&fixture.class.class_code));

        let session = repo.create_counseling_session(&new_session(
            &fixture,
            fixture.counselor.user_code.as_str(),
        ))?;
        assert_eq!(session.session_code.as_str(), "CS-2025-00001");
        assert_eq!(session.status, SessionStatus::Scheduled);

        let record = repo.create_behavior_record(&NewBehaviorRecord {
            student_code: fixture.student.student_code.to_string(),
            reporter_code: fixture.counselor.user_code.to_string(),
            category: BehaviorCategory::Positive,
            description: "Helped a classmate".to_string(),
            occurred_at: datetime!(2025-03-11 14:00 UTC),
        })?;
        assert_eq!(record.student_code, fixture.student.student_code);

        let read = repo.read(EntityKind::CounselingSession, session.session_code.as_str())?;
        assert_eq!(read, EntityRecord::CounselingSession(session.clone()));
        assert_eq!(repo.list_sessions_for_student(fixture.student.student_code.as_str())?, vec![session]);
        assert_eq!(
            repo.list_behavior_records_for_student(fixture.student.student_code.as_str())?,
            vec![record]
        );
        Ok(())
    }

    #[test]
    fn role_constraints_are_enforced() -> KernelResult<()> {
        let store = migrated()?;
        let repo = EntityRepository::new(&store, &config());
        let fixture = seed(&repo)?;

        let err = repo
            .create_counseling_session(&new_session(&fixture, fixture.student_user.user_code.as_str()))
            .err();
        assert!(
            matches!(&err, Some(KernelError::InvalidArgument { field, .. }) if field == "counselor_code"),
            "{err:?}"
        );

        let err = repo
            .create_student(&NewStudent {
                user_code: fixture.counselor.user_code.to_string(),
                class_code: None,
                full_name: "Not A Student".to_string(),
            })
            .err();
        assert!(matches!(err, Some(KernelError::InvalidArgument { .. })), "{err:?}");

        let err = repo
            .create_counseling_session(&new_session(&fixture, "CNS-2025-999"))
            .err();
        assert!(matches!(err, Some(KernelError::NotFound { .. })), "{err:?}");

        let err = repo.create_counseling_session(&new_session(&fixture, "counselor-1")).err();
        assert!(matches!(err, Some(KernelError::InvalidArgument { .. })), "{err:?}");

        let sessions: i64 = store
            .conn()
            .query_row("SELECT COUNT(*) FROM counseling_sessions", [], |row| row.get(0))
            .map_store("count sessions")?;
        assert_eq!(sessions, 0);
        Ok(())
    }

    #[test]
    fn update_revalidates_changed_references() -> KernelResult<()> {
        let store = migrated()?;
        let repo = EntityRepository::new(&store, &config());
        let fixture = seed(&repo)?;

        let updated = repo.update(
            EntityKind::Student,
            fixture.student.student_code.as_str(),
            &EntityPatch::Student(StudentPatch {
                class_code: Some(None),
                full_name: Some("Ana M. Lima".to_string()),
                ..StudentPatch::default()
            }),
        )?;
        let EntityRecord::Student(student) = updated else {
            panic!("expected a student record");
        };
        assert_eq!(student.class_code, None);
        assert_eq!(student.full_name, "Ana M. Lima");
        assert_eq!(student.student_code, fixture.student.student_code);

        let err = repo
            .update_student(
                fixture.student.student_code.as_str(),
                &StudentPatch {
                    user_code: Some(fixture.counselor.user_code.to_string()),
                    ..StudentPatch::default()
                },
            )
            .err();
        assert!(matches!(err, Some(KernelError::InvalidArgument { .. })), "{err:?}");

        let err = repo
            .update(
                EntityKind::Class,
                fixture.class.class_code.as_str(),
                &EntityPatch::User(UserPatch::default()),
            )
            .err();
        assert!(matches!(err, Some(KernelError::InvalidArgument { .. })), "{err:?}");
        Ok(())
    }

    #[test]
    fn delete_is_blocked_by_restrict_children() -> KernelResult<()> {
        let store = migrated()?;
        let repo = EntityRepository::new(&store, &config());
        let fixture = seed(&repo)?;
        repo.create_counseling_session(&new_session(&fixture, fixture.counselor.user_code.as_str()))?;

        let err = repo.delete(EntityKind::Student, fixture.student.student_code.as_str()).err();
        assert!(matches!(err, Some(KernelError::Conflict { .. })), "{err:?}");
        assert!(repo.read_student(fixture.student.student_code.as_str()).is_ok());
        Ok(())
    }

    #[test]
    fn cascade_policy_removes_children_and_retires_identifiers() -> KernelResult<()> {
        let store = migrated()?;
        let mut config = config();
        config.deletion.relationships.push(RelationshipPolicy {
            parent: EntityKind::Student,
            child: EntityKind::CounselingSession,
            policy: DeletePolicy::Cascade,
        });
        let repo = EntityRepository::new(&store, &config);
        let fixture = seed(&repo)?;
        let session = repo
            .create_counseling_session(&new_session(&fixture, fixture.counselor.user_code.as_str()))?;

        let outcome = repo.delete(EntityKind::Student, fixture.student.student_code.as_str())?;
        assert_eq!(outcome.mode, DeleteMode::Hard);
        assert_eq!(outcome.cascaded.len(), 1);
        assert_eq!(outcome.cascaded[0].business_id, session.session_code);

        let err = repo.read_counseling_session(session.session_code.as_str()).err();
        assert!(matches!(err, Some(KernelError::NotFound { .. })));

        // Retired identifiers are never minted again.
        let next = repo.create_student(&NewStudent {
            user_code: fixture.student_user.user_code.to_string(),
            class_code: None,
            full_name: "Ana Lima".to_string(),
        })?;
        assert_ne!(next.student_code, fixture.student.student_code);
        Ok(())
    }

    #[test]
    fn deleting_a_class_detaches_students() -> KernelResult<()> {
        let store = migrated()?;
        let repo = EntityRepository::new(&store, &config());
        let fixture = seed(&repo)?;

        let outcome = repo.delete(EntityKind::Class, fixture.class.class_code.as_str())?;
        assert_eq!(outcome.detached.len(), 1);
        assert_eq!(outcome.detached[0].business_id, fixture.student.student_code);
        assert_eq!(repo.read_student(fixture.student.student_code.as_str())?.class_code, None);
        Ok(())
    }

    #[test]
    fn soft_delete_hides_the_row_but_keeps_children() -> KernelResult<()> {
        let store = migrated()?;
        let mut config = config();
        config.deletion.modes.push(EntityDeleteMode {
            entity: EntityKind::Student,
            mode: DeleteMode::Soft,
        });
        let repo = EntityRepository::new(&store, &config);
        let fixture = seed(&repo)?;
        repo.create_counseling_session(&new_session(&fixture, fixture.counselor.user_code.as_str()))?;

        let outcome = repo.delete(EntityKind::Student, fixture.student.student_code.as_str())?;
        assert_eq!(outcome.mode, DeleteMode::Soft);
        assert!(outcome.cascaded.is_empty());

        let code = fixture.student.student_code.as_str();
        assert!(matches!(repo.read_student(code), Err(KernelError::NotFound { .. })));
        assert!(matches!(repo.delete(EntityKind::Student, code), Err(KernelError::NotFound { .. })));
        let err = repo.create_counseling_session(&new_session(&fixture, fixture.counselor.user_code.as_str())).err();
        assert!(matches!(err, Some(KernelError::NotFound { .. })), "{err:?}");
        Ok(())
    }

    #[test]
    fn resolved_row_stays_readable_while_another_connection_deletes_it() -> KernelResult<()> {
        fn exercise(store_config: &StoreConfig) -> KernelResult<()> {
            let reader = Store::open(store_config)?;
            reader.migrate()?;
            let repo = EntityRepository::new(&reader, &config());
            let fixture = seed(&repo)?;
            let code = fixture.student.student_code.as_str();

            let writer = Store::open(store_config)?;
            let tx = reader.read_transaction()?;
            let key = live_key(&tx, repo.resolver(), EntityKind::Student, code)?;
            EntityRepository::new(&writer, &config()).delete(EntityKind::Student, code)?;
            assert_eq!(records::load_student(&tx, key)?.student_code, fixture.student.student_code);
            tx.commit().map_store("finish snapshot")?;

            assert!(matches!(repo.read_student(code), Err(KernelError::NotFound { .. })));
            Ok(())
        }

        let path = std::env::temp_dir().join(format!("rosterkernel-read-{}.sqlite3", ulid::Ulid::new()));
        let outcome = exercise(&StoreConfig { path: path.clone(), busy_timeout_ms: 1_000 });
        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{}{suffix}", path.display()));
        }
        outcome
    }
}
