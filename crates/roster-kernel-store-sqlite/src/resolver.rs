//! Translation between business identifiers and surrogate keys, and minting.
//!
//! Every call is a point-in-time query on the connection it is handed; the
//! resolver keeps no cache. Callers that need resolution and a write to agree
//! pass the same transaction to both.

use roster_kernel_core::{
    BusinessId, EntityKind, IdScheme, IdentifierConfig, KernelError, KernelResult, UserRole,
};
use rusqlite::{params, Connection, OptionalExtension};
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::error::StoreResultExt;
use crate::schema::quote;

const MINT_ATTEMPTS: usize = 2;

#[derive(Debug, Clone, Default)]
pub struct IdentifierResolver {
    config: IdentifierConfig,
}

impl IdentifierResolver {
    #[must_use]
    pub fn new(config: IdentifierConfig) -> Self {
        Self { config }
    }

    /// Business identifier → surrogate key.
    ///
    /// # Errors
    /// `InvalidArgument` for a malformed identifier (no query is issued),
    /// `NotFound` when no row carries it.
    pub fn resolve(&self, conn: &Connection, entity: EntityKind, raw: &str) -> KernelResult<i64> {
        let business_id = BusinessId::parse(entity, raw)?;
        let sql = format!(
            "SELECT id FROM {} WHERE {} = ?1",
            quote(entity.table()),
            quote(entity.code_column())
        );
        let key = conn
            .query_row(&sql, params![business_id.as_str()], |row| row.get::<_, i64>(0))
            .optional()
            .map_store(&format!("resolve {entity} {raw}"))?
            .ok_or_else(|| KernelError::not_found(entity, raw))?;
        debug!(%entity, business_id = raw, key, "resolved business identifier");
        Ok(key)
    }

    /// Surrogate key → business identifier.
    ///
    /// # Errors
    /// `NotFound` when the key is absent.
    pub fn lookup(&self, conn: &Connection, entity: EntityKind, key: i64) -> KernelResult<BusinessId> {
        let sql = format!(
            "SELECT {} FROM {} WHERE id = ?1",
            quote(entity.code_column()),
            quote(entity.table())
        );
        conn.query_row(&sql, params![key], |row| row.get::<_, String>(0))
            .optional()
            .map_store(&format!("lookup {entity} key {key}"))?
            .map(BusinessId::from_stored)
            .ok_or_else(|| KernelError::not_found(entity, format!("#{key}")))
    }

    /// Year stamped into minted identifiers.
    #[must_use]
    pub fn minting_year(&self) -> i32 {
        self.config.year_override.unwrap_or_else(|| OffsetDateTime::now_utc().year())
    }

    /// Generate the next identifier for `entity`.
    ///
    /// `role` selects the user scheme and is ignored for other entities.
    /// Run inside the caller's write transaction so the sequence advance and
    /// the insert that consumes the identifier commit together.
    ///
    /// # Errors
    /// `InvalidArgument` when a user is minted without a role, `Conflict`
    /// when the sequence space is exhausted or two consecutive candidates
    /// collide with existing or retired identifiers.
    pub fn mint(
        &self,
        conn: &Connection,
        entity: EntityKind,
        role: Option<UserRole>,
    ) -> KernelResult<BusinessId> {
        let scheme = match (entity, role) {
            (EntityKind::User, Some(role)) => Some(role.scheme()),
            (EntityKind::User, None) => {
                return Err(KernelError::invalid("role", "minting a user identifier needs a role"))
            }
            (other, _) => other.fixed_scheme(),
        };

        let mut last_candidate = String::new();
        for attempt in 1..=MINT_ATTEMPTS {
            let candidate = match scheme {
                Some(scheme) => self.next_in_sequence(conn, scheme)?,
                None => BusinessId::opaque(),
            };
            if !is_taken(conn, entity, &candidate)? {
                debug!(%entity, business_id = %candidate, attempt, "minted business identifier");
                return Ok(candidate);
            }
            warn!(%entity, business_id = %candidate, attempt, "minted identifier collides");
            last_candidate = candidate.to_string();
        }

        Err(KernelError::conflict(
            entity,
            last_candidate,
            format!("{MINT_ATTEMPTS} consecutive minted identifiers already exist"),
        ))
    }

    fn next_in_sequence(&self, conn: &Connection, scheme: IdScheme) -> KernelResult<BusinessId> {
        let year = self.minting_year();
        let next: i64 = conn
            .query_row(
                "INSERT INTO id_sequences(prefix, year, last_value) VALUES (?1, ?2, 1)
                 ON CONFLICT(prefix, year) DO UPDATE SET last_value = last_value + 1
                 RETURNING last_value",
                params![scheme.prefix, year],
                |row| row.get(0),
            )
            .map_store(&format!("advance sequence {}-{year}", scheme.prefix))?;

        let sequence = u32::try_from(next)
            .ok()
            .filter(|value| *value <= scheme.max_sequence())
            .ok_or_else(|| {
                KernelError::conflict(
                    scheme.prefix,
                    format!("{}-{year}", scheme.prefix),
                    format!("sequence space of {} digits exhausted", scheme.width),
                )
            })?;
        scheme.format(year, sequence)
    }
}

/// Taken means present in the entity table or retired by a hard delete.
fn is_taken(conn: &Connection, entity: EntityKind, candidate: &BusinessId) -> KernelResult<bool> {
    let sql = format!(
        "SELECT EXISTS(SELECT 1 FROM {table} WHERE {column} = ?1)
             OR EXISTS(SELECT 1 FROM retired_identifiers WHERE entity = ?2 AND business_id = ?1)",
        table = quote(entity.table()),
        column = quote(entity.code_column()),
    );
    let taken = conn
        .query_row(&sql, params![candidate.as_str(), entity.as_str()], |row| row.get::<_, i64>(0))
        .map_store("check identifier collision")?;
    Ok(taken == 1)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::path::PathBuf;
    use std::thread;

    use proptest::prelude::*;
    use roster_kernel_core::StoreConfig;
    use ulid::Ulid;

    use super::*;
    use crate::store::Store;

    fn pinned() -> IdentifierResolver {
        IdentifierResolver::new(IdentifierConfig { year_override: Some(2025) })
    }

    fn migrated() -> KernelResult<Store> {
        let store = Store::open_in_memory()?;
        store.migrate()?;
        Ok(store)
    }

    fn insert_user(conn: &Connection, code: &str, role: UserRole) -> KernelResult<i64> {
        conn.execute(
            "INSERT INTO users(user_code, role, display_name, created_at)
             VALUES (?1, ?2, 'Fixture', '2025-01-01T00:00:00Z')",
            params![code, role.as_str()],
        )
        .map_store("insert fixture user")?;
        Ok(conn.last_insert_rowid())
    }

    #[test]
    fn mints_sequential_identifiers_per_prefix() -> KernelResult<()> {
        let store = migrated()?;
        let resolver = pinned();
        let conn = store.conn();

        let first = resolver.mint(conn, EntityKind::User, Some(UserRole::Student))?;
        insert_user(conn, first.as_str(), UserRole::Student)?;
        let second = resolver.mint(conn, EntityKind::User, Some(UserRole::Student))?;
        let counselor = resolver.mint(conn, EntityKind::User, Some(UserRole::Counselor))?;
        let session = resolver.mint(conn, EntityKind::CounselingSession, None)?;

        assert_eq!(first.as_str(), "STU-2025-0001");
        assert_eq!(second.as_str(), "STU-2025-0002");
        assert_eq!(counselor.as_str(), "CNS-2025-001");
        assert_eq!(session.as_str(), "CS-2025-00001");
        Ok(())
    }

    #[test]
    fn user_mint_without_role_is_rejected() -> KernelResult<()> {
        let store = migrated()?;
        let err = pinned().mint(store.conn(), EntityKind::User, None).err();
        assert!(matches!(err, Some(KernelError::InvalidArgument { .. })));
        Ok(())
    }

    #[test]
    fn resolve_and_lookup_are_inverse() -> KernelResult<()> {
        let store = migrated()?;
        let resolver = pinned();
        let key = insert_user(store.conn(), "ADM-2025-001", UserRole::Admin)?;

        assert_eq!(resolver.resolve(store.conn(), EntityKind::User, "ADM-2025-001")?, key);
        assert_eq!(resolver.lookup(store.conn(), EntityKind::User, key)?.as_str(), "ADM-2025-001");
        Ok(())
    }

    #[test]
    fn malformed_identifier_fails_before_query() -> KernelResult<()> {
        // No schema: a query would surface as a storage error, not InvalidArgument.
        let store = Store::open_in_memory()?;
        let resolver = pinned();
        for raw in ["stu-2025-0001", "STU-2025-001", "STU-25-0001", "CLS-2025-0001", ""] {
            let err = resolver.resolve(store.conn(), EntityKind::User, raw).err();
            assert!(matches!(err, Some(KernelError::InvalidArgument { .. })), "{raw}: {err:?}");
        }
        Ok(())
    }

    #[test]
    fn absent_rows_are_not_found() -> KernelResult<()> {
        let store = migrated()?;
        let resolver = pinned();
        assert!(matches!(
            resolver.resolve(store.conn(), EntityKind::Class, "CLS-2025-001"),
            Err(KernelError::NotFound { .. })
        ));
        assert!(matches!(
            resolver.lookup(store.conn(), EntityKind::Class, 41),
            Err(KernelError::NotFound { .. })
        ));
        Ok(())
    }

    #[test]
    fn collision_retries_once_with_next_sequence() -> KernelResult<()> {
        let store = migrated()?;
        insert_user(store.conn(), "STU-2025-0001", UserRole::Student)?;

        let minted = pinned().mint(store.conn(), EntityKind::User, Some(UserRole::Student))?;
        assert_eq!(minted.as_str(), "STU-2025-0002");
        Ok(())
    }

    #[test]
    fn repeated_collision_is_conflict() -> KernelResult<()> {
        let store = migrated()?;
        insert_user(store.conn(), "STU-2025-0001", UserRole::Student)?;
        store
            .conn()
            .execute(
                "INSERT INTO retired_identifiers(entity, business_id, retired_at)
                 VALUES ('user', 'STU-2025-0002', '2025-02-01T00:00:00Z')",
                [],
            )
            .map_store("retire fixture")?;

        let err = pinned().mint(store.conn(), EntityKind::User, Some(UserRole::Student)).err();
        assert!(matches!(err, Some(KernelError::Conflict { .. })), "{err:?}");
        Ok(())
    }

    #[test]
    fn exhausted_sequence_is_conflict() -> KernelResult<()> {
        let store = migrated()?;
        store
            .conn()
            .execute(
                "INSERT INTO id_sequences(prefix, year, last_value) VALUES ('CLS', 2025, 999)",
                [],
            )
            .map_store("seed sequence")?;
        let err = pinned().mint(store.conn(), EntityKind::Class, None).err();
        assert!(matches!(err, Some(KernelError::Conflict { .. })));
        Ok(())
    }

    #[test]
    fn behavior_records_get_opaque_references() -> KernelResult<()> {
        let store = migrated()?;
        let reference = pinned().mint(store.conn(), EntityKind::BehaviorRecord, None)?;
        BusinessId::parse(EntityKind::BehaviorRecord, reference.as_str())?;
        Ok(())
    }

    #[test]
    fn concurrent_minting_never_duplicates() -> KernelResult<()> {
        let db_path =
            std::env::temp_dir().join(format!("rosterkernel-mint-{}.sqlite3", Ulid::new()));
        let config = StoreConfig { path: db_path.clone(), busy_timeout_ms: 10_000 };
        Store::open(&config)?.migrate()?;

        let threads = 4;
        let mints_per_thread = 25;
        let mut handles = Vec::new();
        for _ in 0..threads {
            let config = config.clone();
            handles.push(thread::spawn(move || -> KernelResult<Vec<String>> {
                let store = Store::open(&config)?;
                let resolver = pinned();
                let mut minted = Vec::new();
                for _ in 0..mints_per_thread {
                    let tx = store.write_transaction()?;
                    let id = resolver.mint(&tx, EntityKind::User, Some(UserRole::Student))?;
                    tx.execute(
                        "INSERT INTO users(user_code, role, display_name, created_at)
                         VALUES (?1, 'student', 'Concurrent', '2025-01-01T00:00:00Z')",
                        params![id.as_str()],
                    )
                    .map_store("insert minted user")?;
                    tx.commit().map_store("commit mint")?;
                    minted.push(id.to_string());
                }
                Ok(minted)
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            let Ok(result) = handle.join() else {
                return Err(KernelError::storage("minting thread panicked"));
            };
            all.extend(result?);
        }
        let unique: BTreeSet<_> = all.iter().cloned().collect();
        assert_eq!(unique.len(), threads * mints_per_thread);
        assert!(unique.contains("STU-2025-0100"));

        for suffix in ["", "-wal", "-shm"] {
            let path = PathBuf::from(format!("{}{}", db_path.display(), suffix));
            if path.exists() {
                std::fs::remove_file(&path)
                    .map_err(|err| KernelError::storage(format!("cleanup: {err}")))?;
            }
        }
        Ok(())
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn round_trip_holds_for_every_minted_class(count in 1_usize..20) {
            let store = migrated().map_err(|err| TestCaseError::fail(err.to_string()))?;
            let resolver = pinned();
            let conn = store.conn();
            for _ in 0..count {
                let code = resolver
                    .mint(conn, EntityKind::Class, None)
                    .map_err(|err| TestCaseError::fail(err.to_string()))?;
                conn.execute(
                    "INSERT INTO classes(class_code, name, grade_level, school_code, created_at)
                     VALUES (?1, 'Fixture', 5, 'SCH-01', '2025-01-01T00:00:00Z')",
                    params![code.as_str()],
                )
                .map_err(|err| TestCaseError::fail(err.to_string()))?;
                let key = conn.last_insert_rowid();

                let resolved = resolver
                    .resolve(conn, EntityKind::Class, code.as_str())
                    .map_err(|err| TestCaseError::fail(err.to_string()))?;
                let looked_up = resolver
                    .lookup(conn, EntityKind::Class, key)
                    .map_err(|err| TestCaseError::fail(err.to_string()))?;
                prop_assert_eq!(resolved, key);
                prop_assert_eq!(looked_up, code);
            }
        }
    }
}
