//! Policy-driven deletion over the fixed relationship graph.

use roster_kernel_core::{
    BusinessId, DeleteMode, DeleteOutcome, DeletePolicy, DeletionConfig, EntityKind, EntityRef,
    KernelError, KernelResult, Relationship,
};
use rusqlite::{params, Connection};
use tracing::{info, warn};

use crate::auditor::IntegrityAuditor;
use crate::error::StoreResultExt;
use crate::resolver::IdentifierResolver;
use crate::schema::{now_rfc3339, quote};

pub(crate) struct Deletion<'a> {
    conn: &'a Connection,
    resolver: &'a IdentifierResolver,
    auditor: IntegrityAuditor,
    policies: &'a DeletionConfig,
    cascaded: Vec<EntityRef>,
    detached: Vec<EntityRef>,
}

impl<'a> Deletion<'a> {
    pub fn new(
        conn: &'a Connection,
        resolver: &'a IdentifierResolver,
        auditor: IntegrityAuditor,
        policies: &'a DeletionConfig,
    ) -> Self {
        Self { conn, resolver, auditor, policies, cascaded: Vec::new(), detached: Vec::new() }
    }

    /// Delete the live row `key` according to the entity's configured mode.
    pub fn run(mut self, entity: EntityKind, key: i64) -> KernelResult<DeleteOutcome> {
        let business_id = self.resolver.lookup(self.conn, entity, key)?;
        let mode = self.policies.mode_for(entity);
        match mode {
            DeleteMode::Soft => {
                let sql = format!("UPDATE {} SET deleted_at = ?1 WHERE id = ?2", quote(entity.table()));
                self.conn
                    .execute(&sql, params![now_rfc3339()?, key])
                    .map_store(&format!("soft-delete {entity}"))?;
            }
            DeleteMode::Hard => {
                self.remove(entity, key, &business_id)?;
            }
        }
        info!(
            %entity,
            business_id = %business_id,
            mode = ?mode,
            cascaded = self.cascaded.len(),
            detached = self.detached.len(),
            "entity deleted"
        );
        Ok(DeleteOutcome {
            target: EntityRef { entity, business_id },
            mode,
            cascaded: self.cascaded,
            detached: self.detached,
        })
    }

    /// Hard-delete one row after settling every child relationship.
    fn remove(&mut self, entity: EntityKind, key: i64, business_id: &BusinessId) -> KernelResult<()> {
        for relationship in Relationship::children_of(entity) {
            let children =
                self.auditor.dependents(self.conn, relationship.child.table(), relationship.column, key)?;
            if children.is_empty() {
                continue;
            }
            match self.policies.policy_for(relationship) {
                DeletePolicy::Restrict => {
                    return Err(KernelError::conflict(
                        entity,
                        business_id.as_str(),
                        format!(
                            "{} dependent {} row(s) via {} and the policy is restrict",
                            children.len(),
                            relationship.child,
                            relationship.describe()
                        ),
                    ));
                }
                DeletePolicy::Cascade => {
                    warn!(
                        parent = %business_id,
                        relationship = %relationship.describe(),
                        count = children.len(),
                        "cascading delete"
                    );
                    for child in children {
                        let child_id = self.resolver.lookup(self.conn, relationship.child, child)?;
                        self.remove(relationship.child, child, &child_id)?;
                        self.cascaded.push(EntityRef { entity: relationship.child, business_id: child_id });
                    }
                }
                DeletePolicy::SetNull => {
                    if !relationship.nullable {
                        return Err(KernelError::invalid(
                            "deletion.relationships",
                            format!("{} is not nullable", relationship.describe()),
                        ));
                    }
                    let sql = format!(
                        "UPDATE {} SET {} = NULL WHERE id = ?1",
                        quote(relationship.child.table()),
                        quote(relationship.column)
                    );
                    for child in children {
                        self.conn.execute(&sql, params![child]).map_store("detach child")?;
                        let child_id = self.resolver.lookup(self.conn, relationship.child, child)?;
                        self.detached.push(EntityRef { entity: relationship.child, business_id: child_id });
                    }
                }
            }
        }

        self.conn
            .execute(
                "INSERT OR IGNORE INTO retired_identifiers(entity, business_id, retired_at)
                 VALUES (?1, ?2, ?3)",
                params![entity.as_str(), business_id.as_str(), now_rfc3339()?],
            )
            .map_store("retire business identifier")?;
        let sql = format!("DELETE FROM {} WHERE id = ?1", quote(entity.table()));
        self.conn.execute(&sql, params![key]).map_store(&format!("delete {entity}"))?;
        Ok(())
    }
}
