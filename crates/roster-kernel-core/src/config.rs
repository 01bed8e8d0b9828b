//! Runtime configuration loaded from YAML or JSON.
//!
//! Every section is optional; omitted fields fall back to `Default`.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::entity::{DeleteMode, DeletePolicy, Relationship, RELATIONSHIPS};
use crate::error::{KernelError, KernelResult};
use crate::ids::{EntityKind, MAX_ID_YEAR, MIN_ID_YEAR};
use crate::retry::RetryPolicy;

pub const IN_MEMORY_PATH: &str = ":memory:";
pub const DEFAULT_BACKFILL_BATCH_SIZE: u32 = 500;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct KernelConfig {
    pub store: StoreConfig,
    pub retry: RetryPolicy,
    pub migration: MigrationConfig,
    pub identifiers: IdentifierConfig,
    pub deletion: DeletionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StoreConfig {
    /// Database file, or `:memory:` for a private in-memory store.
    pub path: PathBuf,
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { path: PathBuf::from("roster.db"), busy_timeout_ms: 5_000 }
    }
}

impl StoreConfig {
    #[must_use]
    pub fn in_memory() -> Self {
        Self { path: PathBuf::from(IN_MEMORY_PATH), ..Self::default() }
    }

    #[must_use]
    pub fn is_in_memory(&self) -> bool {
        self.path.as_os_str() == IN_MEMORY_PATH
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MigrationConfig {
    /// Default rows per transaction for backfill steps without their own size.
    pub backfill_batch_size: u32,
    /// When set, the database is copied here before a migration runs.
    pub backup_dir: Option<PathBuf>,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self { backfill_batch_size: DEFAULT_BACKFILL_BATCH_SIZE, backup_dir: None }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct IdentifierConfig {
    /// Pin the minting year instead of using the current UTC year.
    pub year_override: Option<i32>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RelationshipPolicy {
    pub parent: EntityKind,
    pub child: EntityKind,
    pub policy: DeletePolicy,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct EntityDeleteMode {
    pub entity: EntityKind,
    pub mode: DeleteMode,
}

/// Per-relationship delete policies and per-entity delete modes.
///
/// Entries override the built-in defaults: `Restrict` everywhere except
/// class removal, which detaches students, and hard deletes for every entity.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DeletionConfig {
    pub relationships: Vec<RelationshipPolicy>,
    pub modes: Vec<EntityDeleteMode>,
}

impl DeletionConfig {
    #[must_use]
    pub fn default_policy(relationship: &Relationship) -> DeletePolicy {
        match (relationship.parent, relationship.child) {
            (EntityKind::Class, EntityKind::Student) => DeletePolicy::SetNull,
            _ => DeletePolicy::Restrict,
        }
    }

    #[must_use]
    pub fn policy_for(&self, relationship: &Relationship) -> DeletePolicy {
        self.relationships
            .iter()
            .rev()
            .find(|entry| entry.parent == relationship.parent && entry.child == relationship.child)
            .map_or_else(|| Self::default_policy(relationship), |entry| entry.policy)
    }

    #[must_use]
    pub fn mode_for(&self, entity: EntityKind) -> DeleteMode {
        self.modes
            .iter()
            .rev()
            .find(|entry| entry.entity == entity)
            .map_or(DeleteMode::Hard, |entry| entry.mode)
    }

    /// # Errors
    /// Returns `InvalidArgument` for a relationship the schema does not have,
    /// or `SetNull` on a mandatory reference.
    pub fn validate(&self) -> KernelResult<()> {
        for entry in &self.relationships {
            let Some(relationship) = Relationship::find(entry.parent, entry.child) else {
                return Err(KernelError::invalid(
                    "deletion.relationships",
                    format!("no relationship {} -> {}", entry.parent, entry.child),
                ));
            };
            if entry.policy == DeletePolicy::SetNull && !relationship.nullable {
                return Err(KernelError::invalid(
                    "deletion.relationships",
                    format!("set_null on non-nullable reference {}", relationship.describe()),
                ));
            }
        }
        Ok(())
    }

    /// Effective policy for every relationship, for reporting.
    #[must_use]
    pub fn effective(&self) -> Vec<(Relationship, DeletePolicy)> {
        RELATIONSHIPS.iter().map(|rel| (*rel, self.policy_for(rel))).collect()
    }
}

impl KernelConfig {
    /// Load from `path`; `.json` files are parsed as JSON, everything else as YAML.
    ///
    /// # Errors
    /// Returns `InvalidArgument` when the file cannot be read, parsed, or
    /// fails validation.
    pub fn from_path(path: &Path) -> KernelResult<Self> {
        let raw = fs::read_to_string(path).map_err(|err| {
            KernelError::invalid("config", format!("cannot read {}: {err}", path.display()))
        })?;
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let config = if is_json { Self::from_json(&raw)? } else { Self::from_yaml(&raw)? };
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns `InvalidArgument` on malformed YAML.
    pub fn from_yaml(raw: &str) -> KernelResult<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(raw).map_err(|err| KernelError::invalid("config", err.to_string()))
    }

    /// # Errors
    /// Returns `InvalidArgument` on malformed JSON.
    pub fn from_json(raw: &str) -> KernelResult<Self> {
        serde_json::from_str(raw).map_err(|err| KernelError::invalid("config", err.to_string()))
    }

    /// # Errors
    /// Returns `InvalidArgument` naming the first offending field.
    pub fn validate(&self) -> KernelResult<()> {
        if self.migration.backfill_batch_size == 0 {
            return Err(KernelError::invalid("migration.backfill_batch_size", "must be positive"));
        }
        if let Some(year) = self.identifiers.year_override {
            if !(MIN_ID_YEAR..=MAX_ID_YEAR).contains(&year) {
                return Err(KernelError::invalid(
                    "identifiers.year_override",
                    format!("{year} is outside {MIN_ID_YEAR}..={MAX_ID_YEAR}"),
                ));
            }
        }
        self.retry.validate()?;
        self.deletion.validate()
    }
}
