use std::fmt::Display;

use serde::{Deserialize, Serialize};

pub type KernelResult<T> = Result<T, KernelError>;

/// Error taxonomy shared by every roster-kernel component.
///
/// Each variant carries enough structured detail (entity, identifier,
/// constraint name) for a caller to act without re-querying the store.
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum KernelError {
    #[error("{entity} not found: {identifier}")]
    NotFound { entity: String, identifier: String },
    #[error("conflict on {entity} {identifier}: {reason}")]
    Conflict { entity: String, identifier: String, reason: String },
    #[error("invalid argument `{field}`: {reason}")]
    InvalidArgument { field: String, reason: String },
    #[error("integrity violation on {constraint}: {detail}")]
    IntegrityViolation { constraint: String, detail: String },
    #[error("transient store error: {detail}")]
    TransientStore { detail: String },
    #[error("precondition failed at step {step} ({constraint}): {detail}")]
    PreconditionFailed { step: usize, constraint: String, detail: String },
    /// Non-transient driver failure that fits none of the kinds above.
    #[error("storage error: {detail}")]
    Storage { detail: String },
}

impl KernelError {
    pub const NOT_FOUND: &'static str = "NOT_FOUND";
    pub const CONFLICT: &'static str = "CONFLICT";
    pub const INVALID_ARGUMENT: &'static str = "INVALID_ARGUMENT";
    pub const INTEGRITY_VIOLATION: &'static str = "INTEGRITY_VIOLATION";
    pub const TRANSIENT_STORE: &'static str = "TRANSIENT_STORE";
    pub const PRECONDITION_FAILED: &'static str = "PRECONDITION_FAILED";
    pub const STORAGE: &'static str = "STORAGE";

    pub fn not_found(entity: impl Display, identifier: impl Into<String>) -> Self {
        Self::NotFound { entity: entity.to_string(), identifier: identifier.into() }
    }

    pub fn conflict(
        entity: impl Display,
        identifier: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Conflict {
            entity: entity.to_string(),
            identifier: identifier.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidArgument { field: field.into(), reason: reason.into() }
    }

    pub fn integrity(constraint: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::IntegrityViolation { constraint: constraint.into(), detail: detail.into() }
    }

    pub fn transient(detail: impl Into<String>) -> Self {
        Self::TransientStore { detail: detail.into() }
    }

    pub fn precondition(
        step: usize,
        constraint: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self::PreconditionFailed { step, constraint: constraint.into(), detail: detail.into() }
    }

    pub fn storage(detail: impl Into<String>) -> Self {
        Self::Storage { detail: detail.into() }
    }

    /// Stable machine-readable code for reports and CLI output.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => Self::NOT_FOUND,
            Self::Conflict { .. } => Self::CONFLICT,
            Self::InvalidArgument { .. } => Self::INVALID_ARGUMENT,
            Self::IntegrityViolation { .. } => Self::INTEGRITY_VIOLATION,
            Self::TransientStore { .. } => Self::TRANSIENT_STORE,
            Self::PreconditionFailed { .. } => Self::PRECONDITION_FAILED,
            Self::Storage { .. } => Self::STORAGE,
        }
    }

    /// Only connection-level failures are worth another attempt; constraint
    /// and precondition failures are logical and surface immediately.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientStore { .. })
    }

    /// Re-tag a precondition failure produced without step context.
    #[must_use]
    pub fn at_step(self, index: usize) -> Self {
        match self {
            Self::PreconditionFailed { constraint, detail, .. } => {
                Self::PreconditionFailed { step: index, constraint, detail }
            }
            other => other,
        }
    }
}
