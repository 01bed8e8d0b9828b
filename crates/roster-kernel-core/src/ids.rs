use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::error::{KernelError, KernelResult};

pub const MIN_ID_YEAR: i32 = 2000;
pub const MAX_ID_YEAR: i32 = 2999;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    User,
    Student,
    Class,
    CounselingSession,
    BehaviorRecord,
}

impl EntityKind {
    pub const ALL: [Self; 5] =
        [Self::User, Self::Student, Self::Class, Self::CounselingSession, Self::BehaviorRecord];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Student => "student",
            Self::Class => "class",
            Self::CounselingSession => "counseling_session",
            Self::BehaviorRecord => "behavior_record",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "user" => Some(Self::User),
            "student" => Some(Self::Student),
            "class" => Some(Self::Class),
            "counseling_session" => Some(Self::CounselingSession),
            "behavior_record" => Some(Self::BehaviorRecord),
            _ => None,
        }
    }

    #[must_use]
    pub fn table(self) -> &'static str {
        match self {
            Self::User => "users",
            Self::Student => "students",
            Self::Class => "classes",
            Self::CounselingSession => "counseling_sessions",
            Self::BehaviorRecord => "behavior_records",
        }
    }

    /// Column holding the externally visible identifier.
    #[must_use]
    pub fn code_column(self) -> &'static str {
        match self {
            Self::User => "user_code",
            Self::Student => "student_code",
            Self::Class => "class_code",
            Self::CounselingSession => "session_code",
            Self::BehaviorRecord => "record_ref",
        }
    }

    /// Prefix scheme for entities whose scheme does not depend on a role.
    #[must_use]
    pub fn fixed_scheme(self) -> Option<IdScheme> {
        match self {
            Self::Student => Some(IdScheme::STUDENT),
            Self::Class => Some(IdScheme::CLASS),
            Self::CounselingSession => Some(IdScheme::SESSION),
            Self::User | Self::BehaviorRecord => None,
        }
    }
}

impl Display for EntityKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Student,
    Counselor,
    Admin,
}

impl UserRole {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Student => "student",
            Self::Counselor => "counselor",
            Self::Admin => "admin",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "student" => Some(Self::Student),
            "counselor" => Some(Self::Counselor),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }

    #[must_use]
    pub fn scheme(self) -> IdScheme {
        match self {
            Self::Student => IdScheme::USER_STUDENT,
            Self::Counselor => IdScheme::USER_COUNSELOR,
            Self::Admin => IdScheme::USER_ADMIN,
        }
    }

    /// Roles allowed in a counseling session's counselor reference and a
    /// behavior record's reporter reference.
    #[must_use]
    pub fn is_staff(self) -> bool {
        matches!(self, Self::Counselor | Self::Admin)
    }

    #[must_use]
    pub fn from_prefix(prefix: &str) -> Option<Self> {
        [Self::Student, Self::Counselor, Self::Admin]
            .into_iter()
            .find(|role| role.scheme().prefix == prefix)
    }
}

impl Display for UserRole {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `PREFIX-YYYY-NNNN` identifier layout: fixed prefix, four-digit year,
/// zero-padded sequence of exactly `width` digits.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct IdScheme {
    pub prefix: &'static str,
    pub width: usize,
}

impl IdScheme {
    pub const USER_STUDENT: Self = Self { prefix: "STU", width: 4 };
    pub const USER_COUNSELOR: Self = Self { prefix: "CNS", width: 3 };
    pub const USER_ADMIN: Self = Self { prefix: "ADM", width: 3 };
    pub const STUDENT: Self = Self { prefix: "SID", width: 4 };
    pub const CLASS: Self = Self { prefix: "CLS", width: 3 };
    pub const SESSION: Self = Self { prefix: "CS", width: 5 };

    /// Largest sequence value that still fits the scheme's width.
    #[must_use]
    pub fn max_sequence(self) -> u32 {
        let width = u32::try_from(self.width).unwrap_or(9).min(9);
        10_u32.pow(width) - 1
    }

    /// Render a sequence value in this scheme.
    ///
    /// # Errors
    /// Returns `InvalidArgument` for an out-of-range year or sequence.
    pub fn format(self, year: i32, sequence: u32) -> KernelResult<BusinessId> {
        if !(MIN_ID_YEAR..=MAX_ID_YEAR).contains(&year) {
            return Err(KernelError::invalid(
                "year",
                format!("{year} is outside {MIN_ID_YEAR}..={MAX_ID_YEAR}"),
            ));
        }
        if sequence == 0 || sequence > self.max_sequence() {
            return Err(KernelError::invalid(
                "sequence",
                format!("{sequence} does not fit {} digits for prefix {}", self.width, self.prefix),
            ));
        }
        Ok(BusinessId(format!("{}-{year}-{sequence:0width$}", self.prefix, width = self.width)))
    }

    /// Split a raw identifier into `(year, sequence)` when it matches this
    /// scheme exactly.
    #[must_use]
    pub fn parse(self, raw: &str) -> Option<(i32, u32)> {
        let rest = raw.strip_prefix(self.prefix)?.strip_prefix('-')?;
        let (year, sequence) = rest.split_once('-')?;
        if year.len() != 4 || !year.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        if sequence.len() != self.width || !sequence.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let year: i32 = year.parse().ok()?;
        let sequence: u32 = sequence.parse().ok()?;
        if !(MIN_ID_YEAR..=MAX_ID_YEAR).contains(&year) || sequence == 0 {
            return None;
        }
        Some((year, sequence))
    }
}

/// Externally visible identifier. The only identity that crosses the
/// repository boundary; surrogate keys never do.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct BusinessId(String);

impl BusinessId {
    /// Validate `raw` against the identifier format of `entity`.
    ///
    /// # Errors
    /// Returns `InvalidArgument` when `raw` is malformed for that entity type.
    pub fn parse(entity: EntityKind, raw: &str) -> KernelResult<Self> {
        let valid = match entity {
            EntityKind::User => raw
                .split_once('-')
                .and_then(|(prefix, _)| UserRole::from_prefix(prefix))
                .and_then(|role| role.scheme().parse(raw))
                .is_some(),
            EntityKind::BehaviorRecord => {
                Ulid::from_string(raw).is_ok_and(|ulid| ulid.to_string() == raw)
            }
            other => other.fixed_scheme().and_then(|scheme| scheme.parse(raw)).is_some(),
        };

        if valid {
            Ok(Self(raw.to_string()))
        } else {
            Err(KernelError::invalid(
                entity.code_column(),
                format!("malformed {entity} identifier: {raw:?}"),
            ))
        }
    }

    /// Fresh opaque reference for entities without a prefix scheme.
    #[must_use]
    pub fn opaque() -> Self {
        Self(Ulid::new().to_string())
    }

    /// Wrap a value read back from storage, where it was validated on write.
    #[must_use]
    pub fn from_stored(raw: String) -> Self {
        Self(raw)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Role implied by a user identifier's prefix.
    #[must_use]
    pub fn user_role(&self) -> Option<UserRole> {
        self.0.split_once('-').and_then(|(prefix, _)| UserRole::from_prefix(prefix))
    }
}

impl Display for BusinessId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for BusinessId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
