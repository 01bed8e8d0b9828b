use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::{KernelError, KernelResult};
use crate::ids::{BusinessId, EntityKind, UserRole};

pub const MIN_GRADE_LEVEL: u8 = 1;
pub const MAX_GRADE_LEVEL: u8 = 12;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Scheduled,
    Completed,
    Cancelled,
}

impl SessionStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "scheduled" => Some(Self::Scheduled),
            "completed" => Some(Self::Completed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BehaviorCategory {
    Positive,
    Concern,
    Incident,
}

impl BehaviorCategory {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Positive => "positive",
            Self::Concern => "concern",
            Self::Incident => "incident",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "positive" => Some(Self::Positive),
            "concern" => Some(Self::Concern),
            "incident" => Some(Self::Incident),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct User {
    pub user_code: BusinessId,
    pub role: UserRole,
    pub display_name: String,
    pub email: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Class {
    pub class_code: BusinessId,
    pub name: String,
    pub grade_level: u8,
    pub school_code: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Student {
    pub student_code: BusinessId,
    /// Owning user account (role=student).
    pub user_code: BusinessId,
    pub class_code: Option<BusinessId>,
    pub full_name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CounselingSession {
    pub session_code: BusinessId,
    pub student_code: BusinessId,
    pub counselor_code: BusinessId,
    #[serde(with = "time::serde::rfc3339")]
    pub scheduled_at: OffsetDateTime,
    pub topic: String,
    pub notes: Option<String>,
    pub status: SessionStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct BehaviorRecord {
    pub record_ref: BusinessId,
    pub student_code: BusinessId,
    pub reporter_code: BusinessId,
    pub category: BehaviorCategory,
    pub description: String,
    #[serde(with = "time::serde::rfc3339")]
    pub occurred_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct NewUser {
    pub role: UserRole,
    pub display_name: String,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct NewClass {
    pub name: String,
    pub grade_level: u8,
    pub school_code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct NewStudent {
    pub user_code: String,
    #[serde(default)]
    pub class_code: Option<String>,
    pub full_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct NewCounselingSession {
    pub student_code: String,
    pub counselor_code: String,
    #[serde(with = "time::serde::rfc3339")]
    pub scheduled_at: OffsetDateTime,
    pub topic: String,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct NewBehaviorRecord {
    pub student_code: String,
    pub reporter_code: String,
    pub category: BehaviorCategory,
    pub description: String,
    #[serde(with = "time::serde::rfc3339")]
    pub occurred_at: OffsetDateTime,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct UserPatch {
    pub display_name: Option<String>,
    /// `Some(None)` clears the email.
    pub email: Option<Option<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct ClassPatch {
    pub name: Option<String>,
    pub grade_level: Option<u8>,
    pub school_code: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct StudentPatch {
    pub user_code: Option<String>,
    /// `Some(None)` removes the class assignment.
    pub class_code: Option<Option<String>>,
    pub full_name: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct CounselingSessionPatch {
    pub counselor_code: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub scheduled_at: Option<OffsetDateTime>,
    pub topic: Option<String>,
    pub notes: Option<Option<String>>,
    pub status: Option<SessionStatus>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct BehaviorRecordPatch {
    pub category: Option<BehaviorCategory>,
    pub description: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub occurred_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "entity", rename_all = "snake_case")]
pub enum NewEntity {
    User(NewUser),
    Student(NewStudent),
    Class(NewClass),
    CounselingSession(NewCounselingSession),
    BehaviorRecord(NewBehaviorRecord),
}

impl NewEntity {
    #[must_use]
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::User(_) => EntityKind::User,
            Self::Student(_) => EntityKind::Student,
            Self::Class(_) => EntityKind::Class,
            Self::CounselingSession(_) => EntityKind::CounselingSession,
            Self::BehaviorRecord(_) => EntityKind::BehaviorRecord,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "entity", rename_all = "snake_case")]
pub enum EntityPatch {
    User(UserPatch),
    Student(StudentPatch),
    Class(ClassPatch),
    CounselingSession(CounselingSessionPatch),
    BehaviorRecord(BehaviorRecordPatch),
}

impl EntityPatch {
    #[must_use]
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::User(_) => EntityKind::User,
            Self::Student(_) => EntityKind::Student,
            Self::Class(_) => EntityKind::Class,
            Self::CounselingSession(_) => EntityKind::CounselingSession,
            Self::BehaviorRecord(_) => EntityKind::BehaviorRecord,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "entity", rename_all = "snake_case")]
pub enum EntityRecord {
    User(User),
    Student(Student),
    Class(Class),
    CounselingSession(CounselingSession),
    BehaviorRecord(BehaviorRecord),
}

impl EntityRecord {
    #[must_use]
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::User(_) => EntityKind::User,
            Self::Student(_) => EntityKind::Student,
            Self::Class(_) => EntityKind::Class,
            Self::CounselingSession(_) => EntityKind::CounselingSession,
            Self::BehaviorRecord(_) => EntityKind::BehaviorRecord,
        }
    }

    #[must_use]
    pub fn business_id(&self) -> &BusinessId {
        match self {
            Self::User(user) => &user.user_code,
            Self::Student(student) => &student.student_code,
            Self::Class(class) => &class.class_code,
            Self::CounselingSession(session) => &session.session_code,
            Self::BehaviorRecord(record) => &record.record_ref,
        }
    }
}

fn require_text(field: &str, value: &str) -> KernelResult<()> {
    if value.trim().is_empty() {
        return Err(KernelError::invalid(field, "must not be blank"));
    }
    Ok(())
}

fn validate_email(email: Option<&str>) -> KernelResult<()> {
    match email {
        Some(value) if !value.contains('@') || value.trim() != value => {
            Err(KernelError::invalid("email", format!("not an email address: {value:?}")))
        }
        _ => Ok(()),
    }
}

fn validate_grade_level(grade_level: u8) -> KernelResult<()> {
    if (MIN_GRADE_LEVEL..=MAX_GRADE_LEVEL).contains(&grade_level) {
        Ok(())
    } else {
        Err(KernelError::invalid(
            "grade_level",
            format!("{grade_level} is outside {MIN_GRADE_LEVEL}..={MAX_GRADE_LEVEL}"),
        ))
    }
}

impl NewUser {
    /// # Errors
    /// Returns `InvalidArgument` for a blank name or malformed email.
    pub fn validate(&self) -> KernelResult<()> {
        require_text("display_name", &self.display_name)?;
        validate_email(self.email.as_deref())
    }
}

impl NewClass {
    /// # Errors
    /// Returns `InvalidArgument` for blank text fields or an out-of-range grade.
    pub fn validate(&self) -> KernelResult<()> {
        require_text("name", &self.name)?;
        require_text("school_code", &self.school_code)?;
        validate_grade_level(self.grade_level)
    }
}

impl NewStudent {
    /// # Errors
    /// Returns `InvalidArgument` for a blank name.
    pub fn validate(&self) -> KernelResult<()> {
        require_text("full_name", &self.full_name)
    }
}

impl NewCounselingSession {
    /// # Errors
    /// Returns `InvalidArgument` for a blank topic.
    pub fn validate(&self) -> KernelResult<()> {
        require_text("topic", &self.topic)
    }
}

impl NewBehaviorRecord {
    /// # Errors
    /// Returns `InvalidArgument` for a blank description.
    pub fn validate(&self) -> KernelResult<()> {
        require_text("description", &self.description)
    }
}

impl UserPatch {
    /// # Errors
    /// Returns `InvalidArgument` when a supplied field is invalid.
    pub fn validate(&self) -> KernelResult<()> {
        if let Some(name) = &self.display_name {
            require_text("display_name", name)?;
        }
        if let Some(email) = &self.email {
            validate_email(email.as_deref())?;
        }
        Ok(())
    }
}

impl ClassPatch {
    /// # Errors
    /// Returns `InvalidArgument` when a supplied field is invalid.
    pub fn validate(&self) -> KernelResult<()> {
        if let Some(name) = &self.name {
            require_text("name", name)?;
        }
        if let Some(school_code) = &self.school_code {
            require_text("school_code", school_code)?;
        }
        if let Some(grade_level) = self.grade_level {
            validate_grade_level(grade_level)?;
        }
        Ok(())
    }
}

impl StudentPatch {
    /// # Errors
    /// Returns `InvalidArgument` when a supplied field is invalid.
    pub fn validate(&self) -> KernelResult<()> {
        if let Some(name) = &self.full_name {
            require_text("full_name", name)?;
        }
        Ok(())
    }
}

impl CounselingSessionPatch {
    /// # Errors
    /// Returns `InvalidArgument` when a supplied field is invalid.
    pub fn validate(&self) -> KernelResult<()> {
        if let Some(topic) = &self.topic {
            require_text("topic", topic)?;
        }
        Ok(())
    }
}

impl BehaviorRecordPatch {
    /// # Errors
    /// Returns `InvalidArgument` when a supplied field is invalid.
    pub fn validate(&self) -> KernelResult<()> {
        if let Some(description) = &self.description {
            require_text("description", description)?;
        }
        Ok(())
    }
}

/// One parent → child foreign-key edge in the domain schema.
#[derive(Debug, Clone, Copy, Serialize, Eq, PartialEq, Hash)]
pub struct Relationship {
    pub parent: EntityKind,
    pub child: EntityKind,
    pub column: &'static str,
    pub nullable: bool,
}

pub const RELATIONSHIPS: [Relationship; 6] = [
    Relationship {
        parent: EntityKind::User,
        child: EntityKind::Student,
        column: "user_id",
        nullable: false,
    },
    Relationship {
        parent: EntityKind::Class,
        child: EntityKind::Student,
        column: "class_id",
        nullable: true,
    },
    Relationship {
        parent: EntityKind::Student,
        child: EntityKind::CounselingSession,
        column: "student_id",
        nullable: false,
    },
    Relationship {
        parent: EntityKind::User,
        child: EntityKind::CounselingSession,
        column: "counselor_id",
        nullable: false,
    },
    Relationship {
        parent: EntityKind::Student,
        child: EntityKind::BehaviorRecord,
        column: "student_id",
        nullable: false,
    },
    Relationship {
        parent: EntityKind::User,
        child: EntityKind::BehaviorRecord,
        column: "reporter_id",
        nullable: false,
    },
];

impl Relationship {
    pub fn children_of(parent: EntityKind) -> impl Iterator<Item = &'static Self> {
        RELATIONSHIPS.iter().filter(move |rel| rel.parent == parent)
    }

    #[must_use]
    pub fn find(parent: EntityKind, child: EntityKind) -> Option<&'static Self> {
        RELATIONSHIPS.iter().find(|rel| rel.parent == parent && rel.child == child)
    }

    #[must_use]
    pub fn describe(&self) -> String {
        format!("{} -> {} ({}.{})", self.parent, self.child, self.child.table(), self.column)
    }
}

/// What happens to child rows when a parent is hard-deleted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DeletePolicy {
    Restrict,
    Cascade,
    SetNull,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DeleteMode {
    #[default]
    Hard,
    Soft,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd)]
pub struct EntityRef {
    pub entity: EntityKind,
    pub business_id: BusinessId,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct DeleteOutcome {
    pub target: EntityRef,
    pub mode: DeleteMode,
    /// Children removed through `Cascade` policies, deepest first.
    pub cascaded: Vec<EntityRef>,
    /// Children whose nullable reference was cleared through `SetNull`.
    pub detached: Vec<EntityRef>,
}
