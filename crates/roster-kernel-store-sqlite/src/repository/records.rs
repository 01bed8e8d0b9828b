//! Per-entity row mapping. Foreign keys are stored as surrogate keys and
//! read back through joins, so records only ever carry business identifiers.

use roster_kernel_core::{
    BehaviorCategory, BehaviorRecord, BehaviorRecordPatch, BusinessId, Class, ClassPatch,
    CounselingSession, CounselingSessionPatch, EntityKind, KernelError,
    KernelResult, NewBehaviorRecord, NewClass, NewCounselingSession, NewStudent, NewUser,
    SessionStatus, Student, StudentPatch, User, UserPatch, UserRole,
};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use time::OffsetDateTime;

use crate::error::StoreResultExt;
use crate::resolver::IdentifierResolver;
use crate::schema::{now_rfc3339, parse_rfc3339, quote, rfc3339};

/// Resolution that also hides soft-deleted rows.
pub(crate) fn live_key(
    conn: &Connection,
    resolver: &IdentifierResolver,
    entity: EntityKind,
    raw: &str,
) -> KernelResult<i64> {
    let key = resolver.resolve(conn, entity, raw)?;
    let sql = format!("SELECT deleted_at IS NULL FROM {} WHERE id = ?1", quote(entity.table()));
    let live: bool = conn
        .query_row(&sql, params![key], |row| row.get(0))
        .map_store(&format!("check {entity} {raw} is live"))?;
    if live {
        Ok(key)
    } else {
        Err(KernelError::not_found(entity, raw))
    }
}

fn user_role(conn: &Connection, key: i64) -> KernelResult<UserRole> {
    let raw: String = conn
        .query_row("SELECT role FROM users WHERE id = ?1", params![key], |row| row.get(0))
        .map_store("read user role")?;
    decode(UserRole::parse(&raw), "role", &raw)
}

/// Live user that must hold `accepts` to fill `field`.
fn user_in_role(
    conn: &Connection,
    resolver: &IdentifierResolver,
    field: &str,
    raw: &str,
    accepts: fn(UserRole) -> bool,
    expected: &str,
) -> KernelResult<i64> {
    let key = live_key(conn, resolver, EntityKind::User, raw)?;
    let role = user_role(conn, key)?;
    if accepts(role) {
        Ok(key)
    } else {
        Err(KernelError::invalid(
            field,
            format!("user {raw} has role {}; {field} requires {expected}", role.as_str()),
        ))
    }
}

fn student_owner(conn: &Connection, resolver: &IdentifierResolver, raw: &str) -> KernelResult<i64> {
    user_in_role(conn, resolver, "user_code", raw, |role| role == UserRole::Student, "role student")
}

fn staff_member(
    conn: &Connection,
    resolver: &IdentifierResolver,
    field: &str,
    raw: &str,
) -> KernelResult<i64> {
    user_in_role(conn, resolver, field, raw, UserRole::is_staff, "role counselor or admin")
}

fn decode<T>(value: Option<T>, field: &str, raw: &str) -> KernelResult<T> {
    value.ok_or_else(|| KernelError::storage(format!("unexpected {field} value {raw:?} in store")))
}

fn vanished(entity: EntityKind) -> KernelError {
    KernelError::storage(format!("{entity} row disappeared inside its transaction"))
}

fn update_row(
    conn: &Connection,
    entity: EntityKind,
    key: i64,
    assignments: Vec<(&'static str, Value)>,
) -> KernelResult<()> {
    if assignments.is_empty() {
        return Ok(());
    }
    let set = assignments
        .iter()
        .enumerate()
        .map(|(index, (column, _))| format!("{} = ?{}", quote(column), index + 1))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "UPDATE {} SET {set} WHERE id = ?{}",
        quote(entity.table()),
        assignments.len() + 1
    );
    let mut values: Vec<Value> = assignments.into_iter().map(|(_, value)| value).collect();
    values.push(Value::Integer(key));
    conn.execute(&sql, params_from_iter(values)).map_store(&format!("update {entity}"))?;
    Ok(())
}

fn text(value: &str) -> Value {
    Value::Text(value.to_string())
}

fn optional_text(value: Option<&str>) -> Value {
    value.map_or(Value::Null, text)
}

fn timestamp(value: OffsetDateTime) -> KernelResult<Value> {
    rfc3339(value).map(Value::Text)
}

// users

pub(crate) fn insert_user(
    conn: &Connection,
    resolver: &IdentifierResolver,
    input: &NewUser,
) -> KernelResult<i64> {
    input.validate()?;
    let code = resolver.mint(conn, EntityKind::User, Some(input.role))?;
    conn.execute(
        "INSERT INTO users(user_code, role, display_name, email, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![code.as_str(), input.role.as_str(), input.display_name, input.email, now_rfc3339()?],
    )
    .map_store("insert user")?;
    Ok(conn.last_insert_rowid())
}

pub(crate) fn load_user(conn: &Connection, key: i64) -> KernelResult<User> {
    let (code, role, display_name, email, created_at) = conn
        .query_row(
            "SELECT user_code, role, display_name, email, created_at
             FROM users WHERE id = ?1 AND deleted_at IS NULL",
            params![key],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, String>(4)?,
                ))
            },
        )
        .optional()
        .map_store("load user")?
        .ok_or_else(|| vanished(EntityKind::User))?;
    Ok(User {
        user_code: BusinessId::from_stored(code),
        role: decode(UserRole::parse(&role), "role", &role)?,
        display_name,
        email,
        created_at: parse_rfc3339(&created_at)?,
    })
}

/// Role is part of the identifier prefix and therefore not patchable.
pub(crate) fn patch_user(conn: &Connection, key: i64, patch: &UserPatch) -> KernelResult<()> {
    patch.validate()?;
    let mut assignments = Vec::new();
    if let Some(name) = &patch.display_name {
        assignments.push(("display_name", text(name)));
    }
    if let Some(email) = &patch.email {
        assignments.push(("email", optional_text(email.as_deref())));
    }
    update_row(conn, EntityKind::User, key, assignments)
}

// classes

pub(crate) fn insert_class(
    conn: &Connection,
    resolver: &IdentifierResolver,
    input: &NewClass,
) -> KernelResult<i64> {
    input.validate()?;
    let code = resolver.mint(conn, EntityKind::Class, None)?;
    conn.execute(
        "INSERT INTO classes(class_code, name, grade_level, school_code, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![code.as_str(), input.name, input.grade_level, input.school_code, now_rfc3339()?],
    )
    .map_store("insert class")?;
    Ok(conn.last_insert_rowid())
}

pub(crate) fn load_class(conn: &Connection, key: i64) -> KernelResult<Class> {
    let (code, name, grade_level, school_code, created_at) = conn
        .query_row(
            "SELECT class_code, name, grade_level, school_code, created_at
             FROM classes WHERE id = ?1 AND deleted_at IS NULL",
            params![key],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, u8>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            },
        )
        .optional()
        .map_store("load class")?
        .ok_or_else(|| vanished(EntityKind::Class))?;
    Ok(Class {
        class_code: BusinessId::from_stored(code),
        name,
        grade_level,
        school_code,
        created_at: parse_rfc3339(&created_at)?,
    })
}

pub(crate) fn patch_class(conn: &Connection, key: i64, patch: &ClassPatch) -> KernelResult<()> {
    patch.validate()?;
    let mut assignments = Vec::new();
    if let Some(name) = &patch.name {
        assignments.push(("name", text(name)));
    }
    if let Some(grade_level) = patch.grade_level {
        assignments.push(("grade_level", Value::Integer(i64::from(grade_level))));
    }
    if let Some(school_code) = &patch.school_code {
        assignments.push(("school_code", text(school_code)));
    }
    update_row(conn, EntityKind::Class, key, assignments)
}

// students

pub(crate) fn insert_student(
    conn: &Connection,
    resolver: &IdentifierResolver,
    input: &NewStudent,
) -> KernelResult<i64> {
    input.validate()?;
    let user_id = student_owner(conn, resolver, &input.user_code)?;
    let class_id = input
        .class_code
        .as_deref()
        .map(|raw| live_key(conn, resolver, EntityKind::Class, raw))
        .transpose()?;
    let code = resolver.mint(conn, EntityKind::Student, None)?;
    conn.execute(
        "INSERT INTO students(student_code, user_id, class_id, full_name, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![code.as_str(), user_id, class_id, input.full_name, now_rfc3339()?],
    )
    .map_store("insert student")?;
    Ok(conn.last_insert_rowid())
}

pub(crate) fn load_student(conn: &Connection, key: i64) -> KernelResult<Student> {
    let (code, user_code, class_code, full_name, created_at) = conn
        .query_row(
            "SELECT s.student_code, u.user_code, c.class_code, s.full_name, s.created_at
             FROM students s
             JOIN users u ON u.id = s.user_id
             LEFT JOIN classes c ON c.id = s.class_id
             WHERE s.id = ?1 AND s.deleted_at IS NULL",
            params![key],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            },
        )
        .optional()
        .map_store("load student")?
        .ok_or_else(|| vanished(EntityKind::Student))?;
    Ok(Student {
        student_code: BusinessId::from_stored(code),
        user_code: BusinessId::from_stored(user_code),
        class_code: class_code.map(BusinessId::from_stored),
        full_name,
        created_at: parse_rfc3339(&created_at)?,
    })
}

pub(crate) fn patch_student(
    conn: &Connection,
    resolver: &IdentifierResolver,
    key: i64,
    patch: &StudentPatch,
) -> KernelResult<()> {
    patch.validate()?;
    let mut assignments = Vec::new();
    if let Some(user_code) = &patch.user_code {
        assignments.push(("user_id", Value::Integer(student_owner(conn, resolver, user_code)?)));
    }
    match &patch.class_code {
        Some(Some(class_code)) => {
            let class_id = live_key(conn, resolver, EntityKind::Class, class_code)?;
            assignments.push(("class_id", Value::Integer(class_id)));
        }
        Some(None) => assignments.push(("class_id", Value::Null)),
        None => {}
    }
    if let Some(full_name) = &patch.full_name {
        assignments.push(("full_name", text(full_name)));
    }
    update_row(conn, EntityKind::Student, key, assignments)
}

// counseling sessions

pub(crate) fn insert_session(
    conn: &Connection,
    resolver: &IdentifierResolver,
    input: &NewCounselingSession,
) -> KernelResult<i64> {
    input.validate()?;
    let student_id = live_key(conn, resolver, EntityKind::Student, &input.student_code)?;
    let counselor_id = staff_member(conn, resolver, "counselor_code", &input.counselor_code)?;
    let code = resolver.mint(conn, EntityKind::CounselingSession, None)?;
    conn.execute(
        "INSERT INTO counseling_sessions(
            session_code, student_id, counselor_id, scheduled_at, topic, notes, status, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            code.as_str(),
            student_id,
            counselor_id,
            rfc3339(input.scheduled_at)?,
            input.topic,
            input.notes,
            SessionStatus::Scheduled.as_str(),
            now_rfc3339()?
        ],
    )
    .map_store("insert counseling session")?;
    Ok(conn.last_insert_rowid())
}

pub(crate) fn load_session(conn: &Connection, key: i64) -> KernelResult<CounselingSession> {
    let (code, student_code, counselor_code, scheduled_at, topic, notes, status, created_at) = conn
        .query_row(
            "SELECT cs.session_code, s.student_code, u.user_code, cs.scheduled_at,
                    cs.topic, cs.notes, cs.status, cs.created_at
             FROM counseling_sessions cs
             JOIN students s ON s.id = cs.student_id
             JOIN users u ON u.id = cs.counselor_id
             WHERE cs.id = ?1 AND cs.deleted_at IS NULL",
            params![key],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, String>(7)?,
                ))
            },
        )
        .optional()
        .map_store("load counseling session")?
        .ok_or_else(|| vanished(EntityKind::CounselingSession))?;
    Ok(CounselingSession {
        session_code: BusinessId::from_stored(code),
        student_code: BusinessId::from_stored(student_code),
        counselor_code: BusinessId::from_stored(counselor_code),
        scheduled_at: parse_rfc3339(&scheduled_at)?,
        topic,
        notes,
        status: decode(SessionStatus::parse(&status), "status", &status)?,
        created_at: parse_rfc3339(&created_at)?,
    })
}

pub(crate) fn patch_session(
    conn: &Connection,
    resolver: &IdentifierResolver,
    key: i64,
    patch: &CounselingSessionPatch,
) -> KernelResult<()> {
    patch.validate()?;
    let mut assignments = Vec::new();
    if let Some(counselor_code) = &patch.counselor_code {
        let counselor_id = staff_member(conn, resolver, "counselor_code", counselor_code)?;
        assignments.push(("counselor_id", Value::Integer(counselor_id)));
    }
    if let Some(scheduled_at) = patch.scheduled_at {
        assignments.push(("scheduled_at", timestamp(scheduled_at)?));
    }
    if let Some(topic) = &patch.topic {
        assignments.push(("topic", text(topic)));
    }
    if let Some(notes) = &patch.notes {
        assignments.push(("notes", optional_text(notes.as_deref())));
    }
    if let Some(status) = patch.status {
        assignments.push(("status", text(status.as_str())));
    }
    update_row(conn, EntityKind::CounselingSession, key, assignments)
}

/// Live sessions of one student, earliest first.
pub(crate) fn session_keys_for_student(conn: &Connection, student_id: i64) -> KernelResult<Vec<i64>> {
    child_keys(
        conn,
        "SELECT id FROM counseling_sessions
         WHERE student_id = ?1 AND deleted_at IS NULL
         ORDER BY scheduled_at, id",
        student_id,
    )
}

// behavior records

pub(crate) fn insert_behavior_record(
    conn: &Connection,
    resolver: &IdentifierResolver,
    input: &NewBehaviorRecord,
) -> KernelResult<i64> {
    input.validate()?;
    let student_id = live_key(conn, resolver, EntityKind::Student, &input.student_code)?;
    let reporter_id = staff_member(conn, resolver, "reporter_code", &input.reporter_code)?;
    let reference = resolver.mint(conn, EntityKind::BehaviorRecord, None)?;
    conn.execute(
        "INSERT INTO behavior_records(
            record_ref, student_id, reporter_id, category, description, occurred_at, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            reference.as_str(),
            student_id,
            reporter_id,
            input.category.as_str(),
            input.description,
            rfc3339(input.occurred_at)?,
            now_rfc3339()?
        ],
    )
    .map_store("insert behavior record")?;
    Ok(conn.last_insert_rowid())
}

pub(crate) fn load_behavior_record(conn: &Connection, key: i64) -> KernelResult<BehaviorRecord> {
    let (reference, student_code, reporter_code, category, description, occurred_at, created_at) =
        conn.query_row(
            "SELECT br.record_ref, s.student_code, u.user_code, br.category,
                    br.description, br.occurred_at, br.created_at
             FROM behavior_records br
             JOIN students s ON s.id = br.student_id
             JOIN users u ON u.id = br.reporter_id
             WHERE br.id = ?1 AND br.deleted_at IS NULL",
            params![key],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                ))
            },
        )
        .optional()
        .map_store("load behavior record")?
        .ok_or_else(|| vanished(EntityKind::BehaviorRecord))?;
    Ok(BehaviorRecord {
        record_ref: BusinessId::from_stored(reference),
        student_code: BusinessId::from_stored(student_code),
        reporter_code: BusinessId::from_stored(reporter_code),
        category: decode(BehaviorCategory::parse(&category), "category", &category)?,
        description,
        occurred_at: parse_rfc3339(&occurred_at)?,
        created_at: parse_rfc3339(&created_at)?,
    })
}

pub(crate) fn patch_behavior_record(
    conn: &Connection,
    key: i64,
    patch: &BehaviorRecordPatch,
) -> KernelResult<()> {
    patch.validate()?;
    let mut assignments = Vec::new();
    if let Some(category) = patch.category {
        assignments.push(("category", text(category.as_str())));
    }
    if let Some(description) = &patch.description {
        assignments.push(("description", text(description)));
    }
    if let Some(occurred_at) = patch.occurred_at {
        assignments.push(("occurred_at", timestamp(occurred_at)?));
    }
    update_row(conn, EntityKind::BehaviorRecord, key, assignments)
}

pub(crate) fn behavior_keys_for_student(conn: &Connection, student_id: i64) -> KernelResult<Vec<i64>> {
    child_keys(
        conn,
        "SELECT id FROM behavior_records
         WHERE student_id = ?1 AND deleted_at IS NULL
         ORDER BY occurred_at, id",
        student_id,
    )
}

fn child_keys(conn: &Connection, sql: &str, parent: i64) -> KernelResult<Vec<i64>> {
    let mut stmt = conn.prepare(sql).map_store("prepare child listing")?;
    let rows = stmt.query_map(params![parent], |row| row.get::<_, i64>(0)).map_store("list children")?;
    rows.collect::<Result<Vec<_>, _>>().map_store("list children")
}

