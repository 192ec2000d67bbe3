use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

use crate::ipc::error::err;
use crate::ipc::types::{Actor, Request, Role};

pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(
        code: &'static str,
        message: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            details: Some(details),
        }
    }

    pub fn db_query(e: impl std::fmt::Display) -> Self {
        Self::new("db_query_failed", e.to_string())
    }

    pub fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

/// Every guarded operation takes its identity from the request envelope.
pub fn require_actor(req: &Request) -> Result<&Actor, HandlerErr> {
    req.actor
        .as_ref()
        .ok_or_else(|| HandlerErr::new("permission_denied", "missing actor context"))
}

pub fn require_role(actor: &Actor, role: Role) -> Result<(), HandlerErr> {
    if actor.role == role {
        Ok(())
    } else {
        Err(HandlerErr::new(
            "permission_denied",
            "actor role is not allowed to perform this operation",
        ))
    }
}

#[derive(Debug, Clone)]
pub struct SectionMeta {
    pub id: String,
    pub course_id: String,
    pub term_id: String,
    pub instructor_id: String,
}

pub fn section_meta(conn: &Connection, section_id: &str) -> Result<SectionMeta, HandlerErr> {
    let row: Option<(String, String, String)> = conn
        .query_row(
            "SELECT course_id, term_id, instructor_id FROM sections WHERE id = ?",
            [section_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
        .map_err(HandlerErr::db_query)?;
    let Some((course_id, term_id, instructor_id)) = row else {
        return Err(HandlerErr::with_details(
            "not_found",
            "section not found",
            json!({ "sectionId": section_id }),
        ));
    };
    Ok(SectionMeta {
        id: section_id.to_string(),
        course_id,
        term_id,
        instructor_id,
    })
}

/// Owning-instructor gate for grade writes: criteria/item edits, score
/// batches, submission. Checked before any business logic runs.
pub fn require_section_instructor(
    conn: &Connection,
    actor: &Actor,
    section_id: &str,
) -> Result<SectionMeta, HandlerErr> {
    require_role(actor, Role::Instructor)?;
    let meta = section_meta(conn, section_id)?;
    if meta.instructor_id != actor.user_id {
        return Err(HandlerErr::with_details(
            "permission_denied",
            "instructor does not own this section",
            json!({ "sectionId": section_id }),
        ));
    }
    Ok(meta)
}

/// Read gate for section-wide views: the owning instructor or an admin.
pub fn require_section_read(
    conn: &Connection,
    actor: &Actor,
    section_id: &str,
) -> Result<SectionMeta, HandlerErr> {
    let meta = section_meta(conn, section_id)?;
    match actor.role {
        Role::Admin => Ok(meta),
        Role::Instructor if meta.instructor_id == actor.user_id => Ok(meta),
        _ => Err(HandlerErr::with_details(
            "permission_denied",
            "not allowed to read this section",
            json!({ "sectionId": section_id }),
        )),
    }
}

#[derive(Debug, Clone)]
pub struct EnrollmentMeta {
    pub id: String,
    pub student_id: String,
    pub active: bool,
    pub section: SectionMeta,
}

pub fn enrollment_meta(
    conn: &Connection,
    enrollment_id: &str,
) -> Result<EnrollmentMeta, HandlerErr> {
    let row: Option<(String, String, i64)> = conn
        .query_row(
            "SELECT section_id, student_id, active FROM enrollments WHERE id = ?",
            [enrollment_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
        .map_err(HandlerErr::db_query)?;
    let Some((section_id, student_id, active)) = row else {
        return Err(HandlerErr::with_details(
            "not_found",
            "enrollment not found",
            json!({ "enrollmentId": enrollment_id }),
        ));
    };
    let section = section_meta(conn, &section_id)?;
    Ok(EnrollmentMeta {
        id: enrollment_id.to_string(),
        student_id,
        active: active != 0,
        section,
    })
}

/// Read gate for per-enrollment results: admin, the owning instructor, or
/// the enrolled student looking at their own record.
pub fn require_enrollment_read(
    conn: &Connection,
    actor: &Actor,
    enrollment_id: &str,
) -> Result<EnrollmentMeta, HandlerErr> {
    let meta = enrollment_meta(conn, enrollment_id)?;
    let allowed = match actor.role {
        Role::Admin => true,
        Role::Instructor => meta.section.instructor_id == actor.user_id,
        Role::Student => meta.student_id == actor.user_id,
    };
    if !allowed {
        return Err(HandlerErr::with_details(
            "permission_denied",
            "not allowed to read this enrollment",
            json!({ "enrollmentId": enrollment_id }),
        ));
    }
    Ok(meta)
}
