use crate::calc;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    require_actor, require_role, require_section_read, HandlerErr,
};
use crate::ipc::types::{AppState, Request, Role};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn handle_courses_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let actor = match require_actor(req) {
        Ok(a) => a,
        Err(e) => return e.response(&req.id),
    };
    if let Err(e) = require_role(actor, Role::Admin) {
        return e.response(&req.id);
    }

    let code = match req.params.get("code").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing code", None),
    };
    let name = match req.params.get("name").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing name", None),
    };
    if code.is_empty() || name.is_empty() {
        return err(&req.id, "bad_params", "code and name must not be empty", None);
    }

    let course_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO courses(id, code, name) VALUES(?, ?, ?)",
        (&course_id, &code, &name),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "courseId": course_id }))
}

fn handle_sections_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let actor = match require_actor(req) {
        Ok(a) => a,
        Err(e) => return e.response(&req.id),
    };
    if let Err(e) = require_role(actor, Role::Admin) {
        return e.response(&req.id);
    }

    let course_id = match req.params.get("courseId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing courseId", None),
    };
    let name = match req.params.get("name").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing name", None),
    };
    let term_id = match req.params.get("termId").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing termId", None),
    };
    let instructor_id = match req.params.get("instructorId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing instructorId", None),
    };
    if name.is_empty() || term_id.is_empty() {
        return err(&req.id, "bad_params", "name and termId must not be empty", None);
    }

    let course_exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM courses WHERE id = ?", [&course_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if course_exists.is_none() {
        return err(&req.id, "not_found", "course not found", None);
    }

    let section_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO sections(id, course_id, name, term_id, instructor_id)
         VALUES(?, ?, ?, ?, ?)",
        (&section_id, &course_id, &name, &term_id, &instructor_id),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "sectionId": section_id }))
}

fn handle_sections_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "sections": [] }));
    };
    let actor = match require_actor(req) {
        Ok(a) => a,
        Err(e) => return e.response(&req.id),
    };

    // Admins see everything; instructors see their own sections.
    let (where_clause, bind): (&str, Vec<String>) = match actor.role {
        Role::Admin => ("", vec![]),
        Role::Instructor => ("WHERE s.instructor_id = ?", vec![actor.user_id.clone()]),
        Role::Student => {
            return err(&req.id, "permission_denied", "students cannot list sections", None)
        }
    };

    // Include counts so the portal can show a useful dashboard.
    let sql = format!(
        "SELECT
           s.id, s.name, s.term_id, s.instructor_id, c.id, c.code, c.name,
           (SELECT COUNT(*) FROM enrollments e WHERE e.section_id = s.id) AS enrollment_count,
           (SELECT COUNT(*) FROM criteria cr WHERE cr.section_id = s.id) AS criteria_count
         FROM sections s
         JOIN courses c ON c.id = s.course_id
         {}
         ORDER BY c.code, s.name",
        where_clause
    );

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map(rusqlite::params_from_iter(bind), |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "name": row.get::<_, String>(1)?,
                "termId": row.get::<_, String>(2)?,
                "instructorId": row.get::<_, String>(3)?,
                "courseId": row.get::<_, String>(4)?,
                "courseCode": row.get::<_, String>(5)?,
                "courseName": row.get::<_, String>(6)?,
                "enrollmentCount": row.get::<_, i64>(7)?,
                "criteriaCount": row.get::<_, i64>(8)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(sections) => ok(&req.id, json!({ "sections": sections })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_students_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let actor = match require_actor(req) {
        Ok(a) => a,
        Err(e) => return e.response(&req.id),
    };
    if let Err(e) = require_role(actor, Role::Admin) {
        return e.response(&req.id);
    }

    let last_name = match req.params.get("lastName").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing lastName", None),
    };
    let first_name = match req.params.get("firstName").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing firstName", None),
    };
    if last_name.is_empty() || first_name.is_empty() {
        return err(
            &req.id,
            "bad_params",
            "lastName and firstName must not be empty",
            None,
        );
    }
    let student_no = req
        .params
        .get("studentNo")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string());

    let student_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO students(id, last_name, first_name, student_no) VALUES(?, ?, ?, ?)",
        (&student_id, &last_name, &first_name, &student_no),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "studentId": student_id }))
}

fn handle_enrollments_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let actor = match require_actor(req) {
        Ok(a) => a,
        Err(e) => return e.response(&req.id),
    };
    if let Err(e) = require_role(actor, Role::Admin) {
        return e.response(&req.id);
    }

    let section_id = match req.params.get("sectionId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing sectionId", None),
    };
    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing studentId", None),
    };
    let active = req
        .params
        .get("active")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);

    let exists = |sql: &str, id: &str| -> Result<bool, HandlerErr> {
        conn.query_row(sql, [id], |r| r.get::<_, i64>(0))
            .optional()
            .map(|v| v.is_some())
            .map_err(HandlerErr::db_query)
    };
    match exists("SELECT 1 FROM sections WHERE id = ?", &section_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "section not found", None),
        Err(e) => return e.response(&req.id),
    }
    match exists("SELECT 1 FROM students WHERE id = ?", &student_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "student not found", None),
        Err(e) => return e.response(&req.id),
    }

    // Roster sync is an upsert: re-enrolling flips the active flag, never
    // duplicates the row.
    let enrollment_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO enrollments(id, section_id, student_id, active)
         VALUES(?, ?, ?, ?)
         ON CONFLICT(section_id, student_id) DO UPDATE SET
           active = excluded.active",
        (&enrollment_id, &section_id, &student_id, active as i64),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }

    let resolved_id: String = match conn.query_row(
        "SELECT id FROM enrollments WHERE section_id = ? AND student_id = ?",
        (&section_id, &student_id),
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(&req.id, json!({ "enrollmentId": resolved_id }))
}

fn handle_enrollments_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let actor = match require_actor(req) {
        Ok(a) => a,
        Err(e) => return e.response(&req.id),
    };
    let section_id = match req.params.get("sectionId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing sectionId", None),
    };
    if let Err(e) = require_section_read(conn, actor, &section_id) {
        return e.response(&req.id);
    }

    let mut stmt = match conn.prepare(
        "SELECT e.id, e.student_id, st.last_name, st.first_name, st.student_no, e.active
         FROM enrollments e
         JOIN students st ON st.id = e.student_id
         WHERE e.section_id = ?
         ORDER BY st.last_name, st.first_name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([&section_id], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "studentId": row.get::<_, String>(1)?,
                "lastName": row.get::<_, String>(2)?,
                "firstName": row.get::<_, String>(3)?,
                "studentNo": row.get::<_, Option<String>>(4)?,
                "active": row.get::<_, i64>(5)? != 0,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(enrollments) => ok(&req.id, json!({ "enrollments": enrollments })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

/// A student's own enrollments with grade status: period completeness from
/// the engine plus whether the course/term has been submitted for review.
fn handle_enrollments_mine(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let actor = match require_actor(req) {
        Ok(a) => a,
        Err(e) => return e.response(&req.id),
    };
    if let Err(e) = require_role(actor, Role::Student) {
        return e.response(&req.id);
    }

    let mut stmt = match conn.prepare(
        "SELECT e.id, e.active, s.id, s.name, s.term_id, c.id, c.code, c.name
         FROM enrollments e
         JOIN sections s ON s.id = e.section_id
         JOIN courses c ON c.id = s.course_id
         WHERE e.student_id = ?
         ORDER BY c.code, s.name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows: Vec<(String, bool, String, String, String, String, String, String)> = match stmt
        .query_map([&actor.user_id], |row| {
            Ok((
                row.get(0)?,
                row.get::<_, i64>(1)? != 0,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
                row.get(6)?,
                row.get(7)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut enrollments: Vec<serde_json::Value> = Vec::with_capacity(rows.len());
    for (enrollment_id, active, section_id, section_name, term_id, course_id, course_code, course_name) in
        rows
    {
        let ctx = calc::CalcContext {
            conn,
            section_id: &section_id,
        };
        let fin = match calc::compute_final_result(&ctx, &enrollment_id) {
            Ok(v) => v,
            Err(e) => return err(&req.id, &e.code, e.message, e.details),
        };

        let submitted_at: Option<String> = match conn
            .query_row(
                "SELECT submitted_at FROM submissions WHERE course_id = ? AND term_id = ?",
                (&course_id, &term_id),
                |r| r.get(0),
            )
            .optional()
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };

        enrollments.push(json!({
            "enrollmentId": enrollment_id,
            "active": active,
            "sectionId": section_id,
            "sectionName": section_name,
            "termId": term_id,
            "courseId": course_id,
            "courseCode": course_code,
            "courseName": course_name,
            "complete": fin.complete,
            "remark": fin.remark,
            "submittedAt": submitted_at,
        }));
    }

    ok(&req.id, json!({ "enrollments": enrollments }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "courses.create" => Some(handle_courses_create(state, req)),
        "sections.create" => Some(handle_sections_create(state, req)),
        "sections.list" => Some(handle_sections_list(state, req)),
        "students.create" => Some(handle_students_create(state, req)),
        "enrollments.create" => Some(handle_enrollments_create(state, req)),
        "enrollments.list" => Some(handle_enrollments_list(state, req)),
        "enrollments.mine" => Some(handle_enrollments_mine(state, req)),
        _ => None,
    }
}
