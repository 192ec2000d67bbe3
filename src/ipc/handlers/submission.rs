use crate::calc::{self, Period, WEIGHT_SUM_TOLERANCE};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{require_actor, require_section_instructor};
use crate::ipc::types::{AppState, Request, Role};
use crate::snapshot;
use chrono::Utc;
use rusqlite::OptionalExtension;
use serde_json::json;
use tracing::warn;

fn handle_submission_submit(state: &mut AppState, req: &Request) -> serde_json::Value {
    let workspace = state.workspace.clone();
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(workspace) = workspace else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let actor = match require_actor(req) {
        Ok(a) => a,
        Err(e) => return e.response(&req.id),
    };

    let course_id = match req.params.get("courseId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing courseId", None),
    };
    let term_id = match req.params.get("termId").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing termId", None),
    };
    let section_id = match req.params.get("sectionId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing sectionId", None),
    };
    if term_id.is_empty() {
        return err(&req.id, "bad_params", "termId must not be empty", None);
    }

    let section = match require_section_instructor(conn, actor, &section_id) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    if section.course_id != course_id {
        return err(
            &req.id,
            "validation_failed",
            "section does not belong to the target course",
            Some(json!({ "sectionId": section_id, "courseId": course_id })),
        );
    }

    // A submission locks numbers in; every period must be configured to a
    // full 100 before anything is forwarded for review.
    let structure = match calc::load_section_structure(conn, &section_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, &e.code, e.message, e.details),
    };
    let empty: Vec<calc::CriteriaDef> = Vec::new();
    let mut misconfigured: Vec<serde_json::Value> = Vec::new();
    for period in Period::ALL {
        let total: f64 = structure
            .get(&period)
            .unwrap_or(&empty)
            .iter()
            .map(|c| c.weight)
            .sum();
        if (total - 100.0).abs() > WEIGHT_SUM_TOLERANCE {
            misconfigured.push(json!({
                "period": period.as_str(),
                "weightTotal": total
            }));
        }
    }
    if !misconfigured.is_empty() {
        return err(
            &req.id,
            "validation_failed",
            "criteria weights must total 100 for every period before submission",
            Some(json!({ "periods": misconfigured })),
        );
    }

    let ctx = calc::CalcContext {
        conn,
        section_id: &section_id,
    };
    let sheet = match calc::compute_section_sheet(&ctx) {
        Ok(v) => v,
        Err(e) => return err(&req.id, &e.code, e.message, e.details),
    };

    // Fire-and-forget collaborator step: the review CSV is best-effort and
    // must never fail the submission itself.
    let mut warning: Option<String> = None;
    let mut snapshot_path: Option<String> = None;
    let mut snapshot_sha256: Option<String> = None;
    match snapshot::write_submission_snapshot(&workspace, &sheet.section.course_code, &term_id, &sheet)
    {
        Ok(s) => {
            snapshot_path = Some(s.path.to_string_lossy().to_string());
            snapshot_sha256 = Some(s.sha256);
        }
        Err(e) => {
            warn!("submission snapshot export failed: {e:?}");
            warning = Some(format!("snapshot export failed: {e}"));
        }
    }

    let submitted_at = Utc::now().to_rfc3339();
    if let Err(e) = conn.execute(
        "INSERT INTO submissions(course_id, term_id, instructor_id, section_id, submitted_at, snapshot_path, snapshot_sha256)
         VALUES(?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(course_id, term_id) DO UPDATE SET
           instructor_id = excluded.instructor_id,
           section_id = excluded.section_id,
           submitted_at = excluded.submitted_at,
           snapshot_path = excluded.snapshot_path,
           snapshot_sha256 = excluded.snapshot_sha256",
        (
            &course_id,
            &term_id,
            &actor.user_id,
            &section_id,
            &submitted_at,
            &snapshot_path,
            &snapshot_sha256,
        ),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }

    let message = match &warning {
        Some(w) => format!("grades submitted for review ({})", w),
        None => "grades submitted for review".to_string(),
    };

    ok(
        &req.id,
        json!({
            "success": true,
            "message": message,
            "submittedAt": submitted_at,
            "snapshotSha256": snapshot_sha256,
            "rowCount": sheet.rows.len(),
        }),
    )
}

fn handle_submission_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "submissions": [] }));
    };
    let actor = match require_actor(req) {
        Ok(a) => a,
        Err(e) => return e.response(&req.id),
    };

    let term_filter = req
        .params
        .get("termId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    let mut clauses: Vec<&str> = Vec::new();
    let mut bind: Vec<String> = Vec::new();
    match actor.role {
        Role::Admin => {}
        Role::Instructor => {
            clauses.push("sub.instructor_id = ?");
            bind.push(actor.user_id.clone());
        }
        Role::Student => {
            return err(
                &req.id,
                "permission_denied",
                "students cannot list submissions",
                None,
            )
        }
    }
    if let Some(t) = &term_filter {
        clauses.push("sub.term_id = ?");
        bind.push(t.clone());
    }
    let where_clause = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };

    let sql = format!(
        "SELECT sub.course_id, c.code, c.name, sub.term_id, sub.instructor_id,
                sub.section_id, s.name, sub.submitted_at, sub.snapshot_sha256
         FROM submissions sub
         JOIN courses c ON c.id = sub.course_id
         JOIN sections s ON s.id = sub.section_id
         {}
         ORDER BY sub.submitted_at DESC",
        where_clause
    );

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map(rusqlite::params_from_iter(bind), |row| {
            Ok(json!({
                "courseId": row.get::<_, String>(0)?,
                "courseCode": row.get::<_, String>(1)?,
                "courseName": row.get::<_, String>(2)?,
                "termId": row.get::<_, String>(3)?,
                "instructorId": row.get::<_, String>(4)?,
                "sectionId": row.get::<_, String>(5)?,
                "sectionName": row.get::<_, String>(6)?,
                "submittedAt": row.get::<_, String>(7)?,
                "snapshotSha256": row.get::<_, Option<String>>(8)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(submissions) => ok(&req.id, json!({ "submissions": submissions })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_submission_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let actor = match require_actor(req) {
        Ok(a) => a,
        Err(e) => return e.response(&req.id),
    };
    let course_id = match req.params.get("courseId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing courseId", None),
    };
    let term_id = match req.params.get("termId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing termId", None),
    };

    let row: Option<(String, String, String, Option<String>, Option<String>)> = match conn
        .query_row(
            "SELECT instructor_id, section_id, submitted_at, snapshot_path, snapshot_sha256
             FROM submissions WHERE course_id = ? AND term_id = ?",
            (&course_id, &term_id),
            |r| {
                Ok((
                    r.get(0)?,
                    r.get(1)?,
                    r.get(2)?,
                    r.get(3)?,
                    r.get(4)?,
                ))
            },
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let Some((instructor_id, section_id, submitted_at, snapshot_path, snapshot_sha256)) = row
    else {
        return ok(&req.id, json!({ "submission": null }));
    };

    let allowed = match actor.role {
        Role::Admin => true,
        Role::Instructor => instructor_id == actor.user_id,
        Role::Student => false,
    };
    if !allowed {
        return err(
            &req.id,
            "permission_denied",
            "not allowed to read this submission",
            None,
        );
    }

    ok(
        &req.id,
        json!({
            "submission": {
                "courseId": course_id,
                "termId": term_id,
                "instructorId": instructor_id,
                "sectionId": section_id,
                "submittedAt": submitted_at,
                "snapshotPath": snapshot_path,
                "snapshotSha256": snapshot_sha256,
            }
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "submission.submit" => Some(handle_submission_submit(state, req)),
        "submission.list" => Some(handle_submission_list(state, req)),
        "submission.get" => Some(handle_submission_get(state, req)),
        _ => None,
    }
}
