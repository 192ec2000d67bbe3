use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{require_actor, require_enrollment_read, require_section_instructor, HandlerErr};
use crate::ipc::types::{AppState, Request};
use chrono::Utc;
use rusqlite::{params_from_iter, types::Value, Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashSet;
use uuid::Uuid;

const RECORD_MAX_ENTRIES: usize = 500;

/// A parsed batch entry: cleared back to ungraded, or a graded value
/// (zero is a real score, distinct from cleared).
enum ParsedScore {
    Clear,
    Graded(f64),
}

/// Raw form input per the batch contract: JSON null or an empty string
/// clears the cell; a number or numeric string grades it. Anything else is
/// a validation failure for the whole batch.
fn parse_raw_score(raw: &serde_json::Value) -> Result<ParsedScore, String> {
    let parsed = match raw {
        serde_json::Value::Null => ParsedScore::Clear,
        serde_json::Value::Number(n) => match n.as_f64() {
            Some(v) => ParsedScore::Graded(v),
            None => return Err("value is not a finite number".to_string()),
        },
        serde_json::Value::String(s) => {
            let t = s.trim();
            if t.is_empty() {
                ParsedScore::Clear
            } else {
                match t.parse::<f64>() {
                    Ok(v) if v.is_finite() => ParsedScore::Graded(v),
                    _ => return Err(format!("non-numeric score: {:?}", t)),
                }
            }
        }
        other => return Err(format!("unsupported score value: {}", other)),
    };
    if let ParsedScore::Graded(v) = &parsed {
        if *v < 0.0 {
            return Err(format!("negative scores are not allowed: {}", v));
        }
    }
    Ok(parsed)
}

fn section_item_ids(conn: &Connection, section_id: &str) -> Result<HashSet<String>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT i.id FROM assessment_items i
             JOIN criteria c ON c.id = i.criteria_id
             WHERE c.section_id = ?",
        )
        .map_err(HandlerErr::db_query)?;
    stmt.query_map([section_id], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<HashSet<_>, _>>())
        .map_err(HandlerErr::db_query)
}

fn handle_scores_record(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let enrollment_id = match req.params.get("enrollmentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing enrollmentId", None),
    };
    let Some(entries) = req.params.get("scores").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "missing scores object", None);
    };
    if entries.is_empty() {
        return err(&req.id, "bad_params", "scores must not be empty", None);
    }
    if entries.len() > RECORD_MAX_ENTRIES {
        return err(
            &req.id,
            "bad_params",
            "score batch is too large",
            Some(json!({ "entries": entries.len(), "max": RECORD_MAX_ENTRIES })),
        );
    }

    // Resolve the enrollment before anything else; the section drives the
    // ownership check.
    let enrollment_row: Option<(String, i64)> = match conn
        .query_row(
            "SELECT section_id, active FROM enrollments WHERE id = ?",
            [&enrollment_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((section_id, active)) = enrollment_row else {
        return err(
            &req.id,
            "validation_failed",
            "enrollment does not exist in the target course",
            Some(json!({ "enrollmentId": enrollment_id })),
        );
    };

    let section = match require_section_instructor(conn, actor, &section_id) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    if section.course_id != course_id {
        return err(
            &req.id,
            "validation_failed",
            "enrollment does not belong to the target course",
            Some(json!({ "enrollmentId": enrollment_id, "courseId": course_id })),
        );
    }
    if active == 0 {
        return err(
            &req.id,
            "validation_failed",
            "enrollment is not active",
            Some(json!({ "enrollmentId": enrollment_id })),
        );
    }

    // Whole-batch validation first: one bad value or foreign id rejects
    // everything, nothing is written.
    let mut parsed: Vec<(String, ParsedScore)> = Vec::with_capacity(entries.len());
    let mut bad_values: Vec<serde_json::Value> = Vec::new();
    for (item_id, raw) in entries {
        match parse_raw_score(raw) {
            Ok(p) => parsed.push((item_id.clone(), p)),
            Err(msg) => bad_values.push(json!({ "itemId": item_id, "error": msg })),
        }
    }
    if !bad_values.is_empty() {
        return err(
            &req.id,
            "validation_failed",
            "batch contains invalid score values; nothing was written",
            Some(json!({ "invalidValues": bad_values })),
        );
    }

    let known_items = match section_item_ids(conn, &section_id) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let unknown: Vec<&str> = parsed
        .iter()
        .map(|(id, _)| id.as_str())
        .filter(|id| !known_items.contains(*id))
        .collect();
    if !unknown.is_empty() {
        return err(
            &req.id,
            "validation_failed",
            "batch contains assessment items outside this section; nothing was written",
            Some(json!({ "invalidIds": unknown })),
        );
    }

    let updated_at = Utc::now().to_rfc3339();
    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_insert_failed", e.to_string(), None),
    };
    for (item_id, score) in &parsed {
        let (raw_value, status) = match score {
            ParsedScore::Clear => (None, "ungraded"),
            ParsedScore::Graded(v) => (Some(*v), "graded"),
        };
        let score_id = Uuid::new_v4().to_string();
        if let Err(e) = tx.execute(
            "INSERT INTO scores(id, enrollment_id, assessment_item_id, raw_value, status, updated_at)
             VALUES(?, ?, ?, ?, ?, ?)
             ON CONFLICT(enrollment_id, assessment_item_id) DO UPDATE SET
               raw_value = excluded.raw_value,
               status = excluded.status,
               updated_at = excluded.updated_at",
            (&score_id, &enrollment_id, item_id, raw_value, status, &updated_at),
        ) {
            return err(&req.id, "db_insert_failed", e.to_string(), None);
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({ "updated": parsed.len(), "updatedAt": updated_at }),
    )
}

fn handle_scores_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let actor = match require_actor(req) {
        Ok(a) => a,
        Err(e) => return e.response(&req.id),
    };

    let Some(enrollment_ids_raw) = req.params.get("enrollmentIds").and_then(|v| v.as_array())
    else {
        return err(&req.id, "bad_params", "missing enrollmentIds[]", None);
    };
    let Some(item_ids_raw) = req.params.get("itemIds").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing itemIds[]", None);
    };

    let mut enrollment_ids: Vec<String> = Vec::with_capacity(enrollment_ids_raw.len());
    for v in enrollment_ids_raw {
        match v.as_str() {
            Some(s) => enrollment_ids.push(s.to_string()),
            None => return err(&req.id, "bad_params", "enrollmentIds must be strings", None),
        }
    }
    let mut item_ids: Vec<String> = Vec::with_capacity(item_ids_raw.len());
    for v in item_ids_raw {
        match v.as_str() {
            Some(s) => item_ids.push(s.to_string()),
            None => return err(&req.id, "bad_params", "itemIds must be strings", None),
        }
    }

    for enrollment_id in &enrollment_ids {
        if let Err(e) = require_enrollment_read(conn, actor, enrollment_id) {
            return e.response(&req.id);
        }
    }

    if enrollment_ids.is_empty() || item_ids.is_empty() {
        return ok(&req.id, json!({ "scores": [] }));
    }

    let enroll_placeholders = std::iter::repeat("?")
        .take(enrollment_ids.len())
        .collect::<Vec<_>>()
        .join(",");
    let item_placeholders = std::iter::repeat("?")
        .take(item_ids.len())
        .collect::<Vec<_>>()
        .join(",");
    let sql = format!(
        "SELECT enrollment_id, assessment_item_id, raw_value, status, updated_at
         FROM scores
         WHERE enrollment_id IN ({}) AND assessment_item_id IN ({})",
        enroll_placeholders, item_placeholders
    );

    let mut bind_values: Vec<Value> = Vec::with_capacity(enrollment_ids.len() + item_ids.len());
    for id in &enrollment_ids {
        bind_values.push(Value::Text(id.clone()));
    }
    for id in &item_ids {
        bind_values.push(Value::Text(id.clone()));
    }

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map(params_from_iter(bind_values), |row| {
            Ok(json!({
                "enrollmentId": row.get::<_, String>(0)?,
                "assessmentItemId": row.get::<_, String>(1)?,
                "value": row.get::<_, Option<f64>>(2)?,
                "status": row.get::<_, String>(3)?,
                "updatedAt": row.get::<_, Option<String>>(4)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(scores) => ok(&req.id, json!({ "scores": scores })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "scores.record" => Some(handle_scores_record(state, req)),
        "scores.get" => Some(handle_scores_get(state, req)),
        _ => None,
    }
}
