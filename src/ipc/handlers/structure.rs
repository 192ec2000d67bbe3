use crate::calc::{self, Period, WEIGHT_SUM_TOLERANCE};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{require_actor, require_section_instructor, require_section_read, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn parse_period(raw: &str) -> Result<Period, HandlerErr> {
    Period::parse(raw).ok_or_else(|| {
        HandlerErr::with_details(
            "bad_params",
            "period must be one of: prelim, midterm, finals",
            json!({ "period": raw }),
        )
    })
}

/// Remaining weight room for a (section, period), excluding one criteria
/// when updating it in place.
fn period_weight_sum(
    conn: &Connection,
    section_id: &str,
    period: Period,
    exclude_criteria_id: Option<&str>,
) -> Result<f64, HandlerErr> {
    match exclude_criteria_id {
        Some(id) => conn
            .query_row(
                "SELECT COALESCE(SUM(percentage), 0) FROM criteria
                 WHERE section_id = ? AND period = ? AND id != ?",
                (section_id, period.as_str(), id),
                |r| r.get(0),
            )
            .map_err(HandlerErr::db_query),
        None => conn
            .query_row(
                "SELECT COALESCE(SUM(percentage), 0) FROM criteria
                 WHERE section_id = ? AND period = ?",
                (section_id, period.as_str()),
                |r| r.get(0),
            )
            .map_err(HandlerErr::db_query),
    }
}

fn check_weight_room(
    conn: &Connection,
    section_id: &str,
    period: Period,
    new_weight: f64,
    exclude_criteria_id: Option<&str>,
) -> Result<(), HandlerErr> {
    let current = period_weight_sum(conn, section_id, period, exclude_criteria_id)?;
    if current + new_weight > 100.0 + WEIGHT_SUM_TOLERANCE {
        return Err(HandlerErr::with_details(
            "validation_failed",
            "criteria weights for a period must not exceed 100",
            json!({
                "period": period.as_str(),
                "currentTotal": current,
                "requested": new_weight
            }),
        ));
    }
    Ok(())
}

#[derive(Debug, Clone)]
struct CriteriaMeta {
    section_id: String,
    period: Period,
}

fn criteria_meta(conn: &Connection, criteria_id: &str) -> Result<CriteriaMeta, HandlerErr> {
    let row: Option<(String, String)> = conn
        .query_row(
            "SELECT section_id, period FROM criteria WHERE id = ?",
            [criteria_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(HandlerErr::db_query)?;
    let Some((section_id, period_raw)) = row else {
        return Err(HandlerErr::with_details(
            "not_found",
            "criteria not found",
            json!({ "criteriaId": criteria_id }),
        ));
    };
    Ok(CriteriaMeta {
        section_id,
        period: parse_period(&period_raw)?,
    })
}

fn item_criteria_id(conn: &Connection, item_id: &str) -> Result<String, HandlerErr> {
    let row: Option<String> = conn
        .query_row(
            "SELECT criteria_id FROM assessment_items WHERE id = ?",
            [item_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db_query)?;
    row.ok_or_else(|| {
        HandlerErr::with_details(
            "not_found",
            "assessment item not found",
            json!({ "itemId": item_id }),
        )
    })
}

fn criteria_score_count(conn: &Connection, criteria_id: &str) -> Result<i64, HandlerErr> {
    conn.query_row(
        "SELECT COUNT(*) FROM scores sc
         JOIN assessment_items i ON i.id = sc.assessment_item_id
         WHERE i.criteria_id = ?",
        [criteria_id],
        |r| r.get(0),
    )
    .map_err(HandlerErr::db_query)
}

fn handle_structure_get(state: &mut AppState, req: &Request) -> serde_json::Value {
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

    let structure = match calc::load_section_structure(conn, &section_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, &e.code, e.message, e.details),
    };

    let empty: Vec<calc::CriteriaDef> = Vec::new();
    let periods: Vec<serde_json::Value> = Period::ALL
        .iter()
        .map(|&period| {
            let defs = structure.get(&period).unwrap_or(&empty);
            let weight_total: f64 = defs.iter().map(|c| c.weight).sum();
            json!({
                "period": period.as_str(),
                "weightTotal": weight_total,
                "criteria": defs.iter().map(|c| json!({
                    "id": c.id,
                    "name": c.name,
                    "percentage": c.weight,
                    "possible": c.possible(),
                    "items": c.items.iter().map(|i| json!({
                        "id": i.id,
                        "name": i.name,
                        "maxScore": i.max_score,
                    })).collect::<Vec<_>>(),
                })).collect::<Vec<_>>(),
            })
        })
        .collect();

    ok(&req.id, json!({ "sectionId": section_id, "periods": periods }))
}

fn handle_criteria_create(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    if let Err(e) = require_section_instructor(conn, actor, &section_id) {
        return e.response(&req.id);
    }

    let period = match req.params.get("period").and_then(|v| v.as_str()) {
        Some(raw) => match parse_period(raw) {
            Ok(p) => p,
            Err(e) => return e.response(&req.id),
        },
        None => return err(&req.id, "bad_params", "missing period", None),
    };
    let name = match req.params.get("name").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing name", None),
    };
    if name.is_empty() {
        return err(&req.id, "bad_params", "name must not be empty", None);
    }
    let percentage = match req.params.get("percentage").and_then(|v| v.as_f64()) {
        Some(v) if v > 0.0 && v <= 100.0 => v,
        Some(v) => {
            return err(
                &req.id,
                "bad_params",
                "percentage must be in (0, 100]",
                Some(json!({ "percentage": v })),
            )
        }
        None => return err(&req.id, "bad_params", "missing/invalid percentage", None),
    };

    if let Err(e) = check_weight_room(conn, &section_id, period, percentage, None) {
        return e.response(&req.id);
    }

    let sort_order: i64 = match conn.query_row(
        "SELECT COALESCE(MAX(sort_order), -1) + 1 FROM criteria
         WHERE section_id = ? AND period = ?",
        (&section_id, period.as_str()),
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let criteria_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO criteria(id, section_id, period, name, percentage, sort_order)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            &criteria_id,
            &section_id,
            period.as_str(),
            &name,
            percentage,
            sort_order,
        ),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "criteriaId": criteria_id }))
}

fn handle_criteria_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let actor = match require_actor(req) {
        Ok(a) => a,
        Err(e) => return e.response(&req.id),
    };
    let criteria_id = match req.params.get("criteriaId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing criteriaId", None),
    };
    let meta = match criteria_meta(conn, &criteria_id) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    if let Err(e) = require_section_instructor(conn, actor, &meta.section_id) {
        return e.response(&req.id);
    }

    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "missing patch object", None);
    };

    let name = match patch.get("name") {
        None => None,
        Some(v) => match v.as_str().map(|s| s.trim().to_string()) {
            Some(s) if !s.is_empty() => Some(s),
            _ => return err(&req.id, "bad_params", "patch.name must be a non-empty string", None),
        },
    };
    let percentage = match patch.get("percentage") {
        None => None,
        Some(v) => match v.as_f64() {
            Some(p) if p > 0.0 && p <= 100.0 => Some(p),
            _ => {
                return err(
                    &req.id,
                    "bad_params",
                    "patch.percentage must be in (0, 100]",
                    None,
                )
            }
        },
    };
    if name.is_none() && percentage.is_none() {
        return err(&req.id, "bad_params", "patch must change name or percentage", None);
    }

    if let Some(p) = percentage {
        if let Err(e) = check_weight_room(conn, &meta.section_id, meta.period, p, Some(&criteria_id))
        {
            return e.response(&req.id);
        }
        if let Err(e) = conn.execute(
            "UPDATE criteria SET percentage = ? WHERE id = ?",
            (p, &criteria_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    if let Some(n) = name {
        if let Err(e) = conn.execute(
            "UPDATE criteria SET name = ? WHERE id = ?",
            (&n, &criteria_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }

    ok(&req.id, json!({ "ok": true }))
}

fn handle_criteria_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let actor = match require_actor(req) {
        Ok(a) => a,
        Err(e) => return e.response(&req.id),
    };
    let criteria_id = match req.params.get("criteriaId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing criteriaId", None),
    };
    let meta = match criteria_meta(conn, &criteria_id) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    if let Err(e) = require_section_instructor(conn, actor, &meta.section_id) {
        return e.response(&req.id);
    }

    match criteria_score_count(conn, &criteria_id) {
        Ok(0) => {}
        Ok(n) => {
            return err(
                &req.id,
                "validation_failed",
                "criteria has recorded scores and cannot be deleted",
                Some(json!({ "scoreCount": n })),
            )
        }
        Err(e) => return e.response(&req.id),
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_update_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute(
        "DELETE FROM assessment_items WHERE criteria_id = ?",
        [&criteria_id],
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    if let Err(e) = tx.execute("DELETE FROM criteria WHERE id = ?", [&criteria_id]) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true }))
}

fn handle_items_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let actor = match require_actor(req) {
        Ok(a) => a,
        Err(e) => return e.response(&req.id),
    };
    let criteria_id = match req.params.get("criteriaId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing criteriaId", None),
    };
    let meta = match criteria_meta(conn, &criteria_id) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    if let Err(e) = require_section_instructor(conn, actor, &meta.section_id) {
        return e.response(&req.id);
    }

    let name = match req.params.get("name").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing name", None),
    };
    if name.is_empty() {
        return err(&req.id, "bad_params", "name must not be empty", None);
    }
    let max_score = match req.params.get("maxScore").and_then(|v| v.as_f64()) {
        Some(v) if v > 0.0 => v,
        Some(v) => {
            return err(
                &req.id,
                "bad_params",
                "maxScore must be > 0",
                Some(json!({ "maxScore": v })),
            )
        }
        None => return err(&req.id, "bad_params", "missing/invalid maxScore", None),
    };

    let sort_order: i64 = match conn.query_row(
        "SELECT COALESCE(MAX(sort_order), -1) + 1 FROM assessment_items WHERE criteria_id = ?",
        [&criteria_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let item_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO assessment_items(id, criteria_id, name, max_score, sort_order)
         VALUES(?, ?, ?, ?, ?)",
        (&item_id, &criteria_id, &name, max_score, sort_order),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "itemId": item_id }))
}

fn handle_items_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let actor = match require_actor(req) {
        Ok(a) => a,
        Err(e) => return e.response(&req.id),
    };
    let item_id = match req.params.get("itemId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing itemId", None),
    };
    let criteria_id = match item_criteria_id(conn, &item_id) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let meta = match criteria_meta(conn, &criteria_id) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    if let Err(e) = require_section_instructor(conn, actor, &meta.section_id) {
        return e.response(&req.id);
    }

    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "missing patch object", None);
    };

    // Name and max-score edits stay allowed once grades reference the item.
    let name = match patch.get("name") {
        None => None,
        Some(v) => match v.as_str().map(|s| s.trim().to_string()) {
            Some(s) if !s.is_empty() => Some(s),
            _ => return err(&req.id, "bad_params", "patch.name must be a non-empty string", None),
        },
    };
    let max_score = match patch.get("maxScore") {
        None => None,
        Some(v) => match v.as_f64() {
            Some(m) if m > 0.0 => Some(m),
            _ => return err(&req.id, "bad_params", "patch.maxScore must be > 0", None),
        },
    };
    if name.is_none() && max_score.is_none() {
        return err(&req.id, "bad_params", "patch must change name or maxScore", None);
    }

    if let Some(m) = max_score {
        if let Err(e) = conn.execute(
            "UPDATE assessment_items SET max_score = ? WHERE id = ?",
            (m, &item_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    if let Some(n) = name {
        if let Err(e) = conn.execute(
            "UPDATE assessment_items SET name = ? WHERE id = ?",
            (&n, &item_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }

    ok(&req.id, json!({ "ok": true }))
}

fn handle_items_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let actor = match require_actor(req) {
        Ok(a) => a,
        Err(e) => return e.response(&req.id),
    };
    let item_id = match req.params.get("itemId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing itemId", None),
    };
    let criteria_id = match item_criteria_id(conn, &item_id) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let meta = match criteria_meta(conn, &criteria_id) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    if let Err(e) = require_section_instructor(conn, actor, &meta.section_id) {
        return e.response(&req.id);
    }

    let score_count: i64 = match conn.query_row(
        "SELECT COUNT(*) FROM scores WHERE assessment_item_id = ?",
        [&item_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if score_count > 0 {
        return err(
            &req.id,
            "validation_failed",
            "assessment item has recorded scores and cannot be deleted",
            Some(json!({ "scoreCount": score_count })),
        );
    }

    if let Err(e) = conn.execute("DELETE FROM assessment_items WHERE id = ?", [&item_id]) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "structure.get" => Some(handle_structure_get(state, req)),
        "criteria.create" => Some(handle_criteria_create(state, req)),
        "criteria.update" => Some(handle_criteria_update(state, req)),
        "criteria.delete" => Some(handle_criteria_delete(state, req)),
        "items.create" => Some(handle_items_create(state, req)),
        "items.update" => Some(handle_items_update(state, req)),
        "items.delete" => Some(handle_items_delete(state, req)),
        _ => None,
    }
}
