use crate::calc::{self, Period};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{require_actor, require_enrollment_read, require_section_read};
use crate::ipc::types::{AppState, Request};
use serde_json::json;

fn handle_results_period(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let actor = match require_actor(req) {
        Ok(a) => a,
        Err(e) => return e.response(&req.id),
    };
    let enrollment_id = match req.params.get("enrollmentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing enrollmentId", None),
    };
    let period = match req.params.get("period").and_then(|v| v.as_str()) {
        Some(raw) => match Period::parse(raw) {
            Some(p) => p,
            None => {
                return err(
                    &req.id,
                    "bad_params",
                    "period must be one of: prelim, midterm, finals",
                    Some(json!({ "period": raw })),
                )
            }
        },
        None => return err(&req.id, "bad_params", "missing period", None),
    };

    let meta = match require_enrollment_read(conn, actor, &enrollment_id) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let ctx = calc::CalcContext {
        conn,
        section_id: &meta.section.id,
    };
    let result = match calc::compute_period_result(&ctx, &enrollment_id, period) {
        Ok(v) => v,
        Err(e) => return err(&req.id, &e.code, e.message, e.details),
    };

    // Period-only views derive LEE and the print remark from the period
    // percentage alone; an incomplete period shows neither.
    let (lee, remark) = match result.percentage {
        Some(p) => {
            let lee = calc::resolve_lee(p);
            (Some(lee), Some(calc::remark_for_lee(lee)))
        }
        None => (None, None),
    };

    ok(
        &req.id,
        json!({
            "enrollmentId": enrollment_id,
            "period": period,
            "percentage": result.percentage,
            "complete": result.complete,
            "lee": lee,
            "remark": remark,
        }),
    )
}

fn handle_results_final(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let actor = match require_actor(req) {
        Ok(a) => a,
        Err(e) => return e.response(&req.id),
    };
    let enrollment_id = match req.params.get("enrollmentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing enrollmentId", None),
    };

    let meta = match require_enrollment_read(conn, actor, &enrollment_id) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let ctx = calc::CalcContext {
        conn,
        section_id: &meta.section.id,
    };
    let fin = match calc::compute_final_result(&ctx, &enrollment_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, &e.code, e.message, e.details),
    };

    let mut result = match serde_json::to_value(&fin) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Some(obj) = result.as_object_mut() {
        obj.insert("enrollmentId".into(), json!(enrollment_id));
    }

    ok(&req.id, result)
}

fn handle_results_sheet(state: &mut AppState, req: &Request) -> serde_json::Value {
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

    let ctx = calc::CalcContext {
        conn,
        section_id: &section_id,
    };
    let sheet = match calc::compute_section_sheet(&ctx) {
        Ok(v) => v,
        Err(e) => return err(&req.id, &e.code, e.message, e.details),
    };

    match serde_json::to_value(&sheet) {
        Ok(v) => ok(&req.id, v),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "results.period" => Some(handle_results_period(state, req)),
        "results.final" => Some(handle_results_final(state, req)),
        "results.sheet" => Some(handle_results_sheet(state, req)),
        _ => None,
    }
}
