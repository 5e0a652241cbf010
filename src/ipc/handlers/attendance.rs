use crate::attendance::{self, RecordInput};
use crate::auth::Principal;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::notify::OutboxPush;
use chrono::NaiveDate;
use serde_json::json;

fn handle_submit_batch(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let Some(principal_value) = req.params.get("principal") else {
        return err(&req.id, "unauthenticated", "missing principal", None);
    };
    let principal: Principal = match serde_json::from_value(principal_value.clone()) {
        Ok(p) => p,
        Err(e) => {
            return err(
                &req.id,
                "unauthenticated",
                format!("invalid principal: {e}"),
                None,
            )
        }
    };

    let Some(records_value) = req.params.get("records") else {
        return err(&req.id, "bad_params", "missing records", None);
    };
    let records: Vec<RecordInput> = match serde_json::from_value(records_value.clone()) {
        Ok(r) => r,
        Err(e) => {
            return err(
                &req.id,
                "bad_params",
                format!("invalid records: {e}"),
                None,
            )
        }
    };

    let push = OutboxPush::new(conn);
    match attendance::submit_batch(conn, &push, &principal, &records) {
        Ok(outcome) => ok(
            &req.id,
            json!({
                "message": "attendance recorded",
                "recorded": outcome.recorded,
                "absences": outcome.absences
            }),
        ),
        Err(e) => {
            log::warn!(
                "attendance batch from teacher {} rejected: {e}",
                principal.id
            );
            err(&req.id, e.code(), e.to_string(), None)
        }
    }
}

fn handle_list_for_date(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let class_id = match req.params.get("classId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing classId", None),
    };
    let date = match req.params.get("date").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing date", None),
    };
    if NaiveDate::parse_from_str(&date, "%Y-%m-%d").is_err() {
        return err(&req.id, "bad_params", "date must be YYYY-MM-DD", None);
    }

    let mut stmt = match conn.prepare(
        "SELECT ar.student_id, ar.status, ar.remarks, ar.marked_by, ar.marked_at
         FROM attendance_records ar
         JOIN students s ON s.id = ar.student_id
         WHERE s.class_id = ? AND ar.date = ?
         ORDER BY s.sort_order",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map((&class_id, &date), |row| {
            let student_id: String = row.get(0)?;
            let status: String = row.get(1)?;
            let remarks: Option<String> = row.get(2)?;
            let marked_by: String = row.get(3)?;
            let marked_at: String = row.get(4)?;
            Ok(json!({
                "studentId": student_id,
                "status": status,
                "remarks": remarks,
                "markedBy": marked_by,
                "markedAt": marked_at
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(records) => ok(&req.id, json!({ "date": date, "records": records })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "attendance.submitBatch" => Some(handle_submit_batch(state, req)),
        "attendance.listForDate" => Some(handle_list_for_date(state, req)),
        _ => None,
    }
}
