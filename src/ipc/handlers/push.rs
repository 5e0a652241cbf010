use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::Utc;
use serde_json::json;

fn handle_push_register_token(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let principal_id = match req.params.get("principalId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing principalId", None),
    };
    let role = match req.params.get("role").and_then(|v| v.as_str()) {
        Some("teacher") => "teacher",
        Some("student") => "student",
        Some(other) => {
            return err(
                &req.id,
                "bad_params",
                format!("unknown role `{other}`; expected teacher|student"),
                None,
            )
        }
        None => return err(&req.id, "bad_params", "missing role", None),
    };
    let token = match req.params.get("token").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        Some(_) => return err(&req.id, "bad_params", "token must not be empty", None),
        None => return err(&req.id, "bad_params", "missing token", None),
    };

    // Latest registration wins; at most one token per (principal, role).
    if let Err(e) = conn.execute(
        "INSERT INTO push_tokens(principal_id, role, token, updated_at)
         VALUES(?, ?, ?, ?)
         ON CONFLICT(principal_id, role) DO UPDATE SET
           token = excluded.token,
           updated_at = excluded.updated_at",
        (&principal_id, role, &token, Utc::now().to_rfc3339()),
    ) {
        return err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "push_tokens" })),
        );
    }

    ok(&req.id, json!({ "principalId": principal_id, "role": role }))
}

fn handle_push_outbox(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let after_seq = req
        .params
        .get("afterSeq")
        .and_then(|v| v.as_i64())
        .unwrap_or(0);

    let mut stmt = match conn.prepare(
        "SELECT seq, token, title, body, queued_at
         FROM push_outbox
         WHERE seq > ?
         ORDER BY seq",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([after_seq], |row| {
            let seq: i64 = row.get(0)?;
            let token: String = row.get(1)?;
            let title: String = row.get(2)?;
            let body: String = row.get(3)?;
            let queued_at: String = row.get(4)?;
            Ok(json!({
                "seq": seq,
                "token": token,
                "title": title,
                "body": body,
                "queuedAt": queued_at
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(deliveries) => ok(&req.id, json!({ "deliveries": deliveries })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "push.registerToken" => Some(handle_push_register_token(state, req)),
        "push.outbox" => Some(handle_push_outbox(state, req)),
        _ => None,
    }
}
