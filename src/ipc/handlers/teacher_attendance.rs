use crate::clock;
use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::helpers::{
    bad_params, get_optional_str, get_required_str, parse_actor, parse_date_param, require_admin,
    resolve_now,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

use super::attendance::{parse_status, STUDENT_STATUSES};

/// Teacher day marks share the student status vocabulary but none of the
/// lock/freeze machinery: this is an admin-only write path that feeds the
/// substitution resolver.
fn mark_teachers(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let actor = parse_actor(params)?;
    require_admin(&actor)?;
    let date = parse_date_param(params, "date")?;
    let now_s = resolve_now(params)?.to_rfc3339();
    let Some(raw) = params.get("records").and_then(|v| v.as_array()) else {
        return Err(bad_params("missing records"));
    };
    if raw.is_empty() {
        return Err(bad_params("records must not be empty"));
    }

    let date_s = clock::format_date(date);
    let tx = conn.unchecked_transaction()?;
    for entry in raw {
        let teacher_id = get_required_str(entry, "teacherId")?;
        let status_raw = get_required_str(entry, "status")?;
        let Some(status) = parse_status(&status_raw) else {
            return Err(bad_params(format!(
                "status must be one of {}",
                STUDENT_STATUSES.join("|")
            )));
        };
        let reason = get_optional_str(entry, "reason");

        let exists: Option<i64> = tx
            .query_row("SELECT 1 FROM teachers WHERE id = ?", [&teacher_id], |r| {
                r.get(0)
            })
            .optional()?;
        if exists.is_none() {
            return Err(HandlerErr {
                code: "not_found",
                message: "teacher not found".to_string(),
                details: Some(json!({ "teacherId": teacher_id })),
            });
        }

        tx.execute(
            "INSERT INTO teacher_attendance(id, date, teacher_id, status, marked_by, marked_at)
             VALUES(?, ?, ?, ?, ?, ?)
             ON CONFLICT(date, teacher_id) DO UPDATE SET
               status = excluded.status,
               marked_by = excluded.marked_by,
               marked_at = excluded.marked_at",
            (
                Uuid::new_v4().to_string(),
                &date_s,
                &teacher_id,
                status,
                &actor.id,
                &now_s,
            ),
        )?;
        tx.execute(
            "INSERT INTO teacher_attendance_history(id, date, teacher_id, status, changed_by, reason, timestamp)
             VALUES(?, ?, ?, ?, ?, ?, ?)",
            (
                Uuid::new_v4().to_string(),
                &date_s,
                &teacher_id,
                status,
                &actor.id,
                reason.as_deref(),
                &now_s,
            ),
        )?;
    }
    tx.commit().map_err(|e| HandlerErr {
        code: "db_commit_failed",
        message: e.to_string(),
        details: None,
    })?;

    Ok(json!({ "date": date_s, "marked": raw.len() }))
}

fn query_teachers(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let mut sql = String::from(
        "SELECT a.date, a.teacher_id, t.name, a.status, a.marked_by, a.marked_at
         FROM teacher_attendance a
         JOIN teachers t ON t.id = a.teacher_id
         WHERE 1 = 1",
    );
    let mut args: Vec<String> = Vec::new();
    if let Some(raw) = get_optional_str(params, "date") {
        let Some(date) = clock::parse_date(&raw) else {
            return Err(bad_params("date must be YYYY-MM-DD"));
        };
        sql.push_str(" AND a.date = ?");
        args.push(clock::format_date(date));
    } else if let Some(raw) = get_optional_str(params, "month") {
        let Some((first, last)) = clock::month_range(&raw) else {
            return Err(bad_params("month must be YYYY-MM"));
        };
        sql.push_str(" AND a.date >= ? AND a.date <= ?");
        args.push(clock::format_date(first));
        args.push(clock::format_date(last));
    }
    if let Some(v) = get_optional_str(params, "teacherId") {
        sql.push_str(" AND a.teacher_id = ?");
        args.push(v);
    }
    sql.push_str(" ORDER BY a.date, t.name");

    let mut stmt = conn.prepare(&sql)?;
    let records = stmt
        .query_map(rusqlite::params_from_iter(args.iter()), |r| {
            Ok(json!({
                "date": r.get::<_, String>(0)?,
                "teacherId": r.get::<_, String>(1)?,
                "teacherName": r.get::<_, String>(2)?,
                "status": r.get::<_, String>(3)?,
                "markedBy": r.get::<_, String>(4)?,
                "markedAt": r.get::<_, String>(5)?
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "records": records }))
}

fn dispatch(
    conn: &Connection,
    method: &str,
    params: &serde_json::Value,
) -> Option<Result<serde_json::Value, HandlerErr>> {
    match method {
        "teacherAttendance.mark" => Some(mark_teachers(conn, params)),
        "teacherAttendance.query" => Some(query_teachers(conn, params)),
        _ => None,
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    if !req.method.starts_with("teacherAttendance.") {
        return None;
    }
    let Some(conn) = state.db.as_ref() else {
        return Some(err(&req.id, "no_workspace", "select a workspace first", None));
    };
    dispatch(conn, req.method.as_str(), &req.params).map(|r| match r {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    })
}
