use crate::clock;
use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::helpers::{
    bad_params, get_optional_str, get_required_str, parse_actor, parse_date_param, require_admin,
    require_row, resolve_now, Actor,
};
use crate::ipc::types::{AppState, Request};
use crate::ledger::{self, WriteDenied};
use crate::window::{self, WindowCandidate, WindowState};
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

pub const STUDENT_STATUSES: [&str; 5] = ["present", "absent", "leave", "late", "not_marked"];

pub fn parse_status(raw: &str) -> Option<&'static str> {
    STUDENT_STATUSES.iter().find(|s| **s == raw).copied()
}

struct MarkInput {
    student_id: String,
    status: &'static str,
    reason: Option<String>,
}

fn parse_mark_records(params: &serde_json::Value) -> Result<Vec<MarkInput>, HandlerErr> {
    let Some(raw) = params.get("records").and_then(|v| v.as_array()) else {
        return Err(bad_params("missing records"));
    };
    if raw.is_empty() {
        return Err(bad_params("records must not be empty"));
    }
    let mut out = Vec::with_capacity(raw.len());
    for entry in raw {
        let student_id = get_required_str(entry, "studentId")?;
        let status_raw = get_required_str(entry, "status")?;
        let Some(status) = parse_status(&status_raw) else {
            return Err(bad_params(format!(
                "status must be one of {}",
                STUDENT_STATUSES.join("|")
            )));
        };
        let reason = get_optional_str(entry, "reason");
        out.push(MarkInput {
            student_id,
            status,
            reason,
        });
    }
    Ok(out)
}

fn read_day_lock(
    conn: &Connection,
    date: &str,
    class_id: &str,
    section_id: &str,
) -> Result<Option<(bool, bool)>, HandlerErr> {
    conn.query_row(
        "SELECT marked, frozen FROM attendance_day_locks
         WHERE date = ? AND class_id = ? AND section_id = ?",
        (date, class_id, section_id),
        |r| Ok((r.get::<_, i64>(0)? != 0, r.get::<_, i64>(1)? != 0)),
    )
    .optional()
    .map_err(HandlerErr::from)
}

fn locked_rejection(denied: WriteDenied, date: &str) -> HandlerErr {
    match denied {
        WriteDenied::Frozen => HandlerErr {
            code: "locked",
            message: format!(
                "attendance for {} is frozen; an admin must unfreeze it first",
                date
            ),
            details: Some(json!({ "policy": "frozen" })),
        },
        WriteDenied::AlreadyMarked => HandlerErr {
            code: "locked",
            message: format!(
                "attendance for {} is already marked; contact an admin for corrections",
                date
            ),
            details: Some(json!({ "policy": "already_marked" })),
        },
    }
}

/// Teacher access ladder for a (date, class, section) write: an approved
/// covering substitution grants unconditionally; otherwise the teacher's own
/// periods for that weekday go through the time window gate.
fn check_teacher_access(
    conn: &Connection,
    actor: &Actor,
    date: NaiveDate,
    class_id: &str,
    section_id: &str,
    now: DateTime<Utc>,
) -> Result<(), HandlerErr> {
    let date_s = clock::format_date(date);
    let covering: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM substitutions
             WHERE date = ? AND class_id = ? AND section_id = ? AND substitute_teacher_id = ?",
            (&date_s, class_id, section_id, &actor.id),
            |r| r.get(0),
        )
        .optional()?;
    if covering.is_some() {
        // A cover teacher may mark whenever; no window check.
        return Ok(());
    }

    let weekday = clock::weekday_code(date.weekday());
    let mut stmt = conn.prepare(
        "SELECT a.id, ts.start_time, ts.end_time
         FROM teacher_assignments a
         JOIN time_slots ts ON ts.id = a.time_slot_id
         WHERE a.teacher_id = ? AND a.class_id = ? AND a.section_id = ?
           AND a.active = 1 AND ts.weekday = ?",
    )?;
    let rows = stmt
        .query_map((&actor.id, class_id, section_id, weekday), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut candidates = Vec::with_capacity(rows.len());
    for (assignment_id, start_raw, end_raw) in rows {
        let (Some(start), Some(end)) = (clock::parse_hhmm(&start_raw), clock::parse_hhmm(&end_raw))
        else {
            return Err(HandlerErr {
                code: "db_query_failed",
                message: format!("malformed slot times on assignment {}", assignment_id),
                details: None,
            });
        };
        candidates.push(WindowCandidate {
            assignment_id,
            start,
            end,
        });
    }

    let Some(decision) = window::resolve_window(now.time(), &candidates) else {
        return Err(HandlerErr {
            code: "not_authorized",
            message: "you have no assignment for this class/section today".to_string(),
            details: None,
        });
    };
    match decision.state {
        WindowState::Open => Ok(()),
        WindowState::TooEarly => Err(HandlerErr {
            code: "out_of_window",
            message: format!(
                "attendance window {} has not opened yet",
                decision.window_label()
            ),
            details: Some(json!({ "state": "too_early", "window": decision.window_label() })),
        }),
        WindowState::Closed => Err(HandlerErr {
            code: "out_of_window",
            message: format!("attendance window {} has closed", decision.window_label()),
            details: Some(json!({ "state": "closed", "window": decision.window_label() })),
        }),
    }
}

/// Take (or verify) the day lock inside the marking transaction. For a
/// non-privileged writer the claiming write itself is the check: it only
/// lands when the day is neither marked nor frozen, which closes the
/// check-then-act gap against a concurrent first marker. Returns the day's
/// frozen flag so records can mirror it.
fn acquire_day_lock(
    tx: &rusqlite::Transaction,
    privileged: bool,
    date: &str,
    class_id: &str,
    section_id: &str,
    actor_id: &str,
    now: &str,
) -> Result<bool, HandlerErr> {
    if privileged {
        tx.execute(
            "INSERT INTO attendance_day_locks(date, class_id, section_id, marked, frozen, locked_by, locked_at)
             VALUES(?, ?, ?, 1, 0, ?, ?)
             ON CONFLICT(date, class_id, section_id) DO UPDATE SET marked = 1",
            (date, class_id, section_id, actor_id, now),
        )?;
        let frozen: i64 = tx.query_row(
            "SELECT frozen FROM attendance_day_locks
             WHERE date = ? AND class_id = ? AND section_id = ?",
            (date, class_id, section_id),
            |r| r.get(0),
        )?;
        return Ok(frozen != 0);
    }

    let changes = tx.execute(
        "INSERT INTO attendance_day_locks(date, class_id, section_id, marked, frozen, locked_by, locked_at)
         VALUES(?, ?, ?, 1, 0, ?, ?)
         ON CONFLICT(date, class_id, section_id) DO UPDATE SET
           marked = 1, locked_by = excluded.locked_by, locked_at = excluded.locked_at
         WHERE attendance_day_locks.marked = 0 AND attendance_day_locks.frozen = 0",
        (date, class_id, section_id, actor_id, now),
    )?;
    if changes == 0 {
        // Lost to an earlier marker (or a freeze); report the right policy.
        let lock = tx
            .query_row(
                "SELECT marked, frozen FROM attendance_day_locks
                 WHERE date = ? AND class_id = ? AND section_id = ?",
                (date, class_id, section_id),
                |r| Ok((r.get::<_, i64>(0)? != 0, r.get::<_, i64>(1)? != 0)),
            )
            .optional()?;
        let denied = ledger::gate_write(ledger::day_state(lock), false)
            .err()
            .unwrap_or(WriteDenied::AlreadyMarked);
        return Err(locked_rejection(denied, date));
    }
    Ok(false)
}

fn mark_daily(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let actor = parse_actor(params)?;
    let date = parse_date_param(params, "date")?;
    let class_id = get_required_str(params, "classId")?;
    let section_id = get_required_str(params, "sectionId")?;
    let now = resolve_now(params)?;
    let records = parse_mark_records(params)?;

    require_row(conn, "classes", &class_id, "class")?;
    require_row(conn, "sections", &section_id, "section")?;

    let date_s = clock::format_date(date);
    let privileged = actor.is_privileged();

    // Advisory gate for a precise rejection before any work; the lock insert
    // below re-checks authoritatively.
    let state = ledger::day_state(read_day_lock(conn, &date_s, &class_id, &section_id)?);
    if let Err(denied) = ledger::gate_write(state, privileged) {
        return Err(locked_rejection(denied, &date_s));
    }

    if !privileged {
        check_teacher_access(conn, &actor, date, &class_id, &section_id, now)?;
    }

    let now_s = now.to_rfc3339();
    let tx = conn.unchecked_transaction()?;
    let frozen = acquire_day_lock(
        &tx, privileged, &date_s, &class_id, &section_id, &actor.id, &now_s,
    )?;

    for rec in &records {
        let belongs: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM students WHERE id = ? AND class_id = ? AND section_id = ?",
                (&rec.student_id, &class_id, &section_id),
                |r| r.get(0),
            )
            .optional()?;
        if belongs.is_none() {
            // Dropping the transaction rolls the whole mark back.
            return Err(HandlerErr {
                code: "not_found",
                message: "student not found in this class/section".to_string(),
                details: Some(json!({ "studentId": rec.student_id })),
            });
        }

        tx.execute(
            "INSERT INTO attendance_records(
                id, date, student_id, class_id, section_id, status,
                marked_by, marked_at, is_frozen)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(date, student_id) DO UPDATE SET
               class_id = excluded.class_id,
               section_id = excluded.section_id,
               status = excluded.status,
               marked_by = excluded.marked_by,
               marked_at = excluded.marked_at",
            (
                Uuid::new_v4().to_string(),
                &date_s,
                &rec.student_id,
                &class_id,
                &section_id,
                rec.status,
                &actor.id,
                &now_s,
                frozen as i64,
            ),
        )?;
        // History is append-only; corrections add entries, never rewrite.
        tx.execute(
            "INSERT INTO attendance_history(id, date, student_id, status, changed_by, reason, timestamp)
             VALUES(?, ?, ?, ?, ?, ?, ?)",
            (
                Uuid::new_v4().to_string(),
                &date_s,
                &rec.student_id,
                rec.status,
                &actor.id,
                rec.reason.as_deref(),
                &now_s,
            ),
        )?;
    }
    tx.commit().map_err(|e| HandlerErr {
        code: "db_commit_failed",
        message: e.to_string(),
        details: None,
    })?;

    Ok(json!({
        "date": date_s,
        "classId": class_id,
        "sectionId": section_id,
        "marked": records.len()
    }))
}

fn freeze_day(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let actor = parse_actor(params)?;
    require_admin(&actor)?;
    let date = parse_date_param(params, "date")?;
    let class_id = get_required_str(params, "classId")?;
    let section_id = get_required_str(params, "sectionId")?;
    let frozen = match get_required_str(params, "action")?.as_str() {
        "freeze" => true,
        "unfreeze" => false,
        _ => return Err(bad_params("action must be freeze or unfreeze")),
    };
    require_row(conn, "classes", &class_id, "class")?;
    require_row(conn, "sections", &section_id, "section")?;

    let date_s = clock::format_date(date);
    let now_s = resolve_now(params)?.to_rfc3339();
    let tx = conn.unchecked_transaction()?;
    // Unconditional: works whether or not the day has been marked. The
    // marked flag is untouched so unfreezing a marked day restores Locked,
    // and unfreezing an unmarked day restores Open.
    tx.execute(
        "INSERT INTO attendance_day_locks(date, class_id, section_id, marked, frozen, locked_by, locked_at)
         VALUES(?, ?, ?, 0, ?, ?, ?)
         ON CONFLICT(date, class_id, section_id) DO UPDATE SET frozen = excluded.frozen",
        (&date_s, &class_id, &section_id, frozen as i64, &actor.id, &now_s),
    )?;
    tx.execute(
        "UPDATE attendance_records SET is_frozen = ?
         WHERE date = ? AND class_id = ? AND section_id = ?",
        (frozen as i64, &date_s, &class_id, &section_id),
    )?;
    tx.commit().map_err(|e| HandlerErr {
        code: "db_commit_failed",
        message: e.to_string(),
        details: None,
    })?;

    Ok(json!({
        "date": date_s,
        "classId": class_id,
        "sectionId": section_id,
        "frozen": frozen
    }))
}

fn query_attendance(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let mut sql = String::from(
        "SELECT r.date, r.student_id, st.name, r.class_id, r.section_id, r.status,
                r.marked_by, r.marked_at, r.is_frozen
         FROM attendance_records r
         JOIN students st ON st.id = r.student_id
         WHERE 1 = 1",
    );
    let mut args: Vec<String> = Vec::new();

    if let Some(raw) = get_optional_str(params, "date") {
        let Some(date) = clock::parse_date(&raw) else {
            return Err(bad_params("date must be YYYY-MM-DD"));
        };
        sql.push_str(" AND r.date = ?");
        args.push(clock::format_date(date));
    } else if let Some(raw) = get_optional_str(params, "month") {
        // Month filters expand to the inclusive calendar-month range.
        let Some((first, last)) = clock::month_range(&raw) else {
            return Err(bad_params("month must be YYYY-MM"));
        };
        sql.push_str(" AND r.date >= ? AND r.date <= ?");
        args.push(clock::format_date(first));
        args.push(clock::format_date(last));
    }
    if let Some(v) = get_optional_str(params, "classId") {
        sql.push_str(" AND r.class_id = ?");
        args.push(v);
    }
    if let Some(v) = get_optional_str(params, "sectionId") {
        sql.push_str(" AND r.section_id = ?");
        args.push(v);
    }
    if let Some(v) = get_optional_str(params, "studentId") {
        sql.push_str(" AND r.student_id = ?");
        args.push(v);
    }
    sql.push_str(" ORDER BY r.date, st.name, r.student_id");

    let include_history = params
        .get("includeHistory")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let mut stmt = conn.prepare(&sql)?;
    let rows: Vec<(String, String, serde_json::Value)> = stmt
        .query_map(rusqlite::params_from_iter(args.iter()), |r| {
            let date: String = r.get(0)?;
            let student_id: String = r.get(1)?;
            let row = json!({
                "date": date,
                "studentId": student_id,
                "studentName": r.get::<_, String>(2)?,
                "classId": r.get::<_, String>(3)?,
                "sectionId": r.get::<_, String>(4)?,
                "status": r.get::<_, String>(5)?,
                "markedBy": r.get::<_, String>(6)?,
                "markedAt": r.get::<_, String>(7)?,
                "isFrozen": r.get::<_, i64>(8)? != 0
            });
            Ok((date, student_id, row))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut records = Vec::with_capacity(rows.len());
    for (date, student_id, mut row) in rows {
        if include_history {
            let mut hstmt = conn.prepare(
                "SELECT status, changed_by, reason, timestamp
                 FROM attendance_history
                 WHERE date = ? AND student_id = ?
                 ORDER BY timestamp, id",
            )?;
            let history = hstmt
                .query_map((&date, &student_id), |r| {
                    Ok(json!({
                        "status": r.get::<_, String>(0)?,
                        "changedBy": r.get::<_, String>(1)?,
                        "reason": r.get::<_, Option<String>>(2)?,
                        "timestamp": r.get::<_, String>(3)?
                    }))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            row["history"] = json!(history);
        }
        records.push(row);
    }
    Ok(json!({ "records": records }))
}

fn dispatch(
    conn: &Connection,
    method: &str,
    params: &serde_json::Value,
) -> Option<Result<serde_json::Value, HandlerErr>> {
    match method {
        "attendance.mark" => Some(mark_daily(conn, params)),
        "attendance.freeze" => Some(freeze_day(conn, params)),
        "attendance.query" => Some(query_attendance(conn, params)),
        _ => None,
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    if !req.method.starts_with("attendance.") {
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
