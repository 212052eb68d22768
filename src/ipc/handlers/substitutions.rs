use crate::availability::{self, Candidate};
use crate::clock;
use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::helpers::{
    get_required_str, is_constraint_violation, parse_actor, parse_date_param, require_admin,
    require_row, resolve_now,
};
use crate::ipc::types::{AppState, Request};
use chrono::Datelike;
use rusqlite::Connection;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

fn absent_teacher_ids(conn: &Connection, date: &str) -> Result<HashSet<String>, HandlerErr> {
    let mut stmt = conn.prepare(
        "SELECT teacher_id FROM teacher_attendance
         WHERE date = ? AND status IN ('absent', 'leave')",
    )?;
    let ids = stmt
        .query_map([date], |r| r.get::<_, String>(0))?
        .collect::<Result<HashSet<_>, _>>()?;
    Ok(ids)
}

fn teachers_assigned_at_slot(conn: &Connection, slot_id: &str) -> Result<HashSet<String>, HandlerErr> {
    let mut stmt = conn.prepare(
        "SELECT teacher_id FROM teacher_assignments
         WHERE time_slot_id = ? AND active = 1",
    )?;
    let ids = stmt
        .query_map([slot_id], |r| r.get::<_, String>(0))?
        .collect::<Result<HashSet<_>, _>>()?;
    Ok(ids)
}

fn teachers_substituting_at(
    conn: &Connection,
    date: &str,
    slot_id: &str,
) -> Result<HashSet<String>, HandlerErr> {
    let mut stmt = conn.prepare(
        "SELECT substitute_teacher_id FROM substitutions
         WHERE date = ? AND time_slot_id = ?",
    )?;
    let ids = stmt
        .query_map((date, slot_id), |r| r.get::<_, String>(0))?
        .collect::<Result<HashSet<_>, _>>()?;
    Ok(ids)
}

/// Which periods need cover on a date, derived from the absence feed and the
/// standing timetable, cross-referenced against existing substitutions.
fn needed_substitutions(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let date = parse_date_param(params, "date")?;
    let date_s = clock::format_date(date);

    let absent = absent_teacher_ids(conn, &date_s)?;
    if absent.is_empty() {
        return Ok(json!({ "date": date_s, "needed": [] }));
    }
    let weekday = clock::weekday_code(date.weekday());

    // Existing cover, keyed by the period.
    let mut covered: HashMap<(String, String, String), (String, String, String)> = HashMap::new();
    {
        let mut stmt = conn.prepare(
            "SELECT s.class_id, s.section_id, s.time_slot_id, s.id,
                    s.substitute_teacher_id, t.name
             FROM substitutions s
             JOIN teachers t ON t.id = s.substitute_teacher_id
             WHERE s.date = ?",
        )?;
        let rows = stmt.query_map([&date_s], |r| {
            Ok((
                (
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                ),
                (
                    r.get::<_, String>(3)?,
                    r.get::<_, String>(4)?,
                    r.get::<_, String>(5)?,
                ),
            ))
        })?;
        for row in rows {
            let (key, val) = row?;
            covered.insert(key, val);
        }
    }

    let mut stmt = conn.prepare(
        "SELECT a.id, a.teacher_id, t.name, a.class_id, c.name, a.section_id, s.name,
                a.subject_id, sub.name, a.time_slot_id, ts.start_time, ts.end_time, ts.label
         FROM teacher_assignments a
         JOIN teachers t ON t.id = a.teacher_id
         JOIN classes c ON c.id = a.class_id
         JOIN sections s ON s.id = a.section_id
         JOIN subjects sub ON sub.id = a.subject_id
         JOIN time_slots ts ON ts.id = a.time_slot_id
         WHERE a.active = 1 AND ts.weekday = ?
         ORDER BY ts.start_time, c.name, s.name",
    )?;
    let rows: Vec<serde_json::Value> = stmt
        .query_map([weekday], |r| {
            let teacher_id: String = r.get(1)?;
            let class_id: String = r.get(3)?;
            let section_id: String = r.get(5)?;
            let slot_id: String = r.get(9)?;
            Ok((teacher_id, class_id, section_id, slot_id, json!({
                "assignmentId": r.get::<_, String>(0)?,
                "teacherName": r.get::<_, String>(2)?,
                "className": r.get::<_, String>(4)?,
                "sectionName": r.get::<_, String>(6)?,
                "subjectId": r.get::<_, String>(7)?,
                "subjectName": r.get::<_, String>(8)?,
                "startTime": r.get::<_, String>(10)?,
                "endTime": r.get::<_, String>(11)?,
                "label": r.get::<_, String>(12)?
            })))
        })?
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .filter(|(teacher_id, _, _, _, _)| absent.contains(teacher_id))
        .map(|(teacher_id, class_id, section_id, slot_id, mut row)| {
            let cover = covered
                .get(&(class_id.clone(), section_id.clone(), slot_id.clone()))
                .cloned();
            row["originalTeacherId"] = json!(teacher_id);
            row["classId"] = json!(class_id);
            row["sectionId"] = json!(section_id);
            row["timeSlotId"] = json!(slot_id);
            match cover {
                Some((sub_id, sub_teacher, sub_name)) => {
                    row["status"] = json!("covered");
                    row["substitutionId"] = json!(sub_id);
                    row["coveringTeacherId"] = json!(sub_teacher);
                    row["coveringTeacherName"] = json!(sub_name);
                }
                None => {
                    row["status"] = json!("pending");
                }
            }
            row
        })
        .collect();

    Ok(json!({ "date": date_s, "needed": rows }))
}

fn available_teachers(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let date = parse_date_param(params, "date")?;
    let slot_id = get_required_str(params, "timeSlotId")?;
    require_row(conn, "time_slots", &slot_id, "time slot")?;
    let date_s = clock::format_date(date);

    let mut stmt = conn.prepare("SELECT id, name FROM teachers WHERE active = 1")?;
    let roster = stmt
        .query_map([], |r| {
            Ok(Candidate {
                id: r.get(0)?,
                name: r.get(1)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let absent = absent_teacher_ids(conn, &date_s)?;
    let busy_assigned = teachers_assigned_at_slot(conn, &slot_id)?;
    let busy_substituting = teachers_substituting_at(conn, &date_s, &slot_id)?;

    let free = availability::free_pool(roster, &absent, &busy_assigned, &busy_substituting);
    let teachers: Vec<serde_json::Value> = free
        .into_iter()
        .map(|t| json!({ "id": t.id, "name": t.name }))
        .collect();
    Ok(json!({ "date": date_s, "timeSlotId": slot_id, "teachers": teachers }))
}

fn assign_substitute(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let actor = parse_actor(params)?;
    require_admin(&actor)?;
    let date = parse_date_param(params, "date")?;
    let class_id = get_required_str(params, "classId")?;
    let section_id = get_required_str(params, "sectionId")?;
    let subject_id = get_required_str(params, "subjectId")?;
    let slot_id = get_required_str(params, "timeSlotId")?;
    let original_id = get_required_str(params, "originalTeacherId")?;
    let substitute_id = get_required_str(params, "substituteTeacherId")?;

    require_row(conn, "classes", &class_id, "class")?;
    require_row(conn, "sections", &section_id, "section")?;
    require_row(conn, "subjects", &subject_id, "subject")?;
    require_row(conn, "time_slots", &slot_id, "time slot")?;
    require_row(conn, "teachers", &original_id, "original teacher")?;
    require_row(conn, "teachers", &substitute_id, "substitute teacher")?;

    let date_s = clock::format_date(date);

    // The write re-validates the substitute's freedom; callers cannot create
    // a double-booking by skipping availableTeachers.
    if absent_teacher_ids(conn, &date_s)?.contains(&substitute_id) {
        return Err(HandlerErr {
            code: "conflict",
            message: "substitute is absent or on leave that date".to_string(),
            details: Some(json!({ "reason": "substitute_absent" })),
        });
    }
    if teachers_assigned_at_slot(conn, &slot_id)?.contains(&substitute_id) {
        return Err(HandlerErr {
            code: "conflict",
            message: "substitute already has a regular assignment at this slot".to_string(),
            details: Some(json!({ "reason": "substitute_busy" })),
        });
    }
    if teachers_substituting_at(conn, &date_s, &slot_id)?.contains(&substitute_id) {
        return Err(HandlerErr {
            code: "conflict",
            message: "substitute is already covering another period at this slot".to_string(),
            details: Some(json!({ "reason": "substitute_already_substituting" })),
        });
    }

    let substitution_id = Uuid::new_v4().to_string();
    let now_s = resolve_now(params)?.to_rfc3339();
    let inserted = conn.execute(
        "INSERT INTO substitutions(
            id, date, class_id, section_id, subject_id, time_slot_id,
            original_teacher_id, substitute_teacher_id, assigned_by, assigned_at, status)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'assigned')",
        (
            &substitution_id,
            &date_s,
            &class_id,
            &section_id,
            &subject_id,
            &slot_id,
            &original_id,
            &substitute_id,
            &actor.id,
            &now_s,
        ),
    );
    match inserted {
        Ok(_) => Ok(json!({ "substitutionId": substitution_id })),
        Err(e) if is_constraint_violation(&e) => Err(HandlerErr {
            code: "conflict",
            message: "a substitution already exists for this period".to_string(),
            details: Some(json!({ "reason": "duplicate" })),
        }),
        Err(e) => Err(HandlerErr {
            code: "db_insert_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "substitutions" })),
        }),
    }
}

fn cancel_substitution(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let actor = parse_actor(params)?;
    require_admin(&actor)?;
    let substitution_id = get_required_str(params, "substitutionId")?;
    // Hard delete: the period reverts to pending on the next needed() call.
    let deleted = conn.execute("DELETE FROM substitutions WHERE id = ?", [&substitution_id])?;
    if deleted == 0 {
        return Err(HandlerErr {
            code: "not_found",
            message: "substitution not found".to_string(),
            details: Some(json!({ "id": substitution_id })),
        });
    }
    Ok(json!({ "substitutionId": substitution_id, "cancelled": true }))
}

fn dispatch(
    conn: &Connection,
    method: &str,
    params: &serde_json::Value,
) -> Option<Result<serde_json::Value, HandlerErr>> {
    match method {
        "substitutions.needed" => Some(needed_substitutions(conn, params)),
        "substitutions.availableTeachers" => Some(available_teachers(conn, params)),
        "substitutions.assign" => Some(assign_substitute(conn, params)),
        "substitutions.cancel" => Some(cancel_substitution(conn, params)),
        _ => None,
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    if !req.method.starts_with("substitutions.") {
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
