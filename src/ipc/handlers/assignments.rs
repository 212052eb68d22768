use crate::clock;
use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::helpers::{
    bad_params, get_optional_str, get_required_str, is_constraint_violation, parse_actor,
    require_admin, require_row,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

/// Who holds a slot already, for warning messages.
struct SlotHolder {
    teacher_name: String,
    class_name: String,
    section_name: String,
}

fn teacher_holding_slot(
    conn: &Connection,
    teacher_id: &str,
    slot_id: &str,
) -> Result<Option<SlotHolder>, HandlerErr> {
    conn.query_row(
        "SELECT t.name, c.name, s.name
         FROM teacher_assignments a
         JOIN teachers t ON t.id = a.teacher_id
         JOIN classes c ON c.id = a.class_id
         JOIN sections s ON s.id = a.section_id
         WHERE a.teacher_id = ? AND a.time_slot_id = ? AND a.active = 1",
        (teacher_id, slot_id),
        |r| {
            Ok(SlotHolder {
                teacher_name: r.get(0)?,
                class_name: r.get(1)?,
                section_name: r.get(2)?,
            })
        },
    )
    .optional()
    .map_err(HandlerErr::from)
}

fn class_holding_slot(
    conn: &Connection,
    class_id: &str,
    section_id: &str,
    slot_id: &str,
) -> Result<Option<SlotHolder>, HandlerErr> {
    conn.query_row(
        "SELECT t.name, c.name, s.name
         FROM teacher_assignments a
         JOIN teachers t ON t.id = a.teacher_id
         JOIN classes c ON c.id = a.class_id
         JOIN sections s ON s.id = a.section_id
         WHERE a.class_id = ? AND a.section_id = ? AND a.time_slot_id = ? AND a.active = 1",
        (class_id, section_id, slot_id),
        |r| {
            Ok(SlotHolder {
                teacher_name: r.get(0)?,
                class_name: r.get(1)?,
                section_name: r.get(2)?,
            })
        },
    )
    .optional()
    .map_err(HandlerErr::from)
}

/// Bulk creation over independent slots. The pre-checks only decide the
/// warning text; the unique indexes on active rows are the authoritative
/// clash check, so a concurrent insert that races past the pre-check still
/// degrades to a warning instead of corrupting the timetable.
fn create_assignments(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let actor = parse_actor(params)?;
    require_admin(&actor)?;
    let teacher_id = get_required_str(params, "teacherId")?;
    let class_id = get_required_str(params, "classId")?;
    let section_id = get_required_str(params, "sectionId")?;
    let subject_id = get_required_str(params, "subjectId")?;
    let Some(slot_ids) = params.get("slotIds").and_then(|v| v.as_array()) else {
        return Err(bad_params("missing slotIds"));
    };
    let slot_ids: Vec<String> = slot_ids
        .iter()
        .filter_map(|v| v.as_str().map(|s| s.to_string()))
        .collect();
    if slot_ids.is_empty() {
        return Err(bad_params("slotIds must not be empty"));
    }

    require_row(conn, "teachers", &teacher_id, "teacher")?;
    require_row(conn, "classes", &class_id, "class")?;
    require_row(conn, "sections", &section_id, "section")?;
    require_row(conn, "subjects", &subject_id, "subject")?;

    let created_at = chrono::Utc::now().to_rfc3339();
    let mut created: Vec<serde_json::Value> = Vec::new();
    let mut warnings: Vec<serde_json::Value> = Vec::new();

    for slot_id in &slot_ids {
        let slot: Option<(String, String, String)> = conn
            .query_row(
                "SELECT weekday, start_time, end_time FROM time_slots WHERE id = ?",
                [slot_id],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .optional()?;
        let Some((weekday, start, end)) = slot else {
            warnings.push(json!({
                "timeSlotId": slot_id,
                "code": "slot_not_found",
                "message": "time slot does not exist"
            }));
            continue;
        };

        if let Some(held) = teacher_holding_slot(conn, &teacher_id, slot_id)? {
            warnings.push(json!({
                "timeSlotId": slot_id,
                "code": "teacher_busy",
                "message": format!(
                    "teacher already teaches {} {} at {} {}-{}",
                    held.class_name, held.section_name, weekday, start, end
                )
            }));
            continue;
        }
        if let Some(held) = class_holding_slot(conn, &class_id, &section_id, slot_id)? {
            warnings.push(json!({
                "timeSlotId": slot_id,
                "code": "class_occupied",
                "message": format!(
                    "{} already teaches this class/section at {} {}-{}",
                    held.teacher_name, weekday, start, end
                )
            }));
            continue;
        }

        let assignment_id = Uuid::new_v4().to_string();
        let inserted = conn.execute(
            "INSERT INTO teacher_assignments(
                id, teacher_id, class_id, section_id, subject_id, time_slot_id,
                active, created_by, created_at)
             VALUES(?, ?, ?, ?, ?, ?, 1, ?, ?)",
            (
                &assignment_id,
                &teacher_id,
                &class_id,
                &section_id,
                &subject_id,
                slot_id,
                &actor.id,
                &created_at,
            ),
        );
        match inserted {
            Ok(_) => created.push(json!({
                "assignmentId": assignment_id,
                "timeSlotId": slot_id
            })),
            // A concurrent writer won the slot between check and insert.
            Err(e) if is_constraint_violation(&e) => warnings.push(json!({
                "timeSlotId": slot_id,
                "code": "duplicate_slot",
                "message": "slot was taken by a concurrent assignment"
            })),
            Err(e) => {
                return Err(HandlerErr {
                    code: "db_insert_failed",
                    message: e.to_string(),
                    details: Some(json!({ "table": "teacher_assignments" })),
                })
            }
        }
    }

    if created.is_empty() {
        return Err(HandlerErr {
            code: "conflict",
            message: "no slots could be assigned".to_string(),
            details: Some(json!({ "warnings": warnings })),
        });
    }
    Ok(json!({ "created": created, "warnings": warnings }))
}

fn remove_assignment(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let actor = parse_actor(params)?;
    require_admin(&actor)?;
    let assignment_id = get_required_str(params, "assignmentId")?;
    require_row(conn, "teacher_assignments", &assignment_id, "assignment")?;
    // Soft removal keeps the timetable history; repeating it is a no-op.
    conn.execute(
        "UPDATE teacher_assignments SET active = 0 WHERE id = ?",
        [&assignment_id],
    )?;
    Ok(json!({ "assignmentId": assignment_id, "active": false }))
}

fn list_assignments(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let teacher_id = get_optional_str(params, "teacherId");
    let class_id = get_optional_str(params, "classId");
    let section_id = get_optional_str(params, "sectionId");
    let include_inactive = params
        .get("includeInactive")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let mut sql = String::from(
        "SELECT a.id, a.teacher_id, t.name, a.class_id, c.name, a.section_id, s.name,
                a.subject_id, sub.name, a.time_slot_id, ts.weekday, ts.start_time,
                ts.end_time, ts.label, a.active
         FROM teacher_assignments a
         JOIN teachers t ON t.id = a.teacher_id
         JOIN classes c ON c.id = a.class_id
         JOIN sections s ON s.id = a.section_id
         JOIN subjects sub ON sub.id = a.subject_id
         JOIN time_slots ts ON ts.id = a.time_slot_id
         WHERE 1 = 1",
    );
    let mut args: Vec<String> = Vec::new();
    if !include_inactive {
        sql.push_str(" AND a.active = 1");
    }
    if let Some(v) = teacher_id {
        sql.push_str(" AND a.teacher_id = ?");
        args.push(v);
    }
    if let Some(v) = class_id {
        sql.push_str(" AND a.class_id = ?");
        args.push(v);
    }
    if let Some(v) = section_id {
        sql.push_str(" AND a.section_id = ?");
        args.push(v);
    }

    let mut stmt = conn.prepare(&sql)?;
    let mut rows: Vec<(u32, String, serde_json::Value)> = stmt
        .query_map(rusqlite::params_from_iter(args.iter()), |r| {
            let weekday: String = r.get(10)?;
            let start: String = r.get(11)?;
            let row = json!({
                "id": r.get::<_, String>(0)?,
                "teacherId": r.get::<_, String>(1)?,
                "teacherName": r.get::<_, String>(2)?,
                "classId": r.get::<_, String>(3)?,
                "className": r.get::<_, String>(4)?,
                "sectionId": r.get::<_, String>(5)?,
                "sectionName": r.get::<_, String>(6)?,
                "subjectId": r.get::<_, String>(7)?,
                "subjectName": r.get::<_, String>(8)?,
                "timeSlotId": r.get::<_, String>(9)?,
                "weekday": weekday,
                "startTime": start,
                "endTime": r.get::<_, String>(12)?,
                "label": r.get::<_, String>(13)?,
                "active": r.get::<_, i64>(14)? != 0
            });
            Ok((clock::weekday_index(&weekday), start, row))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    rows.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));
    let assignments: Vec<serde_json::Value> = rows.into_iter().map(|(_, _, v)| v).collect();
    Ok(json!({ "assignments": assignments }))
}

fn dispatch(
    conn: &Connection,
    method: &str,
    params: &serde_json::Value,
) -> Option<Result<serde_json::Value, HandlerErr>> {
    match method {
        "assignments.create" => Some(create_assignments(conn, params)),
        "assignments.remove" => Some(remove_assignment(conn, params)),
        "assignments.list" => Some(list_assignments(conn, params)),
        _ => None,
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    if !req.method.starts_with("assignments.") {
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
