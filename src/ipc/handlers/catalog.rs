use crate::clock;
use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::helpers::{bad_params, get_required_str, require_row};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;
use uuid::Uuid;

fn create_class(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let name = get_required_str(params, "name")?;
    let name = name.trim().to_string();
    if name.is_empty() {
        return Err(bad_params("name must not be empty"));
    }
    let class_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO classes(id, name) VALUES(?, ?)",
        (&class_id, &name),
    )?;
    Ok(json!({ "classId": class_id, "name": name }))
}

fn create_section(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let name = get_required_str(params, "name")?;
    require_row(conn, "classes", &class_id, "class")?;
    let section_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO sections(id, class_id, name) VALUES(?, ?, ?)",
        (&section_id, &class_id, &name),
    )?;
    Ok(json!({ "sectionId": section_id }))
}

fn create_subject(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let name = get_required_str(params, "name")?;
    let subject_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO subjects(id, name) VALUES(?, ?)",
        (&subject_id, &name),
    )?;
    Ok(json!({ "subjectId": subject_id }))
}

fn create_teacher(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let name = get_required_str(params, "name")?;
    let active = params.get("active").and_then(|v| v.as_bool()).unwrap_or(true);
    let teacher_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO teachers(id, name, active) VALUES(?, ?, ?)",
        (&teacher_id, &name, active as i64),
    )?;
    Ok(json!({ "teacherId": teacher_id }))
}

fn create_student(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let name = get_required_str(params, "name")?;
    let class_id = get_required_str(params, "classId")?;
    let section_id = get_required_str(params, "sectionId")?;
    require_row(conn, "classes", &class_id, "class")?;
    require_row(conn, "sections", &section_id, "section")?;
    let student_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO students(id, name, class_id, section_id, active) VALUES(?, ?, ?, ?, 1)",
        (&student_id, &name, &class_id, &section_id),
    )?;
    Ok(json!({ "studentId": student_id }))
}

fn create_time_slot(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let weekday_raw = get_required_str(params, "weekday")?;
    let Some(weekday) = clock::parse_weekday_code(&weekday_raw) else {
        return Err(bad_params("weekday must be one of mon..sun"));
    };
    let start_raw = get_required_str(params, "startTime")?;
    let end_raw = get_required_str(params, "endTime")?;
    let Some(start) = clock::parse_hhmm(&start_raw) else {
        return Err(bad_params("startTime must be HH:MM"));
    };
    let Some(end) = clock::parse_hhmm(&end_raw) else {
        return Err(bad_params("endTime must be HH:MM"));
    };
    if start >= end {
        return Err(bad_params("startTime must be before endTime"));
    }
    let label = get_required_str(params, "label")?;
    let order = params.get("order").and_then(|v| v.as_i64()).unwrap_or(0);

    let slot_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO time_slots(id, weekday, start_time, end_time, label, sort_order)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            &slot_id,
            clock::weekday_code(weekday),
            &clock::format_hhmm(start),
            &clock::format_hhmm(end),
            &label,
            order,
        ),
    )?;
    Ok(json!({ "timeSlotId": slot_id }))
}

fn list_time_slots(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let weekday = params.get("weekday").and_then(|v| v.as_str());
    let mut rows: Vec<(String, String, String, String, String, i64)> = Vec::new();
    {
        let (sql, args): (&str, Vec<String>) = match weekday {
            Some(w) => (
                "SELECT id, weekday, start_time, end_time, label, sort_order
                 FROM time_slots WHERE weekday = ?",
                vec![w.to_string()],
            ),
            None => (
                "SELECT id, weekday, start_time, end_time, label, sort_order FROM time_slots",
                vec![],
            ),
        };
        let mut stmt = conn.prepare(sql)?;
        let mapped = stmt.query_map(rusqlite::params_from_iter(args.iter()), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, String>(4)?,
                r.get::<_, i64>(5)?,
            ))
        })?;
        for row in mapped {
            rows.push(row?);
        }
    }
    rows.sort_by_key(|(_, wd, _, _, _, order)| (clock::weekday_index(wd), *order));
    let slots: Vec<serde_json::Value> = rows
        .into_iter()
        .map(|(id, wd, start, end, label, order)| {
            json!({
                "id": id,
                "weekday": wd,
                "startTime": start,
                "endTime": end,
                "label": label,
                "order": order
            })
        })
        .collect();
    Ok(json!({ "timeSlots": slots }))
}

fn list_teachers(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt =
        conn.prepare("SELECT id, name, active FROM teachers ORDER BY name, id")?;
    let teachers = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "active": r.get::<_, i64>(2)? != 0
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "teachers": teachers }))
}

fn list_students(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let section_id = get_required_str(params, "sectionId")?;
    let mut stmt = conn.prepare(
        "SELECT id, name, active FROM students
         WHERE class_id = ? AND section_id = ?
         ORDER BY name, id",
    )?;
    let students = stmt
        .query_map((&class_id, &section_id), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "active": r.get::<_, i64>(2)? != 0
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "students": students }))
}

fn dispatch(
    conn: &Connection,
    method: &str,
    params: &serde_json::Value,
) -> Option<Result<serde_json::Value, HandlerErr>> {
    match method {
        "catalog.createClass" => Some(create_class(conn, params)),
        "catalog.createSection" => Some(create_section(conn, params)),
        "catalog.createSubject" => Some(create_subject(conn, params)),
        "catalog.createTeacher" => Some(create_teacher(conn, params)),
        "catalog.createStudent" => Some(create_student(conn, params)),
        "catalog.createTimeSlot" => Some(create_time_slot(conn, params)),
        "catalog.listTimeSlots" => Some(list_time_slots(conn, params)),
        "catalog.listTeachers" => Some(list_teachers(conn)),
        "catalog.listStudents" => Some(list_students(conn, params)),
        _ => None,
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    if !req.method.starts_with("catalog.") {
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
