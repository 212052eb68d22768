use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_timetabled");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn timetabled");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn result_str(value: &serde_json::Value, key: &str) -> String {
    value
        .get("result")
        .and_then(|v| v.get(key))
        .and_then(|v| v.as_str())
        .unwrap_or_else(|| panic!("missing result.{} in {}", key, value))
        .to_string()
}

fn error_code(value: &serde_json::Value) -> &str {
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
}

fn error_reason(value: &serde_json::Value) -> &str {
    value
        .get("error")
        .and_then(|e| e.get("details"))
        .and_then(|d| d.get("reason"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
}

fn assert_ok(value: &serde_json::Value) {
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(true),
        "expected ok response, got {}",
        value
    );
}

struct Harness {
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    next_id: u64,
}

impl Harness {
    fn call(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
        self.next_id += 1;
        let id = self.next_id.to_string();
        request(&mut self.stdin, &mut self.reader, &id, method, params)
    }
}

fn open_workspace(prefix: &str) -> (Child, Harness, PathBuf) {
    let workspace = temp_dir(prefix);
    let (child, stdin, reader) = spawn_sidecar();
    let mut h = Harness {
        stdin,
        reader,
        next_id: 0,
    };
    let resp = h.call(
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    assert_ok(&resp);
    (child, h, workspace)
}

fn admin() -> serde_json::Value {
    json!({ "id": "admin-1", "role": "admin" })
}

struct Seed {
    class_id: String,
    section_id: String,
    subject_id: String,
    slot_id: String,
    absent_teacher: String,
    free_teacher: String,
    second_free_teacher: String,
    busy_teacher: String,
    leave_teacher: String,
}

/// Tuesday 10:00-11:00 Physics for 10A taught by X; Z teaches another class
/// at the same slot; Y and V are free; W has no timetable at all.
fn seed(h: &mut Harness) -> Seed {
    let class_id = result_str(&h.call("catalog.createClass", json!({ "name": "Class 10" })), "classId");
    let section_id = result_str(
        &h.call("catalog.createSection", json!({ "classId": class_id, "name": "A" })),
        "sectionId",
    );
    let other_class = result_str(&h.call("catalog.createClass", json!({ "name": "Class 6" })), "classId");
    let other_section = result_str(
        &h.call("catalog.createSection", json!({ "classId": other_class, "name": "B" })),
        "sectionId",
    );
    let subject_id = result_str(&h.call("catalog.createSubject", json!({ "name": "Physics" })), "subjectId");
    let slot_id = result_str(
        &h.call(
            "catalog.createTimeSlot",
            json!({ "weekday": "tue", "startTime": "10:00", "endTime": "11:00", "label": "P2", "order": 2 }),
        ),
        "timeSlotId",
    );

    let absent_teacher = result_str(&h.call("catalog.createTeacher", json!({ "name": "Xavier" })), "teacherId");
    let free_teacher = result_str(&h.call("catalog.createTeacher", json!({ "name": "Yasmin" })), "teacherId");
    let second_free_teacher =
        result_str(&h.call("catalog.createTeacher", json!({ "name": "Vikram" })), "teacherId");
    let busy_teacher = result_str(&h.call("catalog.createTeacher", json!({ "name": "Zara" })), "teacherId");
    let leave_teacher = result_str(&h.call("catalog.createTeacher", json!({ "name": "Waqas" })), "teacherId");

    let created = h.call(
        "assignments.create",
        json!({
            "teacherId": absent_teacher,
            "classId": class_id,
            "sectionId": section_id,
            "subjectId": subject_id,
            "slotIds": [slot_id],
            "actor": admin()
        }),
    );
    assert_ok(&created);
    let created = h.call(
        "assignments.create",
        json!({
            "teacherId": busy_teacher,
            "classId": other_class,
            "sectionId": other_section,
            "subjectId": subject_id,
            "slotIds": [slot_id],
            "actor": admin()
        }),
    );
    assert_ok(&created);

    Seed {
        class_id,
        section_id,
        subject_id,
        slot_id,
        absent_teacher,
        free_teacher,
        second_free_teacher,
        busy_teacher,
        leave_teacher,
    }
}

fn assign_params(s: &Seed, substitute: &str) -> serde_json::Value {
    json!({
        "date": "2024-05-07",
        "classId": s.class_id,
        "sectionId": s.section_id,
        "subjectId": s.subject_id,
        "timeSlotId": s.slot_id,
        "originalTeacherId": s.absent_teacher,
        "substituteTeacherId": substitute,
        "actor": admin()
    })
}

#[test]
fn absence_to_pending_to_covered_and_back() {
    let (mut child, mut h, workspace) = open_workspace("timetabled-subs");
    let s = seed(&mut h);

    // No absences: cheap empty short-circuit.
    let none = h.call("substitutions.needed", json!({ "date": "2024-05-07" }));
    assert_ok(&none);
    assert_eq!(none["result"]["needed"].as_array().unwrap().len(), 0);

    // X absent, W on leave on Tuesday 2024-05-07.
    let marked = h.call(
        "teacherAttendance.mark",
        json!({
            "date": "2024-05-07",
            "records": [
                { "teacherId": s.absent_teacher, "status": "absent" },
                { "teacherId": s.leave_teacher, "status": "leave" }
            ],
            "actor": admin()
        }),
    );
    assert_ok(&marked);

    // Only X's Tuesday period needs cover; W has no timetable.
    let needed = h.call("substitutions.needed", json!({ "date": "2024-05-07" }));
    assert_ok(&needed);
    let rows = needed["result"]["needed"].as_array().expect("needed");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["status"], "pending");
    assert_eq!(rows[0]["originalTeacherId"], json!(s.absent_teacher));

    // Free pool excludes absent, on-leave, busy and (later) substituting
    // teachers.
    let pool = h.call(
        "substitutions.availableTeachers",
        json!({ "date": "2024-05-07", "timeSlotId": s.slot_id }),
    );
    assert_ok(&pool);
    let ids: Vec<&str> = pool["result"]["teachers"]
        .as_array()
        .expect("teachers")
        .iter()
        .map(|t| t["id"].as_str().unwrap())
        .collect();
    assert!(ids.contains(&s.free_teacher.as_str()));
    assert!(ids.contains(&s.second_free_teacher.as_str()));
    assert!(!ids.contains(&s.absent_teacher.as_str()));
    assert!(!ids.contains(&s.leave_teacher.as_str()));
    assert!(!ids.contains(&s.busy_teacher.as_str()));

    // Write-time re-validation: a busy or absent substitute is refused even
    // though the caller skipped availableTeachers.
    let refused = h.call("substitutions.assign", assign_params(&s, &s.busy_teacher));
    assert_eq!(error_code(&refused), "conflict");
    assert_eq!(error_reason(&refused), "substitute_busy");
    let refused = h.call("substitutions.assign", assign_params(&s, &s.leave_teacher));
    assert_eq!(error_code(&refused), "conflict");
    assert_eq!(error_reason(&refused), "substitute_absent");

    // Y covers the period.
    let assigned = h.call("substitutions.assign", assign_params(&s, &s.free_teacher));
    assert_ok(&assigned);
    let substitution_id = result_str(&assigned, "substitutionId");

    let needed = h.call("substitutions.needed", json!({ "date": "2024-05-07" }));
    let rows = needed["result"]["needed"].as_array().expect("needed");
    assert_eq!(rows[0]["status"], "covered");
    assert_eq!(rows[0]["coveringTeacherName"], "Yasmin");

    // Y is no longer in the pool; a second cover for the same period is a
    // duplicate.
    let pool = h.call(
        "substitutions.availableTeachers",
        json!({ "date": "2024-05-07", "timeSlotId": s.slot_id }),
    );
    let ids: Vec<&str> = pool["result"]["teachers"]
        .as_array()
        .expect("teachers")
        .iter()
        .map(|t| t["id"].as_str().unwrap())
        .collect();
    assert!(!ids.contains(&s.free_teacher.as_str()));

    let duplicate = h.call(
        "substitutions.assign",
        assign_params(&s, &s.second_free_teacher),
    );
    assert_eq!(error_code(&duplicate), "conflict");
    assert_eq!(error_reason(&duplicate), "duplicate");

    // Cancellation reverts the period to pending.
    let cancelled = h.call(
        "substitutions.cancel",
        json!({ "substitutionId": substitution_id, "actor": admin() }),
    );
    assert_ok(&cancelled);
    let needed = h.call("substitutions.needed", json!({ "date": "2024-05-07" }));
    assert_eq!(needed["result"]["needed"][0]["status"], "pending");

    let missing = h.call(
        "substitutions.cancel",
        json!({ "substitutionId": substitution_id, "actor": admin() }),
    );
    assert_eq!(error_code(&missing), "not_found");

    drop(h);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn substitution_administration_requires_admin() {
    let (mut child, mut h, workspace) = open_workspace("timetabled-subs-role");
    let s = seed(&mut h);

    let mut params = assign_params(&s, &s.free_teacher);
    params["actor"] = json!({ "id": s.free_teacher, "role": "teacher" });
    let denied = h.call("substitutions.assign", params);
    assert_eq!(error_code(&denied), "not_authorized");

    let denied = h.call(
        "substitutions.cancel",
        json!({ "substitutionId": "anything", "actor": { "id": s.free_teacher, "role": "teacher" } }),
    );
    assert_eq!(error_code(&denied), "not_authorized");

    drop(h);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn teacher_attendance_marking_is_admin_only() {
    let (mut child, mut h, workspace) = open_workspace("timetabled-subs-ta");
    let s = seed(&mut h);

    let denied = h.call(
        "teacherAttendance.mark",
        json!({
            "date": "2024-05-07",
            "records": [{ "teacherId": s.absent_teacher, "status": "absent" }],
            "actor": { "id": s.free_teacher, "role": "teacher" }
        }),
    );
    assert_eq!(error_code(&denied), "not_authorized");

    // Re-marking the same (date, teacher) updates in place.
    for status in ["absent", "present"] {
        let marked = h.call(
            "teacherAttendance.mark",
            json!({
                "date": "2024-05-07",
                "records": [{ "teacherId": s.absent_teacher, "status": status }],
                "actor": admin()
            }),
        );
        assert_ok(&marked);
    }
    let queried = h.call(
        "teacherAttendance.query",
        json!({ "date": "2024-05-07", "teacherId": s.absent_teacher }),
    );
    assert_ok(&queried);
    let records = queried["result"]["records"].as_array().expect("records");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["status"], "present");

    drop(h);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
