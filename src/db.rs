use rusqlite::Connection;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("timetable.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS sections(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            name TEXT NOT NULL,
            FOREIGN KEY(class_id) REFERENCES classes(id),
            UNIQUE(class_id, name)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sections_class ON sections(class_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS teachers(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            class_id TEXT NOT NULL,
            section_id TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(section_id) REFERENCES sections(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_class_section ON students(class_id, section_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS time_slots(
            id TEXT PRIMARY KEY,
            weekday TEXT NOT NULL,
            start_time TEXT NOT NULL,
            end_time TEXT NOT NULL,
            label TEXT NOT NULL,
            sort_order INTEGER NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_time_slots_weekday ON time_slots(weekday, sort_order)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS teacher_assignments(
            id TEXT PRIMARY KEY,
            teacher_id TEXT NOT NULL,
            class_id TEXT NOT NULL,
            section_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            time_slot_id TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            created_by TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(teacher_id) REFERENCES teachers(id),
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(section_id) REFERENCES sections(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            FOREIGN KEY(time_slot_id) REFERENCES time_slots(id)
        )",
        [],
    )?;
    // The inserts are the authoritative clash check; handler pre-checks only
    // decide the warning text. Partial indexes so inactive history rows never
    // block a re-assignment.
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS ux_assignments_teacher_slot
         ON teacher_assignments(teacher_id, time_slot_id) WHERE active = 1",
        [],
    )?;
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS ux_assignments_class_slot
         ON teacher_assignments(class_id, section_id, time_slot_id) WHERE active = 1",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_assignments_teacher ON teacher_assignments(teacher_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_assignments_class_section
         ON teacher_assignments(class_id, section_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance_records(
            id TEXT PRIMARY KEY,
            date TEXT NOT NULL,
            student_id TEXT NOT NULL,
            class_id TEXT NOT NULL,
            section_id TEXT NOT NULL,
            status TEXT NOT NULL,
            marked_by TEXT NOT NULL,
            marked_at TEXT NOT NULL,
            is_frozen INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(section_id) REFERENCES sections(id),
            UNIQUE(date, student_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_day
         ON attendance_records(date, class_id, section_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_student ON attendance_records(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance_history(
            id TEXT PRIMARY KEY,
            date TEXT NOT NULL,
            student_id TEXT NOT NULL,
            status TEXT NOT NULL,
            changed_by TEXT NOT NULL,
            reason TEXT,
            timestamp TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_history_key
         ON attendance_history(date, student_id)",
        [],
    )?;

    // One row per touched (date, class, section): the day's lock state.
    // marked=1 means some writer holds the first-marker lock; frozen=1 is the
    // admin override. The primary key makes the claiming write itself the
    // lock acquisition, inside the same transaction as the record upserts.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance_day_locks(
            date TEXT NOT NULL,
            class_id TEXT NOT NULL,
            section_id TEXT NOT NULL,
            marked INTEGER NOT NULL DEFAULT 0,
            frozen INTEGER NOT NULL DEFAULT 0,
            locked_by TEXT NOT NULL,
            locked_at TEXT NOT NULL,
            PRIMARY KEY(date, class_id, section_id),
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(section_id) REFERENCES sections(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS teacher_attendance(
            id TEXT PRIMARY KEY,
            date TEXT NOT NULL,
            teacher_id TEXT NOT NULL,
            status TEXT NOT NULL,
            marked_by TEXT NOT NULL,
            marked_at TEXT NOT NULL,
            FOREIGN KEY(teacher_id) REFERENCES teachers(id),
            UNIQUE(date, teacher_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_teacher_attendance_date ON teacher_attendance(date)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS teacher_attendance_history(
            id TEXT PRIMARY KEY,
            date TEXT NOT NULL,
            teacher_id TEXT NOT NULL,
            status TEXT NOT NULL,
            changed_by TEXT NOT NULL,
            reason TEXT,
            timestamp TEXT NOT NULL,
            FOREIGN KEY(teacher_id) REFERENCES teachers(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS substitutions(
            id TEXT PRIMARY KEY,
            date TEXT NOT NULL,
            class_id TEXT NOT NULL,
            section_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            time_slot_id TEXT NOT NULL,
            original_teacher_id TEXT NOT NULL,
            substitute_teacher_id TEXT NOT NULL,
            assigned_by TEXT NOT NULL,
            assigned_at TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'assigned',
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(section_id) REFERENCES sections(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            FOREIGN KEY(time_slot_id) REFERENCES time_slots(id),
            FOREIGN KEY(original_teacher_id) REFERENCES teachers(id),
            FOREIGN KEY(substitute_teacher_id) REFERENCES teachers(id),
            UNIQUE(date, class_id, section_id, time_slot_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_substitutions_date ON substitutions(date)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_substitutions_substitute
         ON substitutions(substitute_teacher_id, date)",
        [],
    )?;

    Ok(conn)
}
