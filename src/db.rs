use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

use crate::reconcile::{AttendanceWrite, GradeWrite, RecordStore};

pub const DB_FILE_NAME: &str = "campus.sqlite3";

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS admins(
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        email TEXT NOT NULL UNIQUE,
        password_hash TEXT NOT NULL,
        password_salt TEXT NOT NULL,
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS careers(
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        code TEXT NOT NULL UNIQUE,
        description TEXT NOT NULL,
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS teachers(
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        first_name TEXT NOT NULL,
        last_name TEXT NOT NULL,
        email TEXT NOT NULL UNIQUE,
        phone TEXT,
        password_hash TEXT NOT NULL,
        password_salt TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT
    )",
    "CREATE TABLE IF NOT EXISTS students(
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        first_name TEXT NOT NULL,
        last_name TEXT NOT NULL,
        enrollment_no TEXT NOT NULL UNIQUE,
        email TEXT NOT NULL UNIQUE,
        phone TEXT,
        address TEXT,
        career_id INTEGER,
        active INTEGER NOT NULL DEFAULT 1,
        password_hash TEXT NOT NULL,
        password_salt TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT,
        FOREIGN KEY(career_id) REFERENCES careers(id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_students_career ON students(career_id)",
    "CREATE TABLE IF NOT EXISTS subjects(
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        code TEXT NOT NULL UNIQUE,
        credits INTEGER NOT NULL,
        weekly_hours INTEGER NOT NULL,
        semester INTEGER NOT NULL,
        career_id INTEGER,
        description TEXT,
        FOREIGN KEY(career_id) REFERENCES careers(id)
    )",
    "CREATE TABLE IF NOT EXISTS offerings(
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        subject_id INTEGER NOT NULL,
        teacher_id INTEGER NOT NULL,
        cycle TEXT NOT NULL,
        created_at TEXT NOT NULL,
        FOREIGN KEY(subject_id) REFERENCES subjects(id),
        FOREIGN KEY(teacher_id) REFERENCES teachers(id),
        UNIQUE(subject_id, teacher_id, cycle)
    )",
    "CREATE INDEX IF NOT EXISTS idx_offerings_teacher ON offerings(teacher_id)",
    "CREATE TABLE IF NOT EXISTS schedule_slots(
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        offering_id INTEGER NOT NULL,
        weekday TEXT NOT NULL,
        start_time TEXT NOT NULL,
        end_time TEXT NOT NULL,
        room TEXT NOT NULL,
        FOREIGN KEY(offering_id) REFERENCES offerings(id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_schedule_slots_offering ON schedule_slots(offering_id)",
    "CREATE TABLE IF NOT EXISTS evaluation_periods(
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        label TEXT NOT NULL,
        start_date TEXT NOT NULL,
        end_date TEXT NOT NULL,
        school_cycle TEXT NOT NULL,
        weight_percent REAL NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS offering_periods(
        offering_id INTEGER NOT NULL,
        period_id INTEGER NOT NULL,
        sort_order INTEGER NOT NULL,
        PRIMARY KEY(offering_id, period_id),
        FOREIGN KEY(offering_id) REFERENCES offerings(id),
        FOREIGN KEY(period_id) REFERENCES evaluation_periods(id)
    )",
    "CREATE TABLE IF NOT EXISTS offering_students(
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        offering_id INTEGER NOT NULL,
        student_id INTEGER NOT NULL,
        created_at TEXT NOT NULL,
        FOREIGN KEY(offering_id) REFERENCES offerings(id),
        FOREIGN KEY(student_id) REFERENCES students(id),
        UNIQUE(offering_id, student_id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_offering_students_student ON offering_students(student_id)",
    "CREATE TABLE IF NOT EXISTS shifts(
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE
    )",
    "CREATE TABLE IF NOT EXISTS class_groups(
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        semester INTEGER NOT NULL,
        career_id INTEGER,
        shift_id INTEGER,
        tutor_teacher_id INTEGER,
        capacity INTEGER NOT NULL,
        FOREIGN KEY(career_id) REFERENCES careers(id),
        FOREIGN KEY(shift_id) REFERENCES shifts(id),
        FOREIGN KEY(tutor_teacher_id) REFERENCES teachers(id)
    )",
    "CREATE TABLE IF NOT EXISTS group_enrollments(
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        student_id INTEGER NOT NULL,
        group_id INTEGER NOT NULL,
        cycle TEXT NOT NULL,
        enrolled_on TEXT NOT NULL,
        status TEXT NOT NULL,
        FOREIGN KEY(student_id) REFERENCES students(id),
        FOREIGN KEY(group_id) REFERENCES class_groups(id),
        UNIQUE(student_id, group_id, cycle)
    )",
    "CREATE INDEX IF NOT EXISTS idx_group_enrollments_group ON group_enrollments(group_id)",
    "CREATE TABLE IF NOT EXISTS grades(
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        student_id INTEGER NOT NULL,
        offering_id INTEGER NOT NULL,
        period_id INTEGER NOT NULL,
        score REAL NOT NULL,
        absences INTEGER NOT NULL DEFAULT 0,
        notes TEXT,
        recorded_at TEXT NOT NULL,
        updated_at TEXT,
        FOREIGN KEY(student_id) REFERENCES students(id),
        FOREIGN KEY(offering_id) REFERENCES offerings(id),
        FOREIGN KEY(period_id) REFERENCES evaluation_periods(id),
        UNIQUE(student_id, offering_id, period_id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_grades_offering ON grades(offering_id)",
    "CREATE TABLE IF NOT EXISTS attendance(
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        student_id INTEGER NOT NULL,
        offering_id INTEGER NOT NULL,
        date TEXT NOT NULL,
        present INTEGER NOT NULL,
        updated_at TEXT,
        FOREIGN KEY(student_id) REFERENCES students(id),
        FOREIGN KEY(offering_id) REFERENCES offerings(id),
        UNIQUE(student_id, offering_id, date)
    )",
    "CREATE INDEX IF NOT EXISTS idx_attendance_offering ON attendance(offering_id)",
    "CREATE TABLE IF NOT EXISTS settings(
        key TEXT PRIMARY KEY,
        value_json TEXT NOT NULL
    )",
];

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    for stmt in SCHEMA {
        conn.execute(stmt, [])?;
    }

    Ok(conn)
}

pub fn now_stamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(conn: &Connection, key: &str, value: &serde_json::Value) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

/// Persistence handle the reconciler writes through.
pub struct SqliteStore<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteStore<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

impl RecordStore for SqliteStore<'_> {
    fn offering_teacher(&self, offering_id: i64) -> anyhow::Result<Option<i64>> {
        Ok(self
            .conn
            .query_row(
                "SELECT teacher_id FROM offerings WHERE id = ?",
                [offering_id],
                |r| r.get(0),
            )
            .optional()?)
    }

    fn is_rostered(&self, offering_id: i64, student_id: i64) -> anyhow::Result<bool> {
        Ok(self
            .conn
            .query_row(
                "SELECT 1 FROM offering_students WHERE offering_id = ? AND student_id = ?",
                (offering_id, student_id),
                |r| r.get::<_, i64>(0),
            )
            .optional()?
            .is_some())
    }

    fn period_attached(&self, offering_id: i64, period_id: i64) -> anyhow::Result<bool> {
        Ok(self
            .conn
            .query_row(
                "SELECT 1 FROM offering_periods WHERE offering_id = ? AND period_id = ?",
                (offering_id, period_id),
                |r| r.get::<_, i64>(0),
            )
            .optional()?
            .is_some())
    }

    fn upsert_grade(&self, g: &GradeWrite) -> anyhow::Result<()> {
        let now = now_stamp();
        self.conn.execute(
            "INSERT INTO grades(student_id, offering_id, period_id, score, absences, notes, recorded_at, updated_at)
             VALUES(?1, ?2, ?3, ?4, COALESCE(?5, 0), ?6, ?7, ?7)
             ON CONFLICT(student_id, offering_id, period_id) DO UPDATE SET
               score = excluded.score,
               absences = COALESCE(?5, grades.absences),
               notes = COALESCE(?6, grades.notes),
               updated_at = excluded.updated_at",
            (
                g.student_id,
                g.offering_id,
                g.period_id,
                g.score,
                g.absences,
                g.notes.as_deref(),
                &now,
            ),
        )?;
        Ok(())
    }

    fn upsert_attendance(&self, a: &AttendanceWrite) -> anyhow::Result<()> {
        self.conn.execute(
            "INSERT INTO attendance(student_id, offering_id, date, present, updated_at)
             VALUES(?, ?, ?, ?, ?)
             ON CONFLICT(student_id, offering_id, date) DO UPDATE SET
               present = excluded.present,
               updated_at = excluded.updated_at",
            (
                a.student_id,
                a.offering_id,
                a.date.format("%Y-%m-%d").to_string(),
                a.present as i64,
                now_stamp(),
            ),
        )?;
        Ok(())
    }
}
