#![allow(dead_code)]

use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static DIR_SEQ: AtomicU64 = AtomicU64::new(0);

pub fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos(),
        DIR_SEQ.fetch_add(1, Ordering::SeqCst)
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

pub struct Sidecar {
    child: Child,
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    next_id: u64,
}

impl Drop for Sidecar {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl Sidecar {
    pub fn spawn() -> Self {
        Self::spawn_with_env(&[])
    }

    pub fn spawn_with_env(envs: &[(&str, &str)]) -> Self {
        let exe = env!("CARGO_BIN_EXE_campusd");
        let mut cmd = Command::new(exe);
        cmd.env_remove("CAMPUSD_WORKSPACE")
            .env_remove("CAMPUSD_SESSION_TTL_MINUTES")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        for (k, v) in envs {
            cmd.env(k, v);
        }
        let mut child = cmd.spawn().expect("spawn campusd");
        let stdin = child.stdin.take().expect("child stdin");
        let stdout = child.stdout.take().expect("child stdout");
        Self {
            child,
            stdin,
            reader: BufReader::new(stdout),
            next_id: 0,
        }
    }

    pub fn send_raw(&mut self, line: &str) -> serde_json::Value {
        writeln!(self.stdin, "{}", line).expect("write request");
        self.stdin.flush().expect("flush request");
        let mut out = String::new();
        self.reader.read_line(&mut out).expect("read response line");
        assert!(!out.trim().is_empty(), "empty response for {}", line);
        serde_json::from_str(out.trim()).expect("parse response json")
    }

    pub fn request(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
        self.next_id += 1;
        let id = self.next_id.to_string();
        let payload = json!({
            "id": id,
            "method": method,
            "params": params,
        });
        let value = self.send_raw(&payload.to_string());
        assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id.as_str()));
        value
    }

    pub fn request_ok(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
        let value = self.request(method, params);
        assert!(
            value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
            "{} failed: {}",
            method,
            value
                .get("error")
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown error".to_string())
        );
        value.get("result").cloned().unwrap_or_else(|| json!({}))
    }

    /// Expects a failure and returns its error code.
    pub fn request_err(&mut self, method: &str, params: serde_json::Value) -> String {
        let value = self.request(method, params);
        assert_eq!(
            value.get("ok").and_then(|v| v.as_bool()),
            Some(false),
            "{} unexpectedly succeeded: {}",
            method,
            value
        );
        value
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str())
            .expect("error code")
            .to_string()
    }

    pub fn open_workspace(&mut self, prefix: &str) -> PathBuf {
        let workspace = temp_dir(prefix);
        self.request_ok(
            "workspace.select",
            json!({ "path": workspace.to_string_lossy() }),
        );
        workspace
    }

    pub fn login(&mut self, role: &str, email: &str, password: &str) {
        self.request_ok(
            "auth.login",
            json!({ "role": role, "email": email, "password": password }),
        );
    }

    pub fn login_admin(&mut self) {
        self.login("admin", ADMIN_EMAIL, PASSWORD);
    }
}

pub const ADMIN_EMAIL: &str = "admin@campus.edu";
pub const PASSWORD: &str = "secret123";

pub fn id_of(result: &serde_json::Value, key: &str) -> i64 {
    result
        .get(key)
        .and_then(|v| v.as_i64())
        .unwrap_or_else(|| panic!("missing {} in {}", key, result))
}

/// A small school: one admin, two teachers, three students, one subject
/// offered by teacher A with three periods (30/30/40) and all three students
/// on the roster, plus one offering owned by teacher B.
pub struct School {
    pub workspace: PathBuf,
    pub teacher_a: i64,
    pub teacher_b: i64,
    pub students: [i64; 3],
    pub offering_a: i64,
    pub offering_b: i64,
    pub periods: [i64; 3],
}

pub const TEACHER_A_EMAIL: &str = "lopez@campus.edu";
pub const TEACHER_B_EMAIL: &str = "garcia@campus.edu";

pub fn student_email(idx: usize) -> String {
    format!("student{}@campus.edu", idx + 1)
}

pub fn seed_school(sc: &mut Sidecar, prefix: &str) -> School {
    let workspace = sc.open_workspace(prefix);
    sc.request_ok(
        "auth.registerAdmin",
        json!({ "name": "Registrar", "email": ADMIN_EMAIL, "password": PASSWORD }),
    );
    sc.login_admin();

    let career = sc.request_ok(
        "careers.create",
        json!({ "name": "Systems Engineering", "code": "ISC", "description": "" }),
    );
    let career_id = id_of(&career, "careerId");

    let teacher_a = id_of(
        &sc.request_ok(
            "teachers.create",
            json!({
                "firstName": "Maria", "lastName": "Lopez",
                "email": TEACHER_A_EMAIL, "password": PASSWORD
            }),
        ),
        "teacherId",
    );
    let teacher_b = id_of(
        &sc.request_ok(
            "teachers.create",
            json!({
                "firstName": "Jorge", "lastName": "Garcia",
                "email": TEACHER_B_EMAIL, "password": PASSWORD
            }),
        ),
        "teacherId",
    );

    let mut students = [0i64; 3];
    for (i, slot) in students.iter_mut().enumerate() {
        *slot = id_of(
            &sc.request_ok(
                "students.create",
                json!({
                    "firstName": format!("Student{}", i + 1),
                    "lastName": "Perez",
                    "enrollmentNo": format!("A00{}", i + 1),
                    "email": student_email(i),
                    "careerId": career_id,
                    "password": PASSWORD
                }),
            ),
            "studentId",
        );
    }

    let subject = id_of(
        &sc.request_ok(
            "subjects.create",
            json!({
                "name": "Calculus", "code": "MAT101", "credits": 8,
                "weeklyHours": 5, "semester": 1, "careerId": career_id
            }),
        ),
        "subjectId",
    );
    let subject_b = id_of(
        &sc.request_ok(
            "subjects.create",
            json!({
                "name": "Physics", "code": "FIS101", "credits": 6,
                "weeklyHours": 4, "semester": 1, "careerId": career_id
            }),
        ),
        "subjectId",
    );

    let offering_a = id_of(
        &sc.request_ok(
            "offerings.create",
            json!({ "subjectId": subject, "teacherId": teacher_a, "cycle": "2024-2025" }),
        ),
        "offeringId",
    );
    let offering_b = id_of(
        &sc.request_ok(
            "offerings.create",
            json!({ "subjectId": subject_b, "teacherId": teacher_b, "cycle": "2024-2025" }),
        ),
        "offeringId",
    );

    let attached = sc.request_ok(
        "offerings.attachPeriods",
        json!({
            "offeringId": offering_a,
            "periods": [
                { "label": "P1", "startDate": "2024-08-26", "endDate": "2024-10-11",
                  "schoolCycle": "2024-2025", "weightPercent": 30 },
                { "label": "P2", "startDate": "2024-10-14", "endDate": "2024-11-29",
                  "schoolCycle": "2024-2025", "weightPercent": 30 },
                { "label": "P3", "startDate": "2024-12-02", "endDate": "2025-01-24",
                  "schoolCycle": "2024-2025", "weightPercent": 40 }
            ]
        }),
    );
    let ids: Vec<i64> = attached["periodIds"]
        .as_array()
        .expect("periodIds")
        .iter()
        .map(|v| v.as_i64().expect("period id"))
        .collect();
    let periods = [ids[0], ids[1], ids[2]];

    for student in students {
        sc.request_ok(
            "offerings.enrollStudent",
            json!({ "offeringId": offering_a, "studentId": student }),
        );
    }
    sc.request_ok(
        "offerings.enrollStudent",
        json!({ "offeringId": offering_b, "studentId": students[0] }),
    );

    School {
        workspace,
        teacher_a,
        teacher_b,
        students,
        offering_a,
        offering_b,
        periods,
    }
}
