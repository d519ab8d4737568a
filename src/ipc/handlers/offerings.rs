use crate::auth::{Role, Session};
use crate::calc;
use crate::db;
use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{
    begin, commit, delete_by_id, dispatch, ensure_exists, ensure_offering_access, get_optional_i64,
    get_optional_str, get_required_i64, get_required_str, parse_hhmm, row_exists, ADMIN, STAFF,
    TEACHER,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{types::Value as SqlValue, Connection};
use serde_json::json;
use tracing::info;

pub const CURRENT_CYCLE_KEY: &str = "school.currentCycle";

const WEEKDAYS: [&str; 7] = [
    "monday",
    "tuesday",
    "wednesday",
    "thursday",
    "friday",
    "saturday",
    "sunday",
];

fn list_offerings(conn: &Connection, teacher_id: Option<i64>) -> Result<Vec<serde_json::Value>, HandlerErr> {
    let mut sql = String::from(
        "SELECT o.id, o.cycle, s.id, s.name, s.code, t.id, t.first_name, t.last_name,
                (SELECT COUNT(*) FROM offering_students os WHERE os.offering_id = o.id)
         FROM offerings o
         JOIN subjects s ON s.id = o.subject_id
         JOIN teachers t ON t.id = o.teacher_id",
    );
    let mut args: Vec<SqlValue> = Vec::new();
    if let Some(id) = teacher_id {
        sql.push_str(" WHERE o.teacher_id = ?");
        args.push(SqlValue::Integer(id));
    }
    sql.push_str(" ORDER BY o.cycle DESC, s.name");
    let mut stmt = conn.prepare(&sql).map_err(HandlerErr::query)?;
    stmt.query_map(rusqlite::params_from_iter(args), |r| {
        let first: String = r.get(6)?;
        let last: String = r.get(7)?;
        Ok(json!({
            "id": r.get::<_, i64>(0)?,
            "cycle": r.get::<_, String>(1)?,
            "subjectId": r.get::<_, i64>(2)?,
            "subjectName": r.get::<_, String>(3)?,
            "subjectCode": r.get::<_, String>(4)?,
            "teacherId": r.get::<_, i64>(5)?,
            "teacherName": format!("{} {}", first, last),
            "studentCount": r.get::<_, i64>(8)?,
        }))
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(HandlerErr::query)
}

fn offerings_list(conn: &Connection, _: &Session, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let teacher_id = get_optional_i64(params, "teacherId")?;
    Ok(json!({ "offerings": list_offerings(conn, teacher_id)? }))
}

fn offerings_mine(conn: &Connection, session: &Session, _: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    Ok(json!({ "offerings": list_offerings(conn, Some(session.actor_id))? }))
}

/// Explicit `cycle`, else the workspace's current cycle setting.
fn resolve_cycle(conn: &Connection, params: &serde_json::Value) -> Result<String, HandlerErr> {
    if let Some(cycle) = get_optional_str(params, "cycle")?.filter(|s| !s.is_empty()) {
        return Ok(cycle);
    }
    let setting = db::settings_get_json(conn, CURRENT_CYCLE_KEY)
        .map_err(|e| HandlerErr::new("db_query_failed", format!("{e:#}")))?;
    setting
        .as_ref()
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            HandlerErr::bad_params(format!(
                "missing cycle (and no {} setting)",
                CURRENT_CYCLE_KEY
            ))
        })
}

fn offerings_create(conn: &Connection, _: &Session, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let subject_id = get_required_i64(params, "subjectId")?;
    let teacher_id = get_required_i64(params, "teacherId")?;
    ensure_exists(conn, "subjects", subject_id, "subject")?;
    ensure_exists(conn, "teachers", teacher_id, "teacher")?;
    let cycle = resolve_cycle(conn, params)?;
    conn.execute(
        "INSERT INTO offerings(subject_id, teacher_id, cycle, created_at) VALUES(?, ?, ?, ?)",
        (subject_id, teacher_id, &cycle, db::now_stamp()),
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", e))?;
    let offering_id = conn.last_insert_rowid();
    info!(offering_id, subject_id, teacher_id, cycle = %cycle, "offering created");
    Ok(json!({ "offeringId": offering_id, "cycle": cycle }))
}

fn offerings_update(conn: &Connection, _: &Session, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let offering_id = get_required_i64(params, "offeringId")?;
    ensure_exists(conn, "offerings", offering_id, "offering")?;
    let tx = begin(conn)?;
    if let Some(teacher_id) = get_optional_i64(params, "teacherId")? {
        ensure_exists(&tx, "teachers", teacher_id, "teacher")?;
        tx.execute(
            "UPDATE offerings SET teacher_id = ? WHERE id = ?",
            (teacher_id, offering_id),
        )
        .map_err(|e| HandlerErr::db("db_update_failed", e))?;
        info!(offering_id, teacher_id, "offering reassigned");
    }
    if let Some(cycle) = get_optional_str(params, "cycle")?.filter(|s| !s.is_empty()) {
        tx.execute("UPDATE offerings SET cycle = ? WHERE id = ?", (&cycle, offering_id))
            .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    }
    commit(tx)?;
    Ok(json!({ "ok": true }))
}

fn offerings_delete(conn: &Connection, _: &Session, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let offering_id = get_required_i64(params, "offeringId")?;
    ensure_exists(conn, "offerings", offering_id, "offering")?;
    if row_exists(
        conn,
        "SELECT 1 FROM offering_students WHERE offering_id = ?1
         UNION ALL SELECT 1 FROM grades WHERE offering_id = ?1
         UNION ALL SELECT 1 FROM attendance WHERE offering_id = ?1
         LIMIT 1",
        offering_id,
    )? {
        return Err(HandlerErr::conflict(
            "offering has enrolled students or recorded grades/attendance",
        ));
    }
    // Schedule slots and period links go with the offering.
    let tx = begin(conn)?;
    tx.execute("DELETE FROM schedule_slots WHERE offering_id = ?", [offering_id])
        .map_err(|e| HandlerErr::db("db_delete_failed", e))?;
    tx.execute("DELETE FROM offering_periods WHERE offering_id = ?", [offering_id])
        .map_err(|e| HandlerErr::db("db_delete_failed", e))?;
    let result = delete_by_id(&tx, "offerings", offering_id, "offering")?;
    commit(tx)?;
    info!(offering_id, "offering deleted");
    Ok(result)
}

fn offerings_enroll_student(conn: &Connection, _: &Session, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let offering_id = get_required_i64(params, "offeringId")?;
    let student_id = get_required_i64(params, "studentId")?;
    ensure_exists(conn, "offerings", offering_id, "offering")?;
    ensure_exists(conn, "students", student_id, "student")?;
    conn.execute(
        "INSERT INTO offering_students(offering_id, student_id, created_at) VALUES(?, ?, ?)",
        (offering_id, student_id, db::now_stamp()),
    )
    .map_err(|e| {
        let mapped = HandlerErr::db("db_insert_failed", e);
        if mapped.code == "conflict" {
            HandlerErr::conflict("student is already enrolled in this offering")
        } else {
            mapped
        }
    })?;
    info!(offering_id, student_id, "student enrolled in offering");
    Ok(json!({ "ok": true }))
}

fn offerings_unenroll_student(conn: &Connection, _: &Session, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let offering_id = get_required_i64(params, "offeringId")?;
    let student_id = get_required_i64(params, "studentId")?;
    let changed = conn
        .execute(
            "DELETE FROM offering_students WHERE offering_id = ? AND student_id = ?",
            (offering_id, student_id),
        )
        .map_err(|e| HandlerErr::db("db_delete_failed", e))?;
    if changed == 0 {
        return Err(HandlerErr::not_found("student is not enrolled in this offering"));
    }
    Ok(json!({ "ok": true }))
}

fn offerings_roster(conn: &Connection, session: &Session, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let offering_id = get_required_i64(params, "offeringId")?;
    ensure_offering_access(conn, session, offering_id)?;
    let students = calc::load_roster(conn, offering_id)?;
    Ok(json!({ "offeringId": offering_id, "students": students }))
}

fn schedules_list(conn: &Connection, session: &Session, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let offering_id = get_optional_i64(params, "offeringId")?;
    let mut sql = String::from(
        "SELECT ss.id, ss.offering_id, ss.weekday, ss.start_time, ss.end_time, ss.room
         FROM schedule_slots ss
         JOIN offerings o ON o.id = ss.offering_id
         WHERE 1 = 1",
    );
    let mut args: Vec<SqlValue> = Vec::new();
    if let Some(id) = offering_id {
        sql.push_str(" AND ss.offering_id = ?");
        args.push(SqlValue::Integer(id));
    }
    if session.role == Role::Teacher {
        sql.push_str(" AND o.teacher_id = ?");
        args.push(SqlValue::Integer(session.actor_id));
    }
    sql.push_str(
        " ORDER BY ss.offering_id,
           CASE ss.weekday
             WHEN 'monday' THEN 1 WHEN 'tuesday' THEN 2 WHEN 'wednesday' THEN 3
             WHEN 'thursday' THEN 4 WHEN 'friday' THEN 5 WHEN 'saturday' THEN 6
             ELSE 7 END,
           ss.start_time",
    );
    let mut stmt = conn.prepare(&sql).map_err(HandlerErr::query)?;
    let slots = stmt
        .query_map(rusqlite::params_from_iter(args), |r| {
            Ok(json!({
                "id": r.get::<_, i64>(0)?,
                "offeringId": r.get::<_, i64>(1)?,
                "weekday": r.get::<_, String>(2)?,
                "start": r.get::<_, String>(3)?,
                "end": r.get::<_, String>(4)?,
                "room": r.get::<_, String>(5)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "slots": slots }))
}

fn schedules_create(conn: &Connection, _: &Session, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let offering_id = get_required_i64(params, "offeringId")?;
    ensure_exists(conn, "offerings", offering_id, "offering")?;
    let weekday = get_required_str(params, "weekday")?.to_ascii_lowercase();
    if !WEEKDAYS.contains(&weekday.as_str()) {
        return Err(HandlerErr::bad_params("weekday must be monday..sunday"));
    }
    let start = parse_hhmm("start", &get_required_str(params, "start")?)?;
    let end = parse_hhmm("end", &get_required_str(params, "end")?)?;
    if start >= end {
        return Err(HandlerErr::bad_params("start must be before end"));
    }
    let room = get_required_str(params, "room")?;
    conn.execute(
        "INSERT INTO schedule_slots(offering_id, weekday, start_time, end_time, room)
         VALUES(?, ?, ?, ?, ?)",
        (
            offering_id,
            &weekday,
            start.format("%H:%M").to_string(),
            end.format("%H:%M").to_string(),
            &room,
        ),
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", e))?;
    Ok(json!({ "slotId": conn.last_insert_rowid() }))
}

fn schedules_delete(conn: &Connection, _: &Session, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let slot_id = get_required_i64(params, "slotId")?;
    delete_by_id(conn, "schedule_slots", slot_id, "schedule slot")
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let resp = match req.method.as_str() {
        "offerings.list" => dispatch(state, req, ADMIN, offerings_list),
        "offerings.mine" => dispatch(state, req, TEACHER, offerings_mine),
        "offerings.create" => dispatch(state, req, ADMIN, offerings_create),
        "offerings.update" => dispatch(state, req, ADMIN, offerings_update),
        "offerings.delete" => dispatch(state, req, ADMIN, offerings_delete),
        "offerings.enrollStudent" => dispatch(state, req, ADMIN, offerings_enroll_student),
        "offerings.unenrollStudent" => dispatch(state, req, ADMIN, offerings_unenroll_student),
        "offerings.roster" => dispatch(state, req, STAFF, offerings_roster),
        "schedules.list" => dispatch(state, req, STAFF, schedules_list),
        "schedules.create" => dispatch(state, req, ADMIN, schedules_create),
        "schedules.delete" => dispatch(state, req, ADMIN, schedules_delete),
        _ => return None,
    };
    Some(resp)
}
