use crate::auth::Session;
use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{
    begin, commit, delete_by_id, dispatch, ensure_exists, get_optional_i64, get_optional_str, get_required_i64,
    get_required_str, parse_iso_date, ADMIN,
};
use crate::ipc::types::{AppState, Request};
use chrono::Local;
use rusqlite::{types::Value as SqlValue, Connection, OptionalExtension};
use serde_json::json;
use tracing::info;

const ENROLLMENT_STATUSES: [&str; 3] = ["active", "dropped", "completed"];

fn check_status(raw: Option<String>) -> Result<String, HandlerErr> {
    let status = raw
        .filter(|s| !s.is_empty())
        .map(|s| s.to_ascii_lowercase())
        .unwrap_or_else(|| "active".to_string());
    if !ENROLLMENT_STATUSES.contains(&status.as_str()) {
        return Err(HandlerErr::bad_params(
            "status must be active, dropped or completed",
        ));
    }
    Ok(status)
}

fn check_refs(conn: &Connection, params: &serde_json::Value) -> Result<(Option<i64>, Option<i64>, Option<i64>), HandlerErr> {
    let career_id = get_optional_i64(params, "careerId")?;
    let shift_id = get_optional_i64(params, "shiftId")?;
    let tutor_id = get_optional_i64(params, "tutorTeacherId")?;
    if let Some(id) = career_id {
        ensure_exists(conn, "careers", id, "career")?;
    }
    if let Some(id) = shift_id {
        ensure_exists(conn, "shifts", id, "shift")?;
    }
    if let Some(id) = tutor_id {
        ensure_exists(conn, "teachers", id, "teacher")?;
    }
    Ok((career_id, shift_id, tutor_id))
}

/// Refuses another active enrollment once `capacity` seats are taken in
/// `cycle`. `exclude` leaves one enrollment out of the count.
fn ensure_seat(conn: &Connection, group_id: i64, cycle: &str, exclude: Option<i64>) -> Result<(), HandlerErr> {
    let (capacity, active): (i64, i64) = conn
        .query_row(
            "SELECT g.capacity,
                    (SELECT COUNT(*) FROM group_enrollments e
                     WHERE e.group_id = g.id AND e.cycle = ?1 AND e.status = 'active'
                       AND (?3 IS NULL OR e.id <> ?3))
             FROM class_groups g WHERE g.id = ?2",
            (cycle, group_id, exclude),
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(HandlerErr::query)?
        .ok_or_else(|| HandlerErr::not_found("group not found"))?;
    if active >= capacity {
        return Err(HandlerErr::conflict("group is at capacity")
            .with_details(json!({ "capacity": capacity, "active": active })));
    }
    Ok(())
}

fn groups_list(conn: &Connection, _: &Session, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    // Capacity applies per cycle, so `cycle` narrows the active count.
    let cycle = get_optional_str(params, "cycle")?.filter(|s| !s.is_empty());
    let mut sql = String::from(
        "SELECT g.id, g.name, g.semester, g.career_id, c.name, g.shift_id, sh.name,
                g.tutor_teacher_id, g.capacity,
                (SELECT COUNT(*) FROM group_enrollments e
                 WHERE e.group_id = g.id AND e.status = 'active'
                   AND (?1 IS NULL OR e.cycle = ?1))
         FROM class_groups g
         LEFT JOIN careers c ON c.id = g.career_id
         LEFT JOIN shifts sh ON sh.id = g.shift_id
         WHERE 1 = 1",
    );
    let mut args: Vec<SqlValue> = vec![cycle.map_or(SqlValue::Null, SqlValue::Text)];
    if let Some(career_id) = get_optional_i64(params, "careerId")? {
        sql.push_str(" AND g.career_id = ?2");
        args.push(SqlValue::Integer(career_id));
    }
    sql.push_str(" ORDER BY g.semester, g.name");
    let mut stmt = conn.prepare(&sql).map_err(HandlerErr::query)?;
    let groups = stmt
        .query_map(rusqlite::params_from_iter(args), |r| {
            Ok(json!({
                "id": r.get::<_, i64>(0)?,
                "name": r.get::<_, String>(1)?,
                "semester": r.get::<_, i64>(2)?,
                "careerId": r.get::<_, Option<i64>>(3)?,
                "careerName": r.get::<_, Option<String>>(4)?,
                "shiftId": r.get::<_, Option<i64>>(5)?,
                "shiftName": r.get::<_, Option<String>>(6)?,
                "tutorTeacherId": r.get::<_, Option<i64>>(7)?,
                "capacity": r.get::<_, i64>(8)?,
                "activeEnrollments": r.get::<_, i64>(9)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "groups": groups }))
}

fn groups_create(conn: &Connection, _: &Session, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let name = get_required_str(params, "name")?;
    let semester = get_required_i64(params, "semester")?;
    let capacity = get_required_i64(params, "capacity")?;
    if semester < 1 || capacity < 1 {
        return Err(HandlerErr::bad_params("semester and capacity must be 1 or greater"));
    }
    let (career_id, shift_id, tutor_id) = check_refs(conn, params)?;
    conn.execute(
        "INSERT INTO class_groups(name, semester, career_id, shift_id, tutor_teacher_id, capacity)
         VALUES(?, ?, ?, ?, ?, ?)",
        (&name, semester, career_id, shift_id, tutor_id, capacity),
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", e))?;
    let group_id = conn.last_insert_rowid();
    info!(group_id, name = %name, "group created");
    Ok(json!({ "groupId": group_id }))
}

fn groups_update(conn: &Connection, _: &Session, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let group_id = get_required_i64(params, "groupId")?;
    ensure_exists(conn, "class_groups", group_id, "group")?;
    let (career_id, shift_id, tutor_id) = check_refs(conn, params)?;
    let tx = begin(conn)?;
    if let Some(name) = get_optional_str(params, "name")?.filter(|s| !s.is_empty()) {
        tx.execute("UPDATE class_groups SET name = ? WHERE id = ?", (&name, group_id))
            .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    }
    if let Some(capacity) = get_optional_i64(params, "capacity")? {
        if capacity < 1 {
            return Err(HandlerErr::bad_params("capacity must be 1 or greater"));
        }
        tx.execute(
            "UPDATE class_groups SET capacity = ? WHERE id = ?",
            (capacity, group_id),
        )
        .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    }
    for (key, column, value) in [
        ("careerId", "career_id", career_id),
        ("shiftId", "shift_id", shift_id),
        ("tutorTeacherId", "tutor_teacher_id", tutor_id),
    ] {
        if params.get(key).is_none() {
            continue;
        }
        let sql = format!("UPDATE class_groups SET {} = ? WHERE id = ?", column);
        tx.execute(&sql, (value, group_id))
            .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    }
    commit(tx)?;
    Ok(json!({ "ok": true }))
}

fn groups_delete(conn: &Connection, _: &Session, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let group_id = get_required_i64(params, "groupId")?;
    delete_by_id(conn, "class_groups", group_id, "group")
}

fn enrollments_list(conn: &Connection, _: &Session, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let mut sql = String::from(
        "SELECT e.id, e.student_id, s.last_name, s.first_name, s.enrollment_no,
                e.group_id, g.name, e.cycle, e.enrolled_on, e.status
         FROM group_enrollments e
         JOIN students s ON s.id = e.student_id
         JOIN class_groups g ON g.id = e.group_id
         WHERE 1 = 1",
    );
    let mut args: Vec<SqlValue> = Vec::new();
    if let Some(group_id) = get_optional_i64(params, "groupId")? {
        sql.push_str(" AND e.group_id = ?");
        args.push(SqlValue::Integer(group_id));
    }
    if let Some(student_id) = get_optional_i64(params, "studentId")? {
        sql.push_str(" AND e.student_id = ?");
        args.push(SqlValue::Integer(student_id));
    }
    sql.push_str(" ORDER BY e.cycle DESC, g.name, s.last_name, s.first_name");
    let mut stmt = conn.prepare(&sql).map_err(HandlerErr::query)?;
    let enrollments = stmt
        .query_map(rusqlite::params_from_iter(args), |r| {
            let last: String = r.get(2)?;
            let first: String = r.get(3)?;
            Ok(json!({
                "id": r.get::<_, i64>(0)?,
                "studentId": r.get::<_, i64>(1)?,
                "studentName": format!("{}, {}", last, first),
                "enrollmentNo": r.get::<_, String>(4)?,
                "groupId": r.get::<_, i64>(5)?,
                "groupName": r.get::<_, String>(6)?,
                "cycle": r.get::<_, String>(7)?,
                "enrolledOn": r.get::<_, String>(8)?,
                "status": r.get::<_, String>(9)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "enrollments": enrollments }))
}

fn enrollments_create(conn: &Connection, _: &Session, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_i64(params, "studentId")?;
    let group_id = get_required_i64(params, "groupId")?;
    let cycle = get_required_str(params, "cycle")?;
    ensure_exists(conn, "students", student_id, "student")?;
    let enrolled_on = match get_optional_str(params, "enrolledOn")?.filter(|s| !s.is_empty()) {
        Some(raw) => parse_iso_date("enrolledOn", &raw)?,
        None => Local::now().date_naive(),
    };
    let status = check_status(get_optional_str(params, "status")?)?;

    if status == "active" {
        ensure_seat(conn, group_id, &cycle, None)?;
    } else {
        ensure_exists(conn, "class_groups", group_id, "group")?;
    }

    conn.execute(
        "INSERT INTO group_enrollments(student_id, group_id, cycle, enrolled_on, status)
         VALUES(?, ?, ?, ?, ?)",
        (
            student_id,
            group_id,
            &cycle,
            enrolled_on.format("%Y-%m-%d").to_string(),
            &status,
        ),
    )
    .map_err(|e| {
        let mapped = HandlerErr::db("db_insert_failed", e);
        if mapped.code == "conflict" {
            HandlerErr::conflict("student is already enrolled in this group for the cycle")
        } else {
            mapped
        }
    })?;
    let enrollment_id = conn.last_insert_rowid();
    info!(enrollment_id, student_id, group_id, cycle = %cycle, "group enrollment created");
    Ok(json!({ "enrollmentId": enrollment_id }))
}

fn enrollments_set_status(conn: &Connection, _: &Session, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let enrollment_id = get_required_i64(params, "enrollmentId")?;
    let status = check_status(Some(get_required_str(params, "status")?))?;
    let (group_id, cycle, current): (i64, String, String) = conn
        .query_row(
            "SELECT group_id, cycle, status FROM group_enrollments WHERE id = ?",
            [enrollment_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
        .map_err(HandlerErr::query)?
        .ok_or_else(|| HandlerErr::not_found("enrollment not found"))?;
    if status == "active" && current != "active" {
        ensure_seat(conn, group_id, &cycle, Some(enrollment_id))?;
    }
    conn.execute(
        "UPDATE group_enrollments SET status = ? WHERE id = ?",
        (&status, enrollment_id),
    )
    .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    info!(enrollment_id, status = %status, "group enrollment status changed");
    Ok(json!({ "ok": true }))
}

fn enrollments_delete(conn: &Connection, _: &Session, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let enrollment_id = get_required_i64(params, "enrollmentId")?;
    delete_by_id(conn, "group_enrollments", enrollment_id, "enrollment")
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let resp = match req.method.as_str() {
        "groups.list" => dispatch(state, req, ADMIN, groups_list),
        "groups.create" => dispatch(state, req, ADMIN, groups_create),
        "groups.update" => dispatch(state, req, ADMIN, groups_update),
        "groups.delete" => dispatch(state, req, ADMIN, groups_delete),
        "enrollments.list" => dispatch(state, req, ADMIN, enrollments_list),
        "enrollments.create" => dispatch(state, req, ADMIN, enrollments_create),
        "enrollments.setStatus" => dispatch(state, req, ADMIN, enrollments_set_status),
        "enrollments.delete" => dispatch(state, req, ADMIN, enrollments_delete),
        _ => return None,
    };
    Some(resp)
}
