use crate::auth::{self, Session};
use crate::db;
use crate::ipc::error::HandlerErr;
use crate::ipc::handlers::auth::check_password;
use crate::ipc::helpers::{
    begin, commit, delete_by_id, dispatch, ensure_exists, get_optional_bool, get_optional_i64,
    get_optional_str, get_required_bool, get_required_i64, get_required_str, normalize_email,
    ADMIN,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{types::Value as SqlValue, Connection};
use serde_json::json;
use tracing::info;

fn required_password(params: &serde_json::Value) -> Result<String, HandlerErr> {
    let password = params
        .get("password")
        .and_then(|v| v.as_str())
        .ok_or_else(|| HandlerErr::bad_params("missing password"))?;
    check_password(password)?;
    Ok(password.to_string())
}

/// Re-hashes under a fresh salt when `password` is present.
fn update_password(conn: &Connection, table: &str, id: i64, params: &serde_json::Value) -> Result<(), HandlerErr> {
    let Some(password) = params.get("password").and_then(|v| v.as_str()) else {
        return Ok(());
    };
    check_password(password)?;
    let salt = auth::new_salt();
    let sql = format!(
        "UPDATE {} SET password_hash = ?, password_salt = ? WHERE id = ?",
        table
    );
    conn.execute(&sql, (auth::hash_password(&salt, password), &salt, id))
        .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    Ok(())
}

/// Applies `column = value` for each text field present in `params`.
/// Callers run it inside a transaction so a rejected field undoes the rest.
fn update_text_fields(
    conn: &Connection,
    table: &str,
    id: i64,
    params: &serde_json::Value,
    fields: &[(&str, &str, bool)],
) -> Result<(), HandlerErr> {
    for (key, column, required) in fields {
        if params.get(*key).is_none() {
            continue;
        }
        let value = get_optional_str(params, key)?.filter(|s| !s.is_empty());
        if *required && value.is_none() {
            return Err(HandlerErr::bad_params(format!("{} must not be empty", key)));
        }
        let value = if *key == "email" {
            value.map(|v| normalize_email(&v)).transpose()?
        } else {
            value
        };
        let sql = format!(
            "UPDATE {} SET {} = ?, updated_at = ? WHERE id = ?",
            table, column
        );
        conn.execute(&sql, (&value, db::now_stamp(), id))
            .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    }
    Ok(())
}

fn teachers_list(conn: &Connection, _: &Session, _: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT t.id, t.first_name, t.last_name, t.email, t.phone,
                    (SELECT COUNT(*) FROM offerings o WHERE o.teacher_id = t.id)
             FROM teachers t
             ORDER BY t.last_name, t.first_name",
        )
        .map_err(HandlerErr::query)?;
    let teachers = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, i64>(0)?,
                "firstName": r.get::<_, String>(1)?,
                "lastName": r.get::<_, String>(2)?,
                "email": r.get::<_, String>(3)?,
                "phone": r.get::<_, Option<String>>(4)?,
                "offeringCount": r.get::<_, i64>(5)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "teachers": teachers }))
}

fn teachers_create(conn: &Connection, _: &Session, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let first_name = get_required_str(params, "firstName")?;
    let last_name = get_required_str(params, "lastName")?;
    let email = normalize_email(&get_required_str(params, "email")?)?;
    let phone = get_optional_str(params, "phone")?.filter(|s| !s.is_empty());
    let password = required_password(params)?;
    let salt = auth::new_salt();
    conn.execute(
        "INSERT INTO teachers(first_name, last_name, email, phone, password_hash, password_salt, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &first_name,
            &last_name,
            &email,
            &phone,
            auth::hash_password(&salt, &password),
            &salt,
            db::now_stamp(),
        ),
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", e))?;
    let teacher_id = conn.last_insert_rowid();
    info!(teacher_id, "teacher created");
    Ok(json!({ "teacherId": teacher_id }))
}

fn teachers_update(conn: &Connection, _: &Session, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let teacher_id = get_required_i64(params, "teacherId")?;
    ensure_exists(conn, "teachers", teacher_id, "teacher")?;
    let tx = begin(conn)?;
    update_text_fields(
        &tx,
        "teachers",
        teacher_id,
        params,
        &[
            ("firstName", "first_name", true),
            ("lastName", "last_name", true),
            ("email", "email", true),
            ("phone", "phone", false),
        ],
    )?;
    update_password(&tx, "teachers", teacher_id, params)?;
    commit(tx)?;
    Ok(json!({ "ok": true }))
}

fn teachers_delete(conn: &Connection, _: &Session, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let teacher_id = get_required_i64(params, "teacherId")?;
    delete_by_id(conn, "teachers", teacher_id, "teacher")
}

fn students_list(conn: &Connection, _: &Session, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let mut sql = String::from(
        "SELECT s.id, s.first_name, s.last_name, s.enrollment_no, s.email, s.phone, s.address,
                s.career_id, c.name, s.active
         FROM students s
         LEFT JOIN careers c ON c.id = s.career_id
         WHERE 1 = 1",
    );
    let mut args: Vec<SqlValue> = Vec::new();
    if let Some(career_id) = get_optional_i64(params, "careerId")? {
        sql.push_str(" AND s.career_id = ?");
        args.push(SqlValue::Integer(career_id));
    }
    if let Some(active) = get_optional_bool(params, "active")? {
        sql.push_str(" AND s.active = ?");
        args.push(SqlValue::Integer(active as i64));
    }
    sql.push_str(" ORDER BY s.last_name, s.first_name");
    let mut stmt = conn.prepare(&sql).map_err(HandlerErr::query)?;
    let students = stmt
        .query_map(rusqlite::params_from_iter(args), |r| {
            Ok(json!({
                "id": r.get::<_, i64>(0)?,
                "firstName": r.get::<_, String>(1)?,
                "lastName": r.get::<_, String>(2)?,
                "enrollmentNo": r.get::<_, String>(3)?,
                "email": r.get::<_, String>(4)?,
                "phone": r.get::<_, Option<String>>(5)?,
                "address": r.get::<_, Option<String>>(6)?,
                "careerId": r.get::<_, Option<i64>>(7)?,
                "careerName": r.get::<_, Option<String>>(8)?,
                "active": r.get::<_, i64>(9)? != 0,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "students": students }))
}

fn students_create(conn: &Connection, _: &Session, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let first_name = get_required_str(params, "firstName")?;
    let last_name = get_required_str(params, "lastName")?;
    let enrollment_no = get_required_str(params, "enrollmentNo")?.to_ascii_uppercase();
    let email = normalize_email(&get_required_str(params, "email")?)?;
    let phone = get_optional_str(params, "phone")?.filter(|s| !s.is_empty());
    let address = get_optional_str(params, "address")?.filter(|s| !s.is_empty());
    let career_id = get_optional_i64(params, "careerId")?;
    if let Some(id) = career_id {
        ensure_exists(conn, "careers", id, "career")?;
    }
    let password = required_password(params)?;
    let salt = auth::new_salt();
    conn.execute(
        "INSERT INTO students(
            first_name, last_name, enrollment_no, email, phone, address, career_id,
            active, password_hash, password_salt, created_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, 1, ?, ?, ?)",
        (
            &first_name,
            &last_name,
            &enrollment_no,
            &email,
            &phone,
            &address,
            career_id,
            auth::hash_password(&salt, &password),
            &salt,
            db::now_stamp(),
        ),
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", e))?;
    let student_id = conn.last_insert_rowid();
    info!(student_id, enrollment_no = %enrollment_no, "student created");
    Ok(json!({ "studentId": student_id }))
}

fn students_update(conn: &Connection, _: &Session, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_i64(params, "studentId")?;
    ensure_exists(conn, "students", student_id, "student")?;
    let tx = begin(conn)?;
    update_text_fields(
        &tx,
        "students",
        student_id,
        params,
        &[
            ("firstName", "first_name", true),
            ("lastName", "last_name", true),
            ("email", "email", true),
            ("phone", "phone", false),
            ("address", "address", false),
        ],
    )?;
    if params.get("careerId").is_some() {
        let career_id = get_optional_i64(params, "careerId")?;
        if let Some(id) = career_id {
            ensure_exists(&tx, "careers", id, "career")?;
        }
        tx.execute(
            "UPDATE students SET career_id = ?, updated_at = ? WHERE id = ?",
            (career_id, db::now_stamp(), student_id),
        )
        .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    }
    update_password(&tx, "students", student_id, params)?;
    commit(tx)?;
    Ok(json!({ "ok": true }))
}

fn students_set_status(conn: &Connection, _: &Session, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_i64(params, "studentId")?;
    let active = get_required_bool(params, "active")?;
    let changed = conn
        .execute(
            "UPDATE students SET active = ?, updated_at = ? WHERE id = ?",
            (active as i64, db::now_stamp(), student_id),
        )
        .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    if changed == 0 {
        return Err(HandlerErr::not_found("student not found"));
    }
    info!(student_id, active, "student status changed");
    Ok(json!({ "ok": true }))
}

fn students_delete(conn: &Connection, _: &Session, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_i64(params, "studentId")?;
    delete_by_id(conn, "students", student_id, "student")
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let resp = match req.method.as_str() {
        "teachers.list" => dispatch(state, req, ADMIN, teachers_list),
        "teachers.create" => dispatch(state, req, ADMIN, teachers_create),
        "teachers.update" => dispatch(state, req, ADMIN, teachers_update),
        "teachers.delete" => dispatch(state, req, ADMIN, teachers_delete),
        "students.list" => dispatch(state, req, ADMIN, students_list),
        "students.create" => dispatch(state, req, ADMIN, students_create),
        "students.update" => dispatch(state, req, ADMIN, students_update),
        "students.setStatus" => dispatch(state, req, ADMIN, students_set_status),
        "students.delete" => dispatch(state, req, ADMIN, students_delete),
        _ => return None,
    };
    Some(resp)
}
