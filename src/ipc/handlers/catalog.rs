use crate::auth::Session;
use crate::db;
use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{
    begin, commit, count, delete_by_id, dispatch, ensure_exists, get_optional_i64, get_optional_str,
    get_required_i64, get_required_str, ADMIN, ANY_ROLE,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{types::Value as SqlValue, Connection};
use serde_json::json;
use tracing::info;

fn careers_list(conn: &Connection, _: &Session, _: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT c.id, c.name, c.code, c.description,
                    (SELECT COUNT(*) FROM students s WHERE s.career_id = c.id),
                    (SELECT COUNT(*) FROM subjects j WHERE j.career_id = c.id)
             FROM careers c
             ORDER BY c.name",
        )
        .map_err(HandlerErr::query)?;
    let careers = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, i64>(0)?,
                "name": r.get::<_, String>(1)?,
                "code": r.get::<_, String>(2)?,
                "description": r.get::<_, String>(3)?,
                "studentCount": r.get::<_, i64>(4)?,
                "subjectCount": r.get::<_, i64>(5)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "careers": careers }))
}

fn careers_create(conn: &Connection, _: &Session, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let name = get_required_str(params, "name")?;
    let code = get_required_str(params, "code")?.to_ascii_uppercase();
    let description = get_optional_str(params, "description")?.unwrap_or_default();
    conn.execute(
        "INSERT INTO careers(name, code, description, created_at) VALUES(?, ?, ?, ?)",
        (&name, &code, &description, db::now_stamp()),
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", e))?;
    let career_id = conn.last_insert_rowid();
    info!(career_id, code = %code, "career created");
    Ok(json!({ "careerId": career_id }))
}

fn careers_update(conn: &Connection, _: &Session, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let career_id = get_required_i64(params, "careerId")?;
    ensure_exists(conn, "careers", career_id, "career")?;
    let tx = begin(conn)?;
    if let Some(name) = get_optional_str(params, "name")?.filter(|s| !s.is_empty()) {
        tx.execute("UPDATE careers SET name = ? WHERE id = ?", (&name, career_id))
            .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    }
    if let Some(code) = get_optional_str(params, "code")?.filter(|s| !s.is_empty()) {
        tx.execute(
            "UPDATE careers SET code = ? WHERE id = ?",
            (code.to_ascii_uppercase(), career_id),
        )
        .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    }
    if let Some(description) = get_optional_str(params, "description")? {
        tx.execute(
            "UPDATE careers SET description = ? WHERE id = ?",
            (&description, career_id),
        )
        .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    }
    commit(tx)?;
    Ok(json!({ "ok": true }))
}

fn careers_delete(conn: &Connection, _: &Session, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let career_id = get_required_i64(params, "careerId")?;
    delete_by_id(conn, "careers", career_id, "career")
}

fn subject_json(r: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "id": r.get::<_, i64>(0)?,
        "name": r.get::<_, String>(1)?,
        "code": r.get::<_, String>(2)?,
        "credits": r.get::<_, i64>(3)?,
        "weeklyHours": r.get::<_, i64>(4)?,
        "semester": r.get::<_, i64>(5)?,
        "careerId": r.get::<_, Option<i64>>(6)?,
        "description": r.get::<_, Option<String>>(7)?,
    }))
}

fn subjects_list(conn: &Connection, _: &Session, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let mut sql = String::from(
        "SELECT id, name, code, credits, weekly_hours, semester, career_id, description
         FROM subjects WHERE 1 = 1",
    );
    let mut args: Vec<SqlValue> = Vec::new();
    if let Some(career_id) = get_optional_i64(params, "careerId")? {
        sql.push_str(" AND career_id = ?");
        args.push(SqlValue::Integer(career_id));
    }
    if let Some(semester) = get_optional_i64(params, "semester")? {
        sql.push_str(" AND semester = ?");
        args.push(SqlValue::Integer(semester));
    }
    sql.push_str(" ORDER BY semester, name");
    let mut stmt = conn.prepare(&sql).map_err(HandlerErr::query)?;
    let subjects = stmt
        .query_map(rusqlite::params_from_iter(args), subject_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "subjects": subjects }))
}

fn positive_or_default(params: &serde_json::Value, key: &str, default: i64) -> Result<i64, HandlerErr> {
    let v = get_optional_i64(params, key)?.unwrap_or(default);
    if v < 0 {
        return Err(HandlerErr::bad_params(format!("{} must not be negative", key)));
    }
    Ok(v)
}

fn subjects_create(conn: &Connection, _: &Session, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let name = get_required_str(params, "name")?;
    let code = get_required_str(params, "code")?.to_ascii_uppercase();
    let credits = positive_or_default(params, "credits", 0)?;
    let weekly_hours = positive_or_default(params, "weeklyHours", 0)?;
    let semester = get_required_i64(params, "semester")?;
    if semester < 1 {
        return Err(HandlerErr::bad_params("semester must be 1 or greater"));
    }
    let career_id = get_optional_i64(params, "careerId")?;
    if let Some(id) = career_id {
        ensure_exists(conn, "careers", id, "career")?;
    }
    let description = get_optional_str(params, "description")?;
    conn.execute(
        "INSERT INTO subjects(name, code, credits, weekly_hours, semester, career_id, description)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (&name, &code, credits, weekly_hours, semester, career_id, &description),
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", e))?;
    let subject_id = conn.last_insert_rowid();
    info!(subject_id, code = %code, "subject created");
    Ok(json!({ "subjectId": subject_id }))
}

fn subjects_update(conn: &Connection, _: &Session, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let subject_id = get_required_i64(params, "subjectId")?;
    let current = conn
        .query_row(
            "SELECT id, name, code, credits, weekly_hours, semester, career_id, description
             FROM subjects WHERE id = ?",
            [subject_id],
            subject_json,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => HandlerErr::not_found("subject not found"),
            other => HandlerErr::query(other),
        })?;

    let name = get_optional_str(params, "name")?
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| current["name"].as_str().unwrap_or_default().to_string());
    let code = get_optional_str(params, "code")?
        .filter(|s| !s.is_empty())
        .map(|s| s.to_ascii_uppercase())
        .unwrap_or_else(|| current["code"].as_str().unwrap_or_default().to_string());
    let credits = positive_or_default(params, "credits", current["credits"].as_i64().unwrap_or(0))?;
    let weekly_hours =
        positive_or_default(params, "weeklyHours", current["weeklyHours"].as_i64().unwrap_or(0))?;
    let semester = positive_or_default(params, "semester", current["semester"].as_i64().unwrap_or(1))?;
    let career_id = match params.get("careerId") {
        Some(_) => get_optional_i64(params, "careerId")?,
        None => current["careerId"].as_i64(),
    };
    if let Some(id) = career_id {
        ensure_exists(conn, "careers", id, "career")?;
    }
    let description = match params.get("description") {
        Some(_) => get_optional_str(params, "description")?,
        None => current["description"].as_str().map(str::to_string),
    };

    conn.execute(
        "UPDATE subjects
         SET name = ?, code = ?, credits = ?, weekly_hours = ?, semester = ?,
             career_id = ?, description = ?
         WHERE id = ?",
        (
            &name,
            &code,
            credits,
            weekly_hours,
            semester,
            career_id,
            &description,
            subject_id,
        ),
    )
    .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    Ok(json!({ "ok": true }))
}

fn subjects_delete(conn: &Connection, _: &Session, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let subject_id = get_required_i64(params, "subjectId")?;
    delete_by_id(conn, "subjects", subject_id, "subject")
}

fn shifts_list(conn: &Connection, _: &Session, _: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT id, name FROM shifts ORDER BY name")
        .map_err(HandlerErr::query)?;
    let shifts = stmt
        .query_map([], |r| {
            Ok(json!({ "id": r.get::<_, i64>(0)?, "name": r.get::<_, String>(1)? }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "shifts": shifts }))
}

fn shifts_create(conn: &Connection, _: &Session, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let name = get_required_str(params, "name")?;
    conn.execute("INSERT INTO shifts(name) VALUES(?)", [&name])
        .map_err(|e| HandlerErr::db("db_insert_failed", e))?;
    Ok(json!({ "shiftId": conn.last_insert_rowid() }))
}

fn shifts_delete(conn: &Connection, _: &Session, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let shift_id = get_required_i64(params, "shiftId")?;
    delete_by_id(conn, "shifts", shift_id, "shift")
}

fn stats_overview(conn: &Connection, _: &Session, _: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    Ok(json!({
        "careers": count(conn, "SELECT COUNT(*) FROM careers")?,
        "subjects": count(conn, "SELECT COUNT(*) FROM subjects")?,
        "teachers": count(conn, "SELECT COUNT(*) FROM teachers")?,
        "students": count(conn, "SELECT COUNT(*) FROM students")?,
        "activeStudents": count(conn, "SELECT COUNT(*) FROM students WHERE active = 1")?,
        "groups": count(conn, "SELECT COUNT(*) FROM class_groups")?,
        "offerings": count(conn, "SELECT COUNT(*) FROM offerings")?,
        "periods": count(conn, "SELECT COUNT(*) FROM evaluation_periods")?,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let resp = match req.method.as_str() {
        "careers.list" => dispatch(state, req, ANY_ROLE, careers_list),
        "careers.create" => dispatch(state, req, ADMIN, careers_create),
        "careers.update" => dispatch(state, req, ADMIN, careers_update),
        "careers.delete" => dispatch(state, req, ADMIN, careers_delete),
        "subjects.list" => dispatch(state, req, ANY_ROLE, subjects_list),
        "subjects.create" => dispatch(state, req, ADMIN, subjects_create),
        "subjects.update" => dispatch(state, req, ADMIN, subjects_update),
        "subjects.delete" => dispatch(state, req, ADMIN, subjects_delete),
        "shifts.list" => dispatch(state, req, ANY_ROLE, shifts_list),
        "shifts.create" => dispatch(state, req, ADMIN, shifts_create),
        "shifts.delete" => dispatch(state, req, ADMIN, shifts_delete),
        "stats.overview" => dispatch(state, req, ADMIN, stats_overview),
        _ => return None,
    };
    Some(resp)
}
