use crate::auth::{Role, Session};
use crate::calc;
use crate::db::{self, SqliteStore};
use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{
    delete_by_id, dispatch, ensure_offering_access, get_optional_i64, get_required_i64, ADMIN,
    STAFF, TEACHER,
};
use crate::ipc::types::{AppState, Request};
use crate::reconcile::{self, Ledger};
use rusqlite::{types::Value as SqlValue, Connection, OptionalExtension};
use serde_json::{json, Map};
use tracing::info;

fn grades_reconcile(conn: &Connection, session: &Session, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let Some(data) = params.get("data") else {
        return Err(HandlerErr::bad_params("missing data"));
    };
    let batches = match params.get("periodId") {
        Some(period) if !period.is_null() => reconcile::flatten_single_period(period, data),
        _ => reconcile::flatten_nested(data),
    }
    .map_err(|e| HandlerErr::bad_params(e.to_string()))?;

    let store = SqliteStore::new(conn);
    let report = reconcile::reconcile(&store, session.actor_id, Ledger::Grades, &batches);
    Ok(report.to_json(Ledger::Grades))
}

/// `{offering: {student: {period: score}}}` for the offerings the actor may see.
fn grades_get(conn: &Connection, session: &Session, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let mut sql = String::from(
        "SELECT o.id, os.student_id, g.period_id, g.score
         FROM offerings o
         JOIN offering_students os ON os.offering_id = o.id
         LEFT JOIN grades g ON g.offering_id = o.id AND g.student_id = os.student_id",
    );
    let mut args: Vec<SqlValue> = Vec::new();
    if let Some(period_id) = get_optional_i64(params, "periodId")? {
        sql.push_str(" AND g.period_id = ?");
        args.push(SqlValue::Integer(period_id));
    }
    let teacher_filter = match session.role {
        Role::Teacher => Some(session.actor_id),
        _ => get_optional_i64(params, "teacherId")?,
    };
    if let Some(teacher_id) = teacher_filter {
        sql.push_str(" WHERE o.teacher_id = ?");
        args.push(SqlValue::Integer(teacher_id));
    }
    sql.push_str(" ORDER BY o.id, os.student_id, g.period_id");

    let mut stmt = conn.prepare(&sql).map_err(HandlerErr::query)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(args), |r| {
            Ok((
                r.get::<_, i64>(0)?,
                r.get::<_, i64>(1)?,
                r.get::<_, Option<i64>>(2)?,
                r.get::<_, Option<f64>>(3)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;

    let mut out = Map::new();
    for (offering_id, student_id, period_id, score) in rows {
        let students = out
            .entry(offering_id.to_string())
            .or_insert_with(|| json!({}));
        let periods = students
            .as_object_mut()
            .map(|m| m.entry(student_id.to_string()).or_insert_with(|| json!({})));
        if let (Some(periods), Some(period_id), Some(score)) = (periods, period_id, score) {
            if let Some(m) = periods.as_object_mut() {
                m.insert(period_id.to_string(), json!(score));
            }
        }
    }
    Ok(serde_json::Value::Object(out))
}

fn grades_summary(conn: &Connection, session: &Session, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let offering_id = get_required_i64(params, "offeringId")?;
    ensure_offering_access(conn, session, offering_id)?;
    let summary = calc::offering_summary(conn, offering_id)?;
    serde_json::to_value(summary).map_err(|e| HandlerErr::new("internal", e.to_string()))
}

fn grades_update(conn: &Connection, _: &Session, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let grade_id = get_required_i64(params, "gradeId")?;
    let (score, absences, notes): (f64, i64, Option<String>) = conn
        .query_row(
            "SELECT score, absences, notes FROM grades WHERE id = ?",
            [grade_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
        .map_err(HandlerErr::query)?
        .ok_or_else(|| HandlerErr::not_found("grade not found"))?;

    let merged = json!({
        "score": params.get("score").cloned().unwrap_or(json!(score)),
        "absences": params.get("absences").cloned().unwrap_or(serde_json::Value::Null),
        "notes": params.get("notes").cloned().unwrap_or(json!(notes)),
    });
    let (score, new_absences, notes) = reconcile::parse_grade_value(&merged)
        .map_err(|e| HandlerErr::bad_params(e.to_string()))?;

    // Absent or null absences keep the stored count.
    conn.execute(
        "UPDATE grades SET score = ?, absences = ?, notes = ?, updated_at = ? WHERE id = ?",
        (score, new_absences.unwrap_or(absences), &notes, db::now_stamp(), grade_id),
    )
    .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    info!(grade_id, score, "grade edited");
    Ok(json!({ "ok": true }))
}

fn grades_delete(conn: &Connection, _: &Session, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let grade_id = get_required_i64(params, "gradeId")?;
    let result = delete_by_id(conn, "grades", grade_id, "grade")?;
    info!(grade_id, "grade deleted");
    Ok(result)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let resp = match req.method.as_str() {
        "grades.reconcile" => dispatch(state, req, TEACHER, grades_reconcile),
        "grades.get" => dispatch(state, req, STAFF, grades_get),
        "grades.summary" => dispatch(state, req, STAFF, grades_summary),
        "grades.update" => dispatch(state, req, ADMIN, grades_update),
        "grades.delete" => dispatch(state, req, ADMIN, grades_delete),
        _ => return None,
    };
    Some(resp)
}
