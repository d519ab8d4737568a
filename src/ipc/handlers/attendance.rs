use crate::auth::{Role, Session};
use crate::db::SqliteStore;
use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{
    dispatch, get_optional_i64, get_optional_str, parse_iso_date, STAFF, TEACHER,
};
use crate::ipc::types::{AppState, Request};
use crate::reconcile::{self, Ledger};
use rusqlite::{types::Value as SqlValue, Connection};
use serde_json::{json, Map};

fn attendance_reconcile(conn: &Connection, session: &Session, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let Some(data) = params.get("data") else {
        return Err(HandlerErr::bad_params("missing data"));
    };
    let batches =
        reconcile::flatten_nested(data).map_err(|e| HandlerErr::bad_params(e.to_string()))?;
    let store = SqliteStore::new(conn);
    let report = reconcile::reconcile(&store, session.actor_id, Ledger::Attendance, &batches);
    Ok(report.to_json(Ledger::Attendance))
}

/// `{offering: {student: {date: present}}}`; every rostered student appears,
/// with an empty map when nothing is recorded.
fn attendance_get(conn: &Connection, session: &Session, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let mut sql = String::from(
        "SELECT o.id, os.student_id, a.date, a.present
         FROM offerings o
         JOIN offering_students os ON os.offering_id = o.id
         LEFT JOIN attendance a ON a.offering_id = o.id AND a.student_id = os.student_id",
    );
    let mut args: Vec<SqlValue> = Vec::new();
    if let Some(from) = get_optional_str(params, "from")?.filter(|s| !s.is_empty()) {
        let d = parse_iso_date("from", &from)?;
        sql.push_str(" AND a.date >= ?");
        args.push(SqlValue::Text(d.format("%Y-%m-%d").to_string()));
    }
    if let Some(to) = get_optional_str(params, "to")?.filter(|s| !s.is_empty()) {
        let d = parse_iso_date("to", &to)?;
        sql.push_str(" AND a.date <= ?");
        args.push(SqlValue::Text(d.format("%Y-%m-%d").to_string()));
    }
    sql.push_str(" WHERE 1 = 1");
    if session.role == Role::Teacher {
        sql.push_str(" AND o.teacher_id = ?");
        args.push(SqlValue::Integer(session.actor_id));
    }
    if let Some(offering_id) = get_optional_i64(params, "offeringId")? {
        sql.push_str(" AND o.id = ?");
        args.push(SqlValue::Integer(offering_id));
    }
    sql.push_str(" ORDER BY o.id, os.student_id, a.date");

    let mut stmt = conn.prepare(&sql).map_err(HandlerErr::query)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(args), |r| {
            Ok((
                r.get::<_, i64>(0)?,
                r.get::<_, i64>(1)?,
                r.get::<_, Option<String>>(2)?,
                r.get::<_, Option<i64>>(3)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;

    let mut out = Map::new();
    for (offering_id, student_id, date, present) in rows {
        let students = out
            .entry(offering_id.to_string())
            .or_insert_with(|| json!({}));
        let days = students
            .as_object_mut()
            .map(|m| m.entry(student_id.to_string()).or_insert_with(|| json!({})));
        if let (Some(days), Some(date), Some(present)) = (days, date, present) {
            if let Some(m) = days.as_object_mut() {
                m.insert(date, json!(present != 0));
            }
        }
    }
    Ok(serde_json::Value::Object(out))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let resp = match req.method.as_str() {
        "attendance.reconcile" => dispatch(state, req, TEACHER, attendance_reconcile),
        "attendance.get" => dispatch(state, req, STAFF, attendance_get),
        _ => return None,
    };
    Some(resp)
}
