use crate::auth::Session;
use crate::calc;
use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{dispatch, get_required_i64, ADMIN, STUDENT};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;

fn report_json(conn: &Connection, student_id: i64) -> Result<serde_json::Value, HandlerErr> {
    let report = calc::student_report(conn, student_id)?;
    serde_json::to_value(report).map_err(|e| HandlerErr::new("internal", e.to_string()))
}

fn reports_student(conn: &Connection, _: &Session, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_i64(params, "studentId")?;
    report_json(conn, student_id)
}

/// A student's own report card.
fn reports_me(conn: &Connection, session: &Session, _: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    report_json(conn, session.actor_id)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let resp = match req.method.as_str() {
        "reports.student" => dispatch(state, req, ADMIN, reports_student),
        "reports.me" => dispatch(state, req, STUDENT, reports_me),
        _ => return None,
    };
    Some(resp)
}
