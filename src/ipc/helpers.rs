use chrono::{NaiveDate, NaiveTime};
use rusqlite::{Connection, OptionalExtension, Transaction};
use serde_json::Value;

use crate::auth::{self, Role, Session};
use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::types::{AppState, Request};

pub const ANY_ROLE: &[Role] = &[Role::Admin, Role::Teacher, Role::Student];
pub const ADMIN: &[Role] = &[Role::Admin];
pub const TEACHER: &[Role] = &[Role::Teacher];
pub const STUDENT: &[Role] = &[Role::Student];
pub const STAFF: &[Role] = &[Role::Admin, Role::Teacher];

pub fn require_db(state: &AppState) -> Result<&Connection, HandlerErr> {
    state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

pub fn require_role<'a>(state: &'a AppState, allowed: &[Role]) -> Result<&'a Session, HandlerErr> {
    Ok(auth::authorize(state.session.as_ref(), allowed)?)
}

/// Runs `f` with the open workspace and a session holding one of `allowed`,
/// and wraps the outcome in a response envelope.
pub fn dispatch<F>(state: &AppState, req: &Request, allowed: &[Role], f: F) -> Value
where
    F: FnOnce(&Connection, &Session, &Value) -> Result<Value, HandlerErr>,
{
    let result = require_db(state).and_then(|conn| {
        let session = require_role(state, allowed)?;
        f(conn, session, &req.params)
    });
    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

pub fn get_required_str(params: &Value, key: &str) -> Result<String, HandlerErr> {
    get_optional_str(params, key)?
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

/// Trimmed string; `null` and absent both read as `None`.
pub fn get_optional_str(params: &Value, key: &str) -> Result<Option<String>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.trim().to_string())),
        Some(_) => Err(HandlerErr::bad_params(format!("{} must be a string", key))),
    }
}

pub fn get_required_i64(params: &Value, key: &str) -> Result<i64, HandlerErr> {
    get_optional_i64(params, key)?.ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

/// Integer ids arrive as numbers or numeric strings.
pub fn get_optional_i64(params: &Value, key: &str) -> Result<Option<i64>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_i64()
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be an integer", key))),
        Some(Value::String(s)) => s
            .trim()
            .parse::<i64>()
            .map(Some)
            .map_err(|_| HandlerErr::bad_params(format!("{} must be an integer", key))),
        Some(_) => Err(HandlerErr::bad_params(format!("{} must be an integer", key))),
    }
}

pub fn get_optional_f64(params: &Value, key: &str) -> Result<Option<f64>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_f64()
            .filter(|x| x.is_finite())
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be a number", key))),
    }
}

pub fn get_optional_bool(params: &Value, key: &str) -> Result<Option<bool>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(_) => Err(HandlerErr::bad_params(format!("{} must be a boolean", key))),
    }
}

pub fn get_required_bool(params: &Value, key: &str) -> Result<bool, HandlerErr> {
    get_optional_bool(params, key)?.ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn parse_iso_date(key: &str, raw: &str) -> Result<NaiveDate, HandlerErr> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| HandlerErr::bad_params(format!("{} must be YYYY-MM-DD", key)))
}

pub fn parse_hhmm(key: &str, raw: &str) -> Result<NaiveTime, HandlerErr> {
    NaiveTime::parse_from_str(raw.trim(), "%H:%M")
        .map_err(|_| HandlerErr::bad_params(format!("{} must be HH:MM", key)))
}

pub fn normalize_email(raw: &str) -> Result<String, HandlerErr> {
    let email = raw.trim().to_ascii_lowercase();
    let valid = email
        .split_once('@')
        .map(|(user, host)| !user.is_empty() && host.contains('.'))
        .unwrap_or(false);
    if !valid {
        return Err(HandlerErr::bad_params("email is not valid"));
    }
    Ok(email)
}

/// Rolls back on drop unless handed to [`commit`].
pub fn begin(conn: &Connection) -> Result<Transaction<'_>, HandlerErr> {
    conn.unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))
}

pub fn commit(tx: Transaction<'_>) -> Result<(), HandlerErr> {
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))
}

pub fn row_exists(conn: &Connection, sql: &str, id: i64) -> Result<bool, HandlerErr> {
    conn.query_row(sql, [id], |r| r.get::<_, i64>(0))
        .optional()
        .map(|v| v.is_some())
        .map_err(HandlerErr::query)
}

pub fn ensure_exists(conn: &Connection, table: &str, id: i64, what: &str) -> Result<(), HandlerErr> {
    let sql = format!("SELECT 1 FROM {} WHERE id = ?", table);
    if row_exists(conn, &sql, id)? {
        Ok(())
    } else {
        Err(HandlerErr::not_found(format!("{} not found", what)))
    }
}

pub fn count(conn: &Connection, sql: &str) -> Result<i64, HandlerErr> {
    conn.query_row(sql, [], |r| r.get(0)).map_err(HandlerErr::query)
}

/// Deletes one row by id. Rows still referenced elsewhere are refused.
pub fn delete_by_id(conn: &Connection, table: &str, id: i64, what: &str) -> Result<Value, HandlerErr> {
    let sql = format!("DELETE FROM {} WHERE id = ?", table);
    let changed = conn.execute(&sql, [id]).map_err(|e| {
        let mapped = HandlerErr::db("db_delete_failed", e);
        if mapped.code == "conflict" {
            HandlerErr::conflict(format!("{} is still referenced", what))
        } else {
            mapped
        }
    })?;
    if changed == 0 {
        return Err(HandlerErr::not_found(format!("{} not found", what)));
    }
    Ok(serde_json::json!({ "ok": true }))
}

/// Offering owner, or `not_found`.
pub fn offering_owner(conn: &Connection, offering_id: i64) -> Result<i64, HandlerErr> {
    conn.query_row(
        "SELECT teacher_id FROM offerings WHERE id = ?",
        [offering_id],
        |r| r.get(0),
    )
    .optional()
    .map_err(HandlerErr::query)?
    .ok_or_else(|| HandlerErr::not_found("offering not found"))
}

/// Admins see every offering; teachers only their own.
pub fn ensure_offering_access(conn: &Connection, session: &Session, offering_id: i64) -> Result<(), HandlerErr> {
    let owner = offering_owner(conn, offering_id)?;
    match session.role {
        Role::Admin => Ok(()),
        Role::Teacher if owner == session.actor_id => Ok(()),
        _ => Err(HandlerErr::new(
            "forbidden",
            "offering is not assigned to this teacher",
        )),
    }
}
