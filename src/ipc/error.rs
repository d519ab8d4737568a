use rusqlite::ffi;
use serde_json::json;

use crate::auth::AuthError;
use crate::calc::CalcError;

pub fn ok(id: &str, result: serde_json::Value) -> serde_json::Value {
    json!({
        "id": id,
        "ok": true,
        "result": result
    })
}

pub fn err(
    id: &str,
    code: &str,
    message: impl Into<String>,
    details: Option<serde_json::Value>,
) -> serde_json::Value {
    let mut error = json!({
        "code": code,
        "message": message.into(),
    });
    if let Some(d) = details {
        error["details"] = d;
    }
    json!({
        "id": id,
        "ok": false,
        "error": error,
    })
}

#[derive(Debug)]
pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn bad_params(message: impl Into<String>) -> Self {
        Self::new("bad_params", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new("not_found", message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new("conflict", message)
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Maps a failed write: constraint violations become `conflict`, anything
    /// else keeps `code` (e.g. `db_insert_failed`).
    pub fn db(code: &'static str, e: rusqlite::Error) -> Self {
        if let Some(kind) = constraint_kind(&e) {
            return Self::conflict(e.to_string()).with_details(json!({ "constraint": kind }));
        }
        Self::new(code, e.to_string())
    }

    pub fn query(e: rusqlite::Error) -> Self {
        Self::new("db_query_failed", e.to_string())
    }

    pub fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

fn constraint_kind(e: &rusqlite::Error) -> Option<&'static str> {
    let rusqlite::Error::SqliteFailure(inner, _) = e else {
        return None;
    };
    if inner.code != rusqlite::ErrorCode::ConstraintViolation {
        return None;
    }
    Some(match inner.extended_code {
        ffi::SQLITE_CONSTRAINT_UNIQUE | ffi::SQLITE_CONSTRAINT_PRIMARYKEY => "unique",
        ffi::SQLITE_CONSTRAINT_FOREIGNKEY => "foreign_key",
        _ => "constraint",
    })
}

impl From<AuthError> for HandlerErr {
    fn from(e: AuthError) -> Self {
        Self::new(e.code(), e.to_string())
    }
}

impl From<CalcError> for HandlerErr {
    fn from(e: CalcError) -> Self {
        let code = match e.code.as_str() {
            "not_found" => "not_found",
            _ => "db_query_failed",
        };
        Self::new(code, e.message)
    }
}
