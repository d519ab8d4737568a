use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

use crate::auth::Session;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    /// Logged-in actor; cleared on logout or when the workspace changes.
    pub session: Option<Session>,
    pub session_ttl_minutes: i64,
}

impl AppState {
    pub fn new(session_ttl_minutes: i64) -> Self {
        Self {
            workspace: None,
            db: None,
            session: None,
            session_ttl_minutes,
        }
    }
}
