use crate::db;
use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::helpers::{dispatch, get_required_str, ADMIN};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

fn handle_health(state: &mut AppState, req: &Request) -> serde_json::Value {
    ok(
        &req.id,
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string()),
            "role": state.session.as_ref().map(|s| s.role.as_str()),
        }),
    )
}

/// Opens (creating if needed) the workspace database and makes it current.
pub fn open_workspace(state: &mut AppState, path: &Path) -> anyhow::Result<()> {
    let conn = db::open_db(path)?;
    if state.session.take().is_some() {
        info!("session cleared on workspace change");
    }
    state.workspace = Some(path.to_path_buf());
    state.db = Some(conn);
    info!(workspace = %path.display(), "workspace opened");
    Ok(())
}

fn handle_workspace_select(state: &mut AppState, req: &Request) -> serde_json::Value {
    let p = req
        .params
        .get("path")
        .and_then(|v| v.as_str())
        .map(PathBuf::from);
    let Some(path) = p else {
        return err(&req.id, "bad_params", "missing params.path", None);
    };

    match open_workspace(state, &path) {
        Ok(()) => ok(&req.id, json!({ "workspacePath": path.to_string_lossy() })),
        Err(e) => {
            warn!(workspace = %path.display(), "open failed: {e:#}");
            err(&req.id, "db_open_failed", format!("{e:#}"), None)
        }
    }
}

fn handle_settings_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    dispatch(state, req, ADMIN, |conn, _, params| {
        let key = get_required_str(params, "key")?;
        let value = db::settings_get_json(conn, &key)
            .map_err(|e| HandlerErr::new("db_query_failed", format!("{e:#}")))?;
        Ok(json!({ "key": key, "value": value }))
    })
}

fn handle_settings_set(state: &mut AppState, req: &Request) -> serde_json::Value {
    dispatch(state, req, ADMIN, |conn, _, params| {
        let key = get_required_str(params, "key")?;
        let Some(value) = params.get("value") else {
            return Err(HandlerErr::bad_params("missing value"));
        };
        db::settings_set_json(conn, &key, value)
            .map_err(|e| HandlerErr::new("db_update_failed", format!("{e:#}")))?;
        info!(key = %key, "setting updated");
        Ok(json!({ "ok": true }))
    })
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "health" => Some(handle_health(state, req)),
        "workspace.select" => Some(handle_workspace_select(state, req)),
        "settings.get" => Some(handle_settings_get(state, req)),
        "settings.set" => Some(handle_settings_set(state, req)),
        _ => None,
    }
}
