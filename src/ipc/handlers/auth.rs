use crate::auth::{self, Role};
use crate::db;
use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::helpers::{
    count, get_required_str, normalize_email, require_db, require_role, ADMIN, ANY_ROLE,
};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use tracing::{info, warn};

const MIN_PASSWORD_LEN: usize = 6;

pub fn check_password(password: &str) -> Result<(), HandlerErr> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(HandlerErr::bad_params(format!(
            "password must have at least {} characters",
            MIN_PASSWORD_LEN
        )));
    }
    Ok(())
}

/// The first admin may register without a session; later ones need an admin.
fn auth_register_admin(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    if count(conn, "SELECT COUNT(*) FROM admins")? > 0 {
        require_role(state, ADMIN)?;
    }
    let name = get_required_str(params, "name")?;
    let email = normalize_email(&get_required_str(params, "email")?)?;
    let password = params
        .get("password")
        .and_then(|v| v.as_str())
        .ok_or_else(|| HandlerErr::bad_params("missing password"))?;
    check_password(password)?;

    let salt = auth::new_salt();
    conn.execute(
        "INSERT INTO admins(name, email, password_hash, password_salt, created_at)
         VALUES(?, ?, ?, ?, ?)",
        (
            &name,
            &email,
            auth::hash_password(&salt, password),
            &salt,
            db::now_stamp(),
        ),
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", e))?;
    let admin_id = conn.last_insert_rowid();
    info!(admin_id, "admin registered");
    Ok(json!({ "adminId": admin_id }))
}

fn auth_login(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let role_raw = get_required_str(params, "role")?;
    let role = Role::parse(&role_raw)
        .ok_or_else(|| HandlerErr::bad_params("role must be admin, teacher or student"))?;
    let email = get_required_str(params, "email")?;
    let password = params
        .get("password")
        .and_then(|v| v.as_str())
        .ok_or_else(|| HandlerErr::bad_params("missing password"))?;

    let conn = require_db(state)?;
    let session = match auth::login(conn, role, &email, password, state.session_ttl_minutes) {
        Ok(s) => s,
        Err(e) => {
            warn!(role = role.as_str(), "login rejected: {e}");
            return Err(e.into());
        }
    };
    info!(role = role.as_str(), actor_id = session.actor_id, "logged in");
    let result = json!({ "session": session });
    state.session = Some(session);
    Ok(result)
}

fn handle_auth_register_admin(state: &mut AppState, req: &Request) -> serde_json::Value {
    match auth_register_admin(state, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_auth_login(state: &mut AppState, req: &Request) -> serde_json::Value {
    match auth_login(state, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_auth_logout(state: &mut AppState, req: &Request) -> serde_json::Value {
    let was_logged_in = state.session.take().is_some();
    if was_logged_in {
        info!("logged out");
    }
    ok(&req.id, json!({ "loggedOut": was_logged_in }))
}

fn handle_auth_me(state: &mut AppState, req: &Request) -> serde_json::Value {
    match require_role(state, ANY_ROLE) {
        Ok(session) => ok(&req.id, json!({ "session": session })),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "auth.registerAdmin" => Some(handle_auth_register_admin(state, req)),
        "auth.login" => Some(handle_auth_login(state, req)),
        "auth.logout" => Some(handle_auth_logout(state, req)),
        "auth.me" => Some(handle_auth_me(state, req)),
        _ => None,
    }
}
