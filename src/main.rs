mod auth;
mod calc;
mod config;
mod db;
mod ipc;
mod reconcile;

use std::io::{self, BufRead, Write};

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() {
    // stdout carries the protocol; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(config::log_filter()))
        .with_writer(io::stderr)
        .with_ansi(false)
        .init();

    let cfg = config::Config::load();
    let mut state = ipc::AppState::new(cfg.session_ttl_minutes);
    if let Some(path) = cfg.workspace.as_deref() {
        if let Err(e) = ipc::open_workspace(&mut state, path) {
            error!(workspace = %path.display(), "could not open workspace: {e:#}");
        }
    }
    info!(version = env!("CARGO_PKG_VERSION"), "campusd ready");

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let req: ipc::Request = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                // Can't reply without id.
                let resp = serde_json::json!({
                    "ok": false,
                    "error": { "code": "bad_json", "message": e.to_string() }
                });
                let _ = writeln!(stdout, "{}", resp);
                let _ = stdout.flush();
                continue;
            }
        };

        let resp = ipc::handle_request(&mut state, req);
        let _ = writeln!(stdout, "{}", resp);
        let _ = stdout.flush();
    }
    info!("stdin closed, exiting");
}
