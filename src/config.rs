use std::{env, fmt::Display, path::PathBuf, str::FromStr};

use tracing::{info, warn};

pub const DEFAULT_LOG_FILTER: &str = "campusd=info";

pub struct Config {
    pub workspace: Option<PathBuf>,
    pub session_ttl_minutes: i64,
}

impl Config {
    pub fn load() -> Self {
        Self {
            workspace: var("CAMPUSD_WORKSPACE")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from),
            session_ttl_minutes: try_load("CAMPUSD_SESSION_TTL_MINUTES", 120),
        }
    }
}

/// Log filter directive: `CAMPUSD_LOG` wins over `RUST_LOG`.
pub fn log_filter() -> String {
    env::var("CAMPUSD_LOG")
        .or_else(|_| env::var("RUST_LOG"))
        .unwrap_or_else(|_| DEFAULT_LOG_FILTER.to_string())
}

fn var(key: &str) -> Result<String, ()> {
    env::var(key).map_err(|_| {
        info!("{key} not set");
    })
}

fn try_load<T>(key: &str, default: T) -> T
where
    T: FromStr + Display,
    T::Err: Display,
{
    let Ok(raw) = var(key) else {
        info!("{key} using default: {default}");
        return default;
    };
    match raw.trim().parse() {
        Ok(v) => v,
        Err(e) => {
            warn!("invalid {key} value {raw:?} ({e}), using default: {default}");
            default
        }
    }
}
