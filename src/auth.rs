use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

const MAX_TTL_MINUTES: i64 = 60 * 24 * 365;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Teacher,
    Student,
}

impl Role {
    pub fn parse(raw: &str) -> Option<Role> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "admin" => Some(Role::Admin),
            "teacher" => Some(Role::Teacher),
            "student" => Some(Role::Student),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Teacher => "teacher",
            Role::Student => "student",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub actor_id: i64,
    pub role: Role,
    pub display_name: String,
    pub email: String,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("not logged in")]
    Unauthenticated,
    #[error("session expired, log in again")]
    Expired,
    #[error("invalid email or password")]
    BadCredentials,
    #[error("account is inactive")]
    Inactive,
    #[error("requires role: {0}")]
    Forbidden(String),
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
}

impl AuthError {
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::Unauthenticated
            | AuthError::Expired
            | AuthError::BadCredentials
            | AuthError::Inactive => "unauthenticated",
            AuthError::Forbidden(_) => "forbidden",
            AuthError::Storage(_) => "db_query_failed",
        }
    }
}

pub fn new_salt() -> String {
    Uuid::new_v4().simple().to_string()
}

pub fn hash_password(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub fn verify_password(salt: &str, password: &str, expected_hash: &str) -> bool {
    let actual = hash_password(salt, password);
    // Compare every byte so timing does not reveal the matching prefix.
    actual.len() == expected_hash.len()
        && actual
            .bytes()
            .zip(expected_hash.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

struct Credentials {
    id: i64,
    display_name: String,
    hash: String,
    salt: String,
    active: bool,
}

fn find_credentials(conn: &Connection, role: Role, email: &str) -> Result<Option<Credentials>, AuthError> {
    let sql = match role {
        Role::Admin => {
            "SELECT id, name, password_hash, password_salt, 1 FROM admins WHERE email = ?"
        }
        Role::Teacher => {
            "SELECT id, first_name || ' ' || last_name, password_hash, password_salt, 1
             FROM teachers WHERE email = ?"
        }
        Role::Student => {
            "SELECT id, first_name || ' ' || last_name, password_hash, password_salt, active
             FROM students WHERE email = ?"
        }
    };
    Ok(conn
        .query_row(sql, [email], |r| {
            Ok(Credentials {
                id: r.get(0)?,
                display_name: r.get(1)?,
                hash: r.get(2)?,
                salt: r.get(3)?,
                active: r.get::<_, i64>(4)? != 0,
            })
        })
        .optional()?)
}

pub fn login(
    conn: &Connection,
    role: Role,
    email: &str,
    password: &str,
    ttl_minutes: i64,
) -> Result<Session, AuthError> {
    let email = email.trim().to_ascii_lowercase();
    let Some(creds) = find_credentials(conn, role, &email)? else {
        return Err(AuthError::BadCredentials);
    };
    if !verify_password(&creds.salt, password, &creds.hash) {
        return Err(AuthError::BadCredentials);
    }
    if !creds.active {
        return Err(AuthError::Inactive);
    }
    Ok(Session {
        actor_id: creds.id,
        role,
        display_name: creds.display_name,
        email,
        expires_at: Utc::now() + Duration::minutes(ttl_minutes.clamp(0, MAX_TTL_MINUTES)),
    })
}

/// Returns the live session if its role is one of `allowed`.
pub fn authorize<'a>(
    session: Option<&'a Session>,
    allowed: &[Role],
) -> Result<&'a Session, AuthError> {
    let Some(session) = session else {
        return Err(AuthError::Unauthenticated);
    };
    if session.is_expired(Utc::now()) {
        return Err(AuthError::Expired);
    }
    if !allowed.contains(&session.role) {
        let names: Vec<&str> = allowed.iter().map(|r| r.as_str()).collect();
        return Err(AuthError::Forbidden(names.join(" or ")));
    }
    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(role: Role, ttl_minutes: i64) -> Session {
        Session {
            actor_id: 1,
            role,
            display_name: "Ana Ruiz".to_string(),
            email: "ana@example.edu".to_string(),
            expires_at: Utc::now() + Duration::minutes(ttl_minutes),
        }
    }

    #[test]
    fn password_hash_depends_on_salt() {
        let a = hash_password("salt-a", "secret");
        let b = hash_password("salt-b", "secret");
        assert_ne!(a, b);
        assert_eq!(a.len(), 64);
        assert!(verify_password("salt-a", "secret", &a));
        assert!(!verify_password("salt-a", "Secret", &a));
    }

    #[test]
    fn authorize_checks_role_and_expiry() {
        let teacher = session(Role::Teacher, 30);
        assert!(authorize(Some(&teacher), &[Role::Teacher]).is_ok());
        assert!(matches!(
            authorize(Some(&teacher), &[Role::Admin]),
            Err(AuthError::Forbidden(_))
        ));
        assert!(matches!(
            authorize(None, &[Role::Admin]),
            Err(AuthError::Unauthenticated)
        ));
        let stale = session(Role::Admin, -1);
        assert!(matches!(
            authorize(Some(&stale), &[Role::Admin]),
            Err(AuthError::Expired)
        ));
    }

    #[test]
    fn role_parse_is_case_insensitive() {
        assert_eq!(Role::parse(" Teacher "), Some(Role::Teacher));
        assert_eq!(Role::parse("docente"), None);
    }
}
