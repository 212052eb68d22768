use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

use crate::clock;
use crate::ipc::error::HandlerErr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Admin,
    Teacher,
}

/// The authenticated caller, as attached by the identity collaborator.
/// Role is the sole privilege discriminator: Admin is exempt from lock,
/// freeze and window restrictions everywhere.
#[derive(Debug, Clone)]
pub struct Actor {
    pub id: String,
    pub role: Role,
}

impl Actor {
    pub fn is_privileged(&self) -> bool {
        matches!(self.role, Role::Admin)
    }
}

pub fn bad_params(message: impl Into<String>) -> HandlerErr {
    HandlerErr {
        code: "bad_params",
        message: message.into(),
        details: None,
    }
}

pub fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| bad_params(format!("missing {}", key)))
}

pub fn get_optional_str(params: &serde_json::Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

pub fn parse_actor(params: &serde_json::Value) -> Result<Actor, HandlerErr> {
    let Some(actor) = params.get("actor") else {
        return Err(bad_params("missing actor"));
    };
    let id = actor
        .get("id")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| bad_params("missing actor.id"))?;
    let role = match actor.get("role").and_then(|v| v.as_str()) {
        Some("admin") => Role::Admin,
        Some("teacher") => Role::Teacher,
        _ => return Err(bad_params("actor.role must be admin or teacher")),
    };
    Ok(Actor { id, role })
}

pub fn require_admin(actor: &Actor) -> Result<(), HandlerErr> {
    if actor.is_privileged() {
        return Ok(());
    }
    Err(HandlerErr {
        code: "not_authorized",
        message: "admin role required".to_string(),
        details: None,
    })
}

pub fn parse_date_param(params: &serde_json::Value, key: &str) -> Result<NaiveDate, HandlerErr> {
    let raw = get_required_str(params, key)?;
    clock::parse_date(&raw).ok_or_else(|| bad_params(format!("{} must be YYYY-MM-DD", key)))
}

/// The moment the operation runs at. Tests (and replays) may pin it via
/// `params.now`; live callers omit it.
pub fn resolve_now(params: &serde_json::Value) -> Result<DateTime<Utc>, HandlerErr> {
    match params.get("now").and_then(|v| v.as_str()) {
        Some(raw) => {
            clock::parse_rfc3339(raw).ok_or_else(|| bad_params("now must be RFC3339"))
        }
        None => Ok(Utc::now()),
    }
}

pub fn row_exists(
    conn: &Connection,
    table: &'static str,
    id: &str,
) -> Result<bool, HandlerErr> {
    let sql = format!("SELECT 1 FROM {} WHERE id = ?", table);
    let found = conn
        .query_row(&sql, [id], |r| r.get::<_, i64>(0))
        .optional()?
        .is_some();
    Ok(found)
}

pub fn require_row(
    conn: &Connection,
    table: &'static str,
    id: &str,
    what: &'static str,
) -> Result<(), HandlerErr> {
    if row_exists(conn, table, id)? {
        return Ok(());
    }
    Err(HandlerErr {
        code: "not_found",
        message: format!("{} not found", what),
        details: Some(json!({ "id": id })),
    })
}

pub fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _)
            if f.code == rusqlite::ErrorCode::ConstraintViolation
    )
}
