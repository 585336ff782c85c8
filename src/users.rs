//! User documents and push-notification registration.
//!
//! Users are created at signup and mutated by account edits and by the
//! notification handler registering or clearing FCM tokens. A token the
//! messaging provider reports as unregistered is cleared here and the user's
//! notifications are disabled until they re-register.

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::db::DbState;
use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Admin => "admin",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Role::User),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub uid: String,
    pub email: String,
    pub name: Option<String>,
    pub role: Role,
    pub fcm_token: Option<String>,
    pub notifications_enabled: bool,
}

/// Signup / account-edit payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserUpsert {
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_role")]
    pub role: Role,
}

fn default_role() -> Role {
    Role::User
}

/// A user the relay can currently reach: token present, notifications on.
#[derive(Debug, Clone)]
pub struct Recipient {
    pub uid: String,
    pub fcm_token: String,
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    let role: String = row.get(3)?;
    Ok(User {
        uid: row.get(0)?,
        email: row.get(1)?,
        name: row.get(2)?,
        role: Role::parse(&role).unwrap_or(Role::User),
        fcm_token: row.get(4)?,
        notifications_enabled: row.get::<_, i64>(5)? != 0,
    })
}

const USER_COLUMNS: &str = "uid, email, name, role, fcm_token, notifications_enabled";

/// Create or update a user document. Push registration fields are left
/// untouched on update.
pub fn upsert_user(db: &DbState, uid: &str, input: &UserUpsert) -> Result<User, AppError> {
    if uid.trim().is_empty() {
        return Err(AppError::Validation("Missing uid".into()));
    }
    if input.email.trim().is_empty() {
        return Err(AppError::Validation("Missing email".into()));
    }

    let conn = db.conn.lock().map_err(|e| AppError::Internal(e.to_string()))?;
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO users (uid, email, name, role, notifications_enabled, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, 0, ?5, ?5)
         ON CONFLICT(uid) DO UPDATE SET
            email = excluded.email,
            name = excluded.name,
            role = excluded.role,
            updated_at = excluded.updated_at",
        params![uid, input.email.trim(), input.name, input.role.as_str(), now],
    )?;
    drop(conn);
    get_user(db, uid)
}

pub fn get_user(db: &DbState, uid: &str) -> Result<User, AppError> {
    let conn = db.conn.lock().map_err(|e| AppError::Internal(e.to_string()))?;
    conn.query_row(
        &format!("SELECT {USER_COLUMNS} FROM users WHERE uid = ?1"),
        params![uid],
        user_from_row,
    )
    .optional()?
    .ok_or_else(|| AppError::NotFound("User".into()))
}

/// Register (or refresh) a device token and the opt-in flag.
pub fn set_push_registration(
    db: &DbState,
    uid: &str,
    fcm_token: Option<&str>,
    notifications_enabled: bool,
) -> Result<User, AppError> {
    let conn = db.conn.lock().map_err(|e| AppError::Internal(e.to_string()))?;
    let now = Utc::now().to_rfc3339();
    let changed = conn.execute(
        "UPDATE users SET fcm_token = ?2, notifications_enabled = ?3, updated_at = ?4
         WHERE uid = ?1",
        params![uid, fcm_token, notifications_enabled as i64, now],
    )?;
    if changed == 0 {
        return Err(AppError::NotFound("User".into()));
    }
    drop(conn);
    get_user(db, uid)
}

/// Clear the token and disable notifications for every uid in one batch
/// (best-effort cleanup after unregistered-token send failures).
pub fn clear_push_registrations(db: &DbState, uids: &[String]) -> Result<usize, AppError> {
    if uids.is_empty() {
        return Ok(0);
    }
    let conn = db.conn.lock().map_err(|e| AppError::Internal(e.to_string()))?;
    let now = Utc::now().to_rfc3339();
    let mut cleaned = 0;
    for uid in uids {
        cleaned += conn.execute(
            "UPDATE users SET fcm_token = NULL, notifications_enabled = 0, updated_at = ?2
             WHERE uid = ?1",
            params![uid, now],
        )?;
    }
    info!(cleaned, "cleared stale push registrations");
    Ok(cleaned)
}

/// Users the relay can reach right now, optionally restricted to one role.
pub fn notifiable_users(db: &DbState, role: Option<Role>) -> Result<Vec<Recipient>, AppError> {
    let conn = db.conn.lock().map_err(|e| AppError::Internal(e.to_string()))?;

    let mut sql = String::from(
        "SELECT uid, fcm_token FROM users
         WHERE fcm_token IS NOT NULL AND notifications_enabled = 1",
    );
    if role.is_some() {
        sql.push_str(" AND role = ?1");
    }
    sql.push_str(" ORDER BY uid");

    let mut stmt = conn.prepare(&sql)?;
    let map_row = |row: &Row<'_>| {
        Ok(Recipient {
            uid: row.get(0)?,
            fcm_token: row.get(1)?,
        })
    };
    let recipients = match role {
        Some(r) => stmt
            .query_map(params![r.as_str()], map_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?,
        None => stmt
            .query_map([], map_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?,
    };
    Ok(recipients)
}

// ===========================================================================
// Tests
// ===========================================================================
