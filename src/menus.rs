//! Menu catalog: documents, the live pointer, and the live-menu watch.
//!
//! The original app kept a singleton "which menu is live" pointer document
//! and pushed changes to clients via Firestore `onSnapshot`. Here the pointer
//! is a `local_settings` row and the push model is replaced by an explicit
//! poll-based subscription (`watch_live_menu`) with a cancellable handle.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::db::{self, DbState};
use crate::error::AppError;

const LIVE_POINTER_CATEGORY: &str = "menu";
const LIVE_POINTER_KEY: &str = "live_menu_id";

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MenuItem {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub emoji: String,
}

/// A named pricing option: MRP and the discounted "special" price the
/// customer actually pays, plus the chapati count the name stands for.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PricingTier {
    pub name: String,
    pub mrp: i64,
    pub special: i64,
    #[serde(default)]
    pub chapati: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PaymentOptions {
    pub prepaid: bool,
    pub cod: bool,
}

impl Default for PaymentOptions {
    fn default() -> Self {
        PaymentOptions {
            prepaid: true,
            cod: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Menu {
    pub id: String,
    pub title: String,
    pub items: Vec<MenuItem>,
    pub pricing: Vec<PricingTier>,
    pub payment_options: PaymentOptions,
    pub delivery_time: Option<String>,
    pub order_deadline: Option<String>,
    pub cover_image: Option<String>,
    pub is_live: bool,
    pub menu_date: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Menu {
    /// Resolve a pricing tier by name.
    pub fn tier(&self, name: &str) -> Option<&PricingTier> {
        self.pricing.iter().find(|t| t.name == name)
    }
}

/// Admin input for creating or replacing a menu document.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MenuDraft {
    pub title: String,
    #[serde(default)]
    pub items: Vec<MenuItem>,
    pub pricing: Vec<PricingTier>,
    #[serde(default)]
    pub payment_options: PaymentOptions,
    #[serde(default)]
    pub delivery_time: Option<String>,
    #[serde(default)]
    pub order_deadline: Option<String>,
    #[serde(default)]
    pub cover_image: Option<String>,
    #[serde(default)]
    pub menu_date: Option<String>,
}

impl MenuDraft {
    /// Boundary validation: non-empty title, at least one tier, tier names
    /// unique within the menu.
    fn validate(&self) -> Result<(), AppError> {
        if self.title.trim().is_empty() {
            return Err(AppError::Validation("Menu title is required".into()));
        }
        if self.pricing.is_empty() {
            return Err(AppError::Validation(
                "Menu needs at least one pricing tier".into(),
            ));
        }
        for (i, tier) in self.pricing.iter().enumerate() {
            if tier.name.trim().is_empty() {
                return Err(AppError::Validation("Pricing tier name is required".into()));
            }
            if self.pricing[..i].iter().any(|t| t.name == tier.name) {
                return Err(AppError::Validation(format!(
                    "Duplicate pricing tier name: {}",
                    tier.name
                )));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

const MENU_COLUMNS: &str = "id, title, items, pricing, payment_prepaid, payment_cod, \
     delivery_time, order_deadline, cover_image, is_live, menu_date, created_at, updated_at";

fn menu_from_row(row: &Row<'_>) -> rusqlite::Result<Menu> {
    let items_json: String = row.get(2)?;
    let pricing_json: String = row.get(3)?;
    Ok(Menu {
        id: row.get(0)?,
        title: row.get(1)?,
        items: serde_json::from_str(&items_json).unwrap_or_default(),
        pricing: serde_json::from_str(&pricing_json).unwrap_or_default(),
        payment_options: PaymentOptions {
            prepaid: row.get::<_, i64>(4)? != 0,
            cod: row.get::<_, i64>(5)? != 0,
        },
        delivery_time: row.get(6)?,
        order_deadline: row.get(7)?,
        cover_image: row.get(8)?,
        is_live: row.get::<_, i64>(9)? != 0,
        menu_date: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

// ---------------------------------------------------------------------------
// Catalog operations
// ---------------------------------------------------------------------------

pub fn create_menu(db: &DbState, draft: &MenuDraft) -> Result<Menu, AppError> {
    draft.validate()?;

    let conn = db.conn.lock().map_err(|e| AppError::Internal(e.to_string()))?;
    let id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();

    conn.execute(
        "INSERT INTO menus (id, title, items, pricing, payment_prepaid, payment_cod,
                            delivery_time, order_deadline, cover_image, is_live, menu_date,
                            created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, ?10, ?11, ?11)",
        params![
            id,
            draft.title.trim(),
            serde_json::to_string(&draft.items)?,
            serde_json::to_string(&draft.pricing)?,
            draft.payment_options.prepaid as i64,
            draft.payment_options.cod as i64,
            draft.delivery_time,
            draft.order_deadline,
            draft.cover_image,
            draft.menu_date,
            now,
        ],
    )?;

    info!(menu_id = %id, title = %draft.title, "menu created");
    drop(conn);
    get_menu(db, &id)
}

pub fn update_menu(db: &DbState, id: &str, draft: &MenuDraft) -> Result<Menu, AppError> {
    draft.validate()?;

    let conn = db.conn.lock().map_err(|e| AppError::Internal(e.to_string()))?;
    let now = Utc::now().to_rfc3339();

    let changed = conn.execute(
        "UPDATE menus SET title = ?2, items = ?3, pricing = ?4, payment_prepaid = ?5,
                          payment_cod = ?6, delivery_time = ?7, order_deadline = ?8,
                          cover_image = ?9, menu_date = ?10, updated_at = ?11
         WHERE id = ?1",
        params![
            id,
            draft.title.trim(),
            serde_json::to_string(&draft.items)?,
            serde_json::to_string(&draft.pricing)?,
            draft.payment_options.prepaid as i64,
            draft.payment_options.cod as i64,
            draft.delivery_time,
            draft.order_deadline,
            draft.cover_image,
            draft.menu_date,
            now,
        ],
    )?;
    if changed == 0 {
        return Err(AppError::NotFound("Menu".into()));
    }

    drop(conn);
    get_menu(db, id)
}

pub fn get_menu(db: &DbState, id: &str) -> Result<Menu, AppError> {
    let conn = db.conn.lock().map_err(|e| AppError::Internal(e.to_string()))?;
    conn.query_row(
        &format!("SELECT {MENU_COLUMNS} FROM menus WHERE id = ?1"),
        params![id],
        menu_from_row,
    )
    .optional()?
    .ok_or_else(|| AppError::NotFound("Menu".into()))
}

/// All menus, newest first.
pub fn list_menus(db: &DbState) -> Result<Vec<Menu>, AppError> {
    let conn = db.conn.lock().map_err(|e| AppError::Internal(e.to_string()))?;
    let mut stmt =
        conn.prepare(&format!("SELECT {MENU_COLUMNS} FROM menus ORDER BY created_at DESC"))?;
    let menus = stmt
        .query_map([], menu_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(menus)
}

// ---------------------------------------------------------------------------
// Live pointer
// ---------------------------------------------------------------------------

/// Make `id` the customer-visible menu. At most one menu is live: the
/// pointer is rewritten and every other menu's `is_live` flag is cleared.
pub fn set_live(db: &DbState, id: &str) -> Result<Menu, AppError> {
    let conn = db.conn.lock().map_err(|e| AppError::Internal(e.to_string()))?;

    let exists: Option<String> = conn
        .query_row("SELECT id FROM menus WHERE id = ?1", params![id], |row| {
            row.get(0)
        })
        .optional()?;
    if exists.is_none() {
        return Err(AppError::NotFound("Menu".into()));
    }

    let now = Utc::now().to_rfc3339();
    conn.execute(
        "UPDATE menus SET is_live = 0, updated_at = ?1 WHERE is_live = 1 AND id != ?2",
        params![now, id],
    )?;
    conn.execute(
        "UPDATE menus SET is_live = 1, updated_at = ?1 WHERE id = ?2",
        params![now, id],
    )?;
    db::set_setting(&conn, LIVE_POINTER_CATEGORY, LIVE_POINTER_KEY, id)
        .map_err(AppError::Internal)?;

    info!(menu_id = %id, "menu set live");
    drop(conn);
    get_menu(db, id)
}

/// Take the current menu off the customer listing.
pub fn clear_live(db: &DbState) -> Result<(), AppError> {
    let conn = db.conn.lock().map_err(|e| AppError::Internal(e.to_string()))?;
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "UPDATE menus SET is_live = 0, updated_at = ?1 WHERE is_live = 1",
        params![now],
    )?;
    db::delete_setting(&conn, LIVE_POINTER_CATEGORY, LIVE_POINTER_KEY)
        .map_err(AppError::Internal)?;
    info!("live menu cleared");
    Ok(())
}

/// Resolve the live pointer. `None` is the customer-facing "no menu today"
/// state: the pointer is absent, dangling, or its target is not flagged live.
pub fn live_menu(db: &DbState) -> Result<Option<Menu>, AppError> {
    let conn = db.conn.lock().map_err(|e| AppError::Internal(e.to_string()))?;
    live_menu_locked(&conn)
}

fn live_menu_locked(conn: &Connection) -> Result<Option<Menu>, AppError> {
    let Some(id) = db::get_setting(conn, LIVE_POINTER_CATEGORY, LIVE_POINTER_KEY) else {
        return Ok(None);
    };

    let menu = conn
        .query_row(
            &format!("SELECT {MENU_COLUMNS} FROM menus WHERE id = ?1"),
            params![id],
            menu_from_row,
        )
        .optional()?;

    Ok(menu.filter(|m| m.is_live))
}

/// True when a live menu exists whose date matches `date` (used by the
/// reminder sweep).
pub fn has_live_menu_for_date(db: &DbState, date: &str) -> Result<bool, AppError> {
    let conn = db.conn.lock().map_err(|e| AppError::Internal(e.to_string()))?;
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM menus WHERE is_live = 1 AND menu_date = ?1 LIMIT 1",
            params![date],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

// ---------------------------------------------------------------------------
// Live-menu subscription (poll model)
// ---------------------------------------------------------------------------

/// Cancellable subscription to live-menu snapshots.
///
/// Emits the current snapshot immediately, then one snapshot per observed
/// change, in order. Dropping the handle or calling [`MenuWatch::cancel`]
/// stops the poll loop.
pub struct MenuWatch {
    rx: mpsc::Receiver<Option<Menu>>,
    cancel: CancellationToken,
}

impl MenuWatch {
    /// Next snapshot, or `None` once the watch has been cancelled.
    pub async fn next(&mut self) -> Option<Option<Menu>> {
        self.rx.recv().await
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Drop for MenuWatch {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Start polling the live pointer every `interval`.
pub fn watch_live_menu(db: Arc<DbState>, interval: Duration) -> MenuWatch {
    let (tx, rx) = mpsc::channel(16);
    let cancel = CancellationToken::new();
    let token = cancel.clone();

    tokio::spawn(async move {
        // Fingerprint of the last emitted snapshot: (id, updated_at).
        let mut last: Option<Option<(String, String)>> = None;

        loop {
            let snapshot = match live_menu(&db) {
                Ok(s) => s,
                Err(e) => {
                    error!("live menu poll failed: {e}");
                    None
                }
            };
            let fingerprint = snapshot
                .as_ref()
                .map(|m| (m.id.clone(), m.updated_at.clone()));

            if last.as_ref() != Some(&fingerprint) {
                debug!(live = fingerprint.is_some(), "live menu changed");
                last = Some(fingerprint);
                if tx.send(snapshot).await.is_err() {
                    break;
                }
            }

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
    });

    MenuWatch { rx, cancel }
}

// ===========================================================================
// Tests
// ===========================================================================
