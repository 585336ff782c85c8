//! Local SQLite database layer for the YummyFi backend.
//!
//! Uses rusqlite with WAL mode. The Firestore collections of the original
//! app (menus, orders, users) become plain tables with JSON columns for the
//! nested parts. Provides schema migrations, settings helpers, and the
//! `DbState` handle that is passed explicitly to every domain function.

use rusqlite::{params, Connection};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{error, info, warn};

/// Shared database handle, injected into every handler and domain function.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 3;

/// Initialize the database at `{data_dir}/yummyfi.db`.
///
/// Creates the directory if needed, opens the connection, sets pragmas,
/// and runs any pending migrations. On corruption or open failure,
/// deletes the file and retries once.
pub fn init(data_dir: &Path) -> Result<DbState, String> {
    fs::create_dir_all(data_dir).map_err(|e| format!("Failed to create data dir: {e}"))?;

    let db_path = data_dir.join("yummyfi.db");
    info!("Opening database at {}", db_path.display());

    let conn = match open_and_configure(&db_path) {
        Ok(c) => c,
        Err(first_err) => {
            warn!(
                "Database open failed ({}), deleting and retrying once",
                first_err
            );
            if db_path.exists() {
                let _ = fs::remove_file(&db_path);
                // Also remove WAL/SHM files if present
                let wal = db_path.with_extension("db-wal");
                let shm = db_path.with_extension("db-shm");
                let _ = fs::remove_file(&wal);
                let _ = fs::remove_file(&shm);
            }
            open_and_configure(&db_path)
                .map_err(|e| format!("Database open failed after retry: {e}"))?
        }
    };

    run_migrations(&conn)?;

    info!("Database initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path,
    })
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> Result<Connection, String> {
    let conn = Connection::open(path).map_err(|e| format!("sqlite open: {e}"))?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )
    .map_err(|e| format!("pragma setup: {e}"))?;

    Ok(conn)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> Result<(), String> {
    // Ensure schema_version table exists first
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )
    .map_err(|e| format!("create schema_version: {e}"))?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Database schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }
    if current < 3 {
        migrate_v3(conn)?;
    }

    Ok(())
}

/// v1: core document tables (menus, orders, users) and local settings.
fn migrate_v1(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS menus (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            items TEXT NOT NULL DEFAULT '[]',
            pricing TEXT NOT NULL DEFAULT '[]',
            payment_prepaid INTEGER NOT NULL DEFAULT 1,
            payment_cod INTEGER NOT NULL DEFAULT 1,
            delivery_time TEXT,
            order_deadline TEXT,
            cover_image TEXT,
            is_live INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS orders (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            user_email TEXT NOT NULL,
            customer_name TEXT,
            menu_id TEXT NOT NULL,
            menu_title TEXT NOT NULL,
            chapati_option TEXT NOT NULL,
            quantity INTEGER NOT NULL CHECK (quantity BETWEEN 1 AND 15),
            payment_method TEXT NOT NULL CHECK (payment_method IN ('prepaid', 'cod')),
            address TEXT NOT NULL,
            instructions TEXT,
            total_amount INTEGER NOT NULL,
            status TEXT NOT NULL,
            order_date TEXT NOT NULL,
            order_time TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_orders_user ON orders(user_id);
        CREATE INDEX IF NOT EXISTS idx_orders_date ON orders(order_date);

        CREATE TABLE IF NOT EXISTS users (
            uid TEXT PRIMARY KEY,
            email TEXT NOT NULL,
            name TEXT,
            role TEXT NOT NULL DEFAULT 'user' CHECK (role IN ('user', 'admin')),
            fcm_token TEXT,
            notifications_enabled INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS local_settings (
            setting_category TEXT NOT NULL,
            setting_key TEXT NOT NULL,
            setting_value TEXT,
            updated_at TEXT DEFAULT (datetime('now')),
            PRIMARY KEY (setting_category, setting_key)
        );

        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(|e| {
        error!("Migration v1 failed: {e}");
        format!("migration v1: {e}")
    })?;

    info!("Applied migration v1 (core tables)");
    Ok(())
}

/// v2: reminder-sweep audit log.
fn migrate_v2(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS notification_logs (
            id TEXT PRIMARY KEY,
            log_type TEXT NOT NULL,
            log_date TEXT NOT NULL,
            sent_count INTEGER NOT NULL DEFAULT 0,
            cleaned_tokens INTEGER NOT NULL DEFAULT 0,
            total_users INTEGER NOT NULL DEFAULT 0,
            users_who_ordered INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_notification_logs_date
            ON notification_logs(log_date);

        INSERT INTO schema_version (version) VALUES (2);
        ",
    )
    .map_err(|e| {
        error!("Migration v2 failed: {e}");
        format!("migration v2: {e}")
    })?;

    info!("Applied migration v2 (notification_logs table)");
    Ok(())
}

/// v3: menus gain a calendar date so the reminder sweep can check
/// "is there a live menu for today" without consulting the pointer.
fn migrate_v3(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        ALTER TABLE menus ADD COLUMN menu_date TEXT;

        CREATE INDEX IF NOT EXISTS idx_menus_date ON menus(menu_date);

        INSERT INTO schema_version (version) VALUES (3);
        ",
    )
    .map_err(|e| {
        error!("Migration v3 failed: {e}");
        format!("migration v3: {e}")
    })?;

    info!("Applied migration v3 (menus.menu_date column)");
    Ok(())
}

// ---------------------------------------------------------------------------
// Settings helpers
// ---------------------------------------------------------------------------

/// Get a single setting value.
pub fn get_setting(conn: &Connection, category: &str, key: &str) -> Option<String> {
    conn.query_row(
        "SELECT setting_value FROM local_settings WHERE setting_category = ?1 AND setting_key = ?2",
        params![category, key],
        |row| row.get(0),
    )
    .ok()
    .flatten()
}

/// Insert or update a setting.
pub fn set_setting(
    conn: &Connection,
    category: &str,
    key: &str,
    value: &str,
) -> Result<(), String> {
    conn.execute(
        "INSERT INTO local_settings (setting_category, setting_key, setting_value, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(setting_category, setting_key) DO UPDATE SET
            setting_value = excluded.setting_value,
            updated_at = excluded.updated_at",
        params![category, key, value],
    )
    .map_err(|e| format!("set_setting: {e}"))?;
    Ok(())
}

/// Remove a setting. Missing rows are not an error.
pub fn delete_setting(conn: &Connection, category: &str, key: &str) -> Result<(), String> {
    conn.execute(
        "DELETE FROM local_settings WHERE setting_category = ?1 AND setting_key = ?2",
        params![category, key],
    )
    .map_err(|e| format!("delete_setting: {e}"))?;
    Ok(())
}

/// Run all migrations on the given connection (test helper, not public API).
#[cfg(test)]
pub fn run_migrations_for_test(conn: &Connection) {
    run_migrations(conn).expect("run_migrations should succeed in test");
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    /// Open an in-memory database and apply pragmas (mirrors open_and_configure).
    fn test_db() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = NORMAL;",
        )
        .expect("pragma setup");
        conn
    }

    /// Helper: list table names in the database.
    fn table_names(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .expect("prepare table list");
        stmt.query_map([], |row| row.get(0))
            .expect("query table list")
            .flatten()
            .collect()
    }

    #[test]
    fn test_migrations_create_all_tables() {
        let conn = test_db();
        run_migrations(&conn).expect("migrations");

        let tables = table_names(&conn);
        for expected in [
            "menus",
            "orders",
            "users",
            "local_settings",
            "notification_logs",
            "schema_version",
        ] {
            assert!(
                tables.iter().any(|t| t == expected),
                "missing table {expected}, have {tables:?}"
            );
        }

        let version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_version",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(version, CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = test_db();
        run_migrations(&conn).expect("first run");
        run_migrations(&conn).expect("second run");

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, CURRENT_SCHEMA_VERSION as i64);
    }

    #[test]
    fn test_orders_check_constraints() {
        let conn = test_db();
        run_migrations(&conn).expect("migrations");

        // Quantity out of range is rejected by the schema
        let bad_qty = conn.execute(
            "INSERT INTO orders (id, user_id, user_email, menu_id, menu_title, chapati_option,
                                 quantity, payment_method, address, total_amount, status,
                                 order_date, order_time)
             VALUES ('o-bad', 'u1', 'a@b.c', 'm1', 'Menu', 'C3', 16, 'cod', 'addr', 100,
                     'pending', '2025-01-01', datetime('now'))",
            [],
        );
        assert!(bad_qty.is_err(), "quantity 16 should be rejected");

        let bad_method = conn.execute(
            "INSERT INTO orders (id, user_id, user_email, menu_id, menu_title, chapati_option,
                                 quantity, payment_method, address, total_amount, status,
                                 order_date, order_time)
             VALUES ('o-bad2', 'u1', 'a@b.c', 'm1', 'Menu', 'C3', 1, 'cheque', 'addr', 100,
                     'pending', '2025-01-01', datetime('now'))",
            [],
        );
        assert!(
            bad_method.is_err(),
            "unknown payment method should be rejected"
        );
    }

    #[test]
    fn test_settings_roundtrip() {
        let conn = test_db();
        run_migrations(&conn).expect("migrations");

        assert_eq!(get_setting(&conn, "menu", "live_menu_id"), None);

        set_setting(&conn, "menu", "live_menu_id", "menu-123").expect("set");
        assert_eq!(
            get_setting(&conn, "menu", "live_menu_id").as_deref(),
            Some("menu-123")
        );

        // Upsert overwrites
        set_setting(&conn, "menu", "live_menu_id", "menu-456").expect("set again");
        assert_eq!(
            get_setting(&conn, "menu", "live_menu_id").as_deref(),
            Some("menu-456")
        );

        delete_setting(&conn, "menu", "live_menu_id").expect("delete");
        assert_eq!(get_setting(&conn, "menu", "live_menu_id"), None);
    }
}
