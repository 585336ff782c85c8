//! Environment-injected configuration.
//!
//! Credentials (FCM server key, VAPID key) and deployment knobs come from the
//! environment; everything has a development default except the FCM key,
//! which falls back to empty and simply disables real push delivery.

use std::{env, fmt::Display, str::FromStr};

use tracing::{info, warn};

#[derive(Clone)]
pub struct Config {
    /// HTTP bind port.
    pub port: u16,
    /// Directory holding the SQLite database and logs.
    pub data_dir: String,
    /// Directory uploaded cover images are written to.
    pub upload_dir: String,
    /// Public URL prefix uploaded files are served under.
    pub upload_base_url: String,
    /// FCM legacy HTTP endpoint. Overridable for tests/staging.
    pub fcm_endpoint: String,
    /// FCM server key (`Authorization: key=...`).
    pub fcm_server_key: String,
    /// Firebase project id, echoed into push data payloads.
    pub fcm_project_id: String,
    /// Web-push VAPID public key, served to clients for token registration.
    pub vapid_public_key: String,
    /// Business UPI id the payment QR points at.
    pub upi_id: String,
    /// Payee name embedded in the UPI intent.
    pub upi_payee: String,
}

impl Config {
    pub fn load() -> Self {
        Self {
            port: try_load("YUMMYFI_PORT", "8080"),
            data_dir: try_load("YUMMYFI_DATA_DIR", "./data"),
            upload_dir: try_load("YUMMYFI_UPLOAD_DIR", "./data/uploads"),
            upload_base_url: try_load("YUMMYFI_UPLOAD_BASE_URL", "/uploads"),
            fcm_endpoint: try_load("FCM_ENDPOINT", "https://fcm.googleapis.com/fcm/send"),
            fcm_server_key: optional("FCM_SERVER_KEY"),
            fcm_project_id: optional("FIREBASE_PROJECT_ID"),
            vapid_public_key: optional("FIREBASE_VAPID_KEY"),
            upi_id: try_load("YUMMYFI_UPI_ID", "8736866828@okbizaxis"),
            upi_payee: try_load("YUMMYFI_UPI_PAYEE", "YummyFi"),
        }
    }
}

fn var(key: &str) -> Result<String, ()> {
    env::var(key).map_err(|_| ())
}

fn try_load<T: FromStr>(key: &str, default: &str) -> T
where
    T::Err: Display,
{
    var(key)
        .unwrap_or_else(|_| {
            info!("{key} not set, using default: {default}");
            default.to_string()
        })
        .parse()
        .map_err(|e| {
            warn!("Invalid {key} value: {e}");
        })
        .expect("Environment misconfigured!")
}

fn optional(key: &str) -> String {
    var(key).unwrap_or_else(|_| {
        warn!("{key} not set");
        String::new()
    })
}
