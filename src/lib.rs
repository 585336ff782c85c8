//! YummyFi backend.
//!
//! Server-side home for a small food pre-order service: admins publish a
//! daily menu, customers place orders against its pricing tiers, and order
//! lifecycle changes fan out as web-push notifications. State lives in a
//! local SQLite database; push delivery goes through FCM.

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod config;
pub mod db;
pub mod error;
pub mod fcm;
pub mod menus;
pub mod notify;
pub mod orders;
pub mod payments;
pub mod routes;
pub mod upload;
pub mod users;

pub use routes::AppState;

/// Initialize structured logging (console + daily rolling file under
/// `{data_dir}/logs`).
pub fn init_tracing(data_dir: &std::path::Path) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,yummyfi_server=debug"));

    let log_dir = data_dir.join("logs");
    std::fs::create_dir_all(&log_dir).ok();

    let file_appender = tracing_appender::rolling::daily(&log_dir, "yummyfi");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    let console_layer = fmt::layer().with_target(true);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    // Keep the guard alive for the lifetime of the process — dropping it
    // flushes logs. Leaked intentionally since we run until exit.
    std::mem::forget(guard);
}

/// Wire up state and the router from loaded configuration.
pub fn build_app(config: config::Config) -> Result<axum::Router, String> {
    let db = db::init(std::path::Path::new(&config.data_dir))?;
    let push = fcm::FcmClient::new(&config)?;

    info!("Starting YummyFi backend v{}", env!("CARGO_PKG_VERSION"));

    let state = Arc::new(AppState {
        db: Arc::new(db),
        push,
        config,
    });
    Ok(routes::router(state))
}
