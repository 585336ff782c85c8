//! HTTP surface: the notification endpoints of the original Vercel
//! functions plus the catalog/order/user operations the React app used to
//! run client-side against Firestore.

use std::sync::Arc;

use axum::{
    extract::{Multipart, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::warn;

use crate::config::Config;
use crate::db::DbState;
use crate::error::AppError;
use crate::fcm::{FcmClient, PushMessage, PushSender, SendError};
use crate::menus::{self, MenuDraft};
use crate::notify::{self, ReminderSweep, StatusNotify};
use crate::orders::{self, OrderStatus, PlaceOrderRequest};
use crate::payments::{self, PaymentMethod};
use crate::upload;
use crate::users::{self, UserUpsert};

/// Explicitly constructed application state, injected into every handler.
pub struct AppState {
    pub db: Arc<DbState>,
    pub push: FcmClient,
    pub config: Config,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/config", get(client_config))
        // Notification relay (the original serverless functions)
        .route("/api/notify-new-menu", post(notify_new_menu))
        .route("/api/notify-new-order", post(notify_new_order))
        .route("/api/notify-order-status", post(notify_order_status))
        .route("/api/send-notification", post(send_notification))
        .route(
            "/api/send-order-reminders",
            get(send_order_reminders).post(send_order_reminders),
        )
        .route("/api/upload", post(upload_file))
        // Menu catalog
        .route("/api/menus", get(list_menus).post(create_menu))
        .route("/api/menus/:id", get(get_menu).put(update_menu))
        .route("/api/menus/:id/live", post(set_menu_live))
        .route("/api/menu/live", get(get_live_menu).delete(clear_live_menu))
        // Orders
        .route("/api/orders", get(list_orders).post(place_order))
        .route("/api/orders/:id", get(get_order))
        .route("/api/orders/:id/status", post(set_order_status))
        // Users
        .route("/api/users/:uid", put(upsert_user).get(get_user))
        .route("/api/users/:uid/push", put(set_push_registration))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Meta
// ---------------------------------------------------------------------------

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

/// Public client configuration (web-push registration key).
async fn client_config(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "vapidKey": state.config.vapid_public_key,
        "projectId": state.config.fcm_project_id,
    }))
}

// ---------------------------------------------------------------------------
// Notification relay endpoints
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NotifyNewMenuBody {
    #[serde(default)]
    menu_data: Option<Value>,
}

async fn notify_new_menu(
    State(state): State<Arc<AppState>>,
    Json(body): Json<NotifyNewMenuBody>,
) -> Result<Json<Value>, AppError> {
    let is_live = body
        .menu_data
        .as_ref()
        .and_then(|m| m.get("isLive"))
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if !is_live {
        return Err(AppError::Validation(
            "Invalid menu data or menu is not live".into(),
        ));
    }

    let outcome = notify::relay_new_menu(&state.db, &state.push).await?;
    Ok(Json(json!({
        "success": true,
        "sentNotifications": outcome.sent,
        "cleanedTokens": outcome.cleaned,
        "message": format!("Sent {} notifications for new menu", outcome.sent),
    })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderRefBody {
    #[serde(default)]
    order_data: Option<Value>,
    #[serde(default)]
    previous_status: Option<String>,
}

impl OrderRefBody {
    fn order_id(&self) -> Result<String, AppError> {
        self.order_data
            .as_ref()
            .and_then(|o| o.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| AppError::Validation("Invalid order data".into()))
    }
}

async fn notify_new_order(
    State(state): State<Arc<AppState>>,
    Json(body): Json<OrderRefBody>,
) -> Result<Json<Value>, AppError> {
    let order = orders::get_order(&state.db, &body.order_id()?)?;
    let outcome = notify::relay_new_order(&state.db, &state.push, &order).await?;
    Ok(Json(json!({
        "success": true,
        "sentNotifications": outcome.sent,
        "cleanedTokens": outcome.cleaned,
        "message": format!("Sent {} notifications to admins for new order", outcome.sent),
    })))
}

async fn notify_order_status(
    State(state): State<Arc<AppState>>,
    Json(body): Json<OrderRefBody>,
) -> Result<Response, AppError> {
    let order = orders::get_order(&state.db, &body.order_id()?)?;
    let _ = &body.previous_status; // informational; the order row is authoritative

    let result = notify::notify_order_status(&state.db, &state.push, &order).await?;
    let response = match result {
        StatusNotify::Sent(message_id) => Json(json!({
            "success": true,
            "messageId": message_id,
            "message": format!("Order status notification sent to user {}", order.user_id),
        }))
        .into_response(),
        StatusNotify::NotNotifiable => Json(json!({
            "success": true,
            "message": "Status change does not require notification",
        }))
        .into_response(),
        StatusNotify::OptedOut => Json(json!({
            "success": true,
            "message": "User does not have notifications enabled",
        }))
        .into_response(),
        StatusNotify::TokenCleaned => (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": "Invalid FCM token, cleaned up",
                "code": "INVALID_TOKEN",
            })),
        )
            .into_response(),
    };
    Ok(response)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendNotificationBody {
    #[serde(default)]
    fcm_token: Option<String>,
    #[serde(default)]
    payload: Option<PushMessage>,
}

/// Ad-hoc direct send to one token.
async fn send_notification(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SendNotificationBody>,
) -> Result<Response, AppError> {
    let (Some(token), Some(payload)) = (body.fcm_token, body.payload) else {
        return Err(AppError::Validation(
            "Missing required fields: fcmToken, payload.title, payload.body".into(),
        ));
    };
    if payload.title.is_empty() || payload.body.is_empty() {
        return Err(AppError::Validation(
            "Missing required fields: fcmToken, payload.title, payload.body".into(),
        ));
    }

    match state.push.send(&token, &payload).await {
        Ok(message_id) => Ok(Json(json!({ "success": true, "messageId": message_id })).into_response()),
        Err(SendError::NotRegistered) => Ok((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "Invalid FCM token", "code": "INVALID_TOKEN" })),
        )
            .into_response()),
        Err(SendError::Upstream(e)) => Err(AppError::Internal(e)),
    }
}

async fn send_order_reminders(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, AppError> {
    let today = Utc::now().format("%Y-%m-%d").to_string();
    match notify::send_order_reminders(&state.db, &state.push, &today).await? {
        ReminderSweep::NoLiveMenu => Ok(Json(json!({
            "success": true,
            "message": "No live menu found for today, skipping reminders",
        }))),
        ReminderSweep::Completed(outcome) => Ok(Json(json!({
            "success": true,
            "sentReminders": outcome.sent,
            "cleanedTokens": outcome.cleaned,
            "totalUsers": outcome.total_users,
            "usersWhoOrdered": outcome.users_who_ordered,
            "message": format!("Sent {} order reminders", outcome.sent),
        }))),
    }
}

async fn upload_file(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<upload::BlobInfo>, AppError> {
    let (filename, content_type, bytes) = upload::read_file_field(&mut multipart).await?;
    let info = upload::save_upload(
        std::path::Path::new(&state.config.upload_dir),
        &state.config.upload_base_url,
        &filename,
        &content_type,
        &bytes,
    )?;
    Ok(Json(info))
}

// ---------------------------------------------------------------------------
// Menu catalog
// ---------------------------------------------------------------------------

async fn list_menus(State(state): State<Arc<AppState>>) -> Result<Json<Value>, AppError> {
    let list = menus::list_menus(&state.db)?;
    Ok(Json(json!({ "menus": list })))
}

async fn create_menu(
    State(state): State<Arc<AppState>>,
    Json(draft): Json<MenuDraft>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let menu = menus::create_menu(&state.db, &draft)?;
    Ok((StatusCode::CREATED, Json(json!({ "menu": menu }))))
}

async fn get_menu(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    Ok(Json(json!({ "menu": menus::get_menu(&state.db, &id)? })))
}

async fn update_menu(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(draft): Json<MenuDraft>,
) -> Result<Json<Value>, AppError> {
    Ok(Json(json!({ "menu": menus::update_menu(&state.db, &id, &draft)? })))
}

/// Flip the live pointer to this menu and fan the announcement out.
async fn set_menu_live(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let menu = menus::set_live(&state.db, &id)?;

    // Fan-out is best effort; the pointer write already succeeded.
    let outcome = match notify::relay_new_menu(&state.db, &state.push).await {
        Ok(o) => o,
        Err(e) => {
            warn!("new-menu fan-out failed: {e}");
            Default::default()
        }
    };

    Ok(Json(json!({
        "menu": menu,
        "sentNotifications": outcome.sent,
        "cleanedTokens": outcome.cleaned,
    })))
}

async fn get_live_menu(State(state): State<Arc<AppState>>) -> Result<Json<Value>, AppError> {
    Ok(Json(json!({ "menu": menus::live_menu(&state.db)? })))
}

async fn clear_live_menu(State(state): State<Arc<AppState>>) -> Result<Json<Value>, AppError> {
    menus::clear_live(&state.db)?;
    Ok(Json(json!({ "success": true })))
}

// ---------------------------------------------------------------------------
// Orders
// ---------------------------------------------------------------------------

/// Checkout. For prepaid orders the response carries the UPI intent the
/// client renders as a QR for the payment-collection step; COD goes straight
/// to confirmation.
async fn place_order(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PlaceOrderRequest>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let order = orders::place_order(&state.db, &req)?;

    let upi_intent = match order.payment_method {
        PaymentMethod::Prepaid => Some(payments::upi_intent(
            &state.config.upi_id,
            &state.config.upi_payee,
            order.total_amount,
            &order.id,
        )),
        PaymentMethod::Cod => None,
    };

    // Tell the admins; a push failure must not fail the checkout.
    if let Err(e) = notify::relay_new_order(&state.db, &state.push, &order).await {
        warn!(order_id = %order.id, "new-order fan-out failed: {e}");
    }

    Ok((
        StatusCode::CREATED,
        Json(json!({ "order": order, "upiIntent": upi_intent })),
    ))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrdersQuery {
    #[serde(default)]
    date: Option<String>,
    #[serde(default)]
    user_id: Option<String>,
}

async fn list_orders(
    State(state): State<Arc<AppState>>,
    Query(q): Query<OrdersQuery>,
) -> Result<Json<Value>, AppError> {
    let list = orders::list_orders(&state.db, q.date.as_deref(), q.user_id.as_deref())?;
    Ok(Json(json!({ "orders": list })))
}

async fn get_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    Ok(Json(json!({ "order": orders::get_order(&state.db, &id)? })))
}

#[derive(Deserialize)]
struct SetStatusBody {
    status: String,
}

/// Admin status transition. Fan-out runs for the notifiable statuses; its
/// failure does not roll the write back.
async fn set_order_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<SetStatusBody>,
) -> Result<Json<Value>, AppError> {
    let status = OrderStatus::parse(&body.status)
        .ok_or_else(|| AppError::Validation(format!("Unknown status: {}", body.status)))?;

    let change = orders::set_status(&state.db, &id, status)?;

    let notified = if change.order.status.is_notifiable() {
        match notify::notify_order_status(&state.db, &state.push, &change.order).await {
            Ok(StatusNotify::Sent(_)) => "sent",
            Ok(StatusNotify::TokenCleaned) => "token_cleaned",
            Ok(_) => "skipped",
            Err(e) => {
                warn!(order_id = %id, "status fan-out failed: {e}");
                "failed"
            }
        }
    } else {
        "not_required"
    };

    Ok(Json(json!({
        "success": true,
        "order": change.order,
        "previousStatus": change.previous_status,
        "notification": notified,
    })))
}

// ---------------------------------------------------------------------------
// Users
// ---------------------------------------------------------------------------

async fn upsert_user(
    State(state): State<Arc<AppState>>,
    Path(uid): Path<String>,
    Json(input): Json<UserUpsert>,
) -> Result<Json<Value>, AppError> {
    Ok(Json(json!({ "user": users::upsert_user(&state.db, &uid, &input)? })))
}

async fn get_user(
    State(state): State<Arc<AppState>>,
    Path(uid): Path<String>,
) -> Result<Json<Value>, AppError> {
    Ok(Json(json!({ "user": users::get_user(&state.db, &uid)? })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PushRegistrationBody {
    #[serde(default)]
    fcm_token: Option<String>,
    notifications_enabled: bool,
}

async fn set_push_registration(
    State(state): State<Arc<AppState>>,
    Path(uid): Path<String>,
    Json(body): Json<PushRegistrationBody>,
) -> Result<Json<Value>, AppError> {
    let user = users::set_push_registration(
        &state.db,
        &uid,
        body.fcm_token.as_deref(),
        body.notifications_enabled,
    )?;
    Ok(Json(json!({ "user": user })))
}

// ===========================================================================
// Tests
// ===========================================================================
