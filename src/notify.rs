//! Notification relay: stateless fan-out handlers over the user documents.
//!
//! One handler per trigger (menu went live, order placed, order status
//! changed, reminder sweep). Each queries its recipient set, sends one push
//! per recipient, and prunes registrations the provider reports as
//! unregistered. A failure for one recipient never aborts the rest; sends
//! are awaited sequentially and cleanup happens in one batch at the end.

use chrono::Utc;
use rusqlite::params;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::DbState;
use crate::error::AppError;
use crate::fcm::{PushMessage, PushSender, SendError};
use crate::menus;
use crate::orders::{self, Order, OrderStatus};
use crate::users::{self, Recipient, Role};

/// Fan-out result: how many pushes went out and how many stale
/// registrations were pruned.
#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayOutcome {
    pub sent: usize,
    pub cleaned: usize,
}

/// Reminder sweep result, mirroring the original endpoint's response fields.
#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReminderOutcome {
    pub sent: usize,
    pub cleaned: usize,
    pub total_users: usize,
    pub users_who_ordered: usize,
}

#[derive(Debug)]
pub enum ReminderSweep {
    /// No live menu for today; nothing to remind about.
    NoLiveMenu,
    Completed(ReminderOutcome),
}

/// Single-recipient outcome for order-status notifications.
#[derive(Debug, PartialEq)]
pub enum StatusNotify {
    Sent(String),
    /// The status is not one customers are told about.
    NotNotifiable,
    /// The user has no token or has notifications off.
    OptedOut,
    /// Send failed with an unregistered token; registration was cleared.
    TokenCleaned,
}

// ---------------------------------------------------------------------------
// Message builders
// ---------------------------------------------------------------------------

fn short_id(id: &str) -> &str {
    let n = id.len();
    &id[n.saturating_sub(6)..]
}

fn new_menu_message() -> PushMessage {
    PushMessage::new(
        "🍽️ New Menu Available!",
        "Today's delicious menu is now live. Check it out and place your order!",
    )
    .link("/")
}

fn new_order_message(order: &Order) -> PushMessage {
    let customer = order.customer_name.as_deref().unwrap_or("Customer");
    PushMessage::new(
        "🔔 New Order Received!",
        format!(
            "Order #{} from {} - ₹{}",
            short_id(&order.id),
            customer,
            order.total_amount
        ),
    )
    .link("/admin")
    .data("type", "new_order")
    .data("orderId", order.id.clone())
    .data("totalAmount", order.total_amount.to_string())
}

fn status_message(order: &Order) -> Option<PushMessage> {
    let (title, body) = match order.status {
        OrderStatus::Confirmed => (
            "✅ Order Confirmed!",
            format!(
                "Your order #{} has been confirmed and is being prepared.",
                short_id(&order.id)
            ),
        ),
        OrderStatus::Cancelled => (
            "❌ Order Cancelled",
            format!(
                "Your order #{} has been cancelled. Contact support if you have questions.",
                short_id(&order.id)
            ),
        ),
        OrderStatus::Delivered => (
            "🎉 Order Delivered!",
            format!(
                "Your order #{} has been delivered. Enjoy your meal!",
                short_id(&order.id)
            ),
        ),
        _ => return None,
    };
    Some(
        PushMessage::new(title, body)
            .link("/my-orders")
            .data("type", "order_status")
            .data("orderId", order.id.clone())
            .data("status", order.status.as_str().to_string()),
    )
}

fn reminder_message(date: &str) -> PushMessage {
    PushMessage::new(
        "⏰ Last Chance to Order!",
        "Don't miss out on today's delicious menu. Order deadline is approaching soon!",
    )
    .link("/")
    .data("type", "order_reminder")
    .data("date", date.to_string())
}

// ---------------------------------------------------------------------------
// Fan-out core
// ---------------------------------------------------------------------------

/// Send `message` to each recipient in turn. Unregistered tokens are
/// collected and cleared in one batch; any other per-recipient failure is
/// logged and skipped.
async fn fan_out<S: PushSender>(
    db: &DbState,
    sender: &S,
    recipients: &[Recipient],
    message: &PushMessage,
) -> Result<RelayOutcome, AppError> {
    let mut sent = 0;
    let mut failed_uids: Vec<String> = Vec::new();

    for recipient in recipients {
        match sender.send(&recipient.fcm_token, message).await {
            Ok(message_id) => {
                info!(uid = %recipient.uid, %message_id, "push sent");
                sent += 1;
            }
            Err(SendError::NotRegistered) => {
                warn!(uid = %recipient.uid, "token no longer registered, marking for cleanup");
                failed_uids.push(recipient.uid.clone());
            }
            Err(SendError::Upstream(e)) => {
                warn!(uid = %recipient.uid, "push failed: {e}");
            }
        }
    }

    let cleaned = users::clear_push_registrations(db, &failed_uids)?;
    Ok(RelayOutcome { sent, cleaned })
}

// ---------------------------------------------------------------------------
// Trigger handlers
// ---------------------------------------------------------------------------

/// A menu went live: tell everyone who can be reached.
pub async fn relay_new_menu<S: PushSender>(
    db: &DbState,
    sender: &S,
) -> Result<RelayOutcome, AppError> {
    let recipients = users::notifiable_users(db, None)?;
    if recipients.is_empty() {
        return Ok(RelayOutcome::default());
    }
    fan_out(db, sender, &recipients, &new_menu_message()).await
}

/// An order was placed: tell the admins.
pub async fn relay_new_order<S: PushSender>(
    db: &DbState,
    sender: &S,
    order: &Order,
) -> Result<RelayOutcome, AppError> {
    let recipients = users::notifiable_users(db, Some(Role::Admin))?;
    if recipients.is_empty() {
        return Ok(RelayOutcome::default());
    }
    fan_out(db, sender, &recipients, &new_order_message(order)).await
}

/// An order's status changed: tell its owner, for the notifiable subset of
/// statuses only.
pub async fn notify_order_status<S: PushSender>(
    db: &DbState,
    sender: &S,
    order: &Order,
) -> Result<StatusNotify, AppError> {
    let Some(message) = status_message(order) else {
        return Ok(StatusNotify::NotNotifiable);
    };

    let user = users::get_user(db, &order.user_id)?;
    let Some(token) = user.fcm_token.filter(|_| user.notifications_enabled) else {
        return Ok(StatusNotify::OptedOut);
    };

    match sender.send(&token, &message).await {
        Ok(message_id) => Ok(StatusNotify::Sent(message_id)),
        Err(SendError::NotRegistered) => {
            users::clear_push_registrations(db, &[order.user_id.clone()])?;
            Ok(StatusNotify::TokenCleaned)
        }
        Err(SendError::Upstream(e)) => Err(AppError::Internal(e)),
    }
}

/// Ad-hoc reminder sweep: nudge regular users who have not ordered today,
/// provided today actually has a live menu. Writes an audit row either way
/// the sweep runs.
pub async fn send_order_reminders<S: PushSender>(
    db: &DbState,
    sender: &S,
    today: &str,
) -> Result<ReminderSweep, AppError> {
    if !menus::has_live_menu_for_date(db, today)? {
        info!(date = today, "no live menu, skipping reminders");
        return Ok(ReminderSweep::NoLiveMenu);
    }

    let all = users::notifiable_users(db, Some(Role::User))?;
    let already_ordered = orders::user_ids_with_order_on(db, today)?;
    let recipients: Vec<Recipient> = all
        .iter()
        .filter(|r| !already_ordered.contains(&r.uid))
        .cloned()
        .collect();

    let relay = fan_out(db, sender, &recipients, &reminder_message(today)).await?;
    let outcome = ReminderOutcome {
        sent: relay.sent,
        cleaned: relay.cleaned,
        total_users: all.len(),
        users_who_ordered: already_ordered.len(),
    };

    log_sweep(db, "order_reminder", today, &outcome)?;

    info!(
        date = today,
        sent = outcome.sent,
        cleaned = outcome.cleaned,
        "reminder sweep completed"
    );
    Ok(ReminderSweep::Completed(outcome))
}

fn log_sweep(
    db: &DbState,
    log_type: &str,
    date: &str,
    outcome: &ReminderOutcome,
) -> Result<(), AppError> {
    let conn = db.conn.lock().map_err(|e| AppError::Internal(e.to_string()))?;
    conn.execute(
        "INSERT INTO notification_logs (id, log_type, log_date, sent_count, cleaned_tokens,
                                        total_users, users_who_ordered, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            Uuid::new_v4().to_string(),
            log_type,
            date,
            outcome.sent as i64,
            outcome.cleaned as i64,
            outcome.total_users as i64,
            outcome.users_who_ordered as i64,
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::menus::tests::{sample_draft, test_db};
    use crate::orders::PlaceOrderRequest;
    use crate::payments::PaymentMethod;
    use crate::users::UserUpsert;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// Recording sender; tokens in `dead_tokens` fail as unregistered.
    pub(crate) struct MockSender {
        pub sent: Mutex<Vec<(String, PushMessage)>>,
        pub dead_tokens: HashSet<String>,
    }

    impl MockSender {
        pub fn new() -> Self {
            MockSender {
                sent: Mutex::new(Vec::new()),
                dead_tokens: HashSet::new(),
            }
        }

        pub fn with_dead_tokens(tokens: &[&str]) -> Self {
            MockSender {
                sent: Mutex::new(Vec::new()),
                dead_tokens: tokens.iter().map(|s| s.to_string()).collect(),
            }
        }

        fn sent_tokens(&self) -> Vec<String> {
            self.sent.lock().unwrap().iter().map(|(t, _)| t.clone()).collect()
        }
    }

    impl PushSender for MockSender {
        async fn send(&self, token: &str, message: &PushMessage) -> Result<String, SendError> {
            if self.dead_tokens.contains(token) {
                return Err(SendError::NotRegistered);
            }
            self.sent
                .lock()
                .unwrap()
                .push((token.to_string(), message.clone()));
            Ok(format!("msg-{}", token))
        }
    }

    fn seed_user(db: &DbState, uid: &str, role: Role, token: Option<&str>, enabled: bool) {
        users::upsert_user(
            db,
            uid,
            &UserUpsert {
                email: format!("{uid}@example.com"),
                name: None,
                role,
            },
        )
        .expect("upsert");
        if token.is_some() || enabled {
            users::set_push_registration(db, uid, token, enabled).expect("register");
        }
    }

    fn seed_order(db: &DbState, user_id: &str) -> Order {
        let menu = crate::menus::create_menu(db, &sample_draft()).expect("menu");
        orders::place_order(
            db,
            &PlaceOrderRequest {
                user_id: user_id.into(),
                user_email: format!("{user_id}@example.com"),
                customer_name: Some("Asha".into()),
                menu_id: menu.id,
                chapati_option: "C3".into(),
                quantity: 2,
                payment_method: PaymentMethod::Cod,
                address: "Hostel B".into(),
                instructions: None,
            },
        )
        .expect("place")
    }

    #[tokio::test]
    async fn test_relay_new_menu_isolates_dead_tokens() {
        let db = test_db();
        seed_user(&db, "u1", Role::User, Some("tok-1"), true);
        seed_user(&db, "u2", Role::User, Some("tok-dead"), true);
        seed_user(&db, "u3", Role::User, Some("tok-3"), true);

        let sender = MockSender::with_dead_tokens(&["tok-dead"]);
        let outcome = relay_new_menu(&db, &sender).await.expect("relay");

        // Dead token did not stop the others
        assert_eq!(outcome.sent, 2);
        assert_eq!(outcome.cleaned, 1);
        assert_eq!(sender.sent_tokens(), vec!["tok-1", "tok-3"]);

        // u2's registration was pruned
        let u2 = users::get_user(&db, "u2").unwrap();
        assert!(u2.fcm_token.is_none());
        assert!(!u2.notifications_enabled);

        // And the other users kept theirs
        assert!(users::get_user(&db, "u1").unwrap().fcm_token.is_some());
    }

    #[tokio::test]
    async fn test_relay_new_order_targets_admins_only() {
        let db = test_db();
        seed_user(&db, "admin-1", Role::Admin, Some("tok-admin"), true);
        seed_user(&db, "u1", Role::User, Some("tok-user"), true);
        let order = seed_order(&db, "u1");

        let sender = MockSender::new();
        let outcome = relay_new_order(&db, &sender, &order).await.expect("relay");

        assert_eq!(outcome.sent, 1);
        assert_eq!(sender.sent_tokens(), vec!["tok-admin"]);

        let sent = sender.sent.lock().unwrap();
        let (_, message) = &sent[0];
        assert!(message.body.contains("₹128"));
        assert!(message.body.contains(&order.id[order.id.len() - 6..]));
        assert_eq!(message.data.get("type").map(String::as_str), Some("new_order"));
    }

    #[tokio::test]
    async fn test_notify_order_status_paths() {
        let db = test_db();
        seed_user(&db, "u1", Role::User, Some("tok-1"), true);
        let order = seed_order(&db, "u1");

        // pending is not a notifiable status
        let result = notify_order_status(&db, &MockSender::new(), &order)
            .await
            .expect("notify");
        assert_eq!(result, StatusNotify::NotNotifiable);

        let change = orders::set_status(&db, &order.id, OrderStatus::Confirmed).expect("set");
        let sender = MockSender::new();
        let result = notify_order_status(&db, &sender, &change.order)
            .await
            .expect("notify");
        assert!(matches!(result, StatusNotify::Sent(_)));
        let sent = sender.sent.lock().unwrap();
        assert_eq!(sent[0].1.title, "✅ Order Confirmed!");
        drop(sent);

        // Opted-out user is silently skipped
        users::set_push_registration(&db, "u1", Some("tok-1"), false).unwrap();
        let result = notify_order_status(&db, &MockSender::new(), &change.order)
            .await
            .expect("notify");
        assert_eq!(result, StatusNotify::OptedOut);
    }

    #[tokio::test]
    async fn test_notify_order_status_cleans_dead_token() {
        let db = test_db();
        seed_user(&db, "u1", Role::User, Some("tok-dead"), true);
        let order = seed_order(&db, "u1");
        let change = orders::set_status(&db, &order.id, OrderStatus::Confirmed).expect("set");

        let sender = MockSender::with_dead_tokens(&["tok-dead"]);
        let result = notify_order_status(&db, &sender, &change.order)
            .await
            .expect("notify");
        assert_eq!(result, StatusNotify::TokenCleaned);
        assert!(users::get_user(&db, "u1").unwrap().fcm_token.is_none());
    }

    #[tokio::test]
    async fn test_notify_order_status_unknown_user_is_not_found() {
        let db = test_db();
        seed_user(&db, "u1", Role::User, Some("tok-1"), true);
        let order = seed_order(&db, "u1");
        let change = orders::set_status(&db, &order.id, OrderStatus::Confirmed).expect("set");

        // Simulate the user document vanishing
        {
            let conn = db.conn.lock().unwrap();
            conn.execute("DELETE FROM users WHERE uid = 'u1'", []).unwrap();
        }
        let err = notify_order_status(&db, &MockSender::new(), &change.order)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_reminder_sweep_skips_without_live_menu() {
        let db = test_db();
        seed_user(&db, "u1", Role::User, Some("tok-1"), true);

        let sweep = send_order_reminders(&db, &MockSender::new(), "2025-06-01")
            .await
            .expect("sweep");
        assert!(matches!(sweep, ReminderSweep::NoLiveMenu));
    }

    #[tokio::test]
    async fn test_reminder_sweep_excludes_exactly_todays_orderers() {
        let db = test_db();
        let today = Utc::now().format("%Y-%m-%d").to_string();

        // Live menu dated today
        let mut draft = sample_draft();
        draft.menu_date = Some(today.clone());
        let menu = crate::menus::create_menu(&db, &draft).expect("menu");
        crate::menus::set_live(&db, &menu.id).expect("live");

        seed_user(&db, "ordered", Role::User, Some("tok-ordered"), true);
        seed_user(&db, "hungry", Role::User, Some("tok-hungry"), true);
        seed_user(&db, "admin-1", Role::Admin, Some("tok-admin"), true);

        // "ordered" already has an order today
        orders::place_order(
            &db,
            &PlaceOrderRequest {
                user_id: "ordered".into(),
                user_email: "ordered@example.com".into(),
                customer_name: None,
                menu_id: menu.id.clone(),
                chapati_option: "C3".into(),
                quantity: 1,
                payment_method: PaymentMethod::Cod,
                address: "Hostel B".into(),
                instructions: None,
            },
        )
        .expect("place");

        let sender = MockSender::new();
        let sweep = send_order_reminders(&db, &sender, &today).await.expect("sweep");
        let ReminderSweep::Completed(outcome) = sweep else {
            panic!("sweep should run");
        };

        // Only "hungry" gets the nudge: orderers excluded, admins out of scope
        assert_eq!(outcome.sent, 1);
        assert_eq!(outcome.total_users, 2);
        assert_eq!(outcome.users_who_ordered, 1);
        assert_eq!(sender.sent_tokens(), vec!["tok-hungry"]);

        // Audit row written
        let conn = db.conn.lock().unwrap();
        let (count, sent): (i64, i64) = conn
            .query_row(
                "SELECT COUNT(*), COALESCE(MAX(sent_count), 0) FROM notification_logs
                 WHERE log_type = 'order_reminder' AND log_date = ?1",
                params![today],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(sent, 1);
    }
}
