//! Order intake and lifecycle.
//!
//! An order is written once at checkout and only its `status` field mutates
//! afterwards. The original admin UI let any status overwrite any other;
//! here transitions are validated against the forward-or-cancel table and
//! anything else is rejected (see `OrderStatus::can_transition_to`).

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::info;
use uuid::Uuid;

use crate::db::DbState;
use crate::error::AppError;
use crate::menus::{self, Menu};
use crate::payments::{self, PaymentMethod, MAX_QUANTITY, MIN_QUANTITY};

// ---------------------------------------------------------------------------
// Status state machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    PendingPayment,
    Pending,
    Confirmed,
    Preparing,
    OutForDelivery,
    Delivered,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::PendingPayment => "pending_payment",
            OrderStatus::Pending => "pending",
            OrderStatus::Confirmed => "confirmed",
            OrderStatus::Preparing => "preparing",
            OrderStatus::OutForDelivery => "out_for_delivery",
            OrderStatus::Delivered => "delivered",
            OrderStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending_payment" => Some(OrderStatus::PendingPayment),
            "pending" => Some(OrderStatus::Pending),
            "confirmed" => Some(OrderStatus::Confirmed),
            "preparing" => Some(OrderStatus::Preparing),
            "out_for_delivery" => Some(OrderStatus::OutForDelivery),
            "delivered" => Some(OrderStatus::Delivered),
            "cancelled" => Some(OrderStatus::Cancelled),
            _ => None,
        }
    }

    /// Position in the forward sequence. Cancelled sits outside it.
    fn rank(&self) -> Option<u8> {
        match self {
            OrderStatus::PendingPayment => Some(0),
            OrderStatus::Pending => Some(1),
            OrderStatus::Confirmed => Some(2),
            OrderStatus::Preparing => Some(3),
            OrderStatus::OutForDelivery => Some(4),
            OrderStatus::Delivered => Some(5),
            OrderStatus::Cancelled => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Delivered | OrderStatus::Cancelled)
    }

    /// Forward-or-cancel rule: any forward step along the sequence, or
    /// cancellation from a non-terminal state.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        if next == OrderStatus::Cancelled {
            return !self.is_terminal();
        }
        match (self.rank(), next.rank()) {
            (Some(from), Some(to)) => to > from,
            // Out of cancelled there is no way back
            _ => false,
        }
    }

    /// Statuses whose change fans out to the notification relay.
    pub fn is_notifiable(&self) -> bool {
        matches!(
            self,
            OrderStatus::Confirmed | OrderStatus::Cancelled | OrderStatus::Delivered
        )
    }

    /// Initial status seeded at checkout.
    pub fn seed(method: PaymentMethod) -> Self {
        match method {
            PaymentMethod::Prepaid => OrderStatus::PendingPayment,
            PaymentMethod::Cod => OrderStatus::Pending,
        }
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: String,
    pub user_id: String,
    pub user_email: String,
    pub customer_name: Option<String>,
    pub menu_id: String,
    pub menu_title: String,
    pub chapati_option: String,
    pub quantity: u32,
    pub payment_method: PaymentMethod,
    pub address: String,
    pub instructions: Option<String>,
    pub total_amount: i64,
    pub status: OrderStatus,
    pub order_date: String,
    pub order_time: String,
}

/// Checkout form payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceOrderRequest {
    pub user_id: String,
    pub user_email: String,
    #[serde(default)]
    pub customer_name: Option<String>,
    pub menu_id: String,
    pub chapati_option: String,
    #[serde(default = "default_quantity")]
    pub quantity: u32,
    pub payment_method: PaymentMethod,
    pub address: String,
    #[serde(default)]
    pub instructions: Option<String>,
}

fn default_quantity() -> u32 {
    1
}

/// Result of a status update: the mutated order plus what it moved from.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusChange {
    pub order: Order,
    pub previous_status: OrderStatus,
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

const ORDER_COLUMNS: &str = "id, user_id, user_email, customer_name, menu_id, menu_title, \
     chapati_option, quantity, payment_method, address, instructions, total_amount, status, \
     order_date, order_time";

fn order_from_row(row: &Row<'_>) -> rusqlite::Result<Order> {
    let method: String = row.get(8)?;
    let status: String = row.get(12)?;
    Ok(Order {
        id: row.get(0)?,
        user_id: row.get(1)?,
        user_email: row.get(2)?,
        customer_name: row.get(3)?,
        menu_id: row.get(4)?,
        menu_title: row.get(5)?,
        chapati_option: row.get(6)?,
        quantity: row.get(7)?,
        payment_method: PaymentMethod::parse(&method).unwrap_or(PaymentMethod::Prepaid),
        address: row.get(9)?,
        instructions: row.get(10)?,
        total_amount: row.get(11)?,
        status: OrderStatus::parse(&status).unwrap_or(OrderStatus::Pending),
        order_date: row.get(13)?,
        order_time: row.get(14)?,
    })
}

// ---------------------------------------------------------------------------
// Intake
// ---------------------------------------------------------------------------

/// Place an order against the referenced menu.
///
/// Validates the form, computes the total from the selected tier, seeds the
/// status from the payment method, and persists exactly one order row. The
/// menu and user documents are never mutated here.
pub fn place_order(db: &DbState, req: &PlaceOrderRequest) -> Result<Order, AppError> {
    if req.address.trim().is_empty() {
        return Err(AppError::Validation("Delivery address is required".into()));
    }
    if req.user_id.trim().is_empty() {
        return Err(AppError::Validation("Missing userId".into()));
    }
    if !(MIN_QUANTITY..=MAX_QUANTITY).contains(&req.quantity) {
        return Err(AppError::Validation(format!(
            "Quantity must be between {MIN_QUANTITY} and {MAX_QUANTITY}"
        )));
    }

    let menu: Menu = menus::get_menu(db, &req.menu_id)?;
    let tier = menu.tier(&req.chapati_option).ok_or_else(|| {
        AppError::Validation(format!("Unknown pricing option: {}", req.chapati_option))
    })?;
    match req.payment_method {
        PaymentMethod::Prepaid if !menu.payment_options.prepaid => {
            return Err(AppError::Validation(
                "Prepaid payment is not available for this menu".into(),
            ));
        }
        PaymentMethod::Cod if !menu.payment_options.cod => {
            return Err(AppError::Validation(
                "Cash on delivery is not available for this menu".into(),
            ));
        }
        _ => {}
    }

    let total = payments::order_total(tier.special, req.quantity, req.payment_method);
    let status = OrderStatus::seed(req.payment_method);

    let id = Uuid::new_v4().to_string();
    let now = Utc::now();
    let order_date = now.format("%Y-%m-%d").to_string();
    let order_time = now.to_rfc3339();

    let conn = db.conn.lock().map_err(|e| AppError::Internal(e.to_string()))?;
    conn.execute(
        "INSERT INTO orders (id, user_id, user_email, customer_name, menu_id, menu_title,
                             chapati_option, quantity, payment_method, address, instructions,
                             total_amount, status, order_date, order_time)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
        params![
            id,
            req.user_id,
            req.user_email,
            req.customer_name,
            menu.id,
            menu.title,
            req.chapati_option,
            req.quantity,
            req.payment_method.as_str(),
            req.address.trim(),
            req.instructions,
            total,
            status.as_str(),
            order_date,
            order_time,
        ],
    )?;
    drop(conn);

    info!(
        order_id = %id,
        user_id = %req.user_id,
        total,
        status = status.as_str(),
        "order placed"
    );

    get_order(db, &id)
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// Overwrite an order's status (admin operation, last-writer-wins).
///
/// Transitions outside the forward-or-cancel table are rejected — this is
/// deliberately stricter than the original admin panel, which allowed
/// arbitrary overwrites.
pub fn set_status(
    db: &DbState,
    order_id: &str,
    new_status: OrderStatus,
) -> Result<StatusChange, AppError> {
    let order = get_order(db, order_id)?;
    let previous = order.status;

    if !previous.can_transition_to(new_status) {
        return Err(AppError::InvalidTransition(format!(
            "{} -> {}",
            previous.as_str(),
            new_status.as_str()
        )));
    }

    let conn = db.conn.lock().map_err(|e| AppError::Internal(e.to_string()))?;
    conn.execute(
        "UPDATE orders SET status = ?2 WHERE id = ?1",
        params![order_id, new_status.as_str()],
    )?;
    drop(conn);

    info!(
        order_id,
        from = previous.as_str(),
        to = new_status.as_str(),
        "order status updated"
    );

    Ok(StatusChange {
        order: get_order(db, order_id)?,
        previous_status: previous,
    })
}

pub fn get_order(db: &DbState, id: &str) -> Result<Order, AppError> {
    let conn = db.conn.lock().map_err(|e| AppError::Internal(e.to_string()))?;
    conn.query_row(
        &format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = ?1"),
        params![id],
        order_from_row,
    )
    .optional()?
    .ok_or_else(|| AppError::NotFound("Order".into()))
}

/// Admin listing, newest first. Optional filters on date and user.
pub fn list_orders(
    db: &DbState,
    date: Option<&str>,
    user_id: Option<&str>,
) -> Result<Vec<Order>, AppError> {
    let conn = db.conn.lock().map_err(|e| AppError::Internal(e.to_string()))?;

    let mut sql = format!("SELECT {ORDER_COLUMNS} FROM orders");
    let mut clauses = Vec::new();
    let mut args: Vec<&str> = Vec::new();
    if let Some(d) = date {
        clauses.push(format!("order_date = ?{}", args.len() + 1));
        args.push(d);
    }
    if let Some(u) = user_id {
        clauses.push(format!("user_id = ?{}", args.len() + 1));
        args.push(u);
    }
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY order_time DESC");

    let mut stmt = conn.prepare(&sql)?;
    let orders = stmt
        .query_map(rusqlite::params_from_iter(args), order_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(orders)
}

/// User ids that already have an order on `date` (reminder exclusion set).
pub fn user_ids_with_order_on(db: &DbState, date: &str) -> Result<HashSet<String>, AppError> {
    let conn = db.conn.lock().map_err(|e| AppError::Internal(e.to_string()))?;
    let mut stmt = conn.prepare("SELECT DISTINCT user_id FROM orders WHERE order_date = ?1")?;
    let ids = stmt
        .query_map(params![date], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<HashSet<_>>>()?;
    Ok(ids)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::menus::tests::{sample_draft, test_db};
    use crate::menus::create_menu;

    fn place(db: &DbState, menu_id: &str, method: PaymentMethod, qty: u32) -> Result<Order, AppError> {
        place_order(
            db,
            &PlaceOrderRequest {
                user_id: "user-1".into(),
                user_email: "user@example.com".into(),
                customer_name: Some("Asha".into()),
                menu_id: menu_id.into(),
                chapati_option: "C3".into(),
                quantity: qty,
                payment_method: method,
                address: "Hostel B, Room 204".into(),
                instructions: None,
            },
        )
    }

    #[test]
    fn test_place_order_cod_totals_and_status() {
        let db = test_db();
        let menu = create_menu(&db, &sample_draft()).expect("menu");

        // Tier C3 special ₹59, qty 2, COD -> 2*59 + 2*5 = 128
        let order = place(&db, &menu.id, PaymentMethod::Cod, 2).expect("place");
        assert_eq!(order.total_amount, 128);
        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.menu_title, menu.title);
    }

    #[test]
    fn test_place_order_prepaid_seeds_pending_payment() {
        let db = test_db();
        let menu = create_menu(&db, &sample_draft()).expect("menu");

        let order = place(&db, &menu.id, PaymentMethod::Prepaid, 2).expect("place");
        assert_eq!(order.total_amount, 118);
        assert_eq!(order.status, OrderStatus::PendingPayment);
    }

    #[test]
    fn test_place_order_rejects_blank_address() {
        let db = test_db();
        let menu = create_menu(&db, &sample_draft()).expect("menu");
        let err = place_order(
            &db,
            &PlaceOrderRequest {
                user_id: "user-1".into(),
                user_email: "user@example.com".into(),
                customer_name: None,
                menu_id: menu.id.clone(),
                chapati_option: "C3".into(),
                quantity: 1,
                payment_method: PaymentMethod::Cod,
                address: "   ".into(),
                instructions: None,
            },
        )
        .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn test_place_order_rejects_unknown_tier_and_bad_quantity() {
        let db = test_db();
        let menu = create_menu(&db, &sample_draft()).expect("menu");

        let mut req = PlaceOrderRequest {
            user_id: "user-1".into(),
            user_email: "user@example.com".into(),
            customer_name: None,
            menu_id: menu.id.clone(),
            chapati_option: "C9".into(),
            quantity: 1,
            payment_method: PaymentMethod::Cod,
            address: "Hostel B".into(),
            instructions: None,
        };
        assert!(matches!(
            place_order(&db, &req),
            Err(AppError::Validation(_))
        ));

        req.chapati_option = "C3".into();
        req.quantity = 0;
        assert!(matches!(
            place_order(&db, &req),
            Err(AppError::Validation(_))
        ));

        req.quantity = 16;
        assert!(matches!(
            place_order(&db, &req),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn test_place_order_unknown_menu_is_not_found() {
        let db = test_db();
        assert!(matches!(
            place(&db, "missing-menu", PaymentMethod::Cod, 1),
            Err(AppError::NotFound(_))
        ));
    }

    #[test]
    fn test_place_order_respects_menu_payment_options() {
        let db = test_db();
        let mut draft = sample_draft();
        draft.payment_options.cod = false;
        let menu = create_menu(&db, &draft).expect("menu");

        assert!(matches!(
            place(&db, &menu.id, PaymentMethod::Cod, 1),
            Err(AppError::Validation(_))
        ));
        assert!(place(&db, &menu.id, PaymentMethod::Prepaid, 1).is_ok());
    }

    #[test]
    fn test_forward_transitions_allowed() {
        use OrderStatus::*;
        let forward = [
            PendingPayment,
            Pending,
            Confirmed,
            Preparing,
            OutForDelivery,
            Delivered,
        ];
        for pair in forward.windows(2) {
            assert!(
                pair[0].can_transition_to(pair[1]),
                "{} -> {} should be allowed",
                pair[0].as_str(),
                pair[1].as_str()
            );
        }
        // Skipping ahead is still forward
        assert!(PendingPayment.can_transition_to(Confirmed));
        assert!(Pending.can_transition_to(Delivered));
    }

    #[test]
    fn test_cancel_allowed_from_non_terminal_only() {
        use OrderStatus::*;
        for s in [PendingPayment, Pending, Confirmed, Preparing, OutForDelivery] {
            assert!(s.can_transition_to(Cancelled), "{} -> cancelled", s.as_str());
        }
        assert!(!Delivered.can_transition_to(Cancelled));
        assert!(!Cancelled.can_transition_to(Cancelled));
    }

    // The original admin panel allowed any overwrite (delivered -> pending
    // succeeded). This codebase hardens that: backward moves are rejected.
    #[test]
    fn test_rejects_backward_transition() {
        use OrderStatus::*;
        assert!(!Delivered.can_transition_to(Pending));
        assert!(!Confirmed.can_transition_to(Pending));
        assert!(!Cancelled.can_transition_to(Confirmed));

        let db = test_db();
        let menu = create_menu(&db, &sample_draft()).expect("menu");
        let order = place(&db, &menu.id, PaymentMethod::Cod, 1).expect("place");

        set_status(&db, &order.id, Confirmed).expect("confirm");
        let err = set_status(&db, &order.id, Pending).unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition(_)));

        // Status untouched after the rejected write
        assert_eq!(get_order(&db, &order.id).unwrap().status, Confirmed);
    }

    #[test]
    fn test_set_status_reports_previous() {
        let db = test_db();
        let menu = create_menu(&db, &sample_draft()).expect("menu");
        let order = place(&db, &menu.id, PaymentMethod::Cod, 1).expect("place");

        let change = set_status(&db, &order.id, OrderStatus::Confirmed).expect("set");
        assert_eq!(change.previous_status, OrderStatus::Pending);
        assert_eq!(change.order.status, OrderStatus::Confirmed);
        assert!(change.order.status.is_notifiable());

        let change = set_status(&db, &order.id, OrderStatus::Preparing).expect("set");
        assert!(!change.order.status.is_notifiable());
    }

    #[test]
    fn test_list_orders_filters() {
        let db = test_db();
        let menu = create_menu(&db, &sample_draft()).expect("menu");
        place(&db, &menu.id, PaymentMethod::Cod, 1).expect("place 1");
        place_order(
            &db,
            &PlaceOrderRequest {
                user_id: "user-2".into(),
                user_email: "two@example.com".into(),
                customer_name: None,
                menu_id: menu.id.clone(),
                chapati_option: "C5".into(),
                quantity: 1,
                payment_method: PaymentMethod::Prepaid,
                address: "Hostel C".into(),
                instructions: None,
            },
        )
        .expect("place 2");

        assert_eq!(list_orders(&db, None, None).unwrap().len(), 2);
        assert_eq!(list_orders(&db, None, Some("user-2")).unwrap().len(), 1);

        let today = Utc::now().format("%Y-%m-%d").to_string();
        assert_eq!(list_orders(&db, Some(&today), None).unwrap().len(), 2);
        assert!(list_orders(&db, Some("1999-01-01"), None).unwrap().is_empty());
    }

    #[test]
    fn test_user_ids_with_order_on_date() {
        let db = test_db();
        let menu = create_menu(&db, &sample_draft()).expect("menu");
        place(&db, &menu.id, PaymentMethod::Cod, 1).expect("place");
        place(&db, &menu.id, PaymentMethod::Cod, 1).expect("place again");

        let today = Utc::now().format("%Y-%m-%d").to_string();
        let ids = user_ids_with_order_on(&db, &today).expect("ids");
        assert_eq!(ids.len(), 1);
        assert!(ids.contains("user-1"));
        assert!(user_ids_with_order_on(&db, "1999-01-01").unwrap().is_empty());
    }
}
