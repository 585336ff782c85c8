//! Order pricing and the UPI payment reference.
//!
//! Amounts are whole rupees throughout; the original app never deals in
//! paise.

use serde::{Deserialize, Serialize};

/// Flat cash-on-delivery surcharge per parcel.
pub const COD_FEE_PER_PARCEL: i64 = 5;

/// Allowed order quantity range.
pub const MIN_QUANTITY: u32 = 1;
pub const MAX_QUANTITY: u32 = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    Prepaid,
    Cod,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Prepaid => "prepaid",
            PaymentMethod::Cod => "cod",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "prepaid" => Some(PaymentMethod::Prepaid),
            "cod" => Some(PaymentMethod::Cod),
            _ => None,
        }
    }
}

/// Total price for an order: `quantity * special`, plus the COD fee per
/// parcel when paying on delivery.
pub fn order_total(tier_special: i64, quantity: u32, method: PaymentMethod) -> i64 {
    let qty = quantity as i64;
    let cod_fee = match method {
        PaymentMethod::Cod => COD_FEE_PER_PARCEL * qty,
        PaymentMethod::Prepaid => 0,
    };
    tier_special * qty + cod_fee
}

/// Build the scannable UPI intent string shown on the prepaid payment step.
/// Encodes the amount and the order id as the transaction note.
pub fn upi_intent(upi_id: &str, payee: &str, amount: i64, order_id: &str) -> String {
    format!("upi://pay?pa={upi_id}&pn={payee}&am={amount}&tn={order_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_total_formula_over_full_quantity_range() {
        let special = 59;
        for q in MIN_QUANTITY..=MAX_QUANTITY {
            assert_eq!(
                order_total(special, q, PaymentMethod::Prepaid),
                special * q as i64
            );
            assert_eq!(
                order_total(special, q, PaymentMethod::Cod),
                special * q as i64 + 5 * q as i64
            );
        }
    }

    #[test]
    fn test_order_total_c3_cod_scenario() {
        // Tier C3 at special ₹59, quantity 2, cash on delivery.
        assert_eq!(order_total(59, 2, PaymentMethod::Cod), 128);
    }

    #[test]
    fn test_prepaid_has_no_cod_fee() {
        assert_eq!(order_total(59, 2, PaymentMethod::Prepaid), 118);
    }

    #[test]
    fn test_payment_method_roundtrip() {
        assert_eq!(PaymentMethod::parse("prepaid"), Some(PaymentMethod::Prepaid));
        assert_eq!(PaymentMethod::parse("cod"), Some(PaymentMethod::Cod));
        assert_eq!(PaymentMethod::parse("card"), None);
        assert_eq!(PaymentMethod::Cod.as_str(), "cod");
    }

    #[test]
    fn test_upi_intent_encodes_amount_and_order_id() {
        let intent = upi_intent("8736866828@okbizaxis", "YummyFi", 128, "ord-42");
        assert_eq!(
            intent,
            "upi://pay?pa=8736866828@okbizaxis&pn=YummyFi&am=128&tn=ord-42"
        );
    }
}
