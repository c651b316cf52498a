use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    New,
    Accepted,
    Preparing,
    Ready,
    PickedUp,
    Delivering,
    Delivered,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    /// The single transition table. Every status change in the service goes
    /// through this check; there are no per-handler guard chains.
    pub fn can_transition_to(self, target: OrderStatus) -> bool {
        use OrderStatus::*;
        matches!(
            (self, target),
            (New, Accepted)
                | (New, Rejected)
                | (Accepted, Preparing)
                | (Preparing, Ready)
                | (Ready, PickedUp)
                | (PickedUp, Delivering)
                | (Delivering, Delivered)
                | (New, Cancelled)
                | (Accepted, Cancelled)
                | (Preparing, Cancelled)
                | (Ready, Cancelled)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Delivered | OrderStatus::Cancelled | OrderStatus::Rejected
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::New => "new",
            OrderStatus::Accepted => "accepted",
            OrderStatus::Preparing => "preparing",
            OrderStatus::Ready => "ready",
            OrderStatus::PickedUp => "picked_up",
            OrderStatus::Delivering => "delivering",
            OrderStatus::Delivered => "delivered",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Rejected => "rejected",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Cash,
    OrangeMoney,
    MtnMoney,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Refunded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineItem {
    pub name: String,
    pub quantity: u32,
    /// Unit price in minor currency units.
    pub unit_price: u64,
    #[serde(default)]
    pub options: Vec<String>,
}

/// One timestamp per transition reached, stamped by the lifecycle engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderTimestamps {
    pub accepted_at: Option<DateTime<Utc>>,
    pub preparing_at: Option<DateTime<Utc>>,
    pub ready_at: Option<DateTime<Utc>>,
    pub picked_up_at: Option<DateTime<Utc>>,
    pub delivering_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub rejected_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderIssue {
    pub id: Uuid,
    pub raised_by_role: String,
    pub raised_by: Uuid,
    pub issue_type: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub restaurant_id: Uuid,
    pub courier_id: Option<Uuid>,
    pub dropoff: crate::models::courier::GeoPoint,
    pub items: Vec<LineItem>,
    pub subtotal: u64,
    pub delivery_fee: u64,
    pub service_fee: u64,
    pub total: u64,
    pub status: OrderStatus,
    /// Cancellation or rejection reason, set on those transitions only.
    pub status_reason: Option<String>,
    pub payment_method: PaymentMethod,
    pub payment_status: PaymentStatus,
    pub estimated_prep_minutes: Option<u32>,
    pub pickup_code: Option<String>,
    pub delivery_code: Option<String>,
    pub proof_url: Option<String>,
    pub review_eligible: bool,
    pub issues: Vec<OrderIssue>,
    pub created_at: DateTime<Utc>,
    pub timestamps: OrderTimestamps,
}

impl Order {
    pub fn stamp(&mut self, status: OrderStatus, at: DateTime<Utc>) {
        match status {
            OrderStatus::Accepted => self.timestamps.accepted_at = Some(at),
            OrderStatus::Preparing => self.timestamps.preparing_at = Some(at),
            OrderStatus::Ready => self.timestamps.ready_at = Some(at),
            OrderStatus::PickedUp => self.timestamps.picked_up_at = Some(at),
            OrderStatus::Delivering => self.timestamps.delivering_at = Some(at),
            OrderStatus::Delivered => self.timestamps.delivered_at = Some(at),
            OrderStatus::Cancelled => self.timestamps.cancelled_at = Some(at),
            OrderStatus::Rejected => self.timestamps.rejected_at = Some(at),
            OrderStatus::New => {}
        }
    }
}
