use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Customer account, created on first successful OTP verification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomerAccount {
    pub id: Uuid,
    pub phone: String,
    pub loyalty_points: u64,
    pub referral_code: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Restaurant {
    pub id: Uuid,
    pub name: String,
    pub location: super::courier::GeoPoint,
    pub is_active: bool,
    pub is_open: bool,
    pub created_at: DateTime<Utc>,
}

impl Restaurant {
    pub fn can_take_orders(&self) -> bool {
        self.is_active && self.is_open
    }
}

/// Written once when a referred user's registration completes; never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferralEntry {
    pub referrer_id: Uuid,
    pub referred_id: Uuid,
    pub points: u64,
    pub created_at: DateTime<Utc>,
}

/// Session minted on successful OTP verification, revoked on logout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub token: Uuid,
    pub customer_id: Uuid,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}
