use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CourierStatus {
    Available,
    Busy,
    Offline,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Courier {
    pub id: Uuid,
    pub name: String,
    pub phone: String,
    pub location: GeoPoint,
    pub capacity: u8,
    pub current_load: u8,
    pub status: CourierStatus,
    pub rating: f64,
    pub updated_at: DateTime<Utc>,
}

impl Courier {
    pub fn can_take_order(&self) -> bool {
        self.status == CourierStatus::Available && self.current_load < self.capacity
    }
}
