use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OtpKind {
    Login,
    Reset,
}

/// One-time numeric code sent to a phone. A challenge becomes permanently
/// unusable once `is_used` is set (successful verify) or once `attempts`
/// reaches `max_attempts`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OtpChallenge {
    pub id: Uuid,
    pub phone: String,
    pub code: String,
    pub kind: OtpKind,
    pub expires_at: DateTime<Utc>,
    pub is_used: bool,
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
}

impl OtpChallenge {
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        !self.is_used && now < self.expires_at
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}
