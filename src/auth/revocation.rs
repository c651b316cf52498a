use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

/// Shared session-revocation store. Every service instance must see the same
/// revocations, so the seam is a trait: the in-memory implementation below
/// is for a single instance and tests; a multi-instance deployment points
/// this at a shared store with the same TTL contract.
#[async_trait]
pub trait RevocationStore: Send + Sync {
    /// Marks a token revoked until `until`; after that the entry may be
    /// dropped, since the session itself has expired by then.
    async fn revoke(&self, token: Uuid, until: DateTime<Utc>);
    async fn is_revoked(&self, token: Uuid, now: DateTime<Utc>) -> bool;
    /// Drops entries whose TTL has lapsed. Returns how many were removed.
    async fn purge(&self, now: DateTime<Utc>) -> usize;
}

#[derive(Default)]
pub struct MemoryRevocationStore {
    entries: DashMap<Uuid, DateTime<Utc>>,
}

impl MemoryRevocationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RevocationStore for MemoryRevocationStore {
    async fn revoke(&self, token: Uuid, until: DateTime<Utc>) {
        self.entries.insert(token, until);
    }

    async fn is_revoked(&self, token: Uuid, now: DateTime<Utc>) -> bool {
        self.entries
            .get(&token)
            .map(|entry| now < *entry.value())
            .unwrap_or(false)
    }

    async fn purge(&self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, until| now < *until);
        before - self.entries.len()
    }
}
