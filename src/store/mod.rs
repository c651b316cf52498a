pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::models::offer::{Offer, OfferStatus};
use crate::models::order::{Order, OrderIssue, OrderStatus};
use crate::models::otp::OtpChallenge;

/// Fields applied together with a status change, inside the same atomic
/// update as the status compare-and-swap.
#[derive(Debug, Clone, Default)]
pub struct StatusChange {
    pub at: DateTime<Utc>,
    pub reason: Option<String>,
    pub estimated_prep_minutes: Option<u32>,
    pub pickup_code: Option<String>,
    pub proof_url: Option<String>,
    pub review_eligible: bool,
}

impl StatusChange {
    pub fn at(at: DateTime<Utc>) -> Self {
        Self {
            at,
            ..Self::default()
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum CasFailure {
    NotFound,
    /// The stored status did not match the expected precondition; carries
    /// what was actually found.
    StatusConflict(OrderStatus),
}

#[derive(Debug, PartialEq, Eq)]
pub enum OfferCasFailure {
    NotFound,
    /// Offer already left `Pending`; carries the resolved status.
    AlreadyResolved(OfferStatus),
    /// Expiry deadline had passed at the consistent `now` of the update; the
    /// offer has been flipped to `Expired` as part of the same update.
    Expired,
}

#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn insert_order(&self, order: Order);
    async fn load_order(&self, id: Uuid) -> Option<Order>;

    /// Atomic status CAS: the update applies only if the stored status still
    /// equals `expected`. Rejected updates leave the record untouched.
    async fn cas_update_order_status(
        &self,
        id: Uuid,
        expected: OrderStatus,
        to: OrderStatus,
        change: StatusChange,
    ) -> Result<Order, CasFailure>;

    /// Atomic courier assignment: applies only while the order is `Ready`
    /// and unassigned. This is the arbitration point that guarantees one
    /// winning offer per order.
    async fn cas_assign_courier(
        &self,
        id: Uuid,
        courier_id: Uuid,
        delivery_code: String,
        at: DateTime<Utc>,
    ) -> Result<Order, CasFailure>;

    async fn append_issue(&self, id: Uuid, issue: OrderIssue) -> Result<Order, CasFailure>;

    /// Ready orders with no courier yet, for the dispatch retry sweep.
    async fn ready_unassigned_orders(&self) -> Vec<Order>;

    async fn order_count(&self) -> usize;
    async fn open_order_count(&self) -> usize;
}

#[async_trait]
pub trait OfferStore: Send + Sync {
    async fn insert_offer(&self, offer: Offer);
    async fn load_offer(&self, id: Uuid) -> Option<Offer>;

    /// Accepts iff the offer is still `Pending` and unexpired at `now`.
    /// Expiry and acceptance are evaluated against the same timestamp inside
    /// the atomic update; a past-deadline offer is marked `Expired` and the
    /// call fails with [`OfferCasFailure::Expired`].
    async fn cas_accept_offer(&self, id: Uuid, now: DateTime<Utc>)
        -> Result<Offer, OfferCasFailure>;

    async fn cas_decline_offer(
        &self,
        id: Uuid,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Offer, OfferCasFailure>;

    /// Force a single pending offer to `Expired`. No-op if it already
    /// resolved.
    async fn expire_offer(&self, id: Uuid, now: DateTime<Utc>) -> Option<Offer>;

    /// Rolls a just-accepted offer back to `Expired`: the loser of the
    /// order-assignment race, whose own offer CAS already succeeded.
    /// Applies only while the offer is `Accepted`.
    async fn cas_revert_accept(&self, id: Uuid, now: DateTime<Utc>) -> Option<Offer>;

    /// Expire every pending offer for an order except `keep` (sibling
    /// release on acceptance, offer release on reject/cancel). Returns the
    /// offers that were flipped.
    async fn expire_offers_for_order(
        &self,
        order_id: Uuid,
        keep: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Vec<Offer>;

    /// Sweep every pending offer whose deadline has passed. Returns the
    /// newly expired offers so the dispatch policy can advance.
    async fn expire_stale_offers(&self, now: DateTime<Utc>) -> Vec<Offer>;

    async fn pending_offer_exists(&self, order_id: Uuid, courier_id: Uuid) -> bool;
    async fn offers_for_order(&self, order_id: Uuid) -> Vec<Offer>;
    async fn offers_for_courier(&self, courier_id: Uuid) -> Vec<Offer>;
    async fn offer_count(&self) -> usize;
}

#[async_trait]
pub trait OtpStore: Send + Sync {
    /// Newest challenge for the phone in any state, for rate limiting.
    async fn latest_challenge(&self, phone: &str) -> Option<OtpChallenge>;

    /// Inserts a fresh challenge, provided the newest challenge for the
    /// phone is at least `window` old; otherwise returns the seconds left in
    /// the window. The window check, the invalidation of prior unused
    /// challenges and the insert are one atomic update, so two concurrent
    /// requests inside the window cannot both create a challenge.
    async fn insert_challenge(
        &self,
        challenge: OtpChallenge,
        window: Duration,
    ) -> Result<(), i64>;

    async fn increment_attempts(&self, id: Uuid) -> Option<u32>;
    async fn mark_challenge_used(&self, id: Uuid);

    /// Drops challenges created before `cutoff`. Returns how many were
    /// removed.
    async fn purge_challenges_before(&self, cutoff: DateTime<Utc>) -> usize;
}

/// The one shared mutable store behind the engines. The in-memory
/// implementation lives in [`memory`]; a relational one would implement the
/// same CAS contract with `UPDATE ... WHERE status = $expected`.
pub trait Store: OrderStore + OfferStore + OtpStore {}

impl<T: OrderStore + OfferStore + OtpStore> Store for T {}
