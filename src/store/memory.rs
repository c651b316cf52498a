use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use crate::models::offer::{Offer, OfferStatus};
use crate::models::order::{Order, OrderIssue, OrderStatus};
use crate::models::otp::OtpChallenge;
use crate::store::{CasFailure, OfferCasFailure, OfferStore, OrderStore, OtpStore, StatusChange};

/// DashMap-backed store. Per-entry locks make every CAS method linearizable
/// for a single record, which is the only granularity the engines need.
#[derive(Default)]
pub struct MemoryStore {
    orders: DashMap<Uuid, Order>,
    offers: DashMap<Uuid, Offer>,
    challenges: DashMap<String, Vec<OtpChallenge>>,
    challenge_phones: DashMap<Uuid, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OrderStore for MemoryStore {
    async fn insert_order(&self, order: Order) {
        self.orders.insert(order.id, order);
    }

    async fn load_order(&self, id: Uuid) -> Option<Order> {
        self.orders.get(&id).map(|entry| entry.value().clone())
    }

    async fn cas_update_order_status(
        &self,
        id: Uuid,
        expected: OrderStatus,
        to: OrderStatus,
        change: StatusChange,
    ) -> Result<Order, CasFailure> {
        let mut entry = self.orders.get_mut(&id).ok_or(CasFailure::NotFound)?;
        let order = entry.value_mut();

        if order.status != expected || !order.status.can_transition_to(to) {
            return Err(CasFailure::StatusConflict(order.status));
        }

        order.status = to;
        order.stamp(to, change.at);
        if change.reason.is_some() {
            order.status_reason = change.reason;
        }
        if change.estimated_prep_minutes.is_some() {
            order.estimated_prep_minutes = change.estimated_prep_minutes;
        }
        if change.pickup_code.is_some() {
            order.pickup_code = change.pickup_code;
        }
        if change.proof_url.is_some() {
            order.proof_url = change.proof_url;
        }
        if change.review_eligible {
            order.review_eligible = true;
        }

        Ok(order.clone())
    }

    async fn cas_assign_courier(
        &self,
        id: Uuid,
        courier_id: Uuid,
        delivery_code: String,
        _at: DateTime<Utc>,
    ) -> Result<Order, CasFailure> {
        let mut entry = self.orders.get_mut(&id).ok_or(CasFailure::NotFound)?;
        let order = entry.value_mut();

        if order.status != OrderStatus::Ready || order.courier_id.is_some() {
            return Err(CasFailure::StatusConflict(order.status));
        }

        order.courier_id = Some(courier_id);
        order.delivery_code = Some(delivery_code);

        Ok(order.clone())
    }

    async fn append_issue(&self, id: Uuid, issue: OrderIssue) -> Result<Order, CasFailure> {
        let mut entry = self.orders.get_mut(&id).ok_or(CasFailure::NotFound)?;
        let order = entry.value_mut();
        order.issues.push(issue);
        Ok(order.clone())
    }

    async fn ready_unassigned_orders(&self) -> Vec<Order> {
        self.orders
            .iter()
            .filter(|entry| {
                let order = entry.value();
                order.status == OrderStatus::Ready && order.courier_id.is_none()
            })
            .map(|entry| entry.value().clone())
            .collect()
    }

    async fn order_count(&self) -> usize {
        self.orders.len()
    }

    async fn open_order_count(&self) -> usize {
        self.orders
            .iter()
            .filter(|entry| !entry.value().status.is_terminal())
            .count()
    }
}

#[async_trait]
impl OfferStore for MemoryStore {
    async fn insert_offer(&self, offer: Offer) {
        self.offers.insert(offer.id, offer);
    }

    async fn load_offer(&self, id: Uuid) -> Option<Offer> {
        self.offers.get(&id).map(|entry| entry.value().clone())
    }

    async fn cas_accept_offer(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Offer, OfferCasFailure> {
        let mut entry = self.offers.get_mut(&id).ok_or(OfferCasFailure::NotFound)?;
        let offer = entry.value_mut();

        if offer.status != OfferStatus::Pending {
            return Err(OfferCasFailure::AlreadyResolved(offer.status));
        }
        if offer.is_expired_at(now) {
            offer.status = OfferStatus::Expired;
            offer.resolved_at = Some(now);
            return Err(OfferCasFailure::Expired);
        }

        offer.status = OfferStatus::Accepted;
        offer.resolved_at = Some(now);
        Ok(offer.clone())
    }

    async fn cas_decline_offer(
        &self,
        id: Uuid,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Offer, OfferCasFailure> {
        let mut entry = self.offers.get_mut(&id).ok_or(OfferCasFailure::NotFound)?;
        let offer = entry.value_mut();

        if offer.status != OfferStatus::Pending {
            return Err(OfferCasFailure::AlreadyResolved(offer.status));
        }

        offer.status = OfferStatus::Declined;
        offer.decline_reason = reason;
        offer.resolved_at = Some(now);
        Ok(offer.clone())
    }

    async fn expire_offer(&self, id: Uuid, now: DateTime<Utc>) -> Option<Offer> {
        let mut entry = self.offers.get_mut(&id)?;
        let offer = entry.value_mut();
        if offer.status != OfferStatus::Pending {
            return None;
        }
        offer.status = OfferStatus::Expired;
        offer.resolved_at = Some(now);
        Some(offer.clone())
    }

    async fn cas_revert_accept(&self, id: Uuid, now: DateTime<Utc>) -> Option<Offer> {
        let mut entry = self.offers.get_mut(&id)?;
        let offer = entry.value_mut();
        if offer.status != OfferStatus::Accepted {
            return None;
        }
        offer.status = OfferStatus::Expired;
        offer.resolved_at = Some(now);
        Some(offer.clone())
    }

    async fn expire_offers_for_order(
        &self,
        order_id: Uuid,
        keep: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Vec<Offer> {
        // Collect ids first; mutating while iterating the same shard would
        // deadlock.
        let targets: Vec<Uuid> = self
            .offers
            .iter()
            .filter(|entry| {
                let offer = entry.value();
                offer.order_id == order_id
                    && offer.status == OfferStatus::Pending
                    && Some(offer.id) != keep
            })
            .map(|entry| entry.value().id)
            .collect();

        let mut flipped = Vec::with_capacity(targets.len());
        for id in targets {
            if let Some(offer) = self.expire_offer(id, now).await {
                flipped.push(offer);
            }
        }
        flipped
    }

    async fn expire_stale_offers(&self, now: DateTime<Utc>) -> Vec<Offer> {
        let targets: Vec<Uuid> = self
            .offers
            .iter()
            .filter(|entry| {
                let offer = entry.value();
                offer.status == OfferStatus::Pending && offer.is_expired_at(now)
            })
            .map(|entry| entry.value().id)
            .collect();

        let mut flipped = Vec::with_capacity(targets.len());
        for id in targets {
            if let Some(offer) = self.expire_offer(id, now).await {
                flipped.push(offer);
            }
        }
        flipped
    }

    async fn pending_offer_exists(&self, order_id: Uuid, courier_id: Uuid) -> bool {
        self.offers.iter().any(|entry| {
            let offer = entry.value();
            offer.order_id == order_id
                && offer.courier_id == courier_id
                && offer.status == OfferStatus::Pending
        })
    }

    async fn offers_for_order(&self, order_id: Uuid) -> Vec<Offer> {
        self.offers
            .iter()
            .filter(|entry| entry.value().order_id == order_id)
            .map(|entry| entry.value().clone())
            .collect()
    }

    async fn offers_for_courier(&self, courier_id: Uuid) -> Vec<Offer> {
        self.offers
            .iter()
            .filter(|entry| entry.value().courier_id == courier_id)
            .map(|entry| entry.value().clone())
            .collect()
    }

    async fn offer_count(&self) -> usize {
        self.offers.len()
    }
}

#[async_trait]
impl OtpStore for MemoryStore {
    async fn latest_challenge(&self, phone: &str) -> Option<OtpChallenge> {
        self.challenges
            .get(phone)
            .and_then(|entry| entry.value().last().cloned())
    }

    async fn insert_challenge(
        &self,
        challenge: OtpChallenge,
        window: Duration,
    ) -> Result<(), i64> {
        let mut entry = self
            .challenges
            .entry(challenge.phone.clone())
            .or_default();

        // Window check and insert happen under the same entry lock.
        if let Some(latest) = entry.value().last() {
            let elapsed = challenge.created_at - latest.created_at;
            if elapsed < window {
                return Err((window - elapsed).num_seconds().max(1));
            }
        }

        self.challenge_phones
            .insert(challenge.id, challenge.phone.clone());
        for prior in entry.value_mut().iter_mut() {
            if !prior.is_used {
                prior.is_used = true;
            }
        }
        entry.value_mut().push(challenge);
        Ok(())
    }

    async fn increment_attempts(&self, id: Uuid) -> Option<u32> {
        let phone = self.challenge_phones.get(&id)?.value().clone();
        let mut entry = self.challenges.get_mut(&phone)?;
        let challenge = entry.value_mut().iter_mut().find(|c| c.id == id)?;
        challenge.attempts += 1;
        Some(challenge.attempts)
    }

    async fn mark_challenge_used(&self, id: Uuid) {
        let Some(phone) = self.challenge_phones.get(&id).map(|e| e.value().clone()) else {
            return;
        };
        if let Some(mut entry) = self.challenges.get_mut(&phone) {
            if let Some(challenge) = entry.value_mut().iter_mut().find(|c| c.id == id) {
                challenge.is_used = true;
            }
        }
    }

    async fn purge_challenges_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut removed = 0;
        for mut entry in self.challenges.iter_mut() {
            let before = entry.value().len();
            entry.value_mut().retain(|c| {
                let keep = c.created_at >= cutoff;
                if !keep {
                    self.challenge_phones.remove(&c.id);
                }
                keep
            });
            removed += before - entry.value().len();
        }
        self.challenges.retain(|_, list| !list.is_empty());
        removed
    }
}
