use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::json;
use tokio::time::{interval, Duration as TokioDuration};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::DispatchPolicy;
use crate::engine::lifecycle;
use crate::engine::scoring::compute_score;
use crate::error::AppError;
use crate::models::actor::Actor;
use crate::models::courier::{Courier, CourierStatus};
use crate::models::offer::{Offer, OfferStatus};
use crate::models::order::{Order, OrderStatus};
use crate::notify::{Channel, EventName};
use crate::state::AppState;
use crate::store::{CasFailure, OfferCasFailure, OfferStore, OrderStore, OtpStore};

/// Kicks off the courier negotiation for a ready order. Under broadcast,
/// every candidate gets an offer at once; under sequential, one at a time
/// with the rest queued.
pub async fn dispatch_order(state: &AppState, order: &Order) -> Result<(), AppError> {
    let Some(pickup) = state
        .restaurants
        .get(&order.restaurant_id)
        .map(|entry| entry.value().location)
    else {
        warn!(order_id = %order.id, "restaurant disappeared before dispatch");
        return Ok(());
    };

    let mut ranked: Vec<(Courier, f64)> = state
        .couriers
        .iter()
        .filter(|entry| entry.value().can_take_order())
        .map(|entry| {
            let courier = entry.value().clone();
            let (score, _) = compute_score(&courier, &pickup);
            (courier, score)
        })
        .collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));

    if ranked.is_empty() {
        warn!(order_id = %order.id, "no eligible couriers; dispatch will retry on sweep");
        return Ok(());
    }

    match state.config.dispatch_policy {
        DispatchPolicy::Broadcast => {
            for (courier, score) in ranked.iter().take(state.config.dispatch_fanout) {
                let offer =
                    propose_to_courier(state, order.id, courier.id, EventName::NewDeliveryAvailable)
                        .await?;
                info!(order_id = %order.id, courier_id = %courier.id, offer_id = %offer.id, score, "offer broadcast");
            }
        }
        DispatchPolicy::Sequential => {
            let mut queue: VecDeque<Uuid> = ranked.iter().map(|(c, _)| c.id).collect();
            if let Some(first) = queue.pop_front() {
                state.dispatch_queues.insert(order.id, queue);
                let offer =
                    propose_to_courier(state, order.id, first, EventName::OrderProposed).await?;
                info!(order_id = %order.id, courier_id = %first, offer_id = %offer.id, "offer proposed");
            }
        }
    }

    Ok(())
}

/// Creates a pending offer with its expiry clock running and publishes the
/// policy's event to the courier's channel.
pub async fn propose_to_courier(
    state: &AppState,
    order_id: Uuid,
    courier_id: Uuid,
    event: EventName,
) -> Result<Offer, AppError> {
    if state.store.pending_offer_exists(order_id, courier_id).await {
        return Err(AppError::InvalidTransition(format!(
            "courier {courier_id} already has a pending offer for order {order_id}"
        )));
    }

    let now = Utc::now();
    let offer = Offer {
        id: Uuid::new_v4(),
        order_id,
        courier_id,
        status: OfferStatus::Pending,
        decline_reason: None,
        created_at: now,
        expires_at: now + Duration::seconds(state.config.offer_ttl_secs),
        resolved_at: None,
    };
    state.store.insert_offer(offer.clone()).await;

    state.notifier.publish(
        Channel::Courier(courier_id),
        event,
        json!({
            "offer_id": offer.id,
            "order_id": order_id,
            "expires_at": offer.expires_at,
        }),
    );
    state
        .metrics
        .events_published_total
        .with_label_values(&[event.as_str()])
        .inc();

    Ok(offer)
}

/// Courier accepts an offer. The offer CAS and the order-side assignment CAS
/// together guarantee exactly one winner per order; a loser's offer is
/// flipped to expired and the caller sees `OfferExpired`.
pub async fn accept_offer(
    state: &AppState,
    actor: Actor,
    offer_id: Uuid,
) -> Result<Offer, AppError> {
    let offer = load_authorized_offer(state, actor, offer_id).await?;
    let now = Utc::now();

    let offer = match state.store.cas_accept_offer(offer.id, now).await {
        Ok(offer) => offer,
        Err(failure) => return Err(offer_failure(failure, offer_id)),
    };

    let delivery_code = lifecycle::numeric_code(4);
    let order = match state
        .store
        .cas_assign_courier(offer.order_id, offer.courier_id, delivery_code, now)
        .await
    {
        Ok(order) => order,
        Err(CasFailure::NotFound) => {
            state.store.cas_revert_accept(offer.id, now).await;
            return Err(AppError::NotFound(format!(
                "order {} not found",
                offer.order_id
            )));
        }
        Err(CasFailure::StatusConflict(_)) => {
            // Lost the race for the order. Our own offer CAS already went
            // through, so roll it back rather than expiring a pending one.
            state.store.cas_revert_accept(offer.id, now).await;
            state
                .metrics
                .offers_total
                .with_label_values(&["expired"])
                .inc();
            return Err(AppError::OfferExpired);
        }
    };

    let siblings = state
        .store
        .expire_offers_for_order(order.id, Some(offer.id), now)
        .await;
    for sibling in &siblings {
        state
            .metrics
            .offers_total
            .with_label_values(&["expired"])
            .inc();
        state.notifier.publish(
            Channel::Courier(sibling.courier_id),
            EventName::OrderStatusChanged,
            json!({ "order_id": order.id, "offer_id": sibling.id, "offer_status": sibling.status }),
        );
    }

    if let Some(mut courier) = state.couriers.get_mut(&offer.courier_id) {
        courier.current_load = courier.current_load.saturating_add(1);
        if courier.current_load >= courier.capacity {
            courier.status = CourierStatus::Busy;
        }
        courier.updated_at = Utc::now();
    }

    state.dispatch_queues.remove(&order.id);
    state
        .metrics
        .offers_total
        .with_label_values(&["accepted"])
        .inc();
    lifecycle::publish_status_changed(state, &order);

    info!(order_id = %order.id, courier_id = %offer.courier_id, offer_id = %offer.id, "offer accepted");
    Ok(offer)
}

pub async fn decline_offer(
    state: &AppState,
    actor: Actor,
    offer_id: Uuid,
    reason: Option<String>,
) -> Result<Offer, AppError> {
    let offer = load_authorized_offer(state, actor, offer_id).await?;
    let now = Utc::now();

    let offer = match state.store.cas_decline_offer(offer.id, reason, now).await {
        Ok(offer) => offer,
        Err(failure) => return Err(offer_failure(failure, offer_id)),
    };

    state
        .metrics
        .offers_total
        .with_label_values(&["declined"])
        .inc();
    info!(offer_id = %offer.id, courier_id = %offer.courier_id, "offer declined");

    if state.config.dispatch_policy == DispatchPolicy::Sequential {
        advance_queue(state, offer.order_id).await;
    }

    Ok(offer)
}

/// Marks every past-deadline pending offer expired. Invoked by the sweeper
/// and cheap enough to call from anywhere. Returns how many were flipped.
pub async fn expire_stale(state: &AppState) -> usize {
    let expired = state.store.expire_stale_offers(Utc::now()).await;
    for offer in &expired {
        state
            .metrics
            .offers_total
            .with_label_values(&["expired"])
            .inc();
        info!(offer_id = %offer.id, order_id = %offer.order_id, "offer expired");
    }

    if state.config.dispatch_policy == DispatchPolicy::Sequential {
        for offer in &expired {
            advance_queue(state, offer.order_id).await;
        }
    }

    expired.len()
}

/// Next candidate under the sequential policy, if the order is still up for
/// grabs.
async fn advance_queue(state: &AppState, order_id: Uuid) {
    let Some(order) = state.store.load_order(order_id).await else {
        state.dispatch_queues.remove(&order_id);
        return;
    };
    if order.status != OrderStatus::Ready || order.courier_id.is_some() {
        state.dispatch_queues.remove(&order_id);
        return;
    }

    let next = state
        .dispatch_queues
        .get_mut(&order_id)
        .and_then(|mut queue| queue.value_mut().pop_front());

    match next {
        Some(courier_id) => {
            if let Err(err) =
                propose_to_courier(state, order_id, courier_id, EventName::OrderProposed).await
            {
                warn!(order_id = %order_id, courier_id = %courier_id, error = %err, "failed to propose to next candidate");
            }
        }
        None => {
            state.dispatch_queues.remove(&order_id);
            warn!(order_id = %order_id, "candidate queue exhausted; dispatch will retry on sweep");
        }
    }
}

/// Periodic maintenance: offer expiry, dispatch retry for stranded ready
/// orders, OTP retention, revocation TTLs.
pub async fn run_sweeper(state: Arc<AppState>) {
    info!("sweeper started");
    let mut ticker = interval(TokioDuration::from_secs(state.config.sweep_interval_secs));

    loop {
        ticker.tick().await;
        let now = Utc::now();

        expire_stale(&state).await;

        for order in state.store.ready_unassigned_orders().await {
            let has_pending = state
                .store
                .offers_for_order(order.id)
                .await
                .iter()
                .any(|offer| offer.status == OfferStatus::Pending);
            let has_queue = state.dispatch_queues.contains_key(&order.id);

            if !has_pending && !has_queue {
                if let Err(err) = dispatch_order(&state, &order).await {
                    warn!(order_id = %order.id, error = %err, "dispatch retry failed");
                }
            }
        }

        let cutoff = now - Duration::hours(state.config.otp_retention_hours);
        state.store.purge_challenges_before(cutoff).await;
        state.revocations.purge(now).await;
    }
}

async fn load_authorized_offer(
    state: &AppState,
    actor: Actor,
    offer_id: Uuid,
) -> Result<Offer, AppError> {
    let offer = state
        .store
        .load_offer(offer_id)
        .await
        .ok_or_else(|| AppError::NotFound(format!("offer {offer_id} not found")))?;

    match actor {
        Actor::Courier(id) if id == offer.courier_id => Ok(offer),
        Actor::Courier(_) => Err(AppError::Forbidden(
            "offer belongs to another courier".to_string(),
        )),
        _ => Err(AppError::Forbidden(format!(
            "{} may not act on courier offers",
            actor.role()
        ))),
    }
}

fn offer_failure(failure: OfferCasFailure, offer_id: Uuid) -> AppError {
    match failure {
        OfferCasFailure::NotFound => AppError::NotFound(format!("offer {offer_id} not found")),
        OfferCasFailure::Expired | OfferCasFailure::AlreadyResolved(OfferStatus::Expired) => {
            AppError::OfferExpired
        }
        OfferCasFailure::AlreadyResolved(status) => AppError::InvalidTransition(format!(
            "offer {offer_id} already resolved as {status:?}"
        )),
    }
}
