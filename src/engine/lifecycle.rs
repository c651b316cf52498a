use chrono::{DateTime, Utc};
use rand::Rng;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::actor::Actor;
use crate::models::courier::GeoPoint;
use crate::models::order::{
    LineItem, Order, OrderIssue, OrderStatus, OrderTimestamps, PaymentMethod, PaymentStatus,
};
use crate::notify::{Channel, EventName};
use crate::state::AppState;
use crate::store::{CasFailure, OfferStore, OrderStore, StatusChange};

const MAX_REASON_LEN: usize = 500;
const BASE_DELIVERY_FEE: u64 = 500;
const DELIVERY_FEE_PER_KM: u64 = 100;
const SERVICE_FEE_PERCENT: u64 = 5;

pub struct CreateOrder {
    pub restaurant_id: Uuid,
    pub items: Vec<LineItem>,
    pub payment_method: PaymentMethod,
    pub dropoff: GeoPoint,
}

/// Customer-facing order creation. Everything after this point goes through
/// the transition operations below.
pub async fn create_order(
    state: &AppState,
    actor: Actor,
    req: CreateOrder,
) -> Result<Order, AppError> {
    let Actor::Customer(customer_id) = actor else {
        return Err(AppError::Forbidden(
            "only customers create orders".to_string(),
        ));
    };

    if req.items.is_empty() {
        return Err(AppError::Validation("order has no items".to_string()));
    }
    for item in &req.items {
        if item.name.trim().is_empty() {
            return Err(AppError::Validation("item name cannot be empty".to_string()));
        }
        if item.quantity == 0 {
            return Err(AppError::Validation(format!(
                "item {} has zero quantity",
                item.name
            )));
        }
    }

    let restaurant = state
        .restaurants
        .get(&req.restaurant_id)
        .map(|entry| entry.value().clone())
        .ok_or_else(|| AppError::NotFound(format!("restaurant {} not found", req.restaurant_id)))?;
    if !restaurant.can_take_orders() {
        return Err(AppError::Validation(format!(
            "restaurant {} is not taking orders",
            restaurant.name
        )));
    }

    // Prices and quantities come from the client; totals must not wrap.
    let mut subtotal: u64 = 0;
    for item in &req.items {
        let line = item
            .unit_price
            .checked_mul(u64::from(item.quantity))
            .ok_or_else(|| AppError::Validation(format!("item {} total overflows", item.name)))?;
        subtotal = subtotal
            .checked_add(line)
            .ok_or_else(|| AppError::Validation("order subtotal overflows".to_string()))?;
    }
    let service_fee = subtotal
        .checked_mul(SERVICE_FEE_PERCENT)
        .map(|scaled| scaled / 100)
        .ok_or_else(|| AppError::Validation("order subtotal overflows".to_string()))?;
    let distance_km = crate::geo::haversine_km(&restaurant.location, &req.dropoff);
    let delivery_fee = BASE_DELIVERY_FEE + (distance_km.ceil() as u64) * DELIVERY_FEE_PER_KM;
    let total = subtotal
        .checked_add(delivery_fee)
        .and_then(|sum| sum.checked_add(service_fee))
        .ok_or_else(|| AppError::Validation("order total overflows".to_string()))?;

    let order = Order {
        id: Uuid::new_v4(),
        customer_id,
        restaurant_id: req.restaurant_id,
        courier_id: None,
        dropoff: req.dropoff,
        items: req.items,
        subtotal,
        delivery_fee,
        service_fee,
        total,
        status: OrderStatus::New,
        status_reason: None,
        payment_method: req.payment_method,
        payment_status: PaymentStatus::Pending,
        estimated_prep_minutes: None,
        pickup_code: None,
        delivery_code: None,
        proof_url: None,
        review_eligible: false,
        issues: vec![],
        created_at: Utc::now(),
        timestamps: OrderTimestamps::default(),
    };

    state.store.insert_order(order.clone()).await;
    state
        .metrics
        .open_orders
        .set(state.store.open_order_count().await as i64);

    state.notifier.publish(
        Channel::Restaurant(order.restaurant_id),
        EventName::OrderStatusChanged,
        json!({ "order_id": order.id, "status": order.status }),
    );

    info!(order_id = %order.id, customer_id = %customer_id, total = order.total, "order created");
    Ok(order)
}

pub async fn accept(
    state: &AppState,
    actor: Actor,
    order_id: Uuid,
    estimated_prep_minutes: Option<u32>,
) -> Result<Order, AppError> {
    let order = apply_transition(
        state,
        order_id,
        "accept",
        &[OrderStatus::New],
        OrderStatus::Accepted,
        |order| {
            ensure_order_restaurant(actor, order)?;
            let restaurant = state
                .restaurants
                .get(&order.restaurant_id)
                .ok_or_else(|| {
                    AppError::NotFound(format!("restaurant {} not found", order.restaurant_id))
                })?;
            if !restaurant.can_take_orders() {
                return Err(AppError::InvalidTransition(
                    "restaurant is not active and open".to_string(),
                ));
            }
            Ok(())
        },
        |_, at| StatusChange {
            at,
            estimated_prep_minutes,
            pickup_code: Some(numeric_code(4)),
            ..StatusChange::default()
        },
    )
    .await?;

    publish_status_changed(state, &order);
    Ok(order)
}

pub async fn reject(
    state: &AppState,
    actor: Actor,
    order_id: Uuid,
    reason: String,
    rejection_type: Option<String>,
) -> Result<Order, AppError> {
    let order = apply_transition(
        state,
        order_id,
        "reject",
        &[OrderStatus::New],
        OrderStatus::Rejected,
        |order| {
            ensure_order_restaurant(actor, order)?;
            validate_reason(&reason)
        },
        |_, at| StatusChange {
            at,
            reason: Some(reason.clone()),
            ..StatusChange::default()
        },
    )
    .await?;

    release_offers(state, &order).await;
    publish_status_changed(state, &order);
    state.notifier.publish(
        Channel::Order(order.id),
        EventName::OrderCancelled,
        json!({
            "order_id": order.id,
            "status": order.status,
            "reason": order.status_reason,
            "rejection_type": rejection_type,
        }),
    );

    Ok(order)
}

pub async fn mark_preparing(
    state: &AppState,
    actor: Actor,
    order_id: Uuid,
) -> Result<Order, AppError> {
    let order = apply_transition(
        state,
        order_id,
        "mark_preparing",
        &[OrderStatus::Accepted],
        OrderStatus::Preparing,
        |order| ensure_order_restaurant(actor, order),
        |_, at| StatusChange::at(at),
    )
    .await?;

    publish_status_changed(state, &order);
    Ok(order)
}

pub async fn mark_ready(state: &AppState, actor: Actor, order_id: Uuid) -> Result<Order, AppError> {
    let order = apply_transition(
        state,
        order_id,
        "mark_ready",
        &[OrderStatus::Preparing],
        OrderStatus::Ready,
        |order| ensure_order_restaurant(actor, order),
        |_, at| StatusChange::at(at),
    )
    .await?;

    publish_status_changed(state, &order);
    state.notifier.publish(
        Channel::Order(order.id),
        EventName::OrderReady,
        json!({ "order_id": order.id }),
    );

    // Ready is the assignable point: start the courier negotiation.
    crate::engine::dispatch::dispatch_order(state, &order).await?;

    Ok(order)
}

pub async fn confirm_pickup(
    state: &AppState,
    actor: Actor,
    order_id: Uuid,
    pickup_code: Option<String>,
) -> Result<Order, AppError> {
    let order = apply_transition(
        state,
        order_id,
        "confirm_pickup",
        &[OrderStatus::Ready],
        OrderStatus::PickedUp,
        |order| {
            ensure_assigned_courier(actor, order)?;
            verify_code_matches(order.pickup_code.as_deref(), pickup_code.as_deref(), "pickup")
        },
        |_, at| StatusChange::at(at),
    )
    .await?;

    publish_status_changed(state, &order);
    Ok(order)
}

pub async fn mark_delivering(
    state: &AppState,
    actor: Actor,
    order_id: Uuid,
) -> Result<Order, AppError> {
    let order = apply_transition(
        state,
        order_id,
        "mark_delivering",
        &[OrderStatus::PickedUp],
        OrderStatus::Delivering,
        |order| ensure_assigned_courier(actor, order),
        |_, at| StatusChange::at(at),
    )
    .await?;

    publish_status_changed(state, &order);
    Ok(order)
}

pub async fn confirm_delivery(
    state: &AppState,
    actor: Actor,
    order_id: Uuid,
    delivery_code: Option<String>,
    proof_url: Option<String>,
) -> Result<Order, AppError> {
    let order = apply_transition(
        state,
        order_id,
        "confirm_delivery",
        &[OrderStatus::Delivering],
        OrderStatus::Delivered,
        |order| {
            ensure_assigned_courier(actor, order)?;
            verify_code_matches(
                order.delivery_code.as_deref(),
                delivery_code.as_deref(),
                "delivery",
            )
        },
        |_, at| StatusChange {
            at,
            proof_url: proof_url.clone(),
            review_eligible: true,
            ..StatusChange::default()
        },
    )
    .await?;

    accrue_loyalty_points(state, order.customer_id);
    release_courier(state, &order);
    publish_status_changed(state, &order);

    info!(order_id = %order.id, "order delivered");
    Ok(order)
}

pub async fn cancel(
    state: &AppState,
    actor: Actor,
    order_id: Uuid,
    reason: String,
    cancellation_type: Option<String>,
) -> Result<Order, AppError> {
    // Customers may not cancel once the food is committed: Ready and later
    // always fail, even though the graph allows Ready -> Cancelled for
    // other flows.
    let order = apply_transition(
        state,
        order_id,
        "cancel",
        &[OrderStatus::New, OrderStatus::Accepted, OrderStatus::Preparing],
        OrderStatus::Cancelled,
        |order| {
            ensure_owner_customer(actor, order)?;
            validate_reason(&reason)
        },
        |_, at| StatusChange {
            at,
            reason: Some(reason.clone()),
            ..StatusChange::default()
        },
    )
    .await?;

    release_offers(state, &order).await;
    publish_status_changed(state, &order);
    state.notifier.publish(
        Channel::Order(order.id),
        EventName::OrderCancelled,
        json!({
            "order_id": order.id,
            "status": order.status,
            "reason": order.status_reason,
            "cancellation_type": cancellation_type,
        }),
    );

    Ok(order)
}

/// Appends an auxiliary issue record; the order status is untouched.
pub async fn report_issue(
    state: &AppState,
    actor: Actor,
    order_id: Uuid,
    issue_type: String,
    description: String,
) -> Result<Order, AppError> {
    if issue_type.trim().is_empty() || description.trim().is_empty() {
        return Err(AppError::Validation(
            "issue_type and description are required".to_string(),
        ));
    }

    let order = state
        .store
        .load_order(order_id)
        .await
        .ok_or_else(|| AppError::NotFound(format!("order {order_id} not found")))?;
    ensure_related_actor(actor, &order)?;

    let issue = OrderIssue {
        id: Uuid::new_v4(),
        raised_by_role: actor.role().to_string(),
        raised_by: actor.id(),
        issue_type,
        description,
        created_at: Utc::now(),
    };

    match state.store.append_issue(order_id, issue).await {
        Ok(order) => Ok(order),
        Err(_) => Err(AppError::NotFound(format!("order {order_id} not found"))),
    }
}

/// Load, authorize, guard, CAS. A lost CAS race is retried exactly once with
/// a fresh read, then surfaced as `InvalidTransition`.
async fn apply_transition(
    state: &AppState,
    order_id: Uuid,
    operation: &'static str,
    allowed_from: &[OrderStatus],
    to: OrderStatus,
    authorize: impl Fn(&Order) -> Result<(), AppError>,
    build_change: impl Fn(&Order, DateTime<Utc>) -> StatusChange,
) -> Result<Order, AppError> {
    let mut retried = false;
    loop {
        let order = state
            .store
            .load_order(order_id)
            .await
            .ok_or_else(|| AppError::NotFound(format!("order {order_id} not found")))?;

        authorize(&order)?;

        if !allowed_from.contains(&order.status) {
            state
                .metrics
                .transitions_total
                .with_label_values(&[to.as_str(), "rejected"])
                .inc();
            return Err(AppError::InvalidTransition(format!(
                "{operation} not allowed from {}",
                order.status.as_str()
            )));
        }

        let change = build_change(&order, Utc::now());
        match state
            .store
            .cas_update_order_status(order_id, order.status, to, change)
            .await
        {
            Ok(updated) => {
                state
                    .metrics
                    .transitions_total
                    .with_label_values(&[to.as_str(), "success"])
                    .inc();
                state
                    .metrics
                    .open_orders
                    .set(state.store.open_order_count().await as i64);
                info!(order_id = %order_id, from = order.status.as_str(), to = to.as_str(), "transition applied");
                return Ok(updated);
            }
            Err(CasFailure::NotFound) => {
                return Err(AppError::NotFound(format!("order {order_id} not found")));
            }
            Err(CasFailure::StatusConflict(actual)) => {
                if retried {
                    state
                        .metrics
                        .transitions_total
                        .with_label_values(&[to.as_str(), "conflict"])
                        .inc();
                    return Err(AppError::InvalidTransition(format!(
                        "{operation} lost a concurrent update, order is now {}",
                        actual.as_str()
                    )));
                }
                retried = true;
            }
        }
    }
}

fn ensure_order_restaurant(actor: Actor, order: &Order) -> Result<(), AppError> {
    match actor {
        Actor::Restaurant(id) if id == order.restaurant_id => Ok(()),
        Actor::Restaurant(_) => Err(AppError::Forbidden(
            "order belongs to another restaurant".to_string(),
        )),
        _ => Err(AppError::Forbidden(format!(
            "{} may not perform restaurant operations",
            actor.role()
        ))),
    }
}

fn ensure_assigned_courier(actor: Actor, order: &Order) -> Result<(), AppError> {
    match actor {
        Actor::Courier(id) if order.courier_id == Some(id) => Ok(()),
        Actor::Courier(_) => Err(AppError::Forbidden(
            "not the courier assigned to this order".to_string(),
        )),
        _ => Err(AppError::Forbidden(format!(
            "{} may not perform courier operations",
            actor.role()
        ))),
    }
}

fn ensure_owner_customer(actor: Actor, order: &Order) -> Result<(), AppError> {
    match actor {
        Actor::Customer(id) if id == order.customer_id => Ok(()),
        Actor::Customer(_) => Err(AppError::Forbidden(
            "order belongs to another customer".to_string(),
        )),
        _ => Err(AppError::Forbidden(format!(
            "{} may not cancel a customer order",
            actor.role()
        ))),
    }
}

fn ensure_related_actor(actor: Actor, order: &Order) -> Result<(), AppError> {
    let related = match actor {
        Actor::Customer(id) => id == order.customer_id,
        Actor::Restaurant(id) => id == order.restaurant_id,
        Actor::Courier(id) => order.courier_id == Some(id),
        Actor::Admin(_) => true,
    };
    if related {
        Ok(())
    } else {
        Err(AppError::Forbidden(
            "no relationship to this order".to_string(),
        ))
    }
}

fn validate_reason(reason: &str) -> Result<(), AppError> {
    if reason.trim().is_empty() {
        return Err(AppError::Validation("a reason is required".to_string()));
    }
    if reason.len() > MAX_REASON_LEN {
        return Err(AppError::Validation(format!(
            "reason exceeds {MAX_REASON_LEN} characters"
        )));
    }
    Ok(())
}

fn verify_code_matches(
    expected: Option<&str>,
    submitted: Option<&str>,
    what: &str,
) -> Result<(), AppError> {
    match expected {
        None => Ok(()),
        Some(expected) => match submitted {
            Some(code) if code == expected => Ok(()),
            _ => Err(AppError::Validation(format!("wrong {what} code"))),
        },
    }
}

pub(crate) fn numeric_code(digits: u32) -> String {
    let upper = 10u64.pow(digits);
    let value = rand::thread_rng().gen_range(0..upper);
    format!("{value:0width$}", width = digits as usize)
}

async fn release_offers(state: &AppState, order: &Order) {
    state.dispatch_queues.remove(&order.id);
    let released = state
        .store
        .expire_offers_for_order(order.id, None, Utc::now())
        .await;
    for offer in &released {
        state
            .metrics
            .offers_total
            .with_label_values(&["expired"])
            .inc();
        state.notifier.publish(
            Channel::Courier(offer.courier_id),
            EventName::OrderCancelled,
            json!({ "order_id": order.id, "offer_id": offer.id }),
        );
    }
}

fn accrue_loyalty_points(state: &AppState, customer_id: Uuid) {
    let points = state.config.loyalty_points_per_delivery;
    for mut entry in state.accounts.iter_mut() {
        if entry.value().id == customer_id {
            entry.value_mut().loyalty_points += points;
            return;
        }
    }
}

fn release_courier(state: &AppState, order: &Order) {
    let Some(courier_id) = order.courier_id else {
        return;
    };
    if let Some(mut courier) = state.couriers.get_mut(&courier_id) {
        courier.current_load = courier.current_load.saturating_sub(1);
        if courier.status == crate::models::courier::CourierStatus::Busy
            && courier.current_load < courier.capacity
        {
            courier.status = crate::models::courier::CourierStatus::Available;
        }
        courier.updated_at = Utc::now();
    }
}

pub(crate) fn publish_status_changed(state: &AppState, order: &Order) {
    let payload = json!({
        "order_id": order.id,
        "status": order.status,
        "courier_id": order.courier_id,
    });

    state.notifier.publish(
        Channel::Order(order.id),
        EventName::OrderStatusChanged,
        payload.clone(),
    );
    state.notifier.publish(
        Channel::Restaurant(order.restaurant_id),
        EventName::OrderStatusChanged,
        payload.clone(),
    );
    if let Some(courier_id) = order.courier_id {
        state.notifier.publish(
            Channel::Courier(courier_id),
            EventName::OrderStatusChanged,
            payload,
        );
    }
    state
        .metrics
        .events_published_total
        .with_label_values(&["order_status_changed"])
        .inc();
}
