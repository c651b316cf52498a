use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use serde::Deserialize;
use uuid::Uuid;

use crate::engine::lifecycle::{self, CreateOrder};
use crate::error::AppError;
use crate::models::actor::Actor;
use crate::models::courier::GeoPoint;
use crate::models::offer::Offer;
use crate::models::order::{LineItem, Order, PaymentMethod};
use crate::state::AppState;
use crate::store::{OfferStore, OrderStore};

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/orders", post(create_order))
        .route("/orders/:id", get(get_order))
        .route("/orders/:id/accept", post(accept))
        .route("/orders/:id/reject", post(reject))
        .route("/orders/:id/preparing", post(mark_preparing))
        .route("/orders/:id/ready", post(mark_ready))
        .route("/orders/:id/pickup", post(confirm_pickup))
        .route("/orders/:id/delivering", post(mark_delivering))
        .route("/orders/:id/delivered", post(confirm_delivery))
        .route("/orders/:id/cancel", post(cancel))
        .route("/orders/:id/issues", post(report_issue))
        .route("/orders/:id/offers", get(list_order_offers))
}

#[derive(Deserialize)]
pub struct CreateOrderRequest {
    pub restaurant_id: Uuid,
    pub items: Vec<LineItem>,
    pub payment_method: PaymentMethod,
    pub dropoff: GeoPoint,
}

#[derive(Deserialize)]
pub struct AcceptRequest {
    pub estimated_prep_minutes: Option<u32>,
}

#[derive(Deserialize)]
pub struct RejectRequest {
    pub reason: String,
    pub rejection_type: Option<String>,
}

#[derive(Deserialize)]
pub struct CancelRequest {
    pub reason: String,
    pub cancellation_type: Option<String>,
}

#[derive(Deserialize, Default)]
pub struct PickupRequest {
    pub pickup_code: Option<String>,
}

#[derive(Deserialize, Default)]
pub struct DeliveryRequest {
    pub delivery_code: Option<String>,
    pub proof_url: Option<String>,
}

#[derive(Deserialize)]
pub struct IssueRequest {
    pub issue_type: String,
    pub description: String,
}

async fn create_order(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Json(payload): Json<CreateOrderRequest>,
) -> Result<Json<Order>, AppError> {
    let order = lifecycle::create_order(
        &state,
        actor,
        CreateOrder {
            restaurant_id: payload.restaurant_id,
            items: payload.items,
            payment_method: payload.payment_method,
            dropoff: payload.dropoff,
        },
    )
    .await?;
    Ok(Json(order))
}

async fn get_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Order>, AppError> {
    let order = state
        .store
        .load_order(id)
        .await
        .ok_or_else(|| AppError::NotFound(format!("order {id} not found")))?;
    Ok(Json(order))
}

async fn accept(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(id): Path<Uuid>,
    Json(payload): Json<AcceptRequest>,
) -> Result<Json<Order>, AppError> {
    let order = lifecycle::accept(&state, actor, id, payload.estimated_prep_minutes).await?;
    Ok(Json(order))
}

async fn reject(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(id): Path<Uuid>,
    Json(payload): Json<RejectRequest>,
) -> Result<Json<Order>, AppError> {
    let order =
        lifecycle::reject(&state, actor, id, payload.reason, payload.rejection_type).await?;
    Ok(Json(order))
}

async fn mark_preparing(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(id): Path<Uuid>,
) -> Result<Json<Order>, AppError> {
    let order = lifecycle::mark_preparing(&state, actor, id).await?;
    Ok(Json(order))
}

async fn mark_ready(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(id): Path<Uuid>,
) -> Result<Json<Order>, AppError> {
    let order = lifecycle::mark_ready(&state, actor, id).await?;
    Ok(Json(order))
}

async fn confirm_pickup(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(id): Path<Uuid>,
    Json(payload): Json<PickupRequest>,
) -> Result<Json<Order>, AppError> {
    let order = lifecycle::confirm_pickup(&state, actor, id, payload.pickup_code).await?;
    Ok(Json(order))
}

async fn mark_delivering(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(id): Path<Uuid>,
) -> Result<Json<Order>, AppError> {
    let order = lifecycle::mark_delivering(&state, actor, id).await?;
    Ok(Json(order))
}

async fn confirm_delivery(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(id): Path<Uuid>,
    Json(payload): Json<DeliveryRequest>,
) -> Result<Json<Order>, AppError> {
    let order =
        lifecycle::confirm_delivery(&state, actor, id, payload.delivery_code, payload.proof_url)
            .await?;
    Ok(Json(order))
}

async fn cancel(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(id): Path<Uuid>,
    Json(payload): Json<CancelRequest>,
) -> Result<Json<Order>, AppError> {
    let order =
        lifecycle::cancel(&state, actor, id, payload.reason, payload.cancellation_type).await?;
    Ok(Json(order))
}

async fn report_issue(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(id): Path<Uuid>,
    Json(payload): Json<IssueRequest>,
) -> Result<Json<Order>, AppError> {
    let order =
        lifecycle::report_issue(&state, actor, id, payload.issue_type, payload.description).await?;
    Ok(Json(order))
}

async fn list_order_offers(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Json<Vec<Offer>> {
    Json(state.store.offers_for_order(id).await)
}
