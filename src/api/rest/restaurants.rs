use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{patch, post};
use axum::Json;
use axum::Router;
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::account::Restaurant;
use crate::models::courier::GeoPoint;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/restaurants", post(create_restaurant).get(list_restaurants))
        .route("/restaurants/:id/availability", patch(update_availability))
}

#[derive(Deserialize)]
pub struct CreateRestaurantRequest {
    pub name: String,
    pub location: GeoPoint,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default = "default_true")]
    pub is_open: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Deserialize)]
pub struct UpdateAvailabilityRequest {
    pub is_active: Option<bool>,
    pub is_open: Option<bool>,
}

async fn create_restaurant(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateRestaurantRequest>,
) -> Result<Json<Restaurant>, AppError> {
    if payload.name.trim().is_empty() {
        return Err(AppError::Validation("name cannot be empty".to_string()));
    }

    let restaurant = Restaurant {
        id: Uuid::new_v4(),
        name: payload.name,
        location: payload.location,
        is_active: payload.is_active,
        is_open: payload.is_open,
        created_at: Utc::now(),
    };

    state.restaurants.insert(restaurant.id, restaurant.clone());
    Ok(Json(restaurant))
}

async fn list_restaurants(State(state): State<Arc<AppState>>) -> Json<Vec<Restaurant>> {
    let restaurants = state
        .restaurants
        .iter()
        .map(|entry| entry.value().clone())
        .collect();
    Json(restaurants)
}

async fn update_availability(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateAvailabilityRequest>,
) -> Result<Json<Restaurant>, AppError> {
    let mut restaurant = state
        .restaurants
        .get_mut(&id)
        .ok_or_else(|| AppError::NotFound(format!("restaurant {id} not found")))?;

    if let Some(is_active) = payload.is_active {
        restaurant.is_active = is_active;
    }
    if let Some(is_open) = payload.is_open {
        restaurant.is_open = is_open;
    }

    Ok(Json(restaurant.clone()))
}
