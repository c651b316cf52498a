use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::auth::otp::{self, OtpReceipt, VerifyOutcome};
use crate::error::AppError;
use crate::models::otp::OtpKind;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/auth/otp/request", post(request_code))
        .route("/auth/otp/verify", post(verify_code))
        .route("/auth/logout", post(logout))
        .route("/auth/session/:token", get(check_session))
}

#[derive(Deserialize)]
pub struct RequestCodeBody {
    pub phone: String,
    #[serde(default = "default_kind")]
    pub kind: OtpKind,
}

fn default_kind() -> OtpKind {
    OtpKind::Login
}

#[derive(Deserialize)]
pub struct VerifyCodeBody {
    pub phone: String,
    pub code: String,
    pub referral_code: Option<String>,
}

#[derive(Deserialize)]
pub struct LogoutBody {
    pub token: Uuid,
}

async fn request_code(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<RequestCodeBody>,
) -> Result<Json<OtpReceipt>, AppError> {
    let receipt = otp::request_code(&state, &payload.phone, payload.kind).await?;
    Ok(Json(receipt))
}

async fn verify_code(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<VerifyCodeBody>,
) -> Result<Json<VerifyOutcome>, AppError> {
    let outcome = otp::verify_code(
        &state,
        &payload.phone,
        &payload.code,
        payload.referral_code,
    )
    .await?;
    Ok(Json(outcome))
}

async fn logout(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<LogoutBody>,
) -> Result<Json<Value>, AppError> {
    otp::logout(&state, payload.token).await?;
    Ok(Json(json!({ "revoked": true })))
}

async fn check_session(
    State(state): State<Arc<AppState>>,
    Path(token): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    let session = otp::check_session(&state, token).await?;
    Ok(Json(json!({
        "customer_id": session.customer_id,
        "expires_at": session.expires_at,
    })))
}
