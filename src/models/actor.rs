use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use uuid::Uuid;

use crate::error::AppError;

/// Closed set of caller roles. Every authorization decision matches on this
/// exhaustively; there is no stringly-typed role field anywhere else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actor {
    Customer(Uuid),
    Restaurant(Uuid),
    Courier(Uuid),
    Admin(Uuid),
}

impl Actor {
    pub fn id(&self) -> Uuid {
        match *self {
            Actor::Customer(id) | Actor::Restaurant(id) | Actor::Courier(id) | Actor::Admin(id) => {
                id
            }
        }
    }

    pub fn role(&self) -> &'static str {
        match self {
            Actor::Customer(_) => "customer",
            Actor::Restaurant(_) => "restaurant",
            Actor::Courier(_) => "courier",
            Actor::Admin(_) => "admin",
        }
    }

    pub fn is_admin(&self) -> bool {
        matches!(self, Actor::Admin(_))
    }
}

/// Actor identity travels in `x-actor-role` / `x-actor-id` headers. The
/// upstream gateway is trusted to have authenticated them; this service only
/// cares about role and ownership.
#[axum::async_trait]
impl<S> FromRequestParts<S> for Actor
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let role = header_value(parts, "x-actor-role")?;
        let id = header_value(parts, "x-actor-id")?;
        let id: Uuid = id
            .parse()
            .map_err(|_| AppError::Validation("x-actor-id must be a uuid".to_string()))?;

        match role.as_str() {
            "customer" => Ok(Actor::Customer(id)),
            "restaurant" => Ok(Actor::Restaurant(id)),
            "courier" => Ok(Actor::Courier(id)),
            "admin" => Ok(Actor::Admin(id)),
            other => Err(AppError::Validation(format!(
                "unknown actor role: {other}"
            ))),
        }
    }
}

fn header_value(parts: &Parts, name: &str) -> Result<String, AppError> {
    parts
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| AppError::Validation(format!("missing {name} header")))
}
