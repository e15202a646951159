//! Caller identity as resolved by the upstream gateway.
//!
//! Headers:
//! - `x-actor-id` (required)
//! - `x-actor-email`
//! - `x-actor-permissions`: comma-separated
//! - `x-correlation-id`: generated when absent

use axum::{extract::FromRequestParts, http::request::Parts};
use expensa_core::domain::actor::Actor;
use uuid::Uuid;

use crate::api::ApiError;

pub const ACTOR_ID_HEADER: &str = "x-actor-id";
pub const ACTOR_EMAIL_HEADER: &str = "x-actor-email";
pub const ACTOR_PERMISSIONS_HEADER: &str = "x-actor-permissions";
pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    pub actor: Actor,
    pub correlation_id: String,
}

impl<S> FromRequestParts<S> for Identity
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let correlation_id = header(parts, CORRELATION_ID_HEADER)
            .map(str::to_string)
            .unwrap_or_else(|| format!("req-{}", Uuid::new_v4().simple()));

        let Some(actor_id) = header(parts, ACTOR_ID_HEADER) else {
            return Err(ApiError::Unauthenticated { correlation_id });
        };

        let mut actor = Actor::new(actor_id);
        if let Some(email) = header(parts, ACTOR_EMAIL_HEADER) {
            actor = actor.with_email(email);
        }
        if let Some(permissions) = header(parts, ACTOR_PERMISSIONS_HEADER) {
            for permission in permissions.split(',').map(str::trim).filter(|p| !p.is_empty()) {
                actor = actor.with_permission(permission);
            }
        }

        Ok(Self { actor, correlation_id })
    }
}

fn header<'a>(parts: &'a Parts, name: &str) -> Option<&'a str> {
    parts
        .headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}
