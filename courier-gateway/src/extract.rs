//! Request-context extractors binding the authenticated tenant (or admin)
//! into handlers.

use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;

use crate::UserId;
use crate::http::HttpError;
use crate::service::GatewayState;
use crate::token::AuthError;

const USER_ID_HEADER: &str = "x-user-id";
const AUTH_TOKEN_HEADER: &str = "x-auth-token";

/// The tenant named by either auth scheme: `Authorization: Bearer <API_KEY>`
/// plus `X-User-Id`, or an encrypted `X-Auth-Token`.
#[derive(Clone)]
pub struct TenantAuth(pub UserId);

impl FromRequestParts<GatewayState> for TenantAuth {
    type Rejection = HttpError;

    async fn from_request_parts(parts: &mut Parts, state: &GatewayState) -> Result<Self, Self::Rejection> {
        if let Some(token) = header_str(parts, AUTH_TOKEN_HEADER) {
            let user_id = state.auth.decode_token(token).map_err(reject)?;
            return Ok(Self(user_id));
        }

        let Some(bearer) = bearer_token(parts) else {
            return Err(HttpError::unauthorized().msg("missing credentials"));
        };

        state.auth.verify_api_key(bearer).map_err(reject)?;

        let user_id = header_str(parts, USER_ID_HEADER)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| HttpError::unauthorized().msg("missing X-User-Id header"))?;

        Ok(Self(UserId::from(user_id)))
    }
}

/// Marker for admin endpoints: `Authorization: Bearer <ADMIN_KEY>`.
#[derive(Clone, Copy)]
pub struct AdminAuth;

impl FromRequestParts<GatewayState> for AdminAuth {
    type Rejection = HttpError;

    async fn from_request_parts(parts: &mut Parts, state: &GatewayState) -> Result<Self, Self::Rejection> {
        let Some(bearer) = bearer_token(parts) else {
            return Err(HttpError::unauthorized().msg("missing credentials"));
        };

        state.auth.verify_admin_key(bearer).map_err(reject)?;

        Ok(Self)
    }
}

fn header_str<'a>(parts: &'a Parts, name: &str) -> Option<&'a str> {
    parts.headers.get(name).and_then(|value| value.to_str().ok())
}

fn bearer_token(parts: &Parts) -> Option<&str> {
    header_str(parts, AUTHORIZATION.as_str())?.strip_prefix("Bearer ")
}

#[track_caller]
fn reject(error: AuthError) -> HttpError {
    match error {
        AuthError::Expired => HttpError::unauthorized().msg("auth token expired"),
        AuthError::Malformed => HttpError::unauthorized().msg("malformed auth token"),
        AuthError::BadApiKey => HttpError::unauthorized().msg("invalid API key"),
        AuthError::BadAdminKey => HttpError::forbidden().msg("invalid admin key"),
        AuthError::Missing => HttpError::unauthorized().msg("missing credentials"),
    }
}
