//! Bearer token extraction.

use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts},
};

use super::token::verify_token;
use crate::error::AppError;
use crate::AppState;

/// Authenticated principal extracted from the `Authorization` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub principal: String,
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .ok_or(AppError::Unauthorized("Missing authorization header"))?
            .to_str()
            .map_err(|_| AppError::Unauthorized("Invalid authorization header format"))?;

        let token = header
            .strip_prefix("Bearer ")
            .ok_or(AppError::Unauthorized("Invalid authorization header format"))?;
        if token.trim().is_empty() {
            return Err(AppError::Unauthorized("Empty bearer token"));
        }

        let principal = verify_token(state.config.auth_secret.as_deref(), token)
            .ok_or(AppError::Unauthorized("Invalid bearer token"))?;

        tracing::debug!(principal = %principal, "authenticated request");
        Ok(AuthUser { principal })
    }
}
