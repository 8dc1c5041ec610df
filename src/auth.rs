//! Caller identity as asserted by the upstream gateway.

use axum::{extract::FromRequestParts, http::request::Parts};

use crate::errors::{AppError, MapError};

pub const USER_ID_HEADER: &str = "x-user-id";
pub const SUPERUSER_HEADER: &str = "x-user-superuser";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    pub user_id: i64,
    pub is_superuser: bool,
}

impl Caller {
    /// Owners and superusers may modify a resource.
    pub fn can_manage(&self, owner_id: i64) -> bool {
        self.is_superuser || self.user_id == owner_id
    }
}

impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
        };

        let user_id = header(USER_ID_HEADER)
            .ok_or_else(|| MapError::Unauthorized(format!("missing `{}` header", USER_ID_HEADER)))?
            .parse::<i64>()
            .map_err(|_| {
                MapError::Unauthorized(format!("`{}` must be an integer user id", USER_ID_HEADER))
            })?;
        let is_superuser = header(SUPERUSER_HEADER)
            .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
            .unwrap_or(false);

        Ok(Self {
            user_id,
            is_superuser,
        })
    }
}
