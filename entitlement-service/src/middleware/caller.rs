//! Caller identity forwarded by the front-end.
//!
//! The front-end authenticates the session and forwards the user's email and
//! role as headers. Those headers are only trusted on signed requests, so the
//! signature middleware must run before this extractor.

use crate::models::normalize_email;
use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use service_core::error::AppError;

pub const USER_EMAIL_HEADER: &str = "X-User-Email";
pub const USER_ROLE_HEADER: &str = "X-User-Role";
const ADMIN_ROLE: &str = "admin";

#[derive(Debug, Clone)]
pub struct CallerContext {
    pub email: String,
    pub role: Option<String>,
}

impl CallerContext {
    pub fn is_admin(&self) -> bool {
        self.role.as_deref() == Some(ADMIN_ROLE)
    }

    pub fn require_admin(&self) -> Result<(), AppError> {
        if self.is_admin() {
            Ok(())
        } else {
            tracing::warn!(caller = %self.email, "Non-admin caller rejected from admin endpoint");
            Err(AppError::Forbidden(anyhow::anyhow!("Admin access required")))
        }
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for CallerContext
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let email = parts
            .headers
            .get(USER_EMAIL_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(normalize_email)
            .filter(|e| !e.is_empty())
            .ok_or_else(|| {
                AppError::Unauthorized(anyhow::anyhow!("Missing X-User-Email header"))
            })?;

        let role = parts
            .headers
            .get(USER_ROLE_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|r| r.trim().to_lowercase());

        tracing::Span::current().record("user", email.as_str());

        Ok(CallerContext { email, role })
    }
}
