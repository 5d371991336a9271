use service_core::error::AppError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EntitlementError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid referral code")]
    InvalidReferralCode,

    #[error("Cannot refer yourself")]
    SelfReferral,

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    NotFound(String),

    #[error("Invalid webhook signature: {0}")]
    InvalidSignature(String),

    #[error("Invalid webhook payload: {0}")]
    InvalidPayload(String),

    #[error("Rate limit store unavailable: {0}")]
    CounterUnavailable(anyhow::Error),

    #[error("{0}")]
    Forbidden(String),

    #[error("Storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl From<EntitlementError> for AppError {
    fn from(err: EntitlementError) -> Self {
        match err {
            EntitlementError::Validation(msg) => AppError::BadRequest(anyhow::anyhow!(msg)),
            EntitlementError::InvalidReferralCode => {
                AppError::BadRequest(anyhow::anyhow!("Invalid referral code"))
            }
            EntitlementError::SelfReferral => {
                AppError::BadRequest(anyhow::anyhow!("Cannot refer yourself"))
            }
            EntitlementError::Conflict(msg) => AppError::Conflict(anyhow::anyhow!(msg)),
            EntitlementError::NotFound(msg) => AppError::NotFound(anyhow::anyhow!(msg)),
            EntitlementError::InvalidSignature(msg) => {
                AppError::BadRequest(anyhow::anyhow!("Invalid webhook signature: {}", msg))
            }
            EntitlementError::InvalidPayload(msg) => {
                AppError::BadRequest(anyhow::anyhow!("Invalid webhook payload: {}", msg))
            }
            EntitlementError::CounterUnavailable(e) => {
                tracing::error!(error = %e, "Rate limit store unavailable");
                AppError::ServiceUnavailable
            }
            EntitlementError::Forbidden(msg) => AppError::Forbidden(anyhow::anyhow!(msg)),
            EntitlementError::Storage(e) => AppError::DatabaseError(e),
        }
    }
}
