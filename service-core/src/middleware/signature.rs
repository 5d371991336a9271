//! HMAC request signing between the front-end and internal services.
//!
//! Identity headers forwarded by the front-end are only trustworthy when the
//! request carries a valid signature. Each nonce is accepted once.

use crate::error::AppError;
use crate::utils::signature::verify_signature;
use async_trait::async_trait;
use axum::{
    body::Body,
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use http_body_util::BodyExt;

pub const CLIENT_ID_HEADER: &str = "X-Client-ID";
pub const TIMESTAMP_HEADER: &str = "X-Timestamp";
pub const NONCE_HEADER: &str = "X-Nonce";
pub const SIGNATURE_HEADER: &str = "X-Signature";

#[derive(Clone, Debug)]
pub struct SignatureConfig {
    /// When false, unsigned requests pass but signed ones are still checked.
    pub require_signatures: bool,
    /// Path prefixes that skip signing entirely.
    pub excluded_paths: Vec<String>,
    pub max_clock_skew_seconds: i64,
}

impl Default for SignatureConfig {
    fn default() -> Self {
        Self {
            require_signatures: false,
            excluded_paths: Vec::new(),
            max_clock_skew_seconds: 60,
        }
    }
}

impl SignatureConfig {
    pub fn is_excluded(&self, path: &str) -> bool {
        self.excluded_paths.iter().any(|p| path.starts_with(p.as_str()))
    }
}

#[async_trait]
pub trait SignatureStore: Send + Sync {
    /// Returns `true` the first time a nonce is seen.
    async fn validate_nonce(&self, nonce: &str) -> Result<bool, AppError>;
    async fn get_signing_secret(&self, client_id: &str) -> Result<Option<String>, AppError>;
}

/// Signing fields carried in the `X-*` request headers.
#[derive(Debug)]
struct SignedRequest {
    client_id: String,
    timestamp: String,
    nonce: String,
    signature: String,
}

impl SignedRequest {
    fn is_present(req: &Request) -> bool {
        req.headers().contains_key(SIGNATURE_HEADER)
    }

    fn extract(req: &Request) -> Result<Self, AppError> {
        let headers = req.headers();
        Ok(Self {
            client_id: header(headers, CLIENT_ID_HEADER)?,
            timestamp: header(headers, TIMESTAMP_HEADER)?,
            nonce: header(headers, NONCE_HEADER)?,
            signature: header(headers, SIGNATURE_HEADER)?,
        })
    }

    fn timestamp_within(&self, max_skew_seconds: i64) -> Result<i64, AppError> {
        let timestamp: i64 = self
            .timestamp
            .parse()
            .map_err(|_| AppError::AuthError(anyhow::anyhow!("Invalid timestamp format")))?;

        if (chrono::Utc::now().timestamp() - timestamp).abs() > max_skew_seconds {
            return Err(AppError::AuthError(anyhow::anyhow!(
                "Request timestamp expired"
            )));
        }
        Ok(timestamp)
    }
}

pub async fn signature_validation_middleware<S>(
    State(state): State<S>,
    req: Request,
    next: Next,
) -> Result<Response, AppError>
where
    S: AsRef<SignatureConfig> + SignatureStore + Clone + Send + Sync + 'static,
{
    let config = state.as_ref();

    if config.is_excluded(req.uri().path())
        || (!config.require_signatures && !SignedRequest::is_present(&req))
    {
        return Ok(next.run(req).await);
    }

    let signed = SignedRequest::extract(&req)?;
    let timestamp = signed.timestamp_within(config.max_clock_skew_seconds)?;

    let secret = state
        .get_signing_secret(&signed.client_id)
        .await?
        .ok_or_else(|| AppError::AuthError(anyhow::anyhow!("Invalid Client ID")))?;

    // The body is part of the signature, so it is buffered and put back.
    let (parts, body) = req.into_parts();
    let bytes = body
        .collect()
        .await
        .map_err(|e| AppError::InternalError(anyhow::anyhow!("Failed to read body: {}", e)))?
        .to_bytes();
    let body_str = std::str::from_utf8(&bytes)
        .map_err(|_| AppError::BadRequest(anyhow::anyhow!("Request body is not valid UTF-8")))?;

    let is_valid = verify_signature(
        &secret,
        parts.method.as_str(),
        parts.uri.path(),
        timestamp,
        &signed.nonce,
        body_str,
        &signed.signature,
    )
    .map_err(|e| AppError::InternalError(anyhow::anyhow!("Signature verification error: {}", e)))?;

    if !is_valid {
        tracing::warn!(client_id = %signed.client_id, "Invalid request signature");
        return Err(AppError::AuthError(anyhow::anyhow!("Invalid signature")));
    }

    // Burn the nonce only for authentic requests so forged traffic cannot exhaust it.
    if !state.validate_nonce(&signed.nonce).await? {
        tracing::warn!(client_id = %signed.client_id, "Replayed request nonce");
        return Err(AppError::AuthError(anyhow::anyhow!(
            "Replay detected (nonce used)"
        )));
    }

    Ok(next.run(Request::from_parts(parts, Body::from(bytes))).await)
}

fn header(headers: &HeaderMap, key: &str) -> Result<String, AppError> {
    headers
        .get(key)
        .ok_or_else(|| AppError::AuthError(anyhow::anyhow!("Missing header: {}", key)))?
        .to_str()
        .map(str::to_string)
        .map_err(|_| AppError::AuthError(anyhow::anyhow!("Invalid header format: {}", key)))
}
