use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use service_core::error::AppError;
use uuid::Uuid;

/// OwnerId extractor.
///
/// The submitting principal is authenticated upstream; trusted callers
/// propagate it via the X-Owner-Id header. Batch records are keyed by
/// (owner, batch), so every batch route needs it.
#[derive(Debug, Clone, Copy)]
pub struct OwnerId(pub Uuid);

#[async_trait]
impl<S> FromRequestParts<S> for OwnerId
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get("X-Owner-Id")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| AppError::BadRequest(anyhow::anyhow!("Missing X-Owner-Id header")))?;

        let owner_id = raw
            .parse::<Uuid>()
            .map_err(|_| AppError::BadRequest(anyhow::anyhow!("Invalid X-Owner-Id header")))?;

        tracing::Span::current().record("owner_id", raw);

        Ok(OwnerId(owner_id))
    }
}
