//! Error taxonomy shared across the proxy and session layers.
//!
//! Errors are classified at the point of occurrence (§7): handlers convert
//! them to a JSON-shaped HTTP response immediately rather than threading a
//! generic error type across the HTTP boundary. This module exists so that
//! classification stays centralized and every call site maps to the same
//! status code and message.

use axum::http::StatusCode;
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum PikoError {
    #[error("invalid token")]
    InvalidToken,
    #[error("expired token")]
    ExpiredToken,
    #[error("unknown tenant")]
    UnknownTenant,
    #[error("endpoint not permitted")]
    EndpointNotPermitted,
    #[error("missing authorization")]
    MissingAuthorization,
    #[error("unsupported auth type")]
    UnsupportedAuthType,

    #[error("no available upstreams")]
    NoAvailableUpstreams,

    #[error("upstream unreachable")]
    UpstreamUnreachable(#[source] anyhow::Error),

    #[error("upstream timeout")]
    UpstreamTimeout,

    #[error("missing endpoint id")]
    MissingEndpointId,
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("internal error")]
    Internal(#[source] anyhow::Error),
}

impl PikoError {
    pub fn status(&self) -> StatusCode {
        match self {
            PikoError::InvalidToken
            | PikoError::ExpiredToken
            | PikoError::UnknownTenant
            | PikoError::EndpointNotPermitted
            | PikoError::MissingAuthorization
            | PikoError::UnsupportedAuthType => StatusCode::UNAUTHORIZED,
            PikoError::NoAvailableUpstreams | PikoError::UpstreamUnreachable(_) => {
                StatusCode::BAD_GATEWAY
            }
            PikoError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            PikoError::MissingEndpointId | PikoError::MalformedRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            PikoError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The stable human-readable message carried in the JSON error body.
    pub fn message(&self) -> String {
        match self {
            PikoError::MalformedRequest(msg) => msg.clone(),
            other => other.to_string(),
        }
    }

    /// True when this error represents normal shutdown noise (cancellation,
    /// closed pipe, multiplexer goaway) that should log at debug rather than
    /// warn level.
    pub fn is_shutdown_noise(&self) -> bool {
        matches!(self, PikoError::Internal(err) if is_shutdown_like(err))
    }
}

fn is_shutdown_like(err: &anyhow::Error) -> bool {
    let msg = err.to_string();
    msg.contains("closed")
        || msg.contains("cancelled")
        || msg.contains("canceled")
        || msg.contains("goaway")
        || msg.contains("broken pipe")
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

impl axum::response::IntoResponse for PikoError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status();
        if status.as_u16() >= 500 {
            tracing::warn!(error = %self, "request failed");
        }
        let body = ErrorBody {
            error: self.message(),
        };
        let mut response = axum::Json(body).into_response();
        *response.status_mut() = status;
        response
            .headers_mut()
            .insert("X-Content-Type-Options", "nosniff".parse().unwrap());
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_matches_taxonomy() {
        assert_eq!(PikoError::InvalidToken.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            PikoError::NoAvailableUpstreams.status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            PikoError::UpstreamTimeout.status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            PikoError::MissingEndpointId.status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            PikoError::Internal(anyhow::anyhow!("boom")).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn message_is_stable_and_human_readable() {
        assert_eq!(PikoError::EndpointNotPermitted.message(), "endpoint not permitted");
        assert_eq!(
            PikoError::MalformedRequest("bad host".to_string()).message(),
            "bad host"
        );
    }
}
