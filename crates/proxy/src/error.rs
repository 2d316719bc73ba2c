use axum::Json;
use axum::response::{IntoResponse, Response};
use http::StatusCode;
use serde::Serialize;

/// Why a bearer token was rejected at the `Validate` step (spec.md §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthReason {
	NotFound,
	Expired,
	Revoked,
	ProjectInactive,
	RateCapReached,
}

impl AuthReason {
	pub fn as_str(&self) -> &'static str {
		match self {
			AuthReason::NotFound => "not_found",
			AuthReason::Expired => "expired",
			AuthReason::Revoked => "revoked",
			AuthReason::ProjectInactive => "project_inactive",
			AuthReason::RateCapReached => "rate_cap_reached",
		}
	}
}

/// Unified error type for the gateway core. Every fallible operation across
/// C1-C7 resolves to one of these variants; `cache_backend` and
/// `rate_backend` are absorbed at their call sites per spec.md §7 and never
/// reach `IntoResponse` in practice, but the variants exist so the absorbing
/// call site has a concrete value to log and count.
#[derive(thiserror::Error, Debug)]
pub enum GatewayError {
	#[error("unauthorized: {0}")]
	Auth(AuthReason),

	#[error("rate limited: {remaining} of {limit} remaining, reset in {reset_seconds}s")]
	RateLimited {
		limit: u64,
		remaining: u64,
		reset_seconds: u64,
	},

	#[error("lifetime request cap reached")]
	LifetimeCapReached,

	#[error("rate limit backend unavailable")]
	RateBackendUnavailable,

	#[error("path or method not allowed for this provider")]
	PolicyDenied,

	#[error("upstream connection error: {0}")]
	UpstreamUnavailable(String),

	#[error("upstream timed out")]
	UpstreamTimeout,

	#[error("cache backend error: {0}")]
	CacheBackend(String),

	#[error("internal error: {0}")]
	Internal(String),
}

impl GatewayError {
	pub fn code(&self) -> &'static str {
		match self {
			GatewayError::Auth(_) => "unauthorized",
			GatewayError::RateLimited { .. } => "rate_limited",
			GatewayError::LifetimeCapReached => "rate_limited",
			GatewayError::RateBackendUnavailable => "rate_limited",
			GatewayError::PolicyDenied => "not_found",
			GatewayError::UpstreamUnavailable(_) => "upstream_unavailable",
			GatewayError::UpstreamTimeout => "upstream_timeout",
			GatewayError::CacheBackend(_) => "internal",
			GatewayError::Internal(_) => "internal",
		}
	}

	pub fn status(&self) -> StatusCode {
		match self {
			GatewayError::Auth(AuthReason::RateCapReached) => StatusCode::TOO_MANY_REQUESTS,
			GatewayError::Auth(_) => StatusCode::UNAUTHORIZED,
			GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
			GatewayError::LifetimeCapReached => StatusCode::TOO_MANY_REQUESTS,
			GatewayError::RateBackendUnavailable => StatusCode::TOO_MANY_REQUESTS,
			GatewayError::PolicyDenied => StatusCode::NOT_FOUND,
			GatewayError::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
			GatewayError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
			GatewayError::CacheBackend(_) => StatusCode::INTERNAL_SERVER_ERROR,
			GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
		}
	}
}

#[derive(Serialize)]
struct ErrorBody<'a> {
	error: &'a str,
	message: String,
}

impl IntoResponse for GatewayError {
	fn into_response(self) -> Response {
		if matches!(
			self,
			GatewayError::CacheBackend(_) | GatewayError::Internal(_)
		) {
			tracing::error!(error = %self, "internal gateway error");
		}
		let status = self.status();
		let body = ErrorBody {
			error: self.code(),
			message: self.to_string(),
		};
		(status, Json(body)).into_response()
	}
}
