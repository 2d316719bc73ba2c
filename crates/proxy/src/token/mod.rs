//! Token Store (C1): persists tokens and projects, validates bearer
//! credentials, and enforces the lifetime request cap with a race-free
//! conditional increment (spec.md §4.1).

mod obfuscate;
mod store;

pub use obfuscate::obfuscate_bearer;
pub use store::PgTokenStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{AuthReason, GatewayError};

#[derive(Debug, Clone)]
pub struct TokenView {
	pub token_id: Uuid,
	pub project_id: Uuid,
	pub project_name: String,
	pub upstream_credential: secrecy::SecretString,
	pub expires_at: DateTime<Utc>,
	pub max_requests: u64,
	pub request_count: u64,
	pub cache_hit_count: u64,
	pub is_active: bool,
	pub created_at: DateTime<Utc>,
}

impl TokenView {
	/// Whether this view, as of when it was read, represents a usable token.
	/// `Validate` re-checks this against the database at call time; this
	/// helper exists for tests and for read-only surfaces like `list`.
	pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
		self.is_active
			&& now < self.expires_at
			&& (self.max_requests == 0 || self.request_count < self.max_requests)
	}
}

/// Row returned by `list`, which deliberately carries less than `TokenView`
/// (no credential): the management plane consumer (spec.md §6) only needs
/// enough to render a token list, never the upstream secret.
#[derive(Debug, Clone)]
pub struct TokenSummary {
	pub token_id: Uuid,
	pub project_id: Uuid,
	pub expires_at: DateTime<Utc>,
	pub max_requests: u64,
	pub request_count: u64,
	pub is_active: bool,
	pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait TokenStore: Send + Sync {
	/// Resolves a presented bearer string to a token view. Bearer comparison
	/// happens at constant time against a hash digest, never as a variable
	/// time string compare or raw SQL equality (spec.md §4.1, §8 P6).
	async fn validate(&self, bearer: &str) -> Result<TokenView, AuthReason>;

	/// Atomically bumps `request_count` (and `cache_hit_count` if
	/// `was_cache_hit`). The increment is conditional: it never succeeds
	/// against a token whose `request_count >= max_requests` when
	/// `max_requests > 0` (spec.md §4.1's admission race, P1).
	async fn increment_usage(
		&self,
		token_id: Uuid,
		was_cache_hit: bool,
	) -> Result<(), GatewayError>;

	/// Idempotent: repeated application after the first is a no-op (P8).
	async fn revoke(&self, token_id: Uuid) -> Result<(), GatewayError>;

	/// Idempotent bulk revoke; returns the number of tokens flipped by this
	/// call specifically (not the project's total revoked count).
	async fn revoke_project(&self, project_id: Uuid) -> Result<u64, GatewayError>;

	async fn list(
		&self,
		project_id: Uuid,
		active_only: bool,
	) -> Result<Vec<TokenSummary>, GatewayError>;
}
