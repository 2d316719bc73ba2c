use async_trait::async_trait;
use chrono::Utc;
use secrecy::SecretString;
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::error::{AuthReason, GatewayError};
use crate::token::obfuscate_bearer;
use crate::token::{TokenStore, TokenSummary, TokenView};

const PREFIX_HEX_LEN: usize = 16;

fn digest(bearer: &str) -> [u8; 32] {
	let mut hasher = Sha256::new();
	hasher.update(bearer.as_bytes());
	hasher.finalize().into()
}

#[derive(sqlx::FromRow)]
struct TokenRow {
	id: Uuid,
	project_id: Uuid,
	project_name: String,
	upstream_credential: String,
	bearer_digest: Vec<u8>,
	expires_at: chrono::DateTime<Utc>,
	max_requests: i64,
	request_count: i64,
	cache_hit_count: i64,
	is_active: bool,
	project_is_active: bool,
	created_at: chrono::DateTime<Utc>,
}

impl TokenRow {
	fn into_view(self) -> TokenView {
		TokenView {
			token_id: self.id,
			project_id: self.project_id,
			project_name: self.project_name,
			upstream_credential: SecretString::from(self.upstream_credential),
			expires_at: self.expires_at,
			max_requests: self.max_requests.max(0) as u64,
			request_count: self.request_count.max(0) as u64,
			cache_hit_count: self.cache_hit_count.max(0) as u64,
			is_active: self.is_active,
			created_at: self.created_at,
		}
	}
}

/// sqlx/Postgres-backed `TokenStore`. Grounded in the teacher's
/// personal-access-token repository: parameterized queries, `RETURNING`
/// clauses for conditional mutation, and narrowing by an indexed prefix
/// before a constant-time comparison of the full digest.
pub struct PgTokenStore {
	pool: PgPool,
}

impl PgTokenStore {
	pub fn new(pool: PgPool) -> Self {
		Self { pool }
	}

	async fn find_candidates(&self, bearer_digest: &[u8]) -> Result<Vec<TokenRow>, GatewayError> {
		let prefix = &bearer_digest[..PREFIX_HEX_LEN / 2];
		sqlx::query_as::<_, TokenRow>(
			r#"
			SELECT t.id, t.project_id, p.name AS project_name, p.upstream_credential,
			       t.bearer_digest, t.expires_at, t.max_requests, t.request_count,
			       t.cache_hit_count, t.is_active, p.is_active AS project_is_active, t.created_at
			FROM tokens t
			JOIN projects p ON p.id = t.project_id
			WHERE t.bearer_prefix = $1
			"#,
		)
		.bind(prefix)
		.fetch_all(&self.pool)
		.await
		.map_err(|e| GatewayError::Internal(e.to_string()))
	}

	async fn validate_inner(&self, bearer: &str) -> Result<TokenView, AuthReason> {
		let presented = digest(bearer);
		let candidates = self
			.find_candidates(&presented)
			.await
			.map_err(|_| AuthReason::NotFound)?;

		let row = candidates
			.into_iter()
			.find(|row| bool::from(row.bearer_digest.as_slice().ct_eq(&presented)))
			.ok_or(AuthReason::NotFound)?;

		if !row.is_active {
			return Err(AuthReason::Revoked);
		}
		if !row.project_is_active {
			return Err(AuthReason::ProjectInactive);
		}
		let now = Utc::now();
		if now >= row.expires_at {
			return Err(AuthReason::Expired);
		}
		let view = row.into_view();
		if view.max_requests != 0 && view.request_count >= view.max_requests {
			return Err(AuthReason::RateCapReached);
		}
		Ok(view)
	}
}

#[async_trait]
impl TokenStore for PgTokenStore {
	async fn validate(&self, bearer: &str) -> Result<TokenView, AuthReason> {
		let result = self.validate_inner(bearer).await;
		tracing::debug!(
			target: "audit",
			bearer = %obfuscate_bearer(bearer),
			rejected_as = ?result.as_ref().err(),
			"token validate"
		);
		result
	}

	async fn increment_usage(
		&self,
		token_id: Uuid,
		was_cache_hit: bool,
	) -> Result<(), GatewayError> {
		// The conditional UPDATE is the whole admission race fix (spec.md
		// §4.1): the WHERE clause and the increment happen in one statement,
		// so concurrent callers against the same row serialize at the
		// database rather than racing a read-compare-write in application
		// code.
		let result = sqlx::query(
			r#"
			UPDATE tokens
			SET request_count = request_count + 1,
			    cache_hit_count = cache_hit_count + CASE WHEN $2 THEN 1 ELSE 0 END
			WHERE id = $1
			  AND is_active
			  AND (max_requests = 0 OR request_count < max_requests)
			"#,
		)
		.bind(token_id)
		.bind(was_cache_hit)
		.execute(&self.pool)
		.await
		.map_err(|e| GatewayError::Internal(e.to_string()))?;

		if result.rows_affected() == 0 {
			return Err(GatewayError::LifetimeCapReached);
		}
		Ok(())
	}

	async fn revoke(&self, token_id: Uuid) -> Result<(), GatewayError> {
		sqlx::query("UPDATE tokens SET is_active = false WHERE id = $1 AND is_active")
			.bind(token_id)
			.execute(&self.pool)
			.await
			.map_err(|e| GatewayError::Internal(e.to_string()))?;
		tracing::debug!(target: "audit", %token_id, "token revoked");
		Ok(())
	}

	async fn revoke_project(&self, project_id: Uuid) -> Result<u64, GatewayError> {
		let result = sqlx::query("UPDATE tokens SET is_active = false WHERE project_id = $1 AND is_active")
			.bind(project_id)
			.execute(&self.pool)
			.await
			.map_err(|e| GatewayError::Internal(e.to_string()))?;
		tracing::debug!(target: "audit", %project_id, revoked = result.rows_affected(), "project tokens revoked");
		Ok(result.rows_affected())
	}

	async fn list(
		&self,
		project_id: Uuid,
		active_only: bool,
	) -> Result<Vec<TokenSummary>, GatewayError> {
		#[derive(sqlx::FromRow)]
		struct Row {
			id: Uuid,
			project_id: Uuid,
			expires_at: chrono::DateTime<Utc>,
			max_requests: i64,
			request_count: i64,
			is_active: bool,
			created_at: chrono::DateTime<Utc>,
		}
		let rows = if active_only {
			sqlx::query_as::<_, Row>(
				"SELECT id, project_id, expires_at, max_requests, request_count, is_active, created_at \
				 FROM tokens WHERE project_id = $1 AND is_active ORDER BY created_at DESC",
			)
			.bind(project_id)
			.fetch_all(&self.pool)
			.await
		} else {
			sqlx::query_as::<_, Row>(
				"SELECT id, project_id, expires_at, max_requests, request_count, is_active, created_at \
				 FROM tokens WHERE project_id = $1 ORDER BY created_at DESC",
			)
			.bind(project_id)
			.fetch_all(&self.pool)
			.await
		}
		.map_err(|e| GatewayError::Internal(e.to_string()))?;

		Ok(
			rows
				.into_iter()
				.map(|r| TokenSummary {
					token_id: r.id,
					project_id: r.project_id,
					expires_at: r.expires_at,
					max_requests: r.max_requests.max(0) as u64,
					request_count: r.request_count.max(0) as u64,
					is_active: r.is_active,
					created_at: r.created_at,
				})
				.collect(),
		)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn digest_is_32_bytes_and_deterministic() {
		assert_eq!(digest("abc").len(), 32);
		assert_eq!(digest("abc"), digest("abc"));
		assert_ne!(digest("abc"), digest("abd"));
	}
}
