//! Rate Limiter (C2): global admission control independent of the
//! per-token lifetime counter (spec.md §4.2). Distributed sliding-window
//! counter over Redis, degrading to a local token bucket when the shared
//! store is unhealthy.

mod distributed;
mod local;

pub use distributed::DistributedLimiter;
pub use local::LocalBucketLimiter;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use uuid::Uuid;

use crate::error::GatewayError;

/// Mirrors the teacher's `FailureMode`: defaults to failing open so a rate
/// limiter outage never takes the whole proxy down, unless the operator has
/// explicitly asked for the conservative behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailureMode {
	#[default]
	FailOpen,
	FailClosed,
}

pub struct RateLimiterConfig {
	pub window: Duration,
	pub max: u64,
	pub fallback_enabled: bool,
	pub failure_mode: FailureMode,
	pub health_probe_interval: Duration,
}

/// Wires together the distributed limiter, its health probe, and the local
/// fallback bucket. The hot path (`admit`) never awaits the health probe —
/// it reads an `AtomicBool` flipped by a background task (spec.md §5: "the
/// hot path reads without awaiting").
pub struct RateLimiter {
	distributed: DistributedLimiter,
	local: LocalBucketLimiter,
	healthy: Arc<AtomicBool>,
	config: RateLimiterConfig,
}

impl RateLimiter {
	pub fn new(distributed: DistributedLimiter, local: LocalBucketLimiter, config: RateLimiterConfig) -> Self {
		Self {
			distributed,
			local,
			healthy: Arc::new(AtomicBool::new(true)),
			config,
		}
	}

	/// Spawns the background health-probe task. Returns a handle the caller
	/// should keep and abort on shutdown.
	pub fn spawn_health_probe(&self) -> tokio::task::JoinHandle<()> {
		let distributed = self.distributed.clone();
		let healthy = self.healthy.clone();
		let interval = self.config.health_probe_interval;
		tokio::spawn(async move {
			let mut ticker = tokio::time::interval(interval);
			loop {
				ticker.tick().await;
				let ok = distributed.ping().await.is_ok();
				healthy.store(ok, Ordering::Relaxed);
			}
		})
	}

	pub fn is_healthy(&self) -> bool {
		self.healthy.load(Ordering::Relaxed)
	}

	/// Admits or rejects a request for `token_id`. Implements spec.md §4.2's
	/// degradation table: healthy → distributed sliding window; unhealthy +
	/// fallback → local token bucket; unhealthy + no fallback → surfaced per
	/// `failure_mode`.
	pub async fn admit(&self, token_id: Uuid) -> Result<(), GatewayError> {
		if self.is_healthy() {
			match self
				.distributed
				.admit(token_id, self.config.window, self.config.max)
				.await
			{
				Ok(admitted) => return self.resolve(admitted),
				Err(_) => {
					self.healthy.store(false, Ordering::Relaxed);
				},
			}
		}

		if self.config.fallback_enabled {
			let admitted = self.local.admit(token_id);
			return self.resolve(admitted);
		}

		match self.config.failure_mode {
			FailureMode::FailOpen => Ok(()),
			FailureMode::FailClosed => Err(GatewayError::RateBackendUnavailable),
		}
	}

	fn resolve(&self, admitted: Admission) -> Result<(), GatewayError> {
		match admitted {
			Admission::Admit => Ok(()),
			Admission::Reject { limit, remaining } => Err(GatewayError::RateLimited {
				limit,
				remaining,
				reset_seconds: self.config.window.as_secs(),
			}),
		}
	}
}

#[derive(Debug, Clone, Copy)]
pub enum Admission {
	Admit,
	Reject { limit: u64, remaining: u64 },
}

/// Tie-break per spec.md §4.2: post-increment count `<= N` admits, `N+1`
/// and above rejects.
pub fn tie_break(post_increment_count: u64, cap: u64) -> Admission {
	if post_increment_count <= cap {
		Admission::Admit
	} else {
		Admission::Reject {
			limit: cap,
			remaining: 0,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn exact_equality_with_cap_admits() {
		assert!(matches!(tie_break(5, 5), Admission::Admit));
	}

	#[test]
	fn one_over_cap_rejects() {
		assert!(matches!(tie_break(6, 5), Admission::Reject { .. }));
	}

	proptest::proptest! {
		/// tie_break only ever admits at or under the cap and rejects
		/// strictly above it, regardless of magnitude (spec.md §4.2).
		#[test]
		fn admits_iff_at_or_under_cap(count in 0u64..=10_000, cap in 0u64..=10_000) {
			match tie_break(count, cap) {
				Admission::Admit => proptest::prop_assert!(count <= cap),
				Admission::Reject { limit, remaining } => {
					proptest::prop_assert!(count > cap);
					proptest::prop_assert_eq!(limit, cap);
					proptest::prop_assert_eq!(remaining, 0);
				},
			}
		}
	}
}
