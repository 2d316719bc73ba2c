use std::time::Duration;

use rand::Rng;

const BASE_MS: u64 = 250;
const CAP_MS: u64 = 30_000;

/// Exponential backoff with full jitter (spec.md §4.5): `base * 2^attempt`
/// capped at `cap`, then a uniform random draw in `[0, capped)`. Hand-rolled
/// rather than pulled from a crate since the formula is fully specified.
pub fn backoff_with_full_jitter(attempt: u32) -> Duration {
	let exp = BASE_MS.saturating_mul(1u64 << attempt.min(20));
	let capped = exp.min(CAP_MS);
	let jittered = rand::rng().random_range(0..=capped);
	Duration::from_millis(jittered)
}
