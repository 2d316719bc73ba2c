use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;
use uuid::Uuid;

use super::Admission;

struct Bucket {
	tokens: f64,
	last_refill: Instant,
}

/// Per-instance token bucket used while the distributed limiter is
/// unhealthy (spec.md §4.2). One bucket per token, each guarded by its own
/// fine-grained mutex so no global lock is ever held (spec.md §5).
pub struct LocalBucketLimiter {
	rate: f64,
	capacity: f64,
	buckets: DashMap<Uuid, Mutex<Bucket>>,
}

impl LocalBucketLimiter {
	pub fn new(rate: f64, capacity: f64) -> Self {
		Self {
			rate,
			capacity,
			buckets: DashMap::new(),
		}
	}

	pub fn admit(&self, token_id: Uuid) -> Admission {
		let entry = self
			.buckets
			.entry(token_id)
			.or_insert_with(|| {
				Mutex::new(Bucket {
					tokens: self.capacity,
					last_refill: Instant::now(),
				})
			});
		let mut bucket = entry.lock();

		let now = Instant::now();
		let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
		bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.capacity);
		bucket.last_refill = now;

		if bucket.tokens >= 1.0 {
			bucket.tokens -= 1.0;
			Admission::Admit
		} else {
			Admission::Reject {
				limit: self.capacity as u64,
				remaining: 0,
			}
		}
	}
}
