use std::time::Duration;

use redis::aio::ConnectionManager;
use uuid::Uuid;

use super::Admission;

/// Atomically increments the sliding-window bucket counter and, on the
/// first increment for a fresh key, sets its TTL in the same round trip —
/// the conditional-increment primitive spec.md §9 requires ("a
/// Lua-scripted INCR in the network cache"). `KEYS[1]` is the bucket key,
/// `ARGV[1]` is the TTL in milliseconds.
const INCR_WITH_TTL: &str = r#"
local count = redis.call("INCR", KEYS[1])
if count == 1 then
  redis.call("PEXPIRE", KEYS[1], ARGV[1])
end
return count
"#;

#[derive(Clone)]
pub struct DistributedLimiter {
	conn: ConnectionManager,
	prefix: String,
}

impl DistributedLimiter {
	pub fn new(conn: ConnectionManager, prefix: impl Into<String>) -> Self {
		Self {
			conn,
			prefix: prefix.into(),
		}
	}

	fn bucket_key(&self, token_id: Uuid, window: Duration) -> String {
		let bucket = unix_seconds() / window.as_secs().max(1);
		format!("{}{}:{}", self.prefix, token_id, bucket)
	}

	pub async fn admit(
		&self,
		token_id: Uuid,
		window: Duration,
		cap: u64,
	) -> Result<Admission, redis::RedisError> {
		let key = self.bucket_key(token_id, window);
		let ttl_ms = (window.as_millis() as u64) + 1000;
		let mut conn = self.conn.clone();
		let count: u64 = redis::Script::new(INCR_WITH_TTL)
			.key(&key)
			.arg(ttl_ms)
			.invoke_async(&mut conn)
			.await?;
		Ok(super::tie_break(count, cap))
	}

	pub async fn ping(&self) -> Result<(), redis::RedisError> {
		let mut conn = self.conn.clone();
		let _: String = redis::cmd("PING").query_async(&mut conn).await?;
		Ok(())
	}
}

fn unix_seconds() -> u64 {
	std::time::SystemTime::now()
		.duration_since(std::time::UNIX_EPOCH)
		.unwrap_or_default()
		.as_secs()
}
