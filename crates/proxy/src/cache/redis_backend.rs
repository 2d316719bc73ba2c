use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};

use crate::error::GatewayError;

use super::{CacheBackend, CacheEntry, CacheKey};

#[derive(Serialize, Deserialize)]
struct WireEntry {
	status: u16,
	headers: Vec<(String, String)>,
	body: Vec<u8>,
	stored_at_unix_ms: u128,
	ttl_ms: u64,
}

impl From<&CacheEntry> for WireEntry {
	fn from(e: &CacheEntry) -> Self {
		WireEntry {
			status: e.status,
			headers: e
				.headers
				.iter()
				.filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
				.collect(),
			body: e.body.to_vec(),
			stored_at_unix_ms: e
				.stored_at
				.duration_since(UNIX_EPOCH)
				.unwrap_or_default()
				.as_millis(),
			ttl_ms: e.ttl.as_millis() as u64,
		}
	}
}

impl WireEntry {
	fn into_entry(self, key: CacheKey) -> CacheEntry {
		let mut headers = HeaderMap::new();
		for (k, v) in self.headers {
			if let (Ok(name), Ok(value)) = (HeaderName::try_from(k), HeaderValue::from_str(&v)) {
				headers.insert(name, value);
			}
		}
		CacheEntry {
			key,
			status: self.status,
			headers,
			body: Bytes::from(self.body),
			stored_at: UNIX_EPOCH + Duration::from_millis(self.stored_at_unix_ms as u64),
			ttl: Duration::from_millis(self.ttl_ms),
		}
	}
}

/// Networked cache backend (spec.md §4.3: "or a networked key-value
/// store"). Stores the entry as a single serialized value with `SET ... PX
/// ttl_ms`, matching spec.md's TTL model directly instead of relying on a
/// second expiry mechanism.
pub struct RedisBackend {
	conn: ConnectionManager,
	prefix: String,
}

impl RedisBackend {
	pub fn new(conn: ConnectionManager, prefix: impl Into<String>) -> Self {
		Self {
			conn,
			prefix: prefix.into(),
		}
	}

	fn redis_key(&self, key: &CacheKey) -> String {
		format!("{}{}", self.prefix, key.0)
	}
}

#[async_trait]
impl CacheBackend for RedisBackend {
	async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, GatewayError> {
		let mut conn = self.conn.clone();
		let raw: Option<Vec<u8>> = conn
			.get(self.redis_key(key))
			.await
			.map_err(|e| GatewayError::CacheBackend(e.to_string()))?;
		let Some(raw) = raw else { return Ok(None) };
		let wire: WireEntry =
			serde_json::from_slice(&raw).map_err(|e| GatewayError::CacheBackend(e.to_string()))?;
		Ok(Some(wire.into_entry(key.clone())))
	}

	async fn set(&self, entry: CacheEntry) -> Result<(), GatewayError> {
		let wire = WireEntry::from(&entry);
		let ttl_ms = wire.ttl_ms.max(1);
		let payload =
			serde_json::to_vec(&wire).map_err(|e| GatewayError::CacheBackend(e.to_string()))?;
		let mut conn = self.conn.clone();
		let _: () = conn
			.set_ex(self.redis_key(&entry.key), payload, ttl_ms.div_ceil(1000))
			.await
			.map_err(|e| GatewayError::CacheBackend(e.to_string()))?;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use http::Method;
	use uuid::Uuid;

	#[test]
	fn wire_entry_round_trips_headers() {
		let mut headers = HeaderMap::new();
		headers.insert(http::header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
		let key = CacheKey::derive(Uuid::nil(), &Method::GET, "/v1/models", None, None, &HeaderMap::new());
		let entry = CacheEntry {
			key: key.clone(),
			status: 200,
			headers,
			body: Bytes::from_static(b"{}"),
			stored_at: SystemTime::now(),
			ttl: Duration::from_secs(30),
		};
		let wire = WireEntry::from(&entry);
		let roundtripped = wire.into_entry(key);
		assert_eq!(roundtripped.status, 200);
		assert_eq!(roundtripped.body, entry.body);
	}
}
