use std::time::Duration;

use async_trait::async_trait;
use moka::future::Cache;

use crate::error::GatewayError;

use super::{CacheBackend, CacheEntry, CacheKey};

/// In-process cache backend. Grounded in the teacher's `moka::future::Cache`
/// usage in its PAT positive-cache (`http/pat.rs`): per-entry TTL is
/// honored by storing the already-bounded `CacheEntry` and letting moka
/// expire it, rather than re-deriving TTL at the backend layer.
pub struct MemoryBackend {
	cache: Cache<CacheKey, CacheEntry>,
}

impl MemoryBackend {
	pub fn new(max_capacity: u64, max_ttl_ceiling: Duration) -> Self {
		Self {
			cache: Cache::builder()
				.max_capacity(max_capacity)
				.time_to_live(max_ttl_ceiling)
				.build(),
		}
	}
}

#[async_trait]
impl CacheBackend for MemoryBackend {
	async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, GatewayError> {
		Ok(self.cache.get(key).await)
	}

	async fn set(&self, entry: CacheEntry) -> Result<(), GatewayError> {
		self.cache.insert(entry.key.clone(), entry).await;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use bytes::Bytes;
	use http::{HeaderMap, Method};
	use std::time::SystemTime;
	use uuid::Uuid;

	fn entry(key: CacheKey) -> CacheEntry {
		CacheEntry {
			key,
			status: 200,
			headers: HeaderMap::new(),
			body: Bytes::from_static(b"ok"),
			stored_at: SystemTime::now(),
			ttl: Duration::from_secs(60),
		}
	}

	#[tokio::test]
	async fn round_trips_an_entry() {
		let backend = MemoryBackend::new(100, Duration::from_secs(3600));
		let key = CacheKey::derive(Uuid::nil(), &Method::GET, "/v1/models", None, None, &HeaderMap::new());
		backend.set(entry(key.clone())).await.unwrap();
		let got = backend.get(&key).await.unwrap();
		assert!(got.is_some());
	}

	#[tokio::test]
	async fn missing_key_is_none() {
		let backend = MemoryBackend::new(100, Duration::from_secs(3600));
		let key = CacheKey::derive(Uuid::nil(), &Method::GET, "/missing", None, None, &HeaderMap::new());
		assert!(backend.get(&key).await.unwrap().is_none());
	}
}
