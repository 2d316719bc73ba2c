//! Cache Engine (C3): RFC-7234-flavored shared-cache semantics over a
//! pluggable backend, safe streaming capture, and miss coalescing
//! (spec.md §4.3).

mod capture;
mod coalesce;
mod memory;
mod redis_backend;

pub use capture::{CaptureBody, CaptureOutcome};
pub use coalesce::{CoalescingTable, InFlight};
pub use memory::MemoryBackend;
pub use redis_backend::RedisBackend;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Method, header};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::GatewayError;
use crate::http::x_headers;

/// Subset of request headers folded into the vary key. SPEC_FULL.md's Open
/// Question decision: fixed subset, not full `Vary` breadth.
const VARY_SUBSET: &[http::HeaderName] = &[header::ACCEPT, header::ACCEPT_LANGUAGE];

const STORABLE_STATUS: &[u16] = &[200, 203, 300, 301, 404, 410];

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(pub String);

impl CacheKey {
	/// `v1 || project_id || method || path || canonical(query) ||
	/// sha256(body) || vary_subset(headers)` (spec.md §4.3).
	pub fn derive(
		project_id: Uuid,
		method: &Method,
		path: &str,
		query: Option<&str>,
		body: Option<&[u8]>,
		headers: &HeaderMap,
	) -> Self {
		let canonical_query = canonicalize_query(query.unwrap_or(""));
		let body_hash = body
			.map(|b| hex(Sha256::digest(b).as_slice()))
			.unwrap_or_default();
		let vary = VARY_SUBSET
			.iter()
			.map(|name| {
				let value = headers
					.get(name)
					.and_then(|v| v.to_str().ok())
					.unwrap_or("");
				format!("{}={}", name.as_str(), value)
			})
			.collect::<Vec<_>>()
			.join("&");

		CacheKey(format!(
			"v1|{project_id}|{method}|{path}|{canonical_query}|{body_hash}|{vary}"
		))
	}
}

fn canonicalize_query(query: &str) -> String {
	if query.is_empty() {
		return String::new();
	}
	let mut pairs: Vec<(String, String)> = url::form_urlencoded::parse(query.as_bytes())
		.into_owned()
		.collect();
	pairs.sort();
	pairs
		.into_iter()
		.map(|(k, v)| format!("{k}={v}"))
		.collect::<Vec<_>>()
		.join("&")
}

fn hex(bytes: &[u8]) -> String {
	bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
	pub key: CacheKey,
	pub status: u16,
	pub headers: HeaderMap,
	pub body: Bytes,
	pub stored_at: SystemTime,
	pub ttl: Duration,
}

impl CacheEntry {
	pub fn is_fresh(&self, now: SystemTime) -> bool {
		now.duration_since(self.stored_at)
			.map(|age| age < self.ttl)
			.unwrap_or(true)
	}

	pub fn age_seconds(&self, now: SystemTime) -> u64 {
		now
			.duration_since(self.stored_at)
			.unwrap_or_default()
			.as_secs()
	}
}

/// Whether the request is lookup-eligible (spec.md §4.3 request side).
pub fn is_lookup_eligible(method: &Method, cache_control: Option<&str>) -> bool {
	let cc = cache_control.unwrap_or("").to_ascii_lowercase();
	if cc.contains("no-store") {
		return false;
	}
	match *method {
		Method::GET | Method::HEAD => true,
		Method::POST => cc.contains("public"),
		_ => false,
	}
}

/// Whether the response is storable (spec.md §4.3 response side).
pub fn is_storable(
	lookup_eligible: bool,
	status: u16,
	response_cache_control: Option<&str>,
	has_set_cookie: bool,
	body_len: usize,
	max_object_bytes: usize,
) -> bool {
	if !lookup_eligible || !STORABLE_STATUS.contains(&status) {
		return false;
	}
	let cc = response_cache_control.unwrap_or("").to_ascii_lowercase();
	if cc.contains("no-store") || cc.contains("private") {
		return false;
	}
	if has_set_cookie {
		return false;
	}
	body_len <= max_object_bytes
}

/// TTL precedence per spec.md §4.3: s-maxage, max-age, Expires-Date,
/// client-forced TTL, configured default.
pub fn derive_ttl(
	response_cache_control: Option<&str>,
	expires_minus_date_secs: Option<i64>,
	request_forced_ttl: Option<Duration>,
	default_ttl: Duration,
) -> Duration {
	if let Some(cc) = response_cache_control {
		if let Some(v) = directive_value(cc, "s-maxage") {
			return Duration::from_secs(v);
		}
		if let Some(v) = directive_value(cc, "max-age") {
			return Duration::from_secs(v);
		}
	}
	if let Some(secs) = expires_minus_date_secs
		&& secs >= 0
	{
		return Duration::from_secs(secs as u64);
	}
	if let Some(ttl) = request_forced_ttl {
		return ttl;
	}
	default_ttl
}

fn directive_value(cache_control: &str, directive: &str) -> Option<u64> {
	cache_control.split(',').find_map(|part| {
		let part = part.trim();
		let (name, value) = part.split_once('=')?;
		if name.trim().eq_ignore_ascii_case(directive) {
			value.trim().parse().ok()
		} else {
			None
		}
	})
}

/// Request's own `Cache-Control: public, max-age=N` forced TTL (spec.md
/// §4.3 precedence rule 4).
pub fn request_forced_ttl(request_cache_control: Option<&str>) -> Option<Duration> {
	let cc = request_cache_control?;
	if !cc.to_ascii_lowercase().contains("public") {
		return None;
	}
	directive_value(cc, "max-age").map(Duration::from_secs)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
	Hit,
	Miss,
	Bypass,
	Stored,
}

impl CacheOutcome {
	fn as_str(&self) -> &'static str {
		match self {
			CacheOutcome::Hit => "hit",
			CacheOutcome::Miss => "miss",
			CacheOutcome::Bypass => "bypass",
			CacheOutcome::Stored => "stored",
		}
	}
}

/// Stamps the engine-observable headers spec.md §4.3 requires on every
/// outgoing response that passed through the cache engine.
pub fn stamp_cache_headers(
	headers: &mut HeaderMap,
	key: &CacheKey,
	outcome: CacheOutcome,
	age_seconds: Option<u64>,
) {
	if let Ok(v) = HeaderValue::from_str(outcome.as_str()) {
		headers.insert(x_headers::X_PROXY_CACHE, v.clone());
		headers.insert(x_headers::CACHE_STATUS, v);
	}
	if let Ok(v) = HeaderValue::from_str(&key.0) {
		headers.insert(x_headers::X_PROXY_CACHE_KEY, v);
	}
	if let Some(age) = age_seconds
		&& let Ok(v) = HeaderValue::from_str(&age.to_string())
	{
		headers.insert(header::AGE, v);
	}
}

/// Pluggable storage for cache entries (spec.md §4.3's "pluggable backend").
#[async_trait]
pub trait CacheBackend: Send + Sync {
	async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, GatewayError>;
	async fn set(&self, entry: CacheEntry) -> Result<(), GatewayError>;
}

pub fn now() -> SystemTime {
	SystemTime::now()
}

pub fn unix_epoch() -> SystemTime {
	UNIX_EPOCH
}
