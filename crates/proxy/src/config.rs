use std::time::Duration;

use serde::Deserialize;

fn default_listen_addr() -> String {
	"0.0.0.0:8080".to_string()
}
fn default_cache_backend() -> CacheBackendKind {
	CacheBackendKind::Memory
}
fn default_cache_ttl_secs() -> u64 {
	300
}
fn default_max_object_bytes() -> usize {
	2 * 1024 * 1024
}
fn default_rl_window_secs() -> u64 {
	1
}
fn default_event_buffer() -> usize {
	4096
}
fn default_shutdown_grace_secs() -> u64 {
	30
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackendKind {
	#[default]
	Memory,
	Redis,
}

/// The configuration surface named in spec.md §6. The core never reads this
/// from disk or the environment itself (that's the external loader's job,
/// spec.md §1's explicit non-goal); this struct is the typed contract the
/// loader hands to the core's constructors.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
	#[serde(default = "default_listen_addr")]
	pub listen_addr: String,

	#[serde(default)]
	pub http_cache_enabled: bool,
	#[serde(default = "default_cache_backend")]
	pub http_cache_backend: CacheBackendKind,
	#[serde(default = "default_cache_ttl_secs")]
	pub http_cache_default_ttl_secs: u64,
	#[serde(default = "default_max_object_bytes")]
	pub http_cache_max_object_bytes: usize,
	#[serde(default)]
	pub redis_url: Option<String>,

	#[serde(default)]
	pub distributed_rate_limit_enabled: bool,
	#[serde(default = "default_rl_window_secs")]
	pub distributed_rate_limit_window_secs: u64,
	#[serde(default)]
	pub distributed_rate_limit_max: u64,
	#[serde(default)]
	pub distributed_rate_limit_fallback: bool,
	#[serde(default)]
	pub rate_limiter_fail_open: bool,

	#[serde(default = "default_event_buffer")]
	pub event_bus_buffer_size: usize,
	#[serde(default)]
	pub dispatcher_sinks: Vec<SinkConfig>,

	#[serde(default = "default_shutdown_grace_secs")]
	pub shutdown_grace_secs: u64,

	#[serde(default)]
	pub database_url: Option<String>,

	#[serde(default)]
	pub providers: Vec<ProviderEntry>,
}

impl GatewayConfig {
	pub fn http_cache_default_ttl(&self) -> Duration {
		Duration::from_secs(self.http_cache_default_ttl_secs)
	}
	pub fn distributed_rate_limit_window(&self) -> Duration {
		Duration::from_secs(self.distributed_rate_limit_window_secs)
	}
	pub fn shutdown_grace(&self) -> Duration {
		Duration::from_secs(self.shutdown_grace_secs)
	}

	/// Rejects combinations that would silently misbehave rather than fail
	/// loudly at startup (e.g. redis backend selected with no URL).
	pub fn validate(&self) -> anyhow::Result<()> {
		if self.http_cache_enabled
			&& matches!(self.http_cache_backend, CacheBackendKind::Redis)
			&& self.redis_url.is_none()
		{
			anyhow::bail!("http_cache_backend=redis requires redis_url");
		}
		// The rate limiter's degradation model (spec.md §4.2) is built around
		// a distributed backing store; redis_url is required unconditionally
		// so the limiter always has one to degrade away from.
		if self.redis_url.is_none() {
			anyhow::bail!("redis_url is required");
		}
		if self.distributed_rate_limit_enabled && self.distributed_rate_limit_max == 0 {
			anyhow::bail!("distributed_rate_limit_max must be > 0 when distributed rate limiting is enabled");
		}
		Ok(())
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SinkConfig {
	File { path: String },
	Http { url: String },
}

/// Wire form of [`crate::registry::ProviderConfig`] (spec.md §4.7): plain
/// strings here, parsed into `http::Uri`/`http::HeaderName` once at startup
/// rather than carrying fallible types through deserialization.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderEntry {
	pub name: String,
	pub base_url: String,
	pub mount_prefix: String,
	pub allowed: Vec<AllowedRouteEntry>,
	#[serde(default = "default_credential_header")]
	pub credential_header: String,
	#[serde(default)]
	pub credential_prefix: String,
	#[serde(default)]
	pub strip_request_headers: Vec<String>,
	#[serde(default)]
	pub strip_response_headers: Vec<String>,
}

fn default_credential_header() -> String {
	"authorization".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct AllowedRouteEntry {
	pub method: String,
	/// A bare path (`/v1/models`) matches exactly; a path ending in `/*`
	/// matches that prefix (spec.md §4.7).
	pub path: String,
}
