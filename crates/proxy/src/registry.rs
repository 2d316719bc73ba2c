use std::sync::Arc;

use http::{HeaderName, HeaderValue, Method};
use secrecy::{ExposeSecret, SecretString};

/// `(method, path_glob)` matcher. Only the exact and prefix forms named in
/// SPEC_FULL.md §4.7 are implemented; regex matching is unneeded surface for
/// a transparent passthrough and is deliberately left out.
#[derive(Debug, Clone)]
pub enum PathMatch {
	Exact(String),
	Prefix(String),
}

impl PathMatch {
	/// Parses the config-file shorthand: a path ending in `/*` is a prefix
	/// match, anything else is exact (spec.md §4.7).
	pub fn parse(raw: &str) -> Self {
		match raw.strip_suffix("/*") {
			Some(prefix) => PathMatch::Prefix(prefix.to_string()),
			None => PathMatch::Exact(raw.to_string()),
		}
	}

	fn matches(&self, path: &str) -> bool {
		match self {
			PathMatch::Exact(p) => path == p,
			PathMatch::Prefix(p) => {
				let p = p.trim_end_matches('/');
				let Some(suffix) = path.trim_end_matches('/').strip_prefix(p) else {
					return false;
				};
				suffix.is_empty() || suffix.starts_with('/')
			},
		}
	}
}

#[derive(Debug, Clone)]
pub struct AllowedRoute {
	pub method: Method,
	pub path: PathMatch,
}

/// Static, per-provider policy (spec.md §4.7). Built once at startup from
/// the external config loader's parsed provider table and handed to the
/// pipeline as `Arc<ProviderConfig>` (spec.md §9's "process-wide frozen
/// value").
#[derive(Debug, Clone)]
pub struct ProviderConfig {
	pub name: String,
	pub base_url: http::Uri,
	/// The path prefix under which this provider's routes live, e.g. `/v1`.
	pub mount_prefix: String,
	pub allowed: Vec<AllowedRoute>,
	pub credential_header: HeaderName,
	pub credential_prefix: String,
	pub strip_request_headers: Vec<HeaderName>,
	pub strip_response_headers: Vec<HeaderName>,
}

impl ProviderConfig {
	fn is_allowed(&self, method: &Method, path: &str) -> bool {
		self
			.allowed
			.iter()
			.any(|r| &r.method == method && r.path.matches(path))
	}

	pub fn credential_header_value(&self, credential: &SecretString) -> anyhow::Result<HeaderValue> {
		let raw = if self.credential_prefix.is_empty() {
			credential.expose_secret().to_string()
		} else {
			format!("{} {}", self.credential_prefix, credential.expose_secret())
		};
		Ok(HeaderValue::from_str(&raw)?)
	}
}

/// Outcome of resolving an inbound request against the registry.
pub enum Resolution {
	/// A provider claims the request's mount prefix and allows this
	/// `(method, path)`.
	Allowed(Arc<ProviderConfig>),
	/// A provider claims the prefix but its allow-list rejects this
	/// `(method, path)`. Surfaced as 404 (spec.md §4.6: "to avoid leaking
	/// provider topology").
	Denied,
	/// No provider claims this prefix at all.
	NoProvider,
}

/// Resolves an inbound request path to a provider, per spec.md §4.7's
/// `resolve(request_path) -> (provider, allowed)` pure function. Frozen
/// after construction: reloading providers is a management-plane concern
/// (spec.md §1 non-goal), not something the registry does to itself.
#[derive(Debug, Clone)]
pub struct ProviderRegistry {
	/// Longest mount prefix first, so `/v1/chat` doesn't shadow `/v1/chat/x`.
	providers: Arc<Vec<Arc<ProviderConfig>>>,
}

impl ProviderRegistry {
	pub fn new(mut providers: Vec<ProviderConfig>) -> Self {
		providers.sort_by(|a, b| b.mount_prefix.len().cmp(&a.mount_prefix.len()));
		Self {
			providers: Arc::new(providers.into_iter().map(Arc::new).collect()),
		}
	}

	pub fn resolve(&self, method: &Method, path: &str) -> Resolution {
		for provider in self.providers.iter() {
			if PathMatch::Prefix(provider.mount_prefix.clone()).matches(path) {
				return if provider.is_allowed(method, path) {
					Resolution::Allowed(provider.clone())
				} else {
					Resolution::Denied
				};
			}
		}
		Resolution::NoProvider
	}
}
