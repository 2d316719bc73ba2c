//! Proxy Pipeline (C6): composes the Token Store, Rate Limiter, Cache
//! Engine, Event Bus and Provider Registry around a streaming reverse-proxy
//! core (spec.md §4.6). This module is the `RECEIVED -> ... -> DONE` state
//! machine spec.md §4.6 diagrams.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use axum::response::IntoResponse;
use bytes::Bytes;
use chrono::Utc;
use gateway_core::metrics::{CacheLabels, MetricsRegistry, ProxyLabels};
use http::header;
use http_body_util::BodyExt;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use uuid::Uuid;

use crate::cache::{
	self, CacheBackend, CacheEntry, CacheKey, CacheOutcome, CaptureBody, CaptureOutcome,
	CoalescingTable, Role,
};
use crate::error::{AuthReason, GatewayError};
use crate::events::{Event, EventBus, EventKind};
use crate::http::{Body, Request, Response};
use crate::ratelimit::RateLimiter;
use crate::registry::{ProviderConfig, ProviderRegistry, Resolution};
use crate::token::{TokenStore, TokenView};

pub type UpstreamClient = Client<hyper_rustls::HttpsConnector<HttpConnector>, Body>;

pub fn build_upstream_client() -> UpstreamClient {
	let https = hyper_rustls::HttpsConnectorBuilder::new()
		.with_native_roots()
		.expect("native root certificates must be available")
		.https_or_http()
		.enable_http1()
		.enable_http2()
		.build();
	Client::builder(TokioExecutor::new()).build(https)
}

pub struct PipelineTimeouts {
	pub upstream_idle: Duration,
}

impl Default for PipelineTimeouts {
	fn default() -> Self {
		Self {
			upstream_idle: Duration::from_secs(60),
		}
	}
}

pub struct Pipeline {
	pub tokens: Arc<dyn TokenStore>,
	pub rate_limiter: Arc<RateLimiter>,
	pub cache_backend: Arc<dyn CacheBackend>,
	pub coalescing: Arc<CoalescingTable>,
	pub events: Arc<EventBus>,
	pub registry: ProviderRegistry,
	pub upstream: UpstreamClient,
	pub timeouts: PipelineTimeouts,
	pub cache_enabled: bool,
	pub default_ttl: Duration,
	pub max_object_bytes: usize,
	pub metrics: Arc<MetricsRegistry>,
}

enum Outcome {
	Ok,
	UpstreamTimeout,
	UpstreamUnavailable,
}

impl Outcome {
	fn as_str(&self) -> &'static str {
		match self {
			Outcome::Ok => "ok",
			Outcome::UpstreamTimeout => "upstream_timeout",
			Outcome::UpstreamUnavailable => "upstream_unavailable",
		}
	}
}

impl Pipeline {
	/// Implements the full state machine of spec.md §4.6. `request_id` is a
	/// ulid, the same id scheme the Event Bus uses, attached as a tracing
	/// span field for the lifetime of the request.
	#[tracing::instrument(skip_all, fields(request_id = %request_id))]
	pub async fn handle(&self, request_id: ulid::Ulid, mut req: Request) -> Response {
		let start = SystemTime::now();

		// RECEIVED -> parse bearer
		let Some(bearer) = extract_bearer(&req) else {
			return self.reject_auth(AuthReason::NotFound, None).await;
		};

		// AUTHED
		let token = match self.tokens.validate(&bearer).await {
			Ok(t) => t,
			Err(reason) => return self.reject_auth(reason, Some(&bearer)).await,
		};

		// ADMITTED
		if let Err(err) = self.rate_limiter.admit(token.token_id).await {
			return err.into_response();
		}

		// Policy gating (Provider Registry, C7)
		let provider = match self.registry.resolve(req.method(), req.uri().path()) {
			Resolution::Allowed(p) => p,
			Resolution::Denied | Resolution::NoProvider => {
				return GatewayError::PolicyDenied.into_response();
			},
		};

		crate::http::strip_hop_by_hop(req.headers_mut());
		crate::http::stamp_request_start(req.headers_mut(), stamp_nanos());

		// CACHE_LOOKUP
		let method = req.method().clone();
		let cache_control = header_str(&req, header::CACHE_CONTROL);
		let mut lookup_eligible =
			self.cache_enabled && cache::is_lookup_eligible(&method, cache_control.as_deref());

		// A POST body is part of the cache key (spec.md §4.3's
		// `sha256(body)` component); it must be buffered and re-attached to
		// the request before it can be forwarded a second time. Bodies past
		// the storage bound fall back to bypassing the cache entirely rather
		// than being keyed ambiguously.
		let body_hash = if lookup_eligible && method == http::Method::POST {
			match buffer_request_body(&mut req, self.max_object_bytes).await {
				Ok(Some(bytes)) => Some(bytes),
				Ok(None) => {
					lookup_eligible = false;
					None
				},
				Err(err) => return err.into_response(),
			}
		} else {
			None
		};

		if !lookup_eligible {
			if let Err(err) = self.tokens.increment_usage(token.token_id, false).await {
				return err.into_response();
			}
			let response = self.forward_uncached(&mut req, &token, &provider).await;
			self.finish(&response, token.project_id, &provider.name, start).await;
			return response;
		}

		let key = CacheKey::derive(
			token.project_id,
			req.method(),
			req.uri().path(),
			req.uri().query(),
			body_hash.as_deref(),
			req.headers(),
		);

		if let Ok(Some(entry)) = self.cache_backend.get(&key).await
			&& entry.is_fresh(SystemTime::now())
		{
			if let Err(err) = self.tokens.increment_usage(token.token_id, true).await {
				return err.into_response();
			}
			self.publish_cache(EventKind::CacheHit, &key, token.project_id);
			self.count_cache_lookup("hit");
			let response = self.serve_cached(&key, &entry);
			self.finish(&response, token.project_id, &provider.name, start).await;
			return response;
		}
		self.publish_cache(EventKind::CacheMiss, &key, token.project_id);
		self.count_cache_lookup("miss");

		if let Err(err) = self.tokens.increment_usage(token.token_id, false).await {
			return err.into_response();
		}
		let response = self
			.forward_with_coalescing(&mut req, &token, &provider, key, cache_control)
			.await;
		self.finish(&response, token.project_id, &provider.name, start).await;
		response
	}

	fn serve_cached(&self, key: &CacheKey, entry: &CacheEntry) -> Response {
		let mut builder = http::Response::builder().status(entry.status);
		for (name, value) in entry.headers.iter() {
			builder = builder.header(name.clone(), value.clone());
		}
		let age = entry.age_seconds(SystemTime::now());
		let mut response = builder.body(Body::from(entry.body.clone())).unwrap();
		cache::stamp_cache_headers(response.headers_mut(), key, CacheOutcome::Hit, Some(age));
		response
	}

	/// FORWARDING with miss coalescing: the first caller for `key` becomes
	/// the originator and performs the upstream fetch; later callers for the
	/// same key wait on its result instead of stampeding the provider
	/// (spec.md §4.3 P4).
	async fn forward_with_coalescing(
		&self,
		req: &mut Request,
		token: &TokenView,
		provider: &ProviderConfig,
		key: CacheKey,
		request_cache_control: Option<String>,
	) -> Response {
		match CoalescingTable::join(&self.coalescing, key.clone()) {
			Role::Waiter(mut rx) => match rx.recv().await {
				Ok(Some(entry)) => self.serve_cached(&key, &entry),
				_ => self.forward_uncached(req, token, provider).await,
			},
			Role::Originator(guard) => {
				rewrite_for_upstream(req, provider, &token.upstream_credential);
				let forced_ttl = cache::request_forced_ttl(request_cache_control.as_deref());
				match self.send_upstream(req).await {
					Ok(mut resp) => {
						strip_response_headers(resp.headers_mut(), provider);
						let has_set_cookie = resp.headers().contains_key(header::SET_COOKIE);
						let response_cc = resp
							.headers()
							.get(header::CACHE_CONTROL)
							.and_then(|v| v.to_str().ok())
							.map(str::to_string);
						let status = resp.status().as_u16();
						// Size isn't known until the body is fully captured,
						// so the size bound is checked again after capture
						// completes; this first pass only screens on status
						// and header-level storability.
						let candidate = cache::is_storable(true, status, response_cc.as_deref(), has_set_cookie, 0, usize::MAX);

						if candidate {
							let body = std::mem::replace(resp.body_mut(), Body::empty());
							let (tee, rx_capture) = CaptureBody::wrap(body, self.max_object_bytes);
							*resp.body_mut() = tee;

							let entry_headers = resp.headers().clone();
							let expires_minus_date = expires_minus_date_secs(resp.headers());
							let ttl = cache::derive_ttl(response_cc.as_deref(), expires_minus_date, forced_ttl, self.default_ttl);
							let backend = self.cache_backend.clone();
							let project_id = token.project_id;
							let events = self.events.clone();
							let metrics = self.metrics.clone();
							let max_object_bytes = self.max_object_bytes;
							let task_key = key.clone();
							tokio::spawn(async move {
								let captured = match rx_capture.await {
									Ok(CaptureOutcome::Captured(body)) if body.len() <= max_object_bytes => Some(body),
									_ => None,
								};
								match captured {
									Some(body) => {
										let entry = CacheEntry {
											key: task_key.clone(),
											status,
											headers: entry_headers,
											body,
											stored_at: SystemTime::now(),
											ttl,
										};
										if backend.set(entry.clone()).await.is_ok() {
											metrics
												.cache_lookups_total
												.get_or_create(&CacheLabels { outcome: "stored".to_string() })
												.inc();
											events.publish(Event::new(
												EventKind::CacheStored,
												HashMap::from([
													("project_id".to_string(), project_id.to_string()),
													("key".to_string(), task_key.0.clone()),
												]),
											));
										}
										// Waiters replay this entry directly rather than re-fetching
										// upstream, win or lose the backend store above (spec.md
										// §4.3 P4).
										guard.complete(Some(Arc::new(entry)));
									},
									None => guard.complete(None),
								}
							});
						} else {
							guard.complete(None);
						}

						cache::stamp_cache_headers(resp.headers_mut(), &key, CacheOutcome::Miss, None);
						resp
					},
					Err(err) => {
						guard.complete(None);
						err.into_response()
					},
				}
			},
		}
	}

	async fn forward_uncached(&self, req: &mut Request, token: &TokenView, provider: &ProviderConfig) -> Response {
		rewrite_for_upstream(req, provider, &token.upstream_credential);
		match self.send_upstream(req).await {
			Ok(mut resp) => {
				strip_response_headers(resp.headers_mut(), provider);
				if self.cache_enabled {
					cache::stamp_cache_headers(resp.headers_mut(), &CacheKey(String::new()), CacheOutcome::Bypass, None);
					self.count_cache_lookup("bypass");
				}
				resp
			},
			Err(err) => err.into_response(),
		}
	}

	async fn send_upstream(&self, req: &mut Request) -> Result<Response, GatewayError> {
		let outgoing = std::mem::replace(req, http::Request::new(Body::empty()));
		let start_nanos = stamp_nanos();
		let result = tokio::time::timeout(self.timeouts.upstream_idle, self.upstream.request(outgoing)).await;
		let stop_nanos = stamp_nanos();
		match result {
			Ok(Ok(resp)) => {
				let mut resp = resp.map(|body| Body::new(body.map_err(axum::Error::new)));
				crate::http::strip_hop_by_hop(resp.headers_mut());
				crate::http::stamp_upstream_timing(resp.headers_mut(), start_nanos, stop_nanos);
				Ok(resp)
			},
			Ok(Err(e)) => Err(GatewayError::UpstreamUnavailable(e.to_string())),
			Err(_) => Err(GatewayError::UpstreamTimeout),
		}
	}

	async fn reject_auth(&self, reason: AuthReason, bearer: Option<&str>) -> Response {
		let obfuscated = bearer.map(crate::token::obfuscate_bearer);
		self.events.publish(Event::new(
			EventKind::TokenRejected,
			HashMap::from([
				("reason".to_string(), reason.as_str().to_string()),
				("bearer".to_string(), obfuscated.unwrap_or_else(|| "none".to_string())),
			]),
		));
		GatewayError::Auth(reason).into_response()
	}

	fn count_cache_lookup(&self, outcome: &str) {
		self
			.metrics
			.cache_lookups_total
			.get_or_create(&CacheLabels { outcome: outcome.to_string() })
			.inc();
	}

	fn publish_cache(&self, kind: EventKind, key: &CacheKey, project_id: Uuid) {
		self.events.publish(Event::new(
			kind,
			HashMap::from([
				("project_id".to_string(), project_id.to_string()),
				("key".to_string(), key.0.clone()),
			]),
		));
	}

	async fn finish(&self, response: &Response, project_id: Uuid, provider: &str, start: SystemTime) {
		let elapsed = SystemTime::now().duration_since(start).unwrap_or_default();
		let outcome = match response.status() {
			http::StatusCode::GATEWAY_TIMEOUT => Outcome::UpstreamTimeout,
			http::StatusCode::BAD_GATEWAY => Outcome::UpstreamUnavailable,
			_ => Outcome::Ok,
		};
		let labels = ProxyLabels {
			project: project_id.to_string(),
			provider: provider.to_string(),
			status: response.status().as_u16().to_string(),
		};
		self.metrics.requests_total.get_or_create(&labels).inc();
		self
			.metrics
			.request_duration_seconds
			.get_or_create(&labels)
			.observe(elapsed.as_secs_f64());
		self.events.publish(Event::new(
			EventKind::RequestFinished,
			HashMap::from([
				("project_id".to_string(), project_id.to_string()),
				("outcome".to_string(), outcome.as_str().to_string()),
				("elapsed_ms".to_string(), elapsed.as_millis().to_string()),
				("status".to_string(), response.status().as_u16().to_string()),
			]),
		));
	}
}

fn extract_bearer(req: &Request) -> Option<String> {
	let value = req.headers().get(header::AUTHORIZATION)?.to_str().ok()?;
	value.strip_prefix("Bearer ").map(str::to_string)
}

fn header_str(req: &Request, name: http::HeaderName) -> Option<String> {
	req.headers().get(name)?.to_str().ok().map(str::to_string)
}

fn stamp_nanos() -> u128 {
	SystemTime::now()
		.duration_since(std::time::UNIX_EPOCH)
		.unwrap_or_default()
		.as_nanos()
}

/// Removes the response-side headers the provider is configured to strip
/// (spec.md §4.7) before the response reaches the client.
fn strip_response_headers(headers: &mut http::HeaderMap, provider: &ProviderConfig) {
	for name in &provider.strip_response_headers {
		headers.remove(name);
	}
}

/// Buffers the request body fully, re-attaching it to `req` so it can still
/// be forwarded upstream, and returns it for hashing into the cache key
/// (spec.md §4.3) when it fits within `max_bytes` — the same bound the cache
/// engine enforces on stored response bodies. A body over the bound is
/// still forwarded untouched; the caller treats the request as cache-bypass
/// instead of keying it ambiguously.
async fn buffer_request_body(req: &mut Request, max_bytes: usize) -> Result<Option<Bytes>, GatewayError> {
	let body = std::mem::replace(req.body_mut(), Body::empty());
	let collected = body
		.collect()
		.await
		.map_err(|e| GatewayError::Internal(e.to_string()))?
		.to_bytes();
	*req.body_mut() = Body::from(collected.clone());
	Ok((collected.len() <= max_bytes).then_some(collected))
}

/// `Expires - Date` in seconds, TTL precedence rule 3 (spec.md §4.3). `None`
/// when either header is absent or unparseable as an HTTP-date.
fn expires_minus_date_secs(headers: &http::HeaderMap) -> Option<i64> {
	let expires = parse_http_date(headers.get(header::EXPIRES)?.to_str().ok()?)?;
	let date = headers
		.get(header::DATE)
		.and_then(|v| v.to_str().ok())
		.and_then(parse_http_date)
		.unwrap_or_else(Utc::now);
	Some((expires - date).num_seconds())
}

fn parse_http_date(value: &str) -> Option<chrono::DateTime<Utc>> {
	chrono::DateTime::parse_from_rfc2822(value)
		.ok()
		.map(|dt| dt.with_timezone(&Utc))
}

/// Applies spec.md §4.6's header-hygiene rule: substitutes the withering
/// bearer for the project's real upstream credential, strips any headers
/// the provider never wants to see, and rewrites the request's authority to
/// the provider's own.
fn rewrite_for_upstream(req: &mut Request, provider: &ProviderConfig, credential: &secrecy::SecretString) {
	if let Ok(value) = provider.credential_header_value(credential) {
		crate::http::substitute_credential(req.headers_mut(), &provider.credential_header, value);
	}
	for name in &provider.strip_request_headers {
		req.headers_mut().remove(name);
	}
	let mut parts = req.uri().clone().into_parts();
	if let Some(authority) = provider.base_url.authority().cloned() {
		parts.authority = Some(authority);
	}
	if let Some(scheme) = provider.base_url.scheme().cloned() {
		parts.scheme = Some(scheme);
	}
	if let Ok(uri) = http::Uri::from_parts(parts) {
		*req.uri_mut() = uri;
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn extracts_bearer_from_authorization_header() {
		let req = http::Request::builder()
			.header(header::AUTHORIZATION, "Bearer abc123")
			.body(Body::empty())
			.unwrap();
		assert_eq!(extract_bearer(&req).as_deref(), Some("abc123"));
	}

	#[test]
	fn missing_authorization_header_yields_none() {
		let req = http::Request::builder().body(Body::empty()).unwrap();
		assert!(extract_bearer(&req).is_none());
	}
}
