use http::{HeaderMap, HeaderName, HeaderValue, header};

pub type Error = axum_core::Error;
pub type Body = axum_core::body::Body;
pub type Request = ::http::Request<Body>;
pub type Response = ::http::Response<Body>;

/// Headers that are connection-scoped rather than message-scoped and must
/// never be forwarded in either direction (spec.md §4.6).
pub const HOP_BY_HOP: &[HeaderName] = &[
	header::CONNECTION,
	header::PROXY_AUTHENTICATE,
	header::PROXY_AUTHORIZATION,
	header::TE,
	header::TRAILER,
	header::TRANSFER_ENCODING,
	header::UPGRADE,
];

pub const KEEP_ALIVE: HeaderName = HeaderName::from_static("keep-alive");

pub mod x_headers {
	use http::HeaderName;

	pub const X_PROXY_CACHE: HeaderName = HeaderName::from_static("x-proxy-cache");
	pub const X_PROXY_CACHE_KEY: HeaderName = HeaderName::from_static("x-proxy-cache-key");
	pub const CACHE_STATUS: HeaderName = HeaderName::from_static("cache-status");
	pub const X_REQUEST_START: HeaderName = HeaderName::from_static("x-request-start");
	pub const X_UPSTREAM_REQUEST_START: HeaderName =
		HeaderName::from_static("x-upstream-request-start");
	pub const X_UPSTREAM_REQUEST_STOP: HeaderName =
		HeaderName::from_static("x-upstream-request-stop");
}

/// Strips hop-by-hop headers from `headers` in place. Applied to both the
/// inbound request (before forwarding upstream) and the upstream response
/// (before returning to the client).
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
	for name in HOP_BY_HOP {
		headers.remove(name);
	}
	headers.remove(KEEP_ALIVE);
}

/// Removes the inbound withering-token `Authorization` header and installs
/// the project's upstream credential in the form the provider expects
/// (spec.md §4.6's header-hygiene rule, P6's non-leak invariant).
pub fn substitute_credential(
	headers: &mut HeaderMap,
	credential_header: &HeaderName,
	value: HeaderValue,
) {
	headers.remove(header::AUTHORIZATION);
	headers.insert(credential_header.clone(), value);
}

pub fn stamp_request_start(headers: &mut HeaderMap, nanos_since_epoch: u128) {
	if let Ok(v) = HeaderValue::from_str(&nanos_since_epoch.to_string()) {
		headers.insert(x_headers::X_REQUEST_START, v);
	}
}

/// Stamps the upstream round-trip window onto the response so latency can be
/// attributed to "time in the gateway" vs. "time upstream" (spec.md §4.6, §6).
pub fn stamp_upstream_timing(headers: &mut HeaderMap, start_nanos: u128, stop_nanos: u128) {
	if let Ok(v) = HeaderValue::from_str(&start_nanos.to_string()) {
		headers.insert(x_headers::X_UPSTREAM_REQUEST_START, v);
	}
	if let Ok(v) = HeaderValue::from_str(&stop_nanos.to_string()) {
		headers.insert(x_headers::X_UPSTREAM_REQUEST_STOP, v);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn strips_all_hop_by_hop_headers() {
		let mut headers = HeaderMap::new();
		headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
		headers.insert(KEEP_ALIVE, HeaderValue::from_static("timeout=5"));
		headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
		strip_hop_by_hop(&mut headers);
		assert!(!headers.contains_key(header::CONNECTION));
		assert!(!headers.contains_key(KEEP_ALIVE));
		assert!(headers.contains_key(header::CONTENT_TYPE));
	}

	#[test]
	fn substitution_never_leaves_original_bearer() {
		let mut headers = HeaderMap::new();
		headers.insert(
			header::AUTHORIZATION,
			HeaderValue::from_static("Bearer withering-abc"),
		);
		substitute_credential(
			&mut headers,
			&header::AUTHORIZATION,
			HeaderValue::from_static("Bearer upstream-key"),
		);
		assert_eq!(headers.get(header::AUTHORIZATION).unwrap(), "Bearer upstream-key");
	}

	#[test]
	fn upstream_timing_stamps_both_headers() {
		let mut headers = HeaderMap::new();
		stamp_upstream_timing(&mut headers, 100, 250);
		assert_eq!(headers.get(x_headers::X_UPSTREAM_REQUEST_START).unwrap(), "100");
		assert_eq!(headers.get(x_headers::X_UPSTREAM_REQUEST_STOP).unwrap(), "250");
	}
}
