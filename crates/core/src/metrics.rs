use prometheus_client::encoding::{EncodeLabelSet, text};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

#[derive(Debug, Clone, PartialEq, Eq, Hash, EncodeLabelSet)]
pub struct ProxyLabels {
	pub project: String,
	pub provider: String,
	pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, EncodeLabelSet)]
pub struct CacheLabels {
	pub outcome: String,
}

/// Process-wide Prometheus registry and the metric families every
/// component reports into. Cheap to clone: every field is an `Arc` under
/// the hood courtesy of `prometheus-client`.
#[derive(Clone)]
pub struct MetricsRegistry {
	pub requests_total: Family<ProxyLabels, Counter>,
	pub request_duration_seconds: Family<ProxyLabels, Histogram>,
	pub cache_lookups_total: Family<CacheLabels, Counter>,
	pub events_dropped_total: Counter,
	pub dead_letters_total: Counter,
}

impl MetricsRegistry {
	pub fn new(registry: &mut Registry) -> Self {
		let requests_total = Family::<ProxyLabels, Counter>::default();
		registry.register(
			"gateway_requests",
			"Total proxied requests by project, provider and status",
			requests_total.clone(),
		);

		let request_duration_seconds =
			Family::<ProxyLabels, Histogram>::new_with_constructor(|| {
				Histogram::new(
					[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0].into_iter(),
				)
			});
		registry.register(
			"gateway_request_duration_seconds",
			"End-to-end proxied request latency",
			request_duration_seconds.clone(),
		);

		let cache_lookups_total = Family::<CacheLabels, Counter>::default();
		registry.register(
			"gateway_cache_lookups",
			"Cache lookups by outcome (hit, miss, bypass, stored)",
			cache_lookups_total.clone(),
		);

		let events_dropped_total = Counter::default();
		registry.register(
			"gateway_events_dropped",
			"Events dropped because the event bus channel was full",
			events_dropped_total.clone(),
		);

		let dead_letters_total = Counter::default();
		registry.register(
			"gateway_dead_letters",
			"Dispatcher deliveries that exhausted retries and were journaled",
			dead_letters_total.clone(),
		);

		Self {
			requests_total,
			request_duration_seconds,
			cache_lookups_total,
			events_dropped_total,
			dead_letters_total,
		}
	}
}

/// Renders the registry in the Prometheus text exposition format for the
/// `/metrics` endpoint.
pub fn encode(registry: &Registry) -> anyhow::Result<String> {
	let mut buf = String::new();
	text::encode(&mut buf, registry)?;
	Ok(buf)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn registers_and_encodes() {
		let mut registry = Registry::default();
		let metrics = MetricsRegistry::new(&mut registry);
		metrics
			.requests_total
			.get_or_create(&ProxyLabels {
				project: "acme".into(),
				provider: "openai".into(),
				status: "200".into(),
			})
			.inc();
		let out = encode(&registry).unwrap();
		assert!(out.contains("gateway_requests_total"));
	}
}
