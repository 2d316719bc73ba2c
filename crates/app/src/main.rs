use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use gateway_core::telemetry::LogFormat;
use gateway_proxy::cache::{CacheBackend, CoalescingTable, MemoryBackend, RedisBackend};
use gateway_proxy::config::{CacheBackendKind, GatewayConfig, ProviderEntry, SinkConfig};
use gateway_proxy::dispatcher::{DeadLetterJournal, FileSink, HttpSink, Sink, SinkWorker, SinkWorkerConfig};
use gateway_proxy::events::EventBus;
use gateway_proxy::pipeline::{Pipeline, PipelineTimeouts, build_upstream_client};
use gateway_proxy::ratelimit::{DistributedLimiter, FailureMode, LocalBucketLimiter, RateLimiter, RateLimiterConfig};
use gateway_proxy::registry::{AllowedRoute, PathMatch, ProviderConfig, ProviderRegistry};
use gateway_proxy::token::PgTokenStore;

#[derive(Parser, Debug)]
#[command(name = "gateway")]
struct Args {
	/// Path to the YAML configuration file (spec.md §6's configuration surface).
	#[arg(long, default_value = "gateway.yaml")]
	config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let args = Args::parse();
	gateway_core::telemetry::init("info", LogFormat::Plain);

	let raw = fs_err::tokio::read_to_string(&args.config)
		.await
		.with_context(|| format!("reading config file {}", args.config))?;
	let config: GatewayConfig = serde_yaml::from_str(&raw).context("parsing config file")?;
	config.validate()?;

	let mut metrics_registry = prometheus_client::registry::Registry::default();
	let metrics = Arc::new(gateway_core::metrics::MetricsRegistry::new(&mut metrics_registry));

	let database_url = config
		.database_url
		.clone()
		.context("database_url is required")?;
	let pool = sqlx::postgres::PgPoolOptions::new()
		.max_connections(10)
		.connect(&database_url)
		.await
		.context("connecting to token store database")?;
	let tokens: Arc<dyn gateway_proxy::token::TokenStore> = Arc::new(PgTokenStore::new(pool));

	let rate_limiter = Arc::new(build_rate_limiter(&config).await?);
	rate_limiter.spawn_health_probe();

	let cache_backend: Arc<dyn CacheBackend> = build_cache_backend(&config).await?;
	let coalescing = Arc::new(CoalescingTable::new());

	let events = Arc::new(EventBus::new(config.event_bus_buffer_size, 5, Some(metrics.clone())));
	spawn_dispatcher(&config, &events, metrics.clone()).await?;

	let registry = ProviderRegistry::new(build_providers(&config.providers)?);

	let pipeline = Arc::new(Pipeline {
		tokens,
		rate_limiter,
		cache_backend,
		coalescing,
		events,
		registry,
		upstream: build_upstream_client(),
		timeouts: PipelineTimeouts::default(),
		cache_enabled: config.http_cache_enabled,
		default_ttl: config.http_cache_default_ttl(),
		max_object_bytes: config.http_cache_max_object_bytes,
		metrics,
	});

	let router = gateway_proxy::build_router(pipeline);

	let (trigger, watcher) = gateway_core::signal::ShutdownTrigger::new();
	let grace = config.shutdown_grace();
	tokio::spawn(gateway_core::signal::shutdown_on_signal(trigger, grace));

	let listener = tokio::net::TcpListener::bind(&config.listen_addr)
		.await
		.with_context(|| format!("binding {}", config.listen_addr))?;
	tracing::info!(addr = %config.listen_addr, "gateway listening");

	axum::serve(listener, router)
		.with_graceful_shutdown(async move {
			let mut watcher = watcher;
			watcher.signaled().await;
		})
		.await
		.context("server error")?;

	Ok(())
}

async fn build_rate_limiter(config: &GatewayConfig) -> anyhow::Result<RateLimiter> {
	let redis_url = config.redis_url.clone().context("redis_url is required")?;
	let client = redis::Client::open(redis_url.as_str()).context("opening redis client for rate limiter")?;
	let conn = client
		.get_connection_manager()
		.await
		.context("connecting redis for rate limiter")?;
	let distributed = DistributedLimiter::new(conn, "gateway:rl:");
	let local = LocalBucketLimiter::new(
		config.distributed_rate_limit_max as f64,
		config.distributed_rate_limit_max.max(1) as f64,
	);
	let failure_mode = if config.rate_limiter_fail_open {
		FailureMode::FailOpen
	} else {
		FailureMode::FailClosed
	};
	Ok(RateLimiter::new(
		distributed,
		local,
		RateLimiterConfig {
			window: config.distributed_rate_limit_window(),
			max: config.distributed_rate_limit_max,
			fallback_enabled: config.distributed_rate_limit_fallback,
			failure_mode,
			health_probe_interval: Duration::from_secs(5),
		},
	))
}

async fn build_cache_backend(config: &GatewayConfig) -> anyhow::Result<Arc<dyn CacheBackend>> {
	match config.http_cache_backend {
		CacheBackendKind::Memory => Ok(Arc::new(MemoryBackend::new(10_000, Duration::from_secs(3600)))),
		CacheBackendKind::Redis => {
			let url = config
				.redis_url
				.clone()
				.context("http_cache_backend=redis requires redis_url")?;
			let client = redis::Client::open(url.as_str())?;
			let conn = client.get_connection_manager().await?;
			Ok(Arc::new(RedisBackend::new(conn, "gateway:cache:")))
		},
	}
}

async fn spawn_dispatcher(
	config: &GatewayConfig,
	events: &Arc<EventBus>,
	metrics: Arc<gateway_core::metrics::MetricsRegistry>,
) -> anyhow::Result<()> {
	if config.dispatcher_sinks.is_empty() {
		return Ok(());
	}
	let journal = Arc::new(DeadLetterJournal::open("gateway-dead-letters.jsonl").await?);
	let mut workers = Vec::new();
	for sink_config in &config.dispatcher_sinks {
		let sink: Arc<dyn Sink> = match sink_config {
			SinkConfig::File { path } => Arc::new(FileSink::open(path.clone()).await?),
			SinkConfig::Http { url } => Arc::new(HttpSink::new(url.clone())),
		};
		let (worker, _handle) = SinkWorker::spawn(sink, journal.clone(), SinkWorkerConfig::default(), Some(metrics.clone()));
		workers.push(Arc::new(worker));
	}
	gateway_proxy::dispatcher::spawn_fanout(events.subscribe(), workers);
	Ok(())
}

fn build_providers(entries: &[ProviderEntry]) -> anyhow::Result<Vec<ProviderConfig>> {
	entries
		.iter()
		.map(|entry| {
			let base_url = http::Uri::from_str(&entry.base_url)
				.with_context(|| format!("provider {}: invalid base_url", entry.name))?;
			let credential_header = http::HeaderName::try_from(entry.credential_header.as_str())
				.with_context(|| format!("provider {}: invalid credential_header", entry.name))?;
			let allowed = entry
				.allowed
				.iter()
				.map(|route| {
					Ok(AllowedRoute {
						method: http::Method::from_str(&route.method)
							.with_context(|| format!("provider {}: invalid method {}", entry.name, route.method))?,
						path: PathMatch::parse(&route.path),
					})
				})
				.collect::<anyhow::Result<Vec<_>>>()?;
			let strip_request_headers = entry
				.strip_request_headers
				.iter()
				.map(|h| http::HeaderName::try_from(h.as_str()))
				.collect::<Result<Vec<_>, _>>()
				.with_context(|| format!("provider {}: invalid strip_request_headers entry", entry.name))?;
			let strip_response_headers = entry
				.strip_response_headers
				.iter()
				.map(|h| http::HeaderName::try_from(h.as_str()))
				.collect::<Result<Vec<_>, _>>()
				.with_context(|| format!("provider {}: invalid strip_response_headers entry", entry.name))?;
			Ok(ProviderConfig {
				name: entry.name.clone(),
				base_url,
				mount_prefix: entry.mount_prefix.clone(),
				allowed,
				credential_header,
				credential_prefix: entry.credential_prefix.clone(),
				strip_request_headers,
				strip_response_headers,
			})
		})
		.collect()
}
