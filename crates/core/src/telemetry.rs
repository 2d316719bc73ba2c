use std::str::FromStr;
use std::sync::OnceLock;

use tracing_subscriber::filter::Targets;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry, reload};

type ReloadHandle = reload::Handle<Targets, Registry>;

static LOG_HANDLE: OnceLock<ReloadHandle> = OnceLock::new();

/// Output format for the process' structured logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
	#[default]
	Plain,
	Json,
}

/// Installs the global tracing subscriber. Must be called once at process
/// startup before any other `tracing` call. The initial filter comes from
/// `RUST_LOG` (falling back to `default_directive`) and can be changed at
/// runtime via [`set_level`].
pub fn init(default_directive: &str, format: LogFormat) {
	let initial = EnvFilter::try_from_default_env()
		.unwrap_or_else(|_| EnvFilter::new(default_directive))
		.to_string();
	let targets = Targets::from_str(&initial).unwrap_or_default();
	let (filter, handle) = reload::Layer::new(targets);

	let registry = tracing_subscriber::registry().with(filter);
	match format {
		LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
		LogFormat::Plain => registry.with(tracing_subscriber::fmt::layer()).init(),
	}

	// init() is only meant to run once; a second call is a bug in the caller,
	// not something we want to silently ignore.
	LOG_HANDLE
		.set(handle)
		.expect("telemetry::init called more than once");
}

/// Mirrors the `POST /logging` behavior of Envoy-style admin planes: either
/// report the current filter, or apply a new one.
///
/// `level` may be a bare level (`"debug"`) applied globally, or a
/// comma-separated list of `target=level` clauses. `reset` restores the
/// process' original startup filter.
pub fn set_level(reset: bool, level: &str) -> anyhow::Result<String> {
	let handle = LOG_HANDLE
		.get()
		.ok_or_else(|| anyhow::anyhow!("telemetry not initialized"))?;
	if reset {
		handle.reload(Targets::from_str("info")?)?;
		return get_current_loglevel();
	}
	let targets = Targets::from_str(level)?;
	handle.reload(targets)?;
	get_current_loglevel()
}

pub fn validate_level(level: &str) -> anyhow::Result<()> {
	for clause in level.split(',') {
		match clause {
			"off" | "error" | "warn" | "info" | "debug" | "trace" => continue,
			s if s.contains('=') => {
				Targets::from_str(s)?;
			},
			s => anyhow::bail!("level {s} is invalid"),
		}
	}
	Ok(())
}

pub fn get_current_loglevel() -> anyhow::Result<String> {
	let handle = LOG_HANDLE
		.get()
		.ok_or_else(|| anyhow::anyhow!("telemetry not initialized"))?;
	let mut out = String::new();
	handle
		.with_current(|targets| out = targets.to_string())
		.map_err(|e| anyhow::anyhow!("failed reading current filter: {e}"))?;
	Ok(out)
}
