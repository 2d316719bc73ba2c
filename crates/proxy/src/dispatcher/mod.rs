//! Dispatcher (C5): bridges the lossy in-process event bus to durable
//! external sinks with retry and a dead-letter journal (spec.md §4.5).

mod deadletter;
mod file_sink;
mod http_sink;
mod retry;

pub use deadletter::DeadLetterJournal;
pub use file_sink::FileSink;
pub use http_sink::HttpSink;
pub use retry::backoff_with_full_jitter;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use gateway_core::metrics::MetricsRegistry;
use tokio::sync::mpsc;

use crate::events::Event;

#[async_trait]
pub trait Sink: Send + Sync {
	async fn send(&self, event: &Event) -> anyhow::Result<()>;
	fn name(&self) -> &str;
}

pub struct SinkWorkerConfig {
	pub intake_buffer: usize,
	pub max_attempts: u32,
}

impl Default for SinkWorkerConfig {
	fn default() -> Self {
		Self {
			intake_buffer: 1024,
			max_attempts: 8,
		}
	}
}

/// One worker per sink. Never exerts backpressure on the bus (spec.md
/// §4.5): the intake channel is bounded and `try_send` drops (and counts)
/// when full rather than awaiting capacity.
pub struct SinkWorker {
	intake: mpsc::Sender<Event>,
	dropped: Arc<AtomicU64>,
}

impl SinkWorker {
	pub fn spawn(
		sink: Arc<dyn Sink>,
		journal: Arc<DeadLetterJournal>,
		config: SinkWorkerConfig,
		metrics: Option<Arc<MetricsRegistry>>,
	) -> (Self, tokio::task::JoinHandle<()>) {
		let (intake, mut rx) = mpsc::channel(config.intake_buffer.max(1));
		let max_attempts = config.max_attempts;
		let handle = tokio::spawn(async move {
			while let Some(event) = rx.recv().await {
				let mut attempt = 0u32;
				loop {
					attempt += 1;
					match sink.send(&event).await {
						Ok(()) => break,
						Err(err) if attempt >= max_attempts => {
							tracing::warn!(
								sink = sink.name(),
								%err,
								attempts = attempt,
								"exhausted retries, writing to dead-letter journal"
							);
							if let Err(journal_err) = journal.write(&event).await {
								tracing::error!(%journal_err, "failed writing dead-letter journal");
							}
							if let Some(metrics) = &metrics {
								metrics.dead_letters_total.inc();
							}
							break;
						},
						Err(err) => {
							let delay = backoff_with_full_jitter(attempt);
							tracing::debug!(sink = sink.name(), %err, attempt, ?delay, "retrying sink delivery");
							tokio::time::sleep(delay).await;
						},
					}
				}
			}
		});
		(
			Self {
				intake,
				dropped: Arc::new(AtomicU64::new(0)),
			},
			handle,
		)
	}

	pub fn offer(&self, event: Event) {
		if self.intake.try_send(event).is_err() {
			self.dropped.fetch_add(1, Ordering::Relaxed);
		}
	}

	pub fn dropped_count(&self) -> u64 {
		self.dropped.load(Ordering::Relaxed)
	}
}

/// Fans an `EventBus` subscription out to every configured sink worker.
/// Runs in its own task so it never shares an execution context with the
/// hot path (spec.md §4.5: "drains bus, ships events ... C5 drains C4 in a
/// separate execution context").
pub fn spawn_fanout(
	mut subscription: crate::events::Subscription,
	workers: Vec<Arc<SinkWorker>>,
) -> tokio::task::JoinHandle<()> {
	tokio::spawn(async move {
		while let Some(event) = subscription.recv().await {
			for worker in &workers {
				worker.offer(event.clone());
			}
		}
	})
}
