//! Event Bus (C4): lossy-by-design in-process fan-out of structured events
//! (spec.md §4.4). Publication never blocks the hot path; overflow drops
//! and is counted.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use ulid::Ulid;

use gateway_core::metrics::MetricsRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
	RequestStarted,
	RequestFinished,
	CacheHit,
	CacheMiss,
	CacheStored,
	TokenRejected,
	SubscriberEvicted,
}

/// Observability record (spec.md §3). Field names (`id`, `ts`, `kind`,
/// `attrs`) are stable per spec.md §6's file-sink schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
	pub id: String,
	pub ts: DateTime<Utc>,
	pub kind: EventKind,
	pub attrs: HashMap<String, String>,
}

impl Event {
	pub fn new(kind: EventKind, attrs: HashMap<String, String>) -> Self {
		Self {
			id: Ulid::new().to_string(),
			ts: Utc::now(),
			kind,
			attrs,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
	Ok,
	Dropped,
}

/// Bounded multi-producer broadcast ring. `tokio::broadcast`'s own overflow
/// behavior (the slowest receiver's unread messages are dropped, oldest
/// first) is exactly the semantics spec.md §4.4 asks for; the bus layers a
/// drop counter and per-subscriber eviction-after-N-drops on top.
pub struct EventBus {
	tx: broadcast::Sender<Event>,
	dropped: Arc<AtomicU32>,
	metrics: Option<Arc<MetricsRegistry>>,
	evict_after: u32,
}

pub struct Subscription {
	rx: broadcast::Receiver<Event>,
	tx: broadcast::Sender<Event>,
	dropped: Arc<AtomicU32>,
	metrics: Option<Arc<MetricsRegistry>>,
	consecutive_lags: u32,
	evict_after: u32,
}

impl Subscription {
	/// Returns the next event, or `None` once this subscriber has lagged
	/// `evict_after` times in a row and should be treated as disconnected
	/// (spec.md §4.4: "disconnected after N consecutive drops").
	pub async fn recv(&mut self) -> Option<Event> {
		loop {
			match self.rx.recv().await {
				Ok(event) => {
					self.consecutive_lags = 0;
					return Some(event);
				},
				Err(broadcast::error::RecvError::Lagged(_)) => {
					self.consecutive_lags += 1;
					self.record_drop();
					if self.consecutive_lags >= self.evict_after {
						self.publish_eviction();
						return None;
					}
				},
				Err(broadcast::error::RecvError::Closed) => return None,
			}
		}
	}

	fn record_drop(&self) {
		self.dropped.fetch_add(1, Ordering::Relaxed);
		if let Some(metrics) = &self.metrics {
			metrics.events_dropped_total.inc();
		}
	}

	/// Best-effort: if the bus has no other live receivers this send fails
	/// silently, same as any other `publish` with nobody listening.
	fn publish_eviction(&self) {
		let _ = self.tx.send(Event::new(EventKind::SubscriberEvicted, HashMap::new()));
	}
}

impl EventBus {
	pub fn new(buffer_size: usize, evict_after: u32, metrics: Option<Arc<MetricsRegistry>>) -> Self {
		let (tx, _rx) = broadcast::channel(buffer_size.max(1));
		Self {
			tx,
			dropped: Arc::new(AtomicU32::new(0)),
			metrics,
			evict_after,
		}
	}

	/// Never awaits anything (P7): `broadcast::Sender::send` is synchronous
	/// and non-blocking; a full ring simply drops the oldest unread message
	/// for lagging subscribers rather than applying backpressure here.
	pub fn publish(&self, event: Event) -> PublishOutcome {
		match self.tx.send(event) {
			Ok(_) => PublishOutcome::Ok,
			Err(_) => {
				// No receivers at all; not a drop in the "ring overflowed"
				// sense, but nothing was delivered either.
				PublishOutcome::Dropped
			},
		}
	}

	pub fn dropped_count(&self) -> u32 {
		self.dropped.load(Ordering::Relaxed)
	}

	pub fn subscribe(&self) -> Subscription {
		Subscription {
			rx: self.tx.subscribe(),
			tx: self.tx.clone(),
			dropped: self.dropped.clone(),
			metrics: self.metrics.clone(),
			consecutive_lags: 0,
			evict_after: self.evict_after,
		}
	}

	pub fn subscriber_count(&self) -> usize {
		self.tx.receiver_count()
	}
}
