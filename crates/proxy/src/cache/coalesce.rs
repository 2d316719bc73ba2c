use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;

use super::{CacheEntry, CacheKey};

/// One in-flight upstream fetch for a given key. The originator sends its
/// result (or `None` on abort) once; waiters subscribe and clone the
/// broadcast value (spec.md §9: "model the in-flight map as `key ->
/// one-shot broadcast channel`"; grounded additionally in
/// `gateway_core::responsechannel`'s request/response channel idiom).
pub struct InFlight {
	tx: broadcast::Sender<Option<Arc<CacheEntry>>>,
}

impl InFlight {
	fn new() -> Self {
		// capacity 1 is enough: every waiter calls subscribe() before the
		// originator ever sends, and the channel only ever carries one value.
		let (tx, _rx) = broadcast::channel(1);
		Self { tx }
	}

	pub fn subscribe(&self) -> broadcast::Receiver<Option<Arc<CacheEntry>>> {
		self.tx.subscribe()
	}

	fn complete(&self, result: Option<Arc<CacheEntry>>) {
		let _ = self.tx.send(result);
	}
}

/// `key -> in-flight fetch` table guarding at-most-one concurrent upstream
/// request per key (spec.md §4.3's miss coalescing, P4). The table is
/// guarded by `DashMap`'s per-shard locks, held only for table operations
/// and never across I/O (spec.md §5).
#[derive(Default)]
pub struct CoalescingTable {
	inflight: DashMap<CacheKey, Arc<InFlight>>,
}

pub enum Role {
	/// This caller is the first to request `key`; it must perform the
	/// upstream fetch and call [`CoalescingGuard::complete`].
	Originator(CoalescingGuard),
	/// Another caller is already fetching `key`; subscribe to its result.
	Waiter(broadcast::Receiver<Option<Arc<CacheEntry>>>),
}

impl CoalescingTable {
	pub fn new() -> Self {
		Self::default()
	}

	/// Takes `table` by `Arc` (rather than `&self`) so the returned
	/// [`CoalescingGuard`] can outlive the calling stack frame — it is
	/// routinely moved into a spawned task that completes the fetch in the
	/// background while the response streams to the client.
	pub fn join(table: &Arc<CoalescingTable>, key: CacheKey) -> Role {
		if let Some(existing) = table.inflight.get(&key) {
			return Role::Waiter(existing.subscribe());
		}
		// Race window between the check above and the insert below is
		// resolved by `entry().or_insert_with`, which is atomic under
		// DashMap's shard lock.
		let slot = table
			.inflight
			.entry(key.clone())
			.or_insert_with(|| Arc::new(InFlight::new()));
		Role::Originator(CoalescingGuard {
			table: table.clone(),
			key,
			inflight: slot.clone(),
			completed: false,
		})
	}
}

/// Held by the originator of an in-flight fetch. Dropping it without
/// calling [`complete`](Self::complete) — e.g. on task cancellation —
/// broadcasts `None` so waiters are released rather than hanging forever,
/// and removes the table entry so the next caller becomes a fresh
/// originator (spec.md §4.3: "last-cancellation aborts").
pub struct CoalescingGuard {
	table: Arc<CoalescingTable>,
	key: CacheKey,
	inflight: Arc<InFlight>,
	completed: bool,
}

impl CoalescingGuard {
	pub fn complete(mut self, result: Option<Arc<CacheEntry>>) {
		self.inflight.complete(result);
		self.table.inflight.remove(&self.key);
		self.completed = true;
	}
}

impl Drop for CoalescingGuard {
	fn drop(&mut self) {
		if !self.completed {
			self.inflight.complete(None);
			self.table.inflight.remove(&self.key);
		}
	}
}
