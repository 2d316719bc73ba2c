use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;

/// Handed out to every long-running task that must finish before the process exits.
///
/// Cloning a [`DrainWatcher`] is cheap; the process only terminates once every
/// clone has been dropped or has observed the shutdown signal and returned.
#[derive(Clone)]
pub struct DrainWatcher {
	rx: watch::Receiver<bool>,
}

impl DrainWatcher {
	/// Resolves once shutdown has been triggered.
	pub async fn signaled(&mut self) {
		// the sender only ever sets `true`, so an error here means the trigger
		// was dropped without firing, which we also treat as shutdown.
		let _ = self.rx.wait_for(|v| *v).await;
	}

	pub fn has_signaled(&self) -> bool {
		*self.rx.borrow()
	}
}

/// Fires the shutdown signal observed by every outstanding [`DrainWatcher`].
#[derive(Clone)]
pub struct ShutdownTrigger {
	tx: watch::Sender<bool>,
}

impl ShutdownTrigger {
	pub fn new() -> (Self, DrainWatcher) {
		let (tx, rx) = watch::channel(false);
		(Self { tx }, DrainWatcher { rx })
	}

	/// Signals shutdown and waits (up to the caller's own timeout) for every
	/// watcher to drop, i.e. for `tx.closed()` to resolve.
	pub async fn shutdown_now(&self) {
		let _ = self.tx.send(true);
		self.tx.closed().await;
	}

	pub fn has_signaled(&self) -> bool {
		*self.tx.borrow()
	}
}

/// Waits for SIGTERM (unix) or Ctrl-C, then trips `trigger` and waits up to
/// `grace` for outstanding work to drain before returning.
pub async fn shutdown_on_signal(trigger: ShutdownTrigger, grace: Duration) {
	wait_for_signal().await;
	tracing::info!("shutdown signal received, draining");
	match tokio::time::timeout(grace, trigger.shutdown_now()).await {
		Ok(()) => tracing::info!("drained cleanly"),
		Err(_) => tracing::warn!(?grace, "drain grace period elapsed, exiting anyway"),
	}
}

#[cfg(unix)]
async fn wait_for_signal() {
	use tokio::signal::unix::{SignalKind, signal};
	let mut term = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
	let mut int = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
	tokio::select! {
		_ = term.recv() => {},
		_ = int.recv() => {},
	}
}

#[cfg(not(unix))]
async fn wait_for_signal() {
	let _ = tokio::signal::ctrl_c().await;
}

/// Runs `fut` to completion unless shutdown fires first, in which case `None`
/// is returned and `fut` is dropped.
pub async fn or_shutdown<F: Future>(mut watcher: DrainWatcher, fut: F) -> Option<F::Output> {
	tokio::select! {
		biased;
		_ = watcher.signaled() => None,
		out = fut => Some(out),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn watcher_observes_trigger() {
		let (trigger, mut watcher) = ShutdownTrigger::new();
		assert!(!watcher.has_signaled());
		let handle = tokio::spawn(async move {
			watcher.signaled().await;
			watcher.has_signaled()
		});
		tokio::time::sleep(Duration::from_millis(10)).await;
		trigger.shutdown_now().await;
		assert!(handle.await.unwrap());
	}

	#[tokio::test]
	async fn or_shutdown_wins_race() {
		let (trigger, watcher) = ShutdownTrigger::new();
		trigger.shutdown_now().await;
		let out = or_shutdown(watcher, async {
			tokio::time::sleep(Duration::from_secs(60)).await;
			1
		})
		.await;
		assert_eq!(out, None);
	}
}
