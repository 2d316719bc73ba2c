use std::path::PathBuf;

use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::events::Event;

/// Append-only, line-delimited JSON journal for events that exhausted
/// retries (spec.md §4.5). Opened once at dispatcher construction.
pub struct DeadLetterJournal {
	file: Option<Mutex<fs_err::tokio::File>>,
}

impl DeadLetterJournal {
	pub async fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
		let file = fs_err::tokio::OpenOptions::new()
			.create(true)
			.append(true)
			.open(path.into())
			.await?;
		Ok(Self {
			file: Some(Mutex::new(file)),
		})
	}

	/// A journal with nowhere to write: used in tests and whenever the
	/// dispatcher is configured without a dead-letter path.
	pub fn disabled() -> Self {
		Self { file: None }
	}

	pub async fn write(&self, event: &Event) -> anyhow::Result<()> {
		let Some(file) = &self.file else { return Ok(()) };
		let mut line = serde_json::to_vec(event)?;
		line.push(b'\n');
		let mut guard = file.lock().await;
		guard.write_all(&line).await?;
		guard.flush().await?;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::collections::HashMap;

	use crate::events::EventKind;

	#[tokio::test]
	async fn appends_newline_delimited_json() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("dead-letters.jsonl");
		let journal = DeadLetterJournal::open(&path).await.unwrap();
		journal
			.write(&Event::new(EventKind::RequestFinished, HashMap::new()))
			.await
			.unwrap();
		journal
			.write(&Event::new(EventKind::CacheHit, HashMap::new()))
			.await
			.unwrap();
		let contents = fs_err::tokio::read_to_string(&path).await.unwrap();
		assert_eq!(contents.lines().count(), 2);
	}

	#[tokio::test]
	async fn disabled_journal_is_a_no_op() {
		let journal = DeadLetterJournal::disabled();
		journal
			.write(&Event::new(EventKind::RequestFinished, HashMap::new()))
			.await
			.unwrap();
	}
}
