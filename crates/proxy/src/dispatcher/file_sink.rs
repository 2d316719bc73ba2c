use std::path::PathBuf;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::events::Event;

use super::Sink;

/// Writes newline-delimited JSON with stable field names (spec.md §6: `id`,
/// `ts`, `kind`, `attrs`), using the teacher's `fs-err` + tokio dependency.
pub struct FileSink {
	path: PathBuf,
	file: Mutex<fs_err::tokio::File>,
}

impl FileSink {
	pub async fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
		let path = path.into();
		let file = fs_err::tokio::OpenOptions::new()
			.create(true)
			.append(true)
			.open(&path)
			.await?;
		Ok(Self {
			path,
			file: Mutex::new(file),
		})
	}
}

#[async_trait]
impl Sink for FileSink {
	async fn send(&self, event: &Event) -> anyhow::Result<()> {
		let mut line = serde_json::to_vec(event)?;
		line.push(b'\n');
		let mut guard = self.file.lock().await;
		guard.write_all(&line).await?;
		guard.flush().await?;
		Ok(())
	}

	fn name(&self) -> &str {
		self.path.to_str().unwrap_or("file")
	}
}
