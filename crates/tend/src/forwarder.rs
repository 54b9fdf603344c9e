use std::io;
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use nix::fcntl::OFlag;
use nix::libc;
use tokio::fs::{DirBuilder, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::pipe;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::config::Tunables;
use crate::error::ForwardError;

const CHUNK_SIZE: usize = 4096;
/// Pause after a failed write before reopening, so a persistently failing
/// destination does not spin.
const WRITE_RETRY_PAUSE: Duration = Duration::from_secs(1);

/// Creates a pipe for one output stream: an async reader for the forwarder
/// and a write end to hand to each child.
pub fn log_pipe() -> Result<(pipe::Receiver, OwnedFd), ForwardError> {
	let (read_end, write_end) = nix::unistd::pipe2(OFlag::O_CLOEXEC).map_err(ForwardError::Pipe)?;
	let reader = pipe::Receiver::from_owned_fd(read_end).map_err(ForwardError::Register)?;
	Ok((reader, write_end))
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ForwardReport {
	pub bytes_written: u64,
	pub bytes_discarded: u64,
	pub reopens: u32,
}

enum Stop {
	/// Writer side closed and nothing is left to write.
	Exhausted,
	Reopen,
	WriteFailed,
}

/// Copies one pipe into an append-only log file that can be swapped out at
/// any time.
pub struct Forwarder {
	path: PathBuf,
	reader: pipe::Receiver,
	/// Read but not yet confirmed written. Survives reopens.
	chunk: Vec<u8>,
	reopen_retry: Duration,
	flush_timeout: Duration,
	report: ForwardReport,
}

impl Forwarder {
	pub fn new(path: impl Into<PathBuf>, reader: pipe::Receiver, tunables: &Tunables) -> Self {
		Self {
			path: path.into(),
			reader,
			chunk: Vec::with_capacity(CHUNK_SIZE),
			reopen_retry: tunables.reopen_retry(),
			flush_timeout: tunables.flush_timeout(),
			report: ForwardReport::default(),
		}
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	/// Forwards until the pipe is exhausted. Each notification on `reopen`
	/// closes the current file and opens `path` again.
	///
	/// Once `drain` is cancelled the forwarder keeps going for at most the
	/// flush timeout; whatever is still buffered then is discarded and
	/// reported.
	pub async fn run(
		mut self,
		reopen: Arc<Notify>,
		drain: CancellationToken,
	) -> Result<ForwardReport, ForwardError> {
		let flush_timeout = self.flush_timeout;
		let expired = async move {
			drain.cancelled().await;
			tokio::time::sleep(flush_timeout).await;
		};

		tokio::select! {
			biased;
			result = self.pump(&reopen) => result?,
			_ = expired => {
				let cause = format!("still pending {:?} after shutdown began", flush_timeout);
				self.discard(&cause);
			}
		}
		Ok(self.report)
	}

	async fn pump(&mut self, reopen: &Notify) -> Result<(), ForwardError> {
		loop {
			let mut file = tokio::select! {
				biased;
				_ = reopen.notified() => {
					self.report.reopens += 1;
					continue;
				}
				file = self.open() => file,
			};

			match self.forward(file.as_mut(), reopen).await? {
				Stop::Exhausted => return Ok(()),
				// every byte counted as written was confirmed, so dropping
				// the old file loses nothing
				Stop::Reopen => self.report.reopens += 1,
				Stop::WriteFailed => {
					drop(file);
					tokio::time::sleep(WRITE_RETRY_PAUSE).await;
				}
			}
		}
	}

	async fn open(&mut self) -> Option<File> {
		if let Some(dir) = self.path.parent() {
			if let Err(e) = DirBuilder::new().recursive(true).mode(0o700).create(dir).await {
				tracing::debug!("failed to create {}: {}", dir.display(), e);
			}
		}

		// O_NONBLOCK: a FIFO without a reader fails here instead of hanging
		let opened = OpenOptions::new()
			.create(true)
			.append(true)
			.mode(0o600)
			.custom_flags(libc::O_NONBLOCK)
			.open(&self.path)
			.await;
		match opened {
			Ok(file) => Some(file),
			Err(e) => {
				tracing::warn!(
					"failed to open '{}' ({}), log will be discarded, trying to reopen in {:?}",
					self.path.display(),
					e,
					self.reopen_retry
				);
				self.discard("destination could not be opened");
				None
			}
		}
	}

	async fn forward(&mut self, mut file: Option<&mut File>, reopen: &Notify) -> Result<Stop, ForwardError> {
		let has_file = file.is_some();
		let retry_after = self.reopen_retry;
		let retry = async move {
			if has_file {
				std::future::pending::<()>().await
			} else {
				tokio::time::sleep(retry_after).await
			}
		};
		tokio::pin!(retry);
		let mut buf = [0u8; CHUNK_SIZE];

		loop {
			if self.chunk.is_empty() {
				let n = tokio::select! {
					biased;
					_ = reopen.notified() => return Ok(Stop::Reopen),
					_ = &mut retry => return Ok(Stop::Reopen),
					read = self.reader.read(&mut buf) => read.map_err(ForwardError::Read)?,
				};
				if n == 0 {
					return Ok(Stop::Exhausted);
				}
				self.chunk.extend_from_slice(&buf[..n]);
			}

			let Some(file) = file.as_deref_mut() else {
				self.report.bytes_discarded += self.chunk.len() as u64;
				self.chunk.clear();
				continue;
			};

			match write_through(file, &self.chunk).await {
				Ok(0) => {
					tracing::warn!("failed to write to '{}' (wrote zero bytes), forcing reopen", self.path.display());
					return Ok(Stop::WriteFailed);
				}
				Ok(n) => {
					self.chunk.drain(..n);
					self.report.bytes_written += n as u64;
				}
				Err(e) => {
					tracing::warn!("failed to write to '{}' ({}), forcing reopen", self.path.display(), e);
					return Ok(Stop::WriteFailed);
				}
			}
		}
	}

	fn discard(&mut self, cause: &str) {
		if self.chunk.is_empty() {
			return;
		}
		tracing::warn!(
			"discarding {} buffered bytes for '{}' ({})",
			self.chunk.len(),
			self.path.display(),
			cause
		);
		self.report.bytes_discarded += self.chunk.len() as u64;
		self.chunk.clear();
	}
}

/// `tokio::fs::File::write` only hands the bytes to the blocking pool; the
/// flush reports whether `write(2)` actually took them.
async fn write_through(file: &mut File, data: &[u8]) -> io::Result<usize> {
	let n = file.write(data).await?;
	file.flush().await?;
	Ok(n)
}
