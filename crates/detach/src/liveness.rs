use std::fs::{self, DirBuilder, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::Path;
use std::time::{Duration, Instant};

use crate::error::StateError;
use crate::paths::ServicePaths;
use crate::token::{self, LaunchState, LaunchToken, STATE_ENV_KEY};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Contents of `D/.state/pid`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PidRecord {
	pub pid: u32,
	pub token: LaunchToken,
}

impl PidRecord {
	/// `Ok(None)` for a record without its trailing newline, i.e. one that is
	/// still being written by a launcher that predates atomic commits.
	pub fn parse(path: &Path, content: &str) -> Result<Option<Self>, StateError> {
		if !content.ends_with('\n') {
			return Ok(None);
		}
		let malformed = || StateError::MalformedRecord {
			path: path.to_path_buf(),
			content: content.to_string(),
		};
		let mut fields = content.split_whitespace();
		let pid = fields
			.next()
			.and_then(|p| p.parse::<u32>().ok())
			.filter(|p| *p > 0)
			.ok_or_else(malformed)?;
		let token = fields
			.next()
			.and_then(|t| t.parse::<LaunchToken>().ok())
			.ok_or_else(malformed)?;
		if fields.next().is_some() {
			return Err(malformed());
		}
		Ok(Some(Self { pid, token }))
	}

	pub fn render(&self) -> String {
		format!("{} {}\n", self.pid, self.token)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
	/// No (complete) record on disk.
	Absent,
	/// A record exists but its pid is gone or belongs to another launch.
	Stale { pid: u32 },
	Alive { pid: u32 },
}

impl Liveness {
	pub fn is_alive(&self) -> bool {
		matches!(self, Liveness::Alive { .. })
	}

	pub fn pid(&self) -> Option<u32> {
		match self {
			Liveness::Alive { pid } => Some(*pid),
			_ => None,
		}
	}
}

/// Outcome of [`LivenessStore::claim`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
	/// The caller owns the service directory and must bootstrap a supervisor.
	Exclusive,
	/// A live supervisor already owns it.
	Contested { pid: u32 },
}

enum Contest {
	Defer(u32),
	TookOver,
	Retry,
}

/// On-disk record tying a pid to the launch token it was started with.
#[derive(Debug, Clone)]
pub struct LivenessStore {
	paths: ServicePaths,
}

impl LivenessStore {
	pub fn new(paths: ServicePaths) -> Self {
		Self { paths }
	}

	pub fn paths(&self) -> &ServicePaths {
		&self.paths
	}

	pub fn read_record(&self) -> Result<Option<PidRecord>, StateError> {
		let path = self.paths.pid_path();
		match fs::read_to_string(&path) {
			Ok(content) => PidRecord::parse(&path, &content),
			Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
			Err(e) => Err(StateError::io("read", path, e)),
		}
	}

	/// One look at the record and the process it names.
	pub fn probe(&self) -> Result<Liveness, StateError> {
		self.inspect().map(|(_, liveness)| liveness)
	}

	/// Like [`probe`](Self::probe), retrying I/O failures for up to `window`
	/// since a competing launcher may be replacing the record right now.
	pub fn is_alive(&self, window: Duration) -> Result<Liveness, StateError> {
		let deadline = Instant::now() + window;
		loop {
			match self.probe() {
				Err(e @ StateError::Io { .. }) if Instant::now() < deadline => {
					tracing::debug!("liveness probe failed, retrying: {}", e);
					std::thread::sleep(POLL_INTERVAL);
				}
				other => return other,
			}
		}
	}

	/// Takes ownership of the service directory. Exactly one of several
	/// concurrent callers gets [`Claim::Exclusive`]; the others wait up to
	/// `wait` for the winner's record to show up and then defer to it.
	pub fn claim(&self, wait: Duration) -> Result<Claim, StateError> {
		let state_dir = self.paths.state_dir();
		loop {
			match DirBuilder::new().mode(0o700).create(&state_dir) {
				Ok(()) => return Ok(Claim::Exclusive),
				Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
				Err(e) => return Err(StateError::io("create", state_dir, e)),
			}

			match self.contest(wait)? {
				Contest::Defer(pid) => return Ok(Claim::Contested { pid }),
				Contest::TookOver => return Ok(Claim::Exclusive),
				Contest::Retry => continue,
			}
		}
	}

	/// Atomically replaces the record: readers see the old record or the new
	/// one, never a partial write.
	pub fn commit(&self, pid: u32, token: &LaunchToken) -> Result<(), StateError> {
		let state_dir = self.paths.state_dir();
		DirBuilder::new()
			.recursive(true)
			.mode(0o700)
			.create(&state_dir)
			.map_err(|e| StateError::io("create", &state_dir, e))?;

		let record = PidRecord {
			pid,
			token: token.clone(),
		};
		let tmp = state_dir.join(format!("pid.tmp.{}", pid));
		let mut file = OpenOptions::new()
			.write(true)
			.create(true)
			.truncate(true)
			.mode(0o600)
			.open(&tmp)
			.map_err(|e| StateError::io("create", &tmp, e))?;
		file.write_all(record.render().as_bytes())
			.and_then(|_| file.sync_all())
			.map_err(|e| StateError::io("write", &tmp, e))?;
		drop(file);

		let pid_path = self.paths.pid_path();
		fs::rename(&tmp, &pid_path).map_err(|e| StateError::io("rename", &pid_path, e))?;
		tracing::debug!("committed pid record {} {}", pid, token);
		Ok(())
	}

	/// Forgets the launch token for this process; it is no longer a bootstrap
	/// continuation and nothing it spawns should look like one.
	pub fn clear(&self) {
		LaunchState::clear_env();
	}

	fn inspect(&self) -> Result<(Option<PidRecord>, Liveness), StateError> {
		let Some(record) = self.read_record()? else {
			return Ok((None, Liveness::Absent));
		};
		let liveness = match live_token(record.pid)? {
			Some(token) if token == record.token.as_str() => Liveness::Alive { pid: record.pid },
			_ => Liveness::Stale { pid: record.pid },
		};
		Ok((Some(record), liveness))
	}

	fn contest(&self, wait: Duration) -> Result<Contest, StateError> {
		let deadline = Instant::now() + wait;
		loop {
			match self.inspect() {
				Ok((_, Liveness::Alive { pid })) => return Ok(Contest::Defer(pid)),
				Ok((Some(record), Liveness::Stale { pid })) => {
					if self.take_over_stale(&record)? {
						tracing::debug!("took over stale record of pid {}", pid);
						return Ok(Contest::TookOver);
					}
				}
				Ok(_) if Instant::now() >= deadline => {
					tracing::debug!("no supervisor appeared within {:?}, taking over", wait);
					let state_dir = self.paths.state_dir();
					match fs::remove_dir_all(&state_dir) {
						Ok(()) => {}
						Err(e) if e.kind() == io::ErrorKind::NotFound => {}
						Err(e) => return Err(StateError::io("remove", state_dir, e)),
					}
					return Ok(Contest::Retry);
				}
				Ok(_) => {}
				Err(e @ StateError::Io { .. }) if Instant::now() < deadline => {
					tracing::debug!("liveness probe failed, retrying: {}", e);
				}
				Err(e) => return Err(e),
			}
			std::thread::sleep(POLL_INTERVAL);
		}
	}

	/// Moves a stale record out of the way. Returns `false` if another
	/// contender got there first.
	fn take_over_stale(&self, seen: &PidRecord) -> Result<bool, StateError> {
		let pid_path = self.paths.pid_path();
		let aside = self
			.paths
			.state_dir()
			.join(format!("pid.stale.{}", std::process::id()));

		match fs::rename(&pid_path, &aside) {
			Ok(()) => {}
			Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
			Err(e) => return Err(StateError::io("rename", &pid_path, e)),
		}

		let moved = fs::read_to_string(&aside)
			.ok()
			.and_then(|content| PidRecord::parse(&aside, &content).ok().flatten());
		if moved.as_ref() == Some(seen) {
			let _ = fs::remove_file(&aside);
			return Ok(true);
		}

		// A fresh commit landed between the read and the rename. Put it back
		// unless an even newer one already took its place.
		let _ = fs::hard_link(&aside, &pid_path);
		let _ = fs::remove_file(&aside);
		Ok(false)
	}
}

/// Token the process `pid` was launched with, read from its environment
/// block. `None` if the process is gone, carries no token, or is not ours to
/// inspect (in which case it is not ours to signal either).
fn live_token(pid: u32) -> Result<Option<String>, StateError> {
	let path = format!("/proc/{}/environ", pid);
	let data = match fs::read(&path) {
		Ok(data) => data,
		Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
		Err(e) if e.kind() == io::ErrorKind::PermissionDenied => return Ok(None),
		Err(e) if e.raw_os_error() == Some(nix::libc::ESRCH) => return Ok(None),
		Err(e) => return Err(StateError::io("read", path, e)),
	};
	Ok(token_from_environ(&data))
}

fn token_from_environ(data: &[u8]) -> Option<String> {
	let prefix = format!("{}=", STATE_ENV_KEY);
	data.split(|b| *b == 0)
		.filter_map(|entry| std::str::from_utf8(entry).ok())
		.find_map(|entry| entry.strip_prefix(prefix.as_str()))
		.map(|value| token::token_of(value).to_string())
}
