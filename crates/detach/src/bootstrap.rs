//! Double-fork by re-execution.
//!
//! ```text
//! phase 0 (operator)  ──setsid──▶ phase 1 (session leader) ──setpgid──▶ phase 2 (supervisor)
//!        ▲                                                                  │
//!        └──────────────────────── "ok" on fd 3 ◀───────────────────────────┘
//! ```
//!
//! Each hop re-executes the current binary with the same arguments; the phase
//! travels in [`STATE_ENV_KEY`]. A multi-threaded runtime cannot `fork()`
//! safely, hence the re-exec.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;

use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::unistd::{dup2, pipe2, setsid};
use tokio::io::AsyncReadExt;

use crate::error::BootstrapError;
use crate::liveness::LivenessStore;
use crate::token::{BootstrapPhase, LaunchState, LaunchToken, STATE_ENV_KEY};

const ACK: &[u8] = b"ok";
const ACK_FD: RawFd = 3;

/// What a resumed bootstrap process should do next.
#[derive(Debug)]
pub enum Resumed {
	/// Phase 1 is done; exit with status 0.
	Exit,
	/// Phase 2: this process is the supervisor. Acknowledge once ready.
	Supervise(AckPipe),
}

/// Write end of the acknowledgement pipe, held by the final supervisor.
#[derive(Debug)]
pub struct AckPipe {
	file: File,
}

impl AckPipe {
	/// Tells the waiting operator that startup succeeded. Consumes and closes
	/// the pipe.
	pub fn acknowledge(mut self) -> Result<(), BootstrapError> {
		self.file
			.write_all(ACK)
			.map_err(|e| BootstrapError::io("write acknowledgement", e))
	}
}

pub struct Bootstrap {
	store: LivenessStore,
	ack_timeout: Duration,
}

impl Bootstrap {
	pub fn new(store: LivenessStore, ack_timeout: Duration) -> Self {
		Self { store, ack_timeout }
	}

	/// Phase 0. Runs in the operator's invocation after a successful claim and
	/// returns once the detached supervisor has acknowledged.
	pub fn request(&self) -> Result<(), BootstrapError> {
		let next = LaunchState {
			token: LaunchToken::generate(),
			phase: BootstrapPhase::Detach,
		};
		tracing::debug!("bootstrapping supervisor, launch {}", next.token);

		let (read_end, write_end) = pipe2(OFlag::O_CLOEXEC).map_err(|source| BootstrapError::Errno {
			action: "create acknowledgement pipe",
			source,
		})?;

		let mut cmd = reexec_command();
		cmd.env(STATE_ENV_KEY, next.to_string());
		let write_fd = write_end.as_raw_fd();
		// SAFETY: only async-signal-safe calls between fork and exec.
		unsafe {
			cmd.pre_exec(move || {
				setsid()?;
				pass_ack_fd(write_fd)
			});
		}

		let mut child = cmd
			.spawn()
			.map_err(|e| BootstrapError::io("spawn session leader", e))?;
		drop(write_end);

		let status = child
			.wait()
			.map_err(|e| BootstrapError::io("wait for session leader", e))?;
		tracing::debug!("session leader exited: {}", status);

		let ack = read_ack(read_end, self.ack_timeout)
			.map_err(|e| BootstrapError::io("read acknowledgement", e))?;
		if ack == ACK {
			return Ok(());
		}

		let diagnostics = fs::read_to_string(self.store.paths().diag_log_path()).unwrap_or_default();
		Err(BootstrapError::NoAck { diagnostics })
	}

	/// Continues a bootstrap in a re-executed process (phase 1 or 2).
	///
	/// Must run before any other thread is started: phase 2 edits the process
	/// environment.
	pub fn resume(&self, state: &LaunchState) -> Result<Resumed, BootstrapError> {
		match state.phase {
			BootstrapPhase::Request => {
				panic!("bootstrap resumed in the request phase ({})", state)
			}
			BootstrapPhase::Detach => {
				self.detach(state)?;
				Ok(Resumed::Exit)
			}
			BootstrapPhase::Commit => self.commit(state).map(Resumed::Supervise),
		}
	}

	/// Phase 1: drop the operator's stdio and hop into a fresh process group
	/// so the supervisor is not a session leader.
	fn detach(&self, state: &LaunchState) -> Result<(), BootstrapError> {
		let Some(next) = state.advance() else {
			panic!("detach phase has no successor ({})", state)
		};

		let diag_path = self.store.paths().diag_log_path();
		let diag = OpenOptions::new()
			.write(true)
			.create(true)
			.truncate(true)
			.mode(0o600)
			.open(&diag_path)
			.map_err(|e| BootstrapError::io("open diagnostic log", e))?;
		let diag_err = diag
			.try_clone()
			.map_err(|e| BootstrapError::io("duplicate diagnostic log", e))?;

		// fd 3 is inherited as is: it has no close-on-exec flag here.
		reexec_command()
			.env(STATE_ENV_KEY, next.to_string())
			.stdin(Stdio::null())
			.stdout(diag)
			.stderr(diag_err)
			.process_group(0)
			.spawn()
			.map_err(|e| BootstrapError::io("spawn supervisor", e))?;
		Ok(())
	}

	/// Phase 2: publish the pid record, then forget the launch token.
	fn commit(&self, state: &LaunchState) -> Result<AckPipe, BootstrapError> {
		fcntl(ACK_FD, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).map_err(|source| BootstrapError::Errno {
			action: "inherit acknowledgement pipe",
			source,
		})?;
		// SAFETY: fd 3 was placed by phase 0 for exactly this purpose and was
		// just checked to be open; nothing else in this process owns it.
		let file = unsafe { File::from_raw_fd(ACK_FD) };

		self.store.commit(std::process::id(), &state.token)?;
		self.store.clear();
		Ok(AckPipe { file })
	}
}

/// Same binary, same arguments.
fn reexec_command() -> Command {
	let mut args = std::env::args_os();
	let arg0 = args.next();
	let mut cmd = Command::new(current_binary());
	if let Some(arg0) = arg0 {
		cmd.arg0(arg0);
	}
	cmd.args(args);
	cmd
}

fn current_binary() -> PathBuf {
	if cfg!(target_os = "linux") {
		return PathBuf::from("/proc/self/exe");
	}
	std::env::current_exe().unwrap_or_else(|_| PathBuf::from("daemonize"))
}

/// Child side of phase 0: make the pipe's write end available as fd 3.
fn pass_ack_fd(fd: RawFd) -> io::Result<()> {
	if fd == ACK_FD {
		fcntl(fd, FcntlArg::F_SETFD(FdFlag::empty()))?;
	} else {
		dup2(fd, ACK_FD)?;
	}
	Ok(())
}

fn read_ack(read_end: OwnedFd, timeout: Duration) -> io::Result<Vec<u8>> {
	let rt = tokio::runtime::Builder::new_current_thread()
		.enable_all()
		.build()?;
	rt.block_on(async move {
		let rx = tokio::net::unix::pipe::Receiver::from_owned_fd(read_end)?;
		let mut buf = Vec::with_capacity(ACK.len());
		let mut limited = rx.take(8);
		match tokio::time::timeout(timeout, limited.read_to_end(&mut buf)).await {
			Ok(result) => {
				result?;
			}
			Err(_) => tracing::debug!("no acknowledgement within {:?}", timeout),
		}
		Ok(buf)
	})
}
