use std::os::fd::OwnedFd;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use detach::{ServicePaths, STATE_ENV_KEY};
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Tunables;
use crate::context::{Control, ControlHandle, SupervisorContext};
use crate::error::ForwardError;
use crate::forwarder::{log_pipe, ForwardReport, Forwarder};

const GROUP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Delay before the next start after a failed run: whatever is left of the
/// restart window, but never less than `floor`.
pub fn restart_delay(uptime: Duration, window: Duration, floor: Duration) -> Duration {
	window.saturating_sub(uptime).max(floor)
}

/// How a single run of the child ended.
enum RunOutcome {
	Exited(ExitStatus),
	WaitFailed(std::io::Error),
	Terminated(Control),
}

/// Keeps one instance of `D/run` alive.
///
/// ```text
/// Starting ──▶ Running ──exit 0──────────────────────────▶ Exited
///    ▲            │ exit ≠ 0 / signal                          ▲
///    │            ▼                                            │
///    ├────── RestartBackoff ──stop─────────────────────────────┤
///    │            ▲                                            │
///    │            └─(spawn failed)                             │
///    └──restart── Terminating ◀──stop/restart── Running ──stop─┘
/// ```
pub struct Supervisor {
	paths: ServicePaths,
	tunables: Tunables,
	shutdown: CancellationToken,
	handle: ControlHandle,
	control: mpsc::Receiver<Control>,
}

impl Supervisor {
	pub fn new(ctx: SupervisorContext) -> Self {
		let (paths, tunables, shutdown, handle, control) = ctx.into_parts();
		Self {
			paths,
			tunables,
			shutdown,
			handle,
			control,
		}
	}

	/// Runs until the child exits cleanly or a stop is requested, then
	/// drains the log forwarders. Returns the exit status for the process.
	pub async fn run(mut self) -> Result<i32, ForwardError> {
		tracing::info!("supervisor started for service dir '{}'", self.paths.root().display());

		let (out_reader, out_writer) = log_pipe()?;
		let (err_reader, err_writer) = log_pipe()?;
		let drain = CancellationToken::new();
		let stdout_task = tokio::spawn(
			Forwarder::new(self.paths.stdout_log_path(), out_reader, &self.tunables)
				.run(self.handle.stdout_reopen(), drain.clone()),
		);
		let stderr_task = tokio::spawn(
			Forwarder::new(self.paths.stderr_log_path(), err_reader, &self.tunables)
				.run(self.handle.stderr_reopen(), drain.clone()),
		);

		let code = self.supervise(&out_writer, &err_writer).await;

		self.shutdown.cancel();
		drop(out_writer);
		drop(err_writer);
		drain_forwarders(stdout_task, stderr_task, drain).await;

		tracing::info!("supervisor exited");
		Ok(code)
	}

	async fn supervise(&mut self, stdout: &OwnedFd, stderr: &OwnedFd) -> i32 {
		loop {
			tracing::info!("starting {}", self.paths.run_path().display());
			let started = Instant::now();

			let failure = match self.spawn(stdout, stderr) {
				Ok(child) => match self.running(child).await {
					RunOutcome::Exited(status) if status.success() => {
						tracing::info!("the process exited successfully");
						return 0;
					}
					RunOutcome::Exited(status) => describe(status),
					RunOutcome::WaitFailed(e) => format!("failed to wait for the process ({})", e),
					RunOutcome::Terminated(Control::Stop) => return 0,
					RunOutcome::Terminated(Control::Restart) => continue,
				},
				Err(e) => format!(
					"failed to execute '{}' ({})",
					self.paths.run_path().display(),
					e
				),
			};

			let delay = restart_delay(
				started.elapsed(),
				self.tunables.restart_window(),
				self.tunables.min_backoff(),
			);
			tracing::info!("{}, restarting in {:?}", failure, delay);

			tokio::select! {
				_ = tokio::time::sleep(delay) => {}
				control = self.next_control() => match control {
					Control::Stop => {
						tracing::info!("exit is requested while in restart back-off");
						return 0;
					}
					Control::Restart => {
						tracing::info!("restart is requested while in restart back-off");
					}
				}
			}
		}
	}

	fn spawn(&self, stdout: &OwnedFd, stderr: &OwnedFd) -> std::io::Result<Child> {
		Command::new(self.paths.run_path())
			.current_dir(self.paths.root())
			.env_remove(STATE_ENV_KEY)
			.stdin(Stdio::null())
			.stdout(Stdio::from(stdout.try_clone()?))
			.stderr(Stdio::from(stderr.try_clone()?))
			.process_group(0)
			.spawn()
	}

	async fn running(&mut self, mut child: Child) -> RunOutcome {
		tokio::select! {
			status = child.wait() => match status {
				Ok(status) => RunOutcome::Exited(status),
				Err(e) => RunOutcome::WaitFailed(e),
			},
			control = self.next_control() => {
				match control {
					Control::Stop => tracing::info!("exit is requested, sending termination signal to the process"),
					Control::Restart => tracing::info!("restart is requested, sending termination signal to the process"),
				}
				self.terminate(&mut child).await;
				RunOutcome::Terminated(control)
			}
		}
	}

	/// SIGTERM to the whole process group, then SIGKILL if the child, or
	/// anything left in its group, is still around after the stop timeout.
	async fn terminate(&self, child: &mut Child) {
		let Some(pid) = child.id() else {
			return;
		};
		let group = Pid::from_raw(pid as i32);
		signal_group(group, Signal::SIGTERM);

		let timeout = self.tunables.stop_timeout();
		let deadline = tokio::time::Instant::now() + timeout;
		match tokio::time::timeout_at(deadline, child.wait()).await {
			Ok(Ok(status)) => tracing::info!("the process exited within {:?} ({})", timeout, describe(status)),
			Ok(Err(e)) => tracing::warn!("failed to wait for the process ({})", e),
			Err(_) => {
				tracing::warn!("the process did not exit within {:?}, force killing process group {}", timeout, group);
				signal_group(group, Signal::SIGKILL);
				if let Err(e) = child.wait().await {
					tracing::warn!("failed to wait for the process ({})", e);
				}
				return;
			}
		}

		// descendants of the reaped leader get the rest of the window
		if !group_emptied(group, deadline).await {
			tracing::warn!("process group {} outlived its leader by {:?}, force killing", group, timeout);
			signal_group(group, Signal::SIGKILL);
		}
	}

	async fn next_control(&mut self) -> Control {
		match self.control.recv().await {
			Some(control) => control,
			// the loop holds a sender itself, so this never resolves
			None => std::future::pending().await,
		}
	}
}

/// Lets both forwarders run to end-of-stream. Each gives up on its own once
/// the flush timeout has passed since `drain` was cancelled.
async fn drain_forwarders(
	stdout_task: JoinHandle<Result<ForwardReport, ForwardError>>,
	stderr_task: JoinHandle<Result<ForwardReport, ForwardError>>,
	drain: CancellationToken,
) {
	drain.cancel();
	let (stdout, stderr) = tokio::join!(stdout_task, stderr_task);

	for (name, result) in [("stdout", stdout), ("stderr", stderr)] {
		match result {
			Ok(Ok(report)) => tracing::debug!("{} forwarder finished: {:?}", name, report),
			Ok(Err(e)) => tracing::error!("{} forwarder failed: {}", name, e),
			Err(e) => tracing::error!("{} forwarder panicked: {}", name, e),
		}
	}
}

/// Polls until no process is left in `group` or `deadline` passes.
async fn group_emptied(group: Pid, deadline: tokio::time::Instant) -> bool {
	loop {
		match killpg(group, None::<Signal>) {
			Err(Errno::ESRCH) => return true,
			_ if tokio::time::Instant::now() >= deadline => return false,
			_ => tokio::time::sleep(GROUP_POLL_INTERVAL).await,
		}
	}
}

fn signal_group(group: Pid, signal: Signal) {
	match killpg(group, signal) {
		Ok(()) | Err(Errno::ESRCH) => {}
		Err(e) => tracing::warn!("failed to send {} to process group {} ({})", signal, group, e),
	}
}

fn describe(status: ExitStatus) -> String {
	if let Some(code) = status.code() {
		return format!("the process exited with status code {}", code);
	}
	match status.signal() {
		Some(sig) => {
			let name = Signal::try_from(sig).map(Signal::as_str).unwrap_or("unknown");
			format!("the process was killed by signal {} ({})", sig, name)
		}
		None => format!("the process exited ({})", status),
	}
}
