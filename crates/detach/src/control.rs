use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

/// Requests an operator can deliver to a running supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
	Stop,
	Restart,
	Reopen,
}

impl ControlSignal {
	pub fn signal(self) -> Signal {
		match self {
			ControlSignal::Stop => Signal::SIGTERM,
			ControlSignal::Restart => Signal::SIGUSR1,
			ControlSignal::Reopen => Signal::SIGUSR2,
		}
	}

	/// Delivers the request to `pid`. `Ok(false)` if the process vanished
	/// between the liveness check and the send.
	pub fn send(self, pid: u32) -> Result<bool, Errno> {
		let raw = i32::try_from(pid).map_err(|_| Errno::EINVAL)?;
		match kill(Pid::from_raw(raw), self.signal()) {
			Ok(()) => {
				tracing::debug!("sent {} to {}", self.signal(), pid);
				Ok(true)
			}
			Err(Errno::ESRCH) => Ok(false),
			Err(e) => Err(e),
		}
	}
}
