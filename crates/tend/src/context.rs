use std::sync::Arc;

use detach::ServicePaths;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

use crate::config::Tunables;

/// Requests that drive the supervision loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
	Stop,
	Restart,
}

/// Pending control requests beyond this are dropped; the loop only ever acts
/// on the next one.
const CONTROL_CAPACITY: usize = 2;

/// Cheap, cloneable way to poke a running supervisor from inside the process.
#[derive(Clone)]
pub struct ControlHandle {
	tx: mpsc::Sender<Control>,
	stdout_reopen: Arc<Notify>,
	stderr_reopen: Arc<Notify>,
}

impl ControlHandle {
	/// Queues a request without waiting. Returns `false` if it was dropped.
	pub fn request(&self, control: Control) -> bool {
		match self.tx.try_send(control) {
			Ok(()) => true,
			Err(e) => {
				tracing::debug!("dropping {:?} request: {}", control, e);
				false
			}
		}
	}

	/// Asks both log forwarders to reopen their files. Requests made before
	/// a forwarder gets to the previous one collapse into a single reopen.
	pub fn reopen(&self) {
		self.stdout_reopen.notify_one();
		self.stderr_reopen.notify_one();
	}

	pub(crate) fn stdout_reopen(&self) -> Arc<Notify> {
		Arc::clone(&self.stdout_reopen)
	}

	pub(crate) fn stderr_reopen(&self) -> Arc<Notify> {
		Arc::clone(&self.stderr_reopen)
	}
}

/// Everything the supervisor's tasks share, built once per process.
pub struct SupervisorContext {
	pub paths: ServicePaths,
	pub tunables: Tunables,
	/// Cancelled when the supervision loop has finished; long-lived helper
	/// tasks (the signal listener) watch it.
	pub shutdown: CancellationToken,
	handle: ControlHandle,
	control: mpsc::Receiver<Control>,
}

impl SupervisorContext {
	pub fn new(paths: ServicePaths, tunables: Tunables) -> Self {
		let (tx, control) = mpsc::channel(CONTROL_CAPACITY);
		Self {
			paths,
			tunables,
			shutdown: CancellationToken::new(),
			handle: ControlHandle {
				tx,
				stdout_reopen: Arc::new(Notify::new()),
				stderr_reopen: Arc::new(Notify::new()),
			},
			control,
		}
	}

	pub fn handle(&self) -> ControlHandle {
		self.handle.clone()
	}

	pub(crate) fn into_parts(self) -> (ServicePaths, Tunables, CancellationToken, ControlHandle, mpsc::Receiver<Control>) {
		(self.paths, self.tunables, self.shutdown, self.handle, self.control)
	}
}
