use std::io;

use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::context::{Control, ControlHandle};

/// Installs the supervisor's signal handlers and forwards what arrives:
///
/// | signal           | effect            |
/// |------------------|-------------------|
/// | SIGTERM, SIGINT  | [`Control::Stop`]   |
/// | SIGUSR1          | [`Control::Restart`] |
/// | SIGUSR2          | reopen log files  |
///
/// Handlers are in place when this returns, so the default disposition can no
/// longer kill the process. The task ends when `shutdown` is cancelled.
pub fn listen(handle: ControlHandle, shutdown: CancellationToken) -> io::Result<JoinHandle<()>> {
	let mut term = signal(SignalKind::terminate())?;
	let mut int = signal(SignalKind::interrupt())?;
	let mut usr1 = signal(SignalKind::user_defined1())?;
	let mut usr2 = signal(SignalKind::user_defined2())?;

	Ok(tokio::spawn(async move {
		loop {
			tokio::select! {
				_ = shutdown.cancelled() => return,
				Some(()) = term.recv() => {
					tracing::debug!("received SIGTERM");
					handle.request(Control::Stop);
				}
				Some(()) = int.recv() => {
					tracing::debug!("received SIGINT");
					handle.request(Control::Stop);
				}
				Some(()) = usr1.recv() => {
					tracing::debug!("received SIGUSR1");
					handle.request(Control::Restart);
				}
				Some(()) = usr2.recv() => {
					tracing::info!("reopen is requested");
					handle.reopen();
				}
			}
		}
	}))
}
