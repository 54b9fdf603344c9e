use std::sync::Mutex;

use tracing::Level;

/// Short-lived operator invocations: warnings and errors only, no clock.
pub fn init_operator() {
	tracing_subscriber::fmt()
		.with_writer(std::io::stderr)
		.with_max_level(Level::WARN)
		.with_target(false)
		.without_time()
		.init();
}

/// The detached supervisor. Its stderr is the diagnostic log, shared by every
/// task, so each event is written under one lock.
pub fn init_supervisor(level: Level) {
	tracing_subscriber::fmt()
		.with_writer(Mutex::new(std::io::stderr()))
		.with_max_level(level)
		.with_ansi(false)
		.with_target(false)
		.init();
}
