/// Operator commands, one per short-lived invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "clap", derive(clap::Subcommand))]
pub enum ServiceCommand {
	/// Start the supervisor unless one is already running
	Start,
	/// Stop the supervisor and its process
	Stop,
	/// Restart the supervised process, or start if not running
	Restart,
	/// Reopen the log files (after external rotation)
	Reopen,
	/// Print "running" or "stopped"
	Status,
	/// Print the supervisor pid, or nothing
	Pid,
}

impl ServiceCommand {
	pub const ALL: [ServiceCommand; 6] = [
		ServiceCommand::Pid,
		ServiceCommand::Reopen,
		ServiceCommand::Restart,
		ServiceCommand::Start,
		ServiceCommand::Status,
		ServiceCommand::Stop,
	];

	pub fn name(self) -> &'static str {
		match self {
			ServiceCommand::Start => "start",
			ServiceCommand::Stop => "stop",
			ServiceCommand::Restart => "restart",
			ServiceCommand::Reopen => "reopen",
			ServiceCommand::Status => "status",
			ServiceCommand::Pid => "pid",
		}
	}

	/// `pid|reopen|restart|start|status|stop`, for usage lines.
	pub fn usage() -> String {
		Self::ALL.iter().map(|c| c.name()).collect::<Vec<_>>().join("|")
	}
}
