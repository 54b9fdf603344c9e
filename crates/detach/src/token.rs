use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::StateError;

/// Environment key carrying [`LaunchState`] across the bootstrap re-execs.
///
/// Removed before the supervised child is spawned, so it cannot collide with
/// anything the child sets for itself.
pub const STATE_ENV_KEY: &str = "DAEMONIZE_STATE";

/// Identifies one launch attempt. Two processes reporting the same pid are
/// the same supervisor only if their tokens match.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LaunchToken(String);

impl LaunchToken {
	pub fn generate() -> Self {
		let nanos = SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.map(|d| d.as_nanos())
			.unwrap_or_default();
		LaunchToken(format!("{}.{}", nanos, std::process::id()))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for LaunchToken {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for LaunchToken {
	type Err = StateError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		if s.is_empty() || s.contains(['/', ' ', '\n', '\0']) {
			return Err(StateError::MalformedLaunchState {
				value: s.to_string(),
				reason: "invalid token",
			});
		}
		Ok(LaunchToken(s.to_string()))
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BootstrapPhase {
	/// The operator's invocation; waits for the acknowledgement.
	Request = 0,
	/// Session leader; redirects stdio and hops once more.
	Detach = 1,
	/// The final supervisor.
	Commit = 2,
}

impl BootstrapPhase {
	pub fn next(self) -> Option<Self> {
		match self {
			BootstrapPhase::Request => Some(BootstrapPhase::Detach),
			BootstrapPhase::Detach => Some(BootstrapPhase::Commit),
			BootstrapPhase::Commit => None,
		}
	}
}

impl TryFrom<u8> for BootstrapPhase {
	type Error = u8;

	fn try_from(value: u8) -> Result<Self, Self::Error> {
		match value {
			0 => Ok(BootstrapPhase::Request),
			1 => Ok(BootstrapPhase::Detach),
			2 => Ok(BootstrapPhase::Commit),
			other => Err(other),
		}
	}
}

/// `{token}/{phase}`, as stored under [`STATE_ENV_KEY`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchState {
	pub token: LaunchToken,
	pub phase: BootstrapPhase,
}

impl LaunchState {
	pub fn new(token: LaunchToken) -> Self {
		Self {
			token,
			phase: BootstrapPhase::Request,
		}
	}

	/// Reads the state of the current process. `Ok(None)` means this is not a
	/// bootstrap continuation.
	pub fn from_env() -> Result<Option<Self>, StateError> {
		match std::env::var(STATE_ENV_KEY) {
			Ok(value) if !value.is_empty() => value.parse().map(Some),
			Ok(_) => Ok(None),
			Err(std::env::VarError::NotPresent) => Ok(None),
			Err(std::env::VarError::NotUnicode(raw)) => Err(StateError::MalformedLaunchState {
				value: raw.to_string_lossy().into_owned(),
				reason: "not unicode",
			}),
		}
	}

	/// The state handed to the next re-exec, or `None` past the last phase.
	pub fn advance(&self) -> Option<Self> {
		self.phase.next().map(|phase| Self {
			token: self.token.clone(),
			phase,
		})
	}

	/// Drops the key from this process's environment so nothing spawned later
	/// inherits it. The kernel's copy in `/proc/<pid>/environ` keeps the
	/// launch-time value, which is what liveness checks read.
	pub fn clear_env() {
		std::env::remove_var(STATE_ENV_KEY);
	}
}

impl fmt::Display for LaunchState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}/{}", self.token, self.phase as u8)
	}
}

impl FromStr for LaunchState {
	type Err = StateError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let malformed = |reason| StateError::MalformedLaunchState {
			value: s.to_string(),
			reason,
		};
		let (token, phase) = s.rsplit_once('/').ok_or_else(|| malformed("missing phase"))?;
		let phase: u8 = phase.parse().map_err(|_| malformed("phase is not a number"))?;
		let phase = BootstrapPhase::try_from(phase).map_err(|_| malformed("unknown phase"))?;
		Ok(Self {
			token: token.parse()?,
			phase,
		})
	}
}

/// Token part of a raw `DAEMONIZE_STATE` value, without validating the phase.
pub(crate) fn token_of(value: &str) -> &str {
	value.split('/').next().unwrap_or_default()
}
