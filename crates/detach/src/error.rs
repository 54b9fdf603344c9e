use std::io;
use std::path::PathBuf;

/// Errors from reading or writing the on-disk supervisor state.
///
/// Benign races (record missing, process gone) are not errors; they show up
/// as [`crate::Liveness`] and [`crate::Claim`] values instead.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
	#[error("failed to {action} {}: {source}", path.display())]
	Io {
		action: &'static str,
		path: PathBuf,
		#[source]
		source: io::Error,
	},

	#[error("malformed pid record {}: {content:?}", path.display())]
	MalformedRecord { path: PathBuf, content: String },

	#[error("malformed launch state {value:?}: {reason}")]
	MalformedLaunchState { value: String, reason: &'static str },
}

impl StateError {
	pub(crate) fn io(action: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
		StateError::Io {
			action,
			path: path.into(),
			source,
		}
	}
}

/// Errors from the double-fork bootstrap.
#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
	#[error(transparent)]
	State(#[from] StateError),

	#[error("failed to {action}: {source}")]
	Io {
		action: &'static str,
		#[source]
		source: io::Error,
	},

	#[error("{action}: {source}")]
	Errno {
		action: &'static str,
		#[source]
		source: nix::errno::Errno,
	},

	/// The detached supervisor never acknowledged. `diagnostics` holds what it
	/// managed to write to its diagnostic log.
	#[error("supervisor did not acknowledge startup")]
	NoAck { diagnostics: String },
}

impl BootstrapError {
	pub(crate) fn io(action: &'static str, source: io::Error) -> Self {
		BootstrapError::Io { action, source }
	}
}
