use std::io;
use std::path::{Path, PathBuf};

/// Filesystem layout of one service directory.
///
/// ```text
/// D/run              entry point
/// D/daemonize.toml   optional tunables
/// D/.state/pid       "<pid> <token>\n"
/// D/.state/log       supervisor diagnostic output
/// D/log/out          child stdout
/// D/log/err          child stderr
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServicePaths {
	root: PathBuf,
}

impl ServicePaths {
	/// Resolves `dir` against the current directory. The directory does not
	/// have to exist yet.
	pub fn new(dir: impl AsRef<Path>) -> io::Result<Self> {
		let dir = dir.as_ref();
		let root = if dir.is_absolute() {
			dir.to_path_buf()
		} else {
			std::env::current_dir()?.join(dir)
		};
		Ok(Self { root })
	}

	pub fn root(&self) -> &Path {
		&self.root
	}

	pub fn run_path(&self) -> PathBuf {
		self.root.join("run")
	}

	pub fn config_path(&self) -> PathBuf {
		self.root.join("daemonize.toml")
	}

	pub fn state_dir(&self) -> PathBuf {
		self.root.join(".state")
	}

	pub fn pid_path(&self) -> PathBuf {
		self.state_dir().join("pid")
	}

	pub fn diag_log_path(&self) -> PathBuf {
		self.state_dir().join("log")
	}

	pub fn log_dir(&self) -> PathBuf {
		self.root.join("log")
	}

	pub fn stdout_log_path(&self) -> PathBuf {
		self.log_dir().join("out")
	}

	pub fn stderr_log_path(&self) -> PathBuf {
		self.log_dir().join("err")
	}
}
