use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

// ── Tunables (D/daemonize.toml) ─────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Tunables {
	#[serde(default = "default_log_level")]
	pub log_level: String,
	#[serde(default)]
	pub bootstrap: BootstrapConfig,
	#[serde(default)]
	pub supervisor: SupervisorConfig,
	#[serde(default)]
	pub logs: LogsConfig,
}

impl Default for Tunables {
	fn default() -> Self {
		Self {
			log_level: default_log_level(),
			bootstrap: BootstrapConfig::default(),
			supervisor: SupervisorConfig::default(),
			logs: LogsConfig::default(),
		}
	}
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct BootstrapConfig {
	/// How long a contested `start` waits for the winner's pid record before
	/// treating the directory as abandoned.
	#[serde(default = "default_claim_wait")]
	pub claim_wait_secs: u64,
	#[serde(default = "default_ack_timeout")]
	pub ack_timeout_secs: u64,
}

impl Default for BootstrapConfig {
	fn default() -> Self {
		Self {
			claim_wait_secs: default_claim_wait(),
			ack_timeout_secs: default_ack_timeout(),
		}
	}
}

fn default_claim_wait() -> u64 { 5 }
fn default_ack_timeout() -> u64 { 5 }

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SupervisorConfig {
	#[serde(default = "default_stop_timeout")]
	pub stop_timeout_secs: u64,
	#[serde(default = "default_restart_window")]
	pub restart_window_secs: u64,
	#[serde(default = "default_min_backoff")]
	pub min_backoff_ms: u64,
}

impl Default for SupervisorConfig {
	fn default() -> Self {
		Self {
			stop_timeout_secs: default_stop_timeout(),
			restart_window_secs: default_restart_window(),
			min_backoff_ms: default_min_backoff(),
		}
	}
}

fn default_stop_timeout() -> u64 { 15 }
fn default_restart_window() -> u64 { 15 }
fn default_min_backoff() -> u64 { 100 }

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct LogsConfig {
	#[serde(default = "default_reopen_retry")]
	pub reopen_retry_secs: u64,
	#[serde(default = "default_flush_timeout")]
	pub flush_timeout_secs: u64,
}

impl Default for LogsConfig {
	fn default() -> Self {
		Self {
			reopen_retry_secs: default_reopen_retry(),
			flush_timeout_secs: default_flush_timeout(),
		}
	}
}

fn default_reopen_retry() -> u64 { 15 }
fn default_flush_timeout() -> u64 { 5 }
fn default_log_level() -> String { "info".into() }

impl Tunables {
	pub fn claim_wait(&self) -> Duration {
		Duration::from_secs(self.bootstrap.claim_wait_secs)
	}

	pub fn ack_timeout(&self) -> Duration {
		Duration::from_secs(self.bootstrap.ack_timeout_secs)
	}

	pub fn stop_timeout(&self) -> Duration {
		Duration::from_secs(self.supervisor.stop_timeout_secs)
	}

	pub fn restart_window(&self) -> Duration {
		Duration::from_secs(self.supervisor.restart_window_secs)
	}

	pub fn min_backoff(&self) -> Duration {
		Duration::from_millis(self.supervisor.min_backoff_ms)
	}

	pub fn reopen_retry(&self) -> Duration {
		Duration::from_secs(self.logs.reopen_retry_secs)
	}

	pub fn flush_timeout(&self) -> Duration {
		Duration::from_secs(self.logs.flush_timeout_secs)
	}

	pub fn level(&self) -> tracing::Level {
		self.log_level.parse().unwrap_or(tracing::Level::INFO)
	}
}

/// Loads `path` if it exists. Unreadable or invalid files fall back to the
/// defaults with a warning; the tunables never stop a service from running.
pub fn load_tunables(path: &Path) -> Tunables {
	if path.exists() {
		match std::fs::read_to_string(path) {
			Ok(content) => match toml::from_str(&content) {
				Ok(tunables) => return tunables,
				Err(e) => tracing::warn!("failed to parse {}: {}", path.display(), e),
			},
			Err(e) => tracing::warn!("failed to read {}: {}", path.display(), e),
		}
	}
	Tunables::default()
}
