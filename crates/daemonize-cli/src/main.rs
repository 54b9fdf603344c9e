mod logging;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{CommandFactory, FromArgMatches, Parser};
use detach::{
	AckPipe, Bootstrap, BootstrapError, BootstrapPhase, Claim, ControlSignal, LaunchState, Liveness,
	LivenessStore, Resumed, ServiceCommand, ServicePaths,
};
use owo_colors::OwoColorize;
use tend::{signals, Supervisor, SupervisorContext, Tunables};

/// Blocking log writes still in flight when the supervisor is done get this
/// long before the runtime is torn down.
const RUNTIME_SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Parser)]
#[command(name = "daemonize", version, about = "Keep a service directory's `run` executable alive in the background")]
struct Cli {
	/// Service directory containing the `run` executable
	service_dir: PathBuf,

	#[command(subcommand)]
	command: ServiceCommand,
}

fn main() {
	let usage = format!("daemonize <SERVICE_DIR> <{}>", ServiceCommand::usage());
	let cli = Cli::command()
		.override_usage(usage)
		.try_get_matches()
		.and_then(|matches| Cli::from_arg_matches(&matches))
		.unwrap_or_else(|e| usage_error(e));

	let result = match LaunchState::from_env() {
		Ok(Some(state)) => resume(&cli, &state),
		Ok(None) => operate(&cli),
		Err(e) => Err(e.into()),
	};

	if let Err(e) = result {
		eprintln!("{} {:#}", "error:".red().bold(), e);
		std::process::exit(1);
	}
}

/// `--help` and `--version` exit 0; every other parse failure exits 1.
fn usage_error(e: clap::Error) -> ! {
	if !e.use_stderr() {
		e.exit();
	}
	let _ = e.print();
	std::process::exit(1)
}

fn open(cli: &Cli) -> anyhow::Result<(LivenessStore, Tunables)> {
	let paths = ServicePaths::new(&cli.service_dir)
		.with_context(|| format!("failed to resolve service dir '{}'", cli.service_dir.display()))?;
	let tunables = tend::load_tunables(&paths.config_path());
	Ok((LivenessStore::new(paths), tunables))
}

// ── Re-executed bootstrap phases ────────────────────────────────────────────

fn resume(cli: &Cli, state: &LaunchState) -> anyhow::Result<()> {
	let (store, tunables) = open(cli)?;
	if state.phase == BootstrapPhase::Commit {
		logging::init_supervisor(tunables.level());
	} else {
		logging::init_operator();
	}

	let paths = store.paths().clone();
	let bootstrap = Bootstrap::new(store, tunables.ack_timeout());
	match bootstrap.resume(state)? {
		Resumed::Exit => Ok(()),
		Resumed::Supervise(ack) => {
			let code = supervise(paths, tunables, ack)?;
			std::process::exit(code)
		}
	}
}

fn supervise(paths: ServicePaths, tunables: Tunables, ack: AckPipe) -> anyhow::Result<i32> {
	let rt = tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()
		.context("failed to build runtime")?;

	let ctx = SupervisorContext::new(paths, tunables);
	let result = rt.block_on(async {
		signals::listen(ctx.handle(), ctx.shutdown.clone()).context("failed to install signal handlers")?;
		ack.acknowledge()?;
		let code = Supervisor::new(ctx).run().await?;
		Ok::<_, anyhow::Error>(code)
	});

	rt.shutdown_timeout(RUNTIME_SHUTDOWN_GRACE);
	result
}

// ── Operator commands ───────────────────────────────────────────────────────

fn operate(cli: &Cli) -> anyhow::Result<()> {
	logging::init_operator();
	let (store, tunables) = open(cli)?;

	match cli.command {
		ServiceCommand::Start => start(store, &tunables),
		ServiceCommand::Stop => send(&store, &tunables, ControlSignal::Stop).map(drop),
		ServiceCommand::Restart => {
			if !send(&store, &tunables, ControlSignal::Restart)? {
				eprintln!("not running, starting instead");
				start(store, &tunables)?;
			}
			Ok(())
		}
		ServiceCommand::Reopen => send(&store, &tunables, ControlSignal::Reopen).map(drop),
		ServiceCommand::Status => {
			let liveness = store.is_alive(tunables.claim_wait())?;
			println!("{}", if liveness.is_alive() { "running" } else { "stopped" });
			Ok(())
		}
		ServiceCommand::Pid => {
			if let Liveness::Alive { pid } = store.is_alive(tunables.claim_wait())? {
				println!("{}", pid);
			}
			Ok(())
		}
	}
}

fn start(store: LivenessStore, tunables: &Tunables) -> anyhow::Result<()> {
	match store.claim(tunables.claim_wait())? {
		Claim::Contested { pid } => {
			tracing::debug!("supervisor already running (pid {})", pid);
			Ok(())
		}
		Claim::Exclusive => match Bootstrap::new(store, tunables.ack_timeout()).request() {
			Ok(()) => Ok(()),
			Err(BootstrapError::NoAck { diagnostics }) => {
				eprint!("{}", diagnostics);
				anyhow::bail!("failed to start supervisor")
			}
			Err(e) => Err(e).context("failed to start supervisor"),
		},
	}
}

/// Delivers `signal` to the live supervisor. `false` when there is none.
fn send(store: &LivenessStore, tunables: &Tunables, signal: ControlSignal) -> anyhow::Result<bool> {
	let Liveness::Alive { pid } = store.is_alive(tunables.claim_wait())? else {
		return Ok(false);
	};
	signal
		.send(pid)
		.with_context(|| format!("failed to send {} to supervisor {}", signal.signal(), pid))
}
