use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use detach::ServicePaths;
use tend::config::{LogsConfig, SupervisorConfig};
use tend::forwarder::log_pipe;
use tend::{Control, Forwarder, Supervisor, SupervisorContext, Tunables};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

fn temp_dir(name: &str) -> PathBuf {
	let n = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
	let dir = std::env::temp_dir().join(format!("tend-test-{}-{}-{}", std::process::id(), n, name));
	let _ = std::fs::remove_dir_all(&dir);
	std::fs::create_dir_all(&dir).unwrap();
	dir
}

fn fast_tunables() -> Tunables {
	Tunables {
		supervisor: SupervisorConfig {
			stop_timeout_secs: 1,
			restart_window_secs: 1,
			min_backoff_ms: 100,
		},
		logs: LogsConfig {
			reopen_retry_secs: 1,
			flush_timeout_secs: 1,
		},
		..Tunables::default()
	}
}

fn service(name: &str, script: &str) -> ServicePaths {
	let paths = ServicePaths::new(temp_dir(name)).unwrap();
	std::fs::write(paths.run_path(), format!("#!/bin/sh\n{}\n", script)).unwrap();
	std::fs::set_permissions(paths.run_path(), std::fs::Permissions::from_mode(0o755)).unwrap();
	paths
}

fn read(path: &Path) -> String {
	std::fs::read_to_string(path).unwrap_or_default()
}

async fn wait_for(path: &Path, what: impl Fn(&str) -> bool) {
	let deadline = Instant::now() + Duration::from_secs(10);
	while !what(&read(path)) {
		assert!(Instant::now() < deadline, "timed out waiting on {}: {:?}", path.display(), read(path));
		tokio::time::sleep(Duration::from_millis(50)).await;
	}
}

/// Gone, or a zombie waiting for an init that does not reap.
fn process_gone(pid: &str) -> bool {
	match std::fs::read_to_string(format!("/proc/{}/stat", pid.trim())) {
		Err(_) => true,
		Ok(stat) => stat
			.rsplit_once(')')
			.map(|(_, rest)| rest.trim_start().starts_with('Z'))
			.unwrap_or(false),
	}
}

// --- Forwarder ---

#[tokio::test]
async fn rotation_splits_output_without_losing_bytes() {
	let dir = temp_dir("rotate");
	let out = dir.join("log").join("out");
	let (reader, writer) = log_pipe().unwrap();
	let reopen = Arc::new(Notify::new());
	let task = tokio::spawn(
		Forwarder::new(&out, reader, &fast_tunables()).run(Arc::clone(&reopen), CancellationToken::new()),
	);

	let mut writer = std::fs::File::from(writer);
	let before = vec![b'a'; 10_000];
	writer.write_all(&before).unwrap();
	wait_for(&out, |s| s.len() == before.len()).await;

	let rotated = dir.join("log").join("out.1");
	std::fs::rename(&out, &rotated).unwrap();
	reopen.notify_one();

	let after = vec![b'b'; 3_000];
	writer.write_all(&after).unwrap();
	drop(writer);

	let report = task.await.unwrap().unwrap();
	assert_eq!(std::fs::read(&rotated).unwrap(), before);
	assert_eq!(std::fs::read(&out).unwrap(), after);
	assert_eq!(report.bytes_written, 13_000);
	assert_eq!(report.bytes_discarded, 0);
	assert_eq!(report.reopens, 1);
}

#[tokio::test]
async fn reopen_requests_coalesce() {
	let dir = temp_dir("coalesce");
	let out = dir.join("out");
	let (reader, writer) = log_pipe().unwrap();
	let reopen = Arc::new(Notify::new());
	for _ in 0..5 {
		reopen.notify_one();
	}
	let task = tokio::spawn(
		Forwarder::new(&out, reader, &fast_tunables()).run(Arc::clone(&reopen), CancellationToken::new()),
	);
	tokio::time::sleep(Duration::from_millis(200)).await;
	drop(writer);

	let report = task.await.unwrap().unwrap();
	assert_eq!(report.reopens, 1);
}

#[tokio::test]
async fn unopenable_destination_discards_output() {
	let dir = temp_dir("unopenable");
	std::fs::write(dir.join("log"), "not a directory").unwrap();
	let (reader, writer) = log_pipe().unwrap();
	let task = tokio::spawn(
		Forwarder::new(dir.join("log").join("out"), reader, &fast_tunables())
			.run(Arc::new(Notify::new()), CancellationToken::new()),
	);

	let mut writer = std::fs::File::from(writer);
	writer.write_all(b"lost to the void\n").unwrap();
	drop(writer);

	let report = task.await.unwrap().unwrap();
	assert_eq!(report.bytes_written, 0);
	assert_eq!(report.bytes_discarded, 17);
}

#[tokio::test]
async fn drain_lets_a_forwarder_finish_with_open_writers() {
	let dir = temp_dir("drain");
	let out = dir.join("out");
	let (reader, writer) = log_pipe().unwrap();
	let drain = CancellationToken::new();
	let task = tokio::spawn(
		Forwarder::new(&out, reader, &fast_tunables()).run(Arc::new(Notify::new()), drain.clone()),
	);

	let mut writer = std::fs::File::from(writer);
	writer.write_all(b"kept\n").unwrap();
	wait_for(&out, |s| s == "kept\n").await;

	drain.cancel();
	let report = tokio::time::timeout(Duration::from_secs(3), task).await.unwrap().unwrap().unwrap();
	assert_eq!(report.bytes_written, 5);
	assert_eq!(report.bytes_discarded, 0);
	drop(writer);
}

#[tokio::test]
async fn failed_writes_are_kept_then_reported_as_discarded() {
	let dir = temp_dir("devfull");
	let out = dir.join("out");
	std::os::unix::fs::symlink("/dev/full", &out).unwrap();
	let (reader, writer) = log_pipe().unwrap();
	let drain = CancellationToken::new();
	let task = tokio::spawn(
		Forwarder::new(&out, reader, &fast_tunables()).run(Arc::new(Notify::new()), drain.clone()),
	);

	let mut writer = std::fs::File::from(writer);
	writer.write_all(&[b'x'; 100]).unwrap();
	drop(writer);
	tokio::time::sleep(Duration::from_millis(300)).await;
	assert!(!task.is_finished(), "unwritten bytes must be retried, not dropped");

	let started = Instant::now();
	drain.cancel();
	let report = tokio::time::timeout(Duration::from_secs(3), task).await.unwrap().unwrap().unwrap();
	assert!(started.elapsed() < Duration::from_millis(1500), "drain took {:?}", started.elapsed());
	assert_eq!(report.bytes_written, 0);
	assert_eq!(report.bytes_discarded, 100);
}

// --- Supervisor ---

#[tokio::test]
async fn clean_exit_ends_supervision() {
	let paths = service("clean", "echo hello\necho oops >&2\nexit 0");
	let ctx = SupervisorContext::new(paths.clone(), fast_tunables());

	let code = tokio::time::timeout(Duration::from_secs(10), Supervisor::new(ctx).run())
		.await
		.unwrap()
		.unwrap();
	assert_eq!(code, 0);
	assert_eq!(read(&paths.stdout_log_path()), "hello\n");
	assert_eq!(read(&paths.stderr_log_path()), "oops\n");
}

#[tokio::test]
async fn child_runs_in_the_service_dir_without_launch_state() {
	let paths = service("cwd", "pwd\necho \"state=${DAEMONIZE_STATE:-unset}\"");
	let ctx = SupervisorContext::new(paths.clone(), fast_tunables());

	Supervisor::new(ctx).run().await.unwrap();
	let out = read(&paths.stdout_log_path());
	let root = paths.root().canonicalize().unwrap();
	assert_eq!(out, format!("{}\nstate=unset\n", root.display()));
}

#[tokio::test]
async fn stop_terminates_the_child() {
	let paths = service("stop", "echo ready\nexec sleep 30");
	let ctx = SupervisorContext::new(paths.clone(), fast_tunables());
	let handle = ctx.handle();
	let task = tokio::spawn(Supervisor::new(ctx).run());

	wait_for(&paths.stdout_log_path(), |s| s == "ready\n").await;
	let started = Instant::now();
	assert!(handle.request(Control::Stop));

	let code = tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap().unwrap();
	assert_eq!(code, 0);
	assert!(started.elapsed() < Duration::from_secs(1), "SIGTERM should be enough");
}

#[tokio::test]
async fn ignored_sigterm_escalates_to_sigkill() {
	let paths = service(
		"stubborn",
		"trap '' TERM\nsleep 300 &\necho $! > descendant\necho ready\nwhile true; do sleep 1; done",
	);
	let ctx = SupervisorContext::new(paths.clone(), fast_tunables());
	let handle = ctx.handle();
	let task = tokio::spawn(Supervisor::new(ctx).run());

	wait_for(&paths.stdout_log_path(), |s| s == "ready\n").await;
	let started = Instant::now();
	handle.request(Control::Stop);

	let code = tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap().unwrap();
	assert_eq!(code, 0);
	assert!(started.elapsed() >= Duration::from_secs(1));
	assert!(process_gone(&read(&paths.root().join("descendant"))));
}

#[tokio::test]
async fn descendants_outliving_the_leader_are_killed() {
	let paths = service(
		"orphans",
		"(trap '' TERM; exec sleep 300) &\necho $! > descendant\necho ready\nexec sleep 30",
	);
	let ctx = SupervisorContext::new(paths.clone(), fast_tunables());
	let handle = ctx.handle();
	let task = tokio::spawn(Supervisor::new(ctx).run());

	wait_for(&paths.stdout_log_path(), |s| s == "ready\n").await;
	let descendant = read(&paths.root().join("descendant"));
	assert!(!process_gone(&descendant));
	handle.request(Control::Stop);

	tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap().unwrap();
	assert!(process_gone(&descendant), "pid {} survived the stop", descendant.trim());
}

#[tokio::test]
async fn failing_child_is_restarted_after_backoff() {
	let paths = service("crashloop", "echo run >> runs\nexit 3");
	let ctx = SupervisorContext::new(paths.clone(), fast_tunables());
	let handle = ctx.handle();
	let task = tokio::spawn(Supervisor::new(ctx).run());

	let runs = paths.root().join("runs");
	let started = Instant::now();
	wait_for(&runs, |s| s.lines().count() >= 2).await;
	assert!(started.elapsed() >= Duration::from_millis(800), "restart ignored the window");

	handle.request(Control::Stop);
	let code = tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap().unwrap();
	assert_eq!(code, 0);
}

#[tokio::test]
async fn restart_request_cuts_the_backoff_short() {
	let mut tunables = fast_tunables();
	tunables.supervisor.restart_window_secs = 30;
	let paths = service("backoff", "echo run >> runs\nexit 1");
	let ctx = SupervisorContext::new(paths.clone(), tunables);
	let handle = ctx.handle();
	let task = tokio::spawn(Supervisor::new(ctx).run());

	let runs = paths.root().join("runs");
	wait_for(&runs, |s| s.lines().count() == 1).await;
	tokio::time::sleep(Duration::from_millis(200)).await;
	let requested = Instant::now();
	handle.request(Control::Restart);
	wait_for(&runs, |s| s.lines().count() == 2).await;
	assert!(requested.elapsed() < Duration::from_secs(5));

	handle.request(Control::Stop);
	let code = tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap().unwrap();
	assert_eq!(code, 0);
}

#[tokio::test]
async fn fifo_destination_does_not_block_shutdown() {
	let paths = service("fifo", "echo hi\nexit 0");
	std::fs::create_dir_all(paths.log_dir()).unwrap();
	nix::unistd::mkfifo(&paths.stdout_log_path(), nix::sys::stat::Mode::S_IRWXU).unwrap();
	let ctx = SupervisorContext::new(paths.clone(), fast_tunables());

	let code = tokio::time::timeout(Duration::from_secs(5), Supervisor::new(ctx).run())
		.await
		.expect("supervisor hung on a FIFO without a reader")
		.unwrap();
	assert_eq!(code, 0);
}

#[tokio::test]
async fn stop_with_an_unwritable_log_is_bounded() {
	let paths = service("full", "echo ready >&2\necho lost\nexec sleep 30");
	std::fs::create_dir_all(paths.log_dir()).unwrap();
	std::os::unix::fs::symlink("/dev/full", paths.stdout_log_path()).unwrap();
	let ctx = SupervisorContext::new(paths.clone(), fast_tunables());
	let handle = ctx.handle();
	let task = tokio::spawn(Supervisor::new(ctx).run());

	wait_for(&paths.stderr_log_path(), |s| s == "ready\n").await;
	let started = Instant::now();
	handle.request(Control::Stop);

	tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap().unwrap();
	// SIGTERM is immediate; the rest is the one-second flush window
	assert!(started.elapsed() < Duration::from_millis(2500), "stop took {:?}", started.elapsed());
}

#[tokio::test]
async fn restart_request_replaces_the_child() {
	let paths = service("restart", "echo started\nexec sleep 30");
	let ctx = SupervisorContext::new(paths.clone(), fast_tunables());
	let handle = ctx.handle();
	let task = tokio::spawn(Supervisor::new(ctx).run());

	wait_for(&paths.stdout_log_path(), |s| s == "started\n").await;
	handle.request(Control::Restart);
	wait_for(&paths.stdout_log_path(), |s| s == "started\nstarted\n").await;

	handle.request(Control::Stop);
	let code = tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap().unwrap();
	assert_eq!(code, 0);
}

#[tokio::test]
async fn missing_run_file_is_retried_until_stopped() {
	let paths = ServicePaths::new(temp_dir("norun")).unwrap();
	let ctx = SupervisorContext::new(paths.clone(), fast_tunables());
	let handle = ctx.handle();
	let task = tokio::spawn(Supervisor::new(ctx).run());

	tokio::time::sleep(Duration::from_millis(300)).await;
	assert!(!task.is_finished());
	handle.request(Control::Stop);
	let code = tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap().unwrap();
	assert_eq!(code, 0);
}

#[tokio::test]
async fn reopen_moves_output_to_a_fresh_file() {
	let paths = service("reopen", "echo one\nsleep 1\necho two\nexec sleep 30");
	let ctx = SupervisorContext::new(paths.clone(), fast_tunables());
	let handle = ctx.handle();
	let task = tokio::spawn(Supervisor::new(ctx).run());

	let out = paths.stdout_log_path();
	wait_for(&out, |s| s == "one\n").await;
	let rotated = paths.log_dir().join("out.old");
	std::fs::rename(&out, &rotated).unwrap();
	handle.reopen();
	wait_for(&out, |s| s == "two\n").await;
	assert_eq!(read(&rotated), "one\n");

	handle.request(Control::Stop);
	tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap().unwrap();
}
