//! Daemon lifecycle, writer lock exclusion and the socket protocol

mod helpers;

use chrono::Utc;
use helpers::{eventually, TestEnv};
use pretty_assertions::assert_eq;
use std::{
	path::PathBuf,
	sync::{
		atomic::{AtomicUsize, Ordering},
		Mutex,
	},
	time::Duration,
};
use strata_core::{
	config::CoreConfig,
	infra::{
		daemon::{
			ensure_daemon, Acquire, BootstrapError, Daemon, DaemonClient, DaemonExit, DaemonRequest,
			DaemonResponse, DaemonSpawner, DaemonState, LockRecord, WriterLock,
		},
		queue::Priority,
	},
	Core, CoreError,
};
use tokio::{task::JoinHandle, time::timeout};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(10);

type DaemonTask = JoinHandle<Result<DaemonExit, strata_core::infra::daemon::DaemonError>>;

/// Start a daemon in this process and wait until it serves
async fn start(config: &CoreConfig) -> (DaemonTask, CancellationToken) {
	let daemon = Daemon::new(config.clone());
	let shutdown = daemon.shutdown_token();
	let mut state = daemon.state().subscribe();
	let task = tokio::spawn(daemon.run());

	timeout(WAIT, state.wait_for(|s| *s >= DaemonState::Serving))
		.await
		.expect("daemon did not start in time")
		.expect("state channel closed");
	(task, shutdown)
}

fn client(config: &CoreConfig) -> DaemonClient {
	DaemonClient::new(config.socket_path(), config.ipc.request_timeout())
}

/// Runs daemons as tasks of the test runtime instead of processes
#[derive(Default)]
struct InProcessSpawner {
	spawned: AtomicUsize,
	shutdowns: Mutex<Vec<CancellationToken>>,
}

impl InProcessSpawner {
	fn count(&self) -> usize {
		self.spawned.load(Ordering::SeqCst)
	}

	fn stop_all(&self) {
		for token in self.shutdowns.lock().expect("poisoned").iter() {
			token.cancel();
		}
	}
}

impl DaemonSpawner for InProcessSpawner {
	fn spawn(&self, config: &CoreConfig) -> Result<(), BootstrapError> {
		self.spawned.fetch_add(1, Ordering::SeqCst);
		let daemon = Daemon::new(config.clone());
		self.shutdowns
			.lock()
			.expect("poisoned")
			.push(daemon.shutdown_token());
		tokio::spawn(daemon.run());
		Ok(())
	}
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_second_daemon_defers_to_lock_holder() -> Result<(), Box<dyn std::error::Error>> {
	let env = TestEnv::new();
	let (first, shutdown) = start(&env.config).await;

	let second = Daemon::new(env.config.clone());
	let state = second.state();
	match timeout(WAIT, second.run()).await?? {
		DaemonExit::AlreadyRunning(record) => {
			assert_eq!(record.pid, std::process::id());
			assert_eq!(record.endpoint, env.config.socket_path());
		}
		DaemonExit::Stopped(_) => panic!("second daemon should not have served"),
	}
	assert_eq!(state.get(), DaemonState::Stopped);

	// The first one is untouched
	assert!(client(&env.config).ping().await);

	shutdown.cancel();
	assert!(matches!(timeout(WAIT, first).await???, DaemonExit::Stopped(_)));
	assert!(!env.config.lock_path().exists());
	assert!(!env.config.socket_path().exists());

	Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_socket_round_trip() -> Result<(), Box<dyn std::error::Error>> {
	let env = TestEnv::new();
	env.write("game", "common/traits/base.txt", "brave = { level = 1 }\n");
	env.write("mod_a", "notes.md", "skip me\n");
	let (daemon, _shutdown) = start(&env.config).await;
	let client = client(&env.config);

	assert_eq!(client.send(&DaemonRequest::Ping).await?, DaemonResponse::Pong);

	match client.send(&DaemonRequest::Discover { force_hash: false }).await? {
		DaemonResponse::Discovered(report) => {
			assert_eq!(report.new_files, 1);
			assert_eq!(report.enqueued, 1);
		}
		other => panic!("unexpected response {other:?}"),
	}

	// Discovery wakes the pool; the item is built without further requests
	let probe = &client;
	let built = eventually(WAIT, move || async move {
		matches!(
			probe.send(&DaemonRequest::Status).await,
			Ok(DaemonResponse::Status(status)) if status.queue.completed == 1
		)
	})
	.await;
	assert!(built, "queued file was never built");

	let not_routed = client
		.send(&DaemonRequest::Enqueue {
			package: "mod_a".to_string(),
			path: PathBuf::from("notes.md"),
			priority: Priority::Flash,
		})
		.await?;
	assert_eq!(not_routed, DaemonResponse::NotRouted);

	let enqueued = client
		.send(&DaemonRequest::Enqueue {
			package: "game".to_string(),
			path: PathBuf::from("common/traits/base.txt"),
			priority: Priority::Flash,
		})
		.await?;
	assert!(matches!(enqueued, DaemonResponse::Enqueued { .. }));

	let unknown = client
		.send(&DaemonRequest::Enqueue {
			package: "nope".to_string(),
			path: PathBuf::from("common/traits/base.txt"),
			priority: Priority::Normal,
		})
		.await?;
	assert!(matches!(unknown, DaemonResponse::Error(_)));

	match client.send(&DaemonRequest::Status).await? {
		DaemonResponse::Status(status) => {
			assert_eq!(status.state, DaemonState::Serving);
			assert_eq!(status.pid, std::process::id());
			assert_eq!(status.workers, 2);
		}
		other => panic!("unexpected response {other:?}"),
	}

	assert_eq!(client.send(&DaemonRequest::Shutdown).await?, DaemonResponse::Ok);
	assert!(matches!(timeout(WAIT, daemon).await???, DaemonExit::Stopped(_)));
	assert!(!client.ping().await);

	Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_ensure_daemon_spawns_only_when_absent() -> Result<(), Box<dyn std::error::Error>> {
	let env = TestEnv::new();
	let spawner = InProcessSpawner::default();

	let client = ensure_daemon(&env.config, &spawner).await?;
	assert_eq!(spawner.count(), 1);
	assert!(client.ping().await);

	// Reachable now, so callers reuse it
	for _ in 0..3 {
		let again = ensure_daemon(&env.config, &spawner).await?;
		assert_eq!(again.socket_path(), env.config.socket_path().as_path());
	}
	assert_eq!(spawner.count(), 1);

	spawner.stop_all();
	let lock_path = env.config.lock_path();
	let lock_path = &lock_path;
	let stopped = eventually(WAIT, move || async move { !lock_path.exists() }).await;
	assert!(stopped, "daemon kept the writer lock after shutdown");

	Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stale_lock_from_dead_holder_is_reclaimed() -> Result<(), Box<dyn std::error::Error>> {
	let env = TestEnv::new();
	env.config.ensure_directories()?;

	let abandoned = LockRecord {
		pid: 4_000_000,
		hostname: "elsewhere".to_string(),
		holder: Uuid::new_v4(),
		endpoint: env.dir.path().join("gone.sock"),
		acquired_at: Utc::now() - chrono::Duration::seconds(120),
		heartbeat_at: Utc::now() - chrono::Duration::seconds(60),
	};
	std::fs::write(env.config.lock_path(), serde_json::to_vec(&abandoned)?)?;

	let spawner = InProcessSpawner::default();
	let client = ensure_daemon(&env.config, &spawner).await?;
	assert_eq!(spawner.count(), 1);
	assert!(client.ping().await);

	let record: LockRecord = serde_json::from_slice(&std::fs::read(env.config.lock_path())?)?;
	assert_ne!(record.holder, abandoned.holder);
	assert_eq!(record.pid, std::process::id());

	spawner.stop_all();
	Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_one_shot_writer_refused_while_daemon_runs() -> Result<(), Box<dyn std::error::Error>> {
	let env = TestEnv::new();
	let (daemon, shutdown) = start(&env.config).await;

	let core = env.core().await;
	match core.acquire_writer().await {
		Err(CoreError::WriterBusy { pid, endpoint }) => {
			assert_eq!(pid, std::process::id());
			assert_eq!(endpoint, env.config.socket_path());
		}
		Err(e) => panic!("unexpected error {e}"),
		Ok(_) => panic!("writer lock granted while a daemon holds it"),
	}

	shutdown.cancel();
	timeout(WAIT, daemon).await???;

	// Free again once the daemon is gone
	let guard = core.acquire_writer().await?;
	guard.release().await?;

	Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_daemons_started_together_elect_one_writer() -> Result<(), Box<dyn std::error::Error>> {
	let env = TestEnv::new();
	let daemons: Vec<_> = (0..3).map(|_| Daemon::new(env.config.clone())).collect();
	let shutdowns: Vec<_> = daemons.iter().map(Daemon::shutdown_token).collect();
	let tasks: Vec<DaemonTask> = daemons
		.into_iter()
		.map(|daemon| tokio::spawn(daemon.run()))
		.collect();

	let probe = client(&env.config);
	let probe = &probe;
	assert!(eventually(WAIT, move || async move { probe.ping().await }).await);

	// The losers return on their own
	let running = &tasks;
	let settled = eventually(WAIT, move || async move {
		running.iter().filter(|task| task.is_finished()).count() == 2
	})
	.await;
	assert!(settled, "more than one daemon kept running");

	for token in &shutdowns {
		token.cancel();
	}
	let (mut served, mut deferred) = (0, 0);
	for task in tasks {
		match timeout(WAIT, task).await??? {
			DaemonExit::Stopped(_) => served += 1,
			DaemonExit::AlreadyRunning(record) => {
				assert_eq!(record.endpoint, env.config.socket_path());
				deferred += 1;
			}
		}
	}
	assert_eq!((served, deferred), (1, 2));
	assert!(!env.config.lock_path().exists());

	Ok(())
}

#[tokio::test]
async fn test_store_is_migrated_only_under_the_writer_lock() -> Result<(), Box<dyn std::error::Error>>
{
	let env = TestEnv::new();
	env.write("game", "common/traits/base.txt", "brave = { level = 1 }\n");
	let database = env.config.database_path();

	// Readers never create the store
	assert!(matches!(
		Core::open_reader(env.config.clone()).await,
		Err(CoreError::StoreNotReady(_))
	));
	assert!(!database.exists());

	let lock = WriterLock::new(
		env.config.lock_path(),
		env.config.socket_path(),
		&env.config.lock,
	);
	let Acquire::Held(holder) = lock.acquire().await? else {
		panic!("lock should be free");
	};
	assert!(matches!(
		Core::open_writer(env.config.clone()).await,
		Err(CoreError::WriterBusy { .. })
	));
	assert!(!database.exists(), "store touched without the writer lock");
	holder.release().await?;

	let (core, guard) = Core::open_writer(env.config.clone()).await?;
	core.discover(false).await?;
	guard.release().await?;
	drop(core);

	let reader = Core::open_reader(env.config.clone()).await?;
	assert_eq!(reader.status().await?.pending, 1);

	Ok(())
}
