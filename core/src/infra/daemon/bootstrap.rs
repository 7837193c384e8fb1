use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};

use crate::config::CoreConfig;
use crate::infra::daemon::client::DaemonClient;
use crate::infra::daemon::lock::{LockError, LockStatus, WriterLock};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum BootstrapError {
	#[error(transparent)]
	Lock(#[from] LockError),
	#[error("failed to spawn daemon: {0}")]
	Spawn(#[source] io::Error),
	#[error("writer lock is held by pid {pid} but its endpoint {endpoint} never answered")]
	HolderUnreachable { pid: u32, endpoint: PathBuf },
	#[error("spawned daemon did not become reachable within {0:?}")]
	StartTimeout(Duration),
	#[error("failed to initialize logging: {0}")]
	Tracing(String),
}

/// Starts a daemon process for a data directory.
pub trait DaemonSpawner: Send + Sync {
	fn spawn(&self, config: &CoreConfig) -> Result<(), BootstrapError>;
}

/// Spawns `<program> daemon --data-dir <dir>` detached from our stdio
#[derive(Debug, Clone)]
pub struct ProcessSpawner {
	program: PathBuf,
}

impl ProcessSpawner {
	pub fn new(program: impl Into<PathBuf>) -> Self {
		Self {
			program: program.into(),
		}
	}

	pub fn current_exe() -> io::Result<Self> {
		Ok(Self::new(std::env::current_exe()?))
	}
}

impl DaemonSpawner for ProcessSpawner {
	fn spawn(&self, config: &CoreConfig) -> Result<(), BootstrapError> {
		let child = std::process::Command::new(&self.program)
			.arg("daemon")
			.arg("--data-dir")
			.arg(&config.data_dir)
			.stdin(Stdio::null())
			.stdout(Stdio::null())
			.stderr(Stdio::null())
			.spawn()
			.map_err(BootstrapError::Spawn)?;
		info!(pid = child.id(), "Spawned daemon");
		Ok(())
	}
}

/// Return a client for a reachable daemon, starting one only if nobody
/// holds the writer lock. Every path that may start a daemon goes through
/// here.
pub async fn ensure_daemon(
	config: &CoreConfig,
	spawner: &dyn DaemonSpawner,
) -> Result<DaemonClient, BootstrapError> {
	let timeout = config.ipc.request_timeout();
	let client = DaemonClient::new(config.socket_path(), timeout);
	if client.ping().await {
		return Ok(client);
	}

	let wait = config.lock.connect_wait();
	let lock = WriterLock::new(config.lock_path(), config.socket_path(), &config.lock);
	match lock.status().await? {
		LockStatus::Live(record) | LockStatus::StaleInGrace(record) => {
			// A starting or busy holder, give it time to answer
			debug!(pid = record.pid, "Writer lock held, waiting for its endpoint");
			let client = DaemonClient::new(&record.endpoint, timeout);
			if wait_reachable(&client, wait).await {
				Ok(client)
			} else {
				Err(BootstrapError::HolderUnreachable {
					pid: record.pid,
					endpoint: record.endpoint,
				})
			}
		}
		status @ (LockStatus::Absent | LockStatus::Reclaimable(_)) => {
			if let LockStatus::Reclaimable(record) = &status {
				warn!(pid = record.pid, "Writer lock is stale, starting a new daemon");
			}
			spawner.spawn(config)?;
			if wait_reachable(&client, wait).await {
				Ok(client)
			} else {
				Err(BootstrapError::StartTimeout(wait))
			}
		}
	}
}

async fn wait_reachable(client: &DaemonClient, wait: Duration) -> bool {
	let deadline = Instant::now() + wait;
	loop {
		if client.ping().await {
			return true;
		}
		if Instant::now() >= deadline {
			return false;
		}
		sleep(POLL_INTERVAL).await;
	}
}

/// Initialize tracing with stdout and a daily file at `<logs_dir>/daemon.log`.
/// `level` applies to strata's own targets unless `RUST_LOG` is set.
///
/// Keep the returned guard alive for as long as logs should be flushed.
pub fn init_daemon_tracing(logs_dir: &Path, level: &str) -> Result<WorkerGuard, BootstrapError> {
	use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

	std::fs::create_dir_all(logs_dir)
		.map_err(|e| BootstrapError::Tracing(format!("failed to create logs directory: {e}")))?;

	let file_appender = RollingFileAppender::new(Rotation::DAILY, logs_dir, "daemon.log");
	let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

	tracing_subscriber::registry()
		.with(
			EnvFilter::try_from_default_env()
				.unwrap_or_else(|_| EnvFilter::new(format!("strata_core={level},strata={level}"))),
		)
		.with(
			fmt::layer()
				.with_target(true)
				.with_thread_ids(true)
				.with_writer(std::io::stdout),
		)
		.with(
			fmt::layer()
				.with_target(true)
				.with_thread_ids(true)
				.with_ansi(false)
				.with_writer(file_writer),
		)
		.try_init()
		.map_err(|e| BootstrapError::Tracing(e.to_string()))?;

	Ok(guard)
}
