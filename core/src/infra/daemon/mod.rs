//! Writer daemon
//!
//! The daemon is the long-running holder of the writer lock. It recovers the
//! queue, keeps the lock's heartbeat fresh, serves the socket and runs the
//! worker pool until asked to stop, then drains in-flight items and releases
//! the lock.

pub mod bootstrap;
pub mod client;
pub mod lock;
pub mod rpc;
pub mod state;
pub mod types;

pub use bootstrap::{ensure_daemon, init_daemon_tracing, BootstrapError, DaemonSpawner, ProcessSpawner};
pub use client::{ClientError, DaemonClient};
pub use lock::{Acquire, LockError, LockRecord, LockStatus, WriterLock, WriterLockGuard};
pub use state::{DaemonState, DaemonStateHandle};
pub use types::{DaemonRequest, DaemonResponse, DaemonStatus};

use crate::{
	config::{ConfigError, CoreConfig},
	ops::indexing::{PoolMode, PoolReport, WorkerKind, WriterError},
	Core, CoreError,
};

use chrono::{DateTime, Utc};
use rpc::RpcServer;
use std::{io, sync::Arc};
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum DaemonError {
	#[error(transparent)]
	Config(#[from] ConfigError),
	#[error(transparent)]
	Lock(#[from] LockError),
	#[error(transparent)]
	Core(#[from] CoreError),
	#[error(transparent)]
	Writer(#[from] WriterError),
	#[error("socket error: {0}")]
	Io(#[from] io::Error),
}

/// How a daemon run ended
#[derive(Debug)]
pub enum DaemonExit {
	Stopped(PoolReport),
	/// Another process holds the writer lock
	AlreadyRunning(LockRecord),
}

/// What connection handlers share with the daemon
pub struct DaemonShared {
	pub(crate) core: Arc<Core>,
	pub(crate) state: DaemonStateHandle,
	pub(crate) wake: Arc<Notify>,
	pub(crate) shutdown: CancellationToken,
	pub(crate) started_at: DateTime<Utc>,
	pub(crate) workers: usize,
}

pub struct Daemon {
	config: CoreConfig,
	worker_kind: Option<WorkerKind>,
	state: DaemonStateHandle,
	shutdown: CancellationToken,
}

impl Daemon {
	pub fn new(config: CoreConfig) -> Self {
		Self {
			config,
			worker_kind: None,
			state: DaemonStateHandle::new(),
			shutdown: CancellationToken::new(),
		}
	}

	/// Override the worker kind derived from `pipeline.worker_mode`
	pub fn with_worker_kind(mut self, kind: WorkerKind) -> Self {
		self.worker_kind = Some(kind);
		self
	}

	pub fn state(&self) -> DaemonStateHandle {
		self.state.clone()
	}

	/// Cancelling it makes the daemon drain and stop
	pub fn shutdown_token(&self) -> CancellationToken {
		self.shutdown.clone()
	}

	pub async fn run(self) -> Result<DaemonExit, DaemonError> {
		let Self {
			config,
			worker_kind,
			state,
			shutdown,
		} = self;

		config.ensure_directories()?;
		let lock = WriterLock::new(config.lock_path(), config.socket_path(), &config.lock);

		let mut guard = match lock.acquire().await? {
			Acquire::Held(guard) => guard,
			Acquire::AlreadyHeld(record) => {
				info!(pid = record.pid, endpoint = %record.endpoint.display(), "Writer lock already held");
				state.set(DaemonState::Stopped);
				return Ok(DaemonExit::AlreadyRunning(record));
			}
		};
		state.set(DaemonState::LockAcquired);

		let result = Self::serve(config, worker_kind, &state, shutdown.clone(), &mut guard).await;

		shutdown.cancel();
		if let Err(e) = guard.release().await {
			error!("Failed to release writer lock: {}", e);
		}
		state.set(DaemonState::Stopped);

		result.map(DaemonExit::Stopped)
	}

	async fn serve(
		config: CoreConfig,
		worker_kind: Option<WorkerKind>,
		state: &DaemonStateHandle,
		shutdown: CancellationToken,
		guard: &mut WriterLockGuard,
	) -> Result<PoolReport, DaemonError> {
		let socket_path = config.socket_path();
		let workers = config.pipeline.workers;

		let core = Arc::new(Core::with_config(config).await?);
		let recovered = core.writer().recover_abandoned().await?;
		if recovered > 0 {
			warn!(recovered, "Recovered abandoned queue items");
		}
		guard.start_heartbeat();

		let shared = Arc::new(DaemonShared {
			core: Arc::clone(&core),
			state: state.clone(),
			wake: Arc::new(Notify::new()),
			shutdown: shutdown.clone(),
			started_at: Utc::now(),
			workers,
		});

		let server = RpcServer::new(socket_path, Arc::clone(&shared));
		let listener = server.bind()?;
		let rpc = tokio::spawn(async move { server.serve(listener).await });

		// Another process took the lock over
		let lost = guard.lost();
		let watcher = tokio::spawn({
			let shutdown = shutdown.clone();
			let state = state.clone();
			async move {
				tokio::select! {
					_ = lost.cancelled() => {
						error!("Writer lock lost, shutting down");
						shutdown.cancel();
					}
					_ = shutdown.cancelled() => {}
				}
				state.set(DaemonState::Draining);
			}
		});

		state.set(DaemonState::Serving);
		info!(workers, "Daemon serving");

		let kind = worker_kind.unwrap_or_else(|| core.worker_kind());
		let report = core
			.pool(kind)
			.run(PoolMode::Serve {
				shutdown: shutdown.clone(),
				wake: Arc::clone(&shared.wake),
			})
			.await;

		shutdown.cancel();
		let _ = watcher.await;
		if let Err(e) = rpc.await {
			error!("RPC server task failed: {}", e);
		}

		Ok(report?)
	}
}
