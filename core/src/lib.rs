#![warn(clippy::all)]

//! Strata indexes a game's script tree plus any number of override packages
//! into a store, and resolves which definition of every identifier is in
//! effect once the packages are merged in load order.
//!
//! [`Core`] is the entry point for callers that own the store for writing:
//! the daemon, and one-shot commands run while no daemon holds the writer
//! lock.

pub mod config;
pub mod domain;
pub mod infra;
pub mod ops;

use config::{ConfigError, CoreConfig, WorkerMode};
use infra::{
	daemon::{Acquire, LockError, WriterLock, WriterLockGuard},
	db::Database,
	queue::{BuildId, BuildQueue, Priority, QueueError, QueueStats},
	store::ContentStore,
};
use ops::{
	indexing::{
		Discovery, DiscoveryError, DiscoveryReport, EnvelopeExecutor, PoolConfig, PoolMode,
		PoolReport, RoutingError, RoutingTable, ScriptExecutor, StoreWriter, WorkerKind,
		WorkerPool, WriterError,
	},
	merge::{resolve_all, MergeError, MergeVerdict},
};

use sea_orm::DbErr;
use std::{
	path::{Path, PathBuf},
	sync::Arc,
};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum CoreError {
	#[error(transparent)]
	Config(#[from] ConfigError),
	#[error("database error: {0}")]
	Database(#[from] DbErr),
	#[error(transparent)]
	Routing(#[from] RoutingError),
	#[error(transparent)]
	Discovery(#[from] DiscoveryError),
	#[error(transparent)]
	Writer(#[from] WriterError),
	#[error(transparent)]
	Queue(#[from] QueueError),
	#[error(transparent)]
	Merge(#[from] MergeError),
	#[error(transparent)]
	Lock(#[from] LockError),
	#[error("writer lock is held by pid {pid}, send work to the daemon at {endpoint:?}")]
	WriterBusy { pid: u32, endpoint: PathBuf },
	#[error("unknown package '{0}'")]
	UnknownPackage(String),
	#[error("{0:?} is not inside the package root")]
	OutsidePackage(PathBuf),
	#[error("store at {0:?} is missing or not migrated, run a writing command first")]
	StoreNotReady(PathBuf),
}

pub struct Core {
	config: CoreConfig,
	db: Database,
	routing: RoutingTable,
	blobs: ContentStore,
	writer: Arc<StoreWriter>,
}

impl Core {
	/// Open the store under `data_dir`, or the platform default, as its writer
	pub async fn open(data_dir: Option<PathBuf>) -> Result<(Self, WriterLockGuard), CoreError> {
		let config = match data_dir {
			Some(dir) => CoreConfig::load_from(&dir)?,
			None => CoreConfig::load()?,
		};
		Self::open_writer(config).await
	}

	/// Open and migrate the store. Migrating writes, so callers own the
	/// writer lock; one-shot commands go through [`open_writer`](Self::open_writer).
	pub async fn with_config(config: CoreConfig) -> Result<Self, CoreError> {
		config.validate()?;
		config.ensure_directories()?;

		let db = Database::create(&config.database_path()).await?;
		db.migrate().await?;
		Self::assemble(config, db)
	}

	/// Take the writer lock, then open and migrate the store
	pub async fn open_writer(config: CoreConfig) -> Result<(Self, WriterLockGuard), CoreError> {
		config.validate()?;
		config.ensure_directories()?;

		let guard = acquire_writer_lock(&config).await?;
		match Self::with_config(config).await {
			Ok(core) => Ok((core, guard)),
			Err(e) => {
				if let Err(release) = guard.release().await {
					warn!("Failed to release writer lock: {}", release);
				}
				Err(e)
			}
		}
	}

	/// Open an existing store without migrating it, for commands that only
	/// read while a daemon may own the store.
	pub async fn open_reader(config: CoreConfig) -> Result<Self, CoreError> {
		config.validate()?;

		let path = config.database_path();
		if !path.exists() {
			return Err(CoreError::StoreNotReady(path));
		}
		let db = Database::open(&path).await?;
		if !db.is_current().await? {
			return Err(CoreError::StoreNotReady(path));
		}
		Self::assemble(config, db)
	}

	fn assemble(config: CoreConfig, db: Database) -> Result<Self, CoreError> {
		let routing = RoutingTable::new(&config.routing)?;
		let blobs = ContentStore::new(config.blobs_dir());
		let queue = BuildQueue::new(config.pipeline.max_attempts);
		let writer = Arc::new(StoreWriter::new(db.clone(), queue));

		info!(data_dir = %config.data_dir.display(), packages = config.packages.len() + 1, "Core opened");
		Ok(Self {
			config,
			db,
			routing,
			blobs,
			writer,
		})
	}

	pub fn config(&self) -> &CoreConfig {
		&self.config
	}

	pub fn db(&self) -> &Database {
		&self.db
	}

	pub fn routing(&self) -> &RoutingTable {
		&self.routing
	}

	pub fn blobs(&self) -> &ContentStore {
		&self.blobs
	}

	pub fn writer(&self) -> Arc<StoreWriter> {
		Arc::clone(&self.writer)
	}

	/// Take the writer lock for a one-shot command.
	pub async fn acquire_writer(&self) -> Result<WriterLockGuard, CoreError> {
		acquire_writer_lock(&self.config).await
	}

	pub async fn discover(&self, force_hash: bool) -> Result<DiscoveryReport, CoreError> {
		let force_hash = force_hash || self.config.pipeline.force_hash;
		Ok(Discovery::new(&self.config, &self.routing, &self.blobs, &self.writer)
			.run(force_hash)
			.await?)
	}

	/// Enqueue one file of `package`. `path` is relative to the package root
	/// or absolute inside it. Returns `None` when routing skips the file.
	pub async fn enqueue_path(
		&self,
		package: &str,
		path: &Path,
		priority: Priority,
	) -> Result<Option<BuildId>, CoreError> {
		let rel_path = if path.is_absolute() {
			let config = self
				.config
				.load_order()
				.find(|p| p.name == package)
				.ok_or_else(|| CoreError::UnknownPackage(package.to_string()))?;
			let root = self.config.package_root(config);
			path.strip_prefix(&root)
				.map_err(|_| CoreError::OutsidePackage(path.to_path_buf()))?
				.to_path_buf()
		} else {
			path.to_path_buf()
		};

		Ok(Discovery::new(&self.config, &self.routing, &self.blobs, &self.writer)
			.enqueue_one(package, &rel_path.to_string_lossy(), priority)
			.await?)
	}

	pub fn executor(&self) -> Arc<dyn EnvelopeExecutor> {
		Arc::new(ScriptExecutor::new(self.blobs.clone()))
	}

	/// Workers as configured by `pipeline.worker_mode`
	pub fn worker_kind(&self) -> WorkerKind {
		match self.config.pipeline.worker_mode {
			WorkerMode::Task => WorkerKind::InProcess(self.executor()),
			WorkerMode::Process => match std::env::current_exe() {
				Ok(program) => WorkerKind::Subprocess {
					program,
					args: vec![
						"worker".to_string(),
						"--data-dir".to_string(),
						self.config.data_dir.to_string_lossy().into_owned(),
					],
				},
				Err(e) => {
					warn!("Cannot locate own executable, using in-process workers: {}", e);
					WorkerKind::InProcess(self.executor())
				}
			},
		}
	}

	pub fn pool(&self, kind: WorkerKind) -> WorkerPool {
		WorkerPool::new(
			self.writer(),
			kind,
			PoolConfig {
				workers: self.config.pipeline.workers,
				item_timeout: self.config.pipeline.item_timeout(),
				claim_batch: self.config.pipeline.claim_batch,
				holder: format!("pid:{}", std::process::id()),
			},
		)
	}

	/// Drain the queue once with the configured workers
	pub async fn build(&self) -> Result<PoolReport, CoreError> {
		self.build_with(self.worker_kind()).await
	}

	pub async fn build_with(&self, kind: WorkerKind) -> Result<PoolReport, CoreError> {
		// Items left in flight by a crashed run
		self.writer.recover_abandoned().await?;
		Ok(self.pool(kind).run(PoolMode::Drain).await?)
	}

	pub async fn status(&self) -> Result<QueueStats, CoreError> {
		Ok(self.writer.queue().stats(self.db.conn()).await?)
	}

	/// Merge verdicts for every identity in the store
	pub async fn resolve(&self) -> Result<Vec<MergeVerdict>, CoreError> {
		Ok(resolve_all(self.db.conn(), &self.config.resolver).await?)
	}
}

async fn acquire_writer_lock(config: &CoreConfig) -> Result<WriterLockGuard, CoreError> {
	let lock = WriterLock::new(config.lock_path(), config.socket_path(), &config.lock);
	match lock.acquire().await? {
		Acquire::Held(mut guard) => {
			guard.start_heartbeat();
			Ok(guard)
		}
		Acquire::AlreadyHeld(record) => Err(CoreError::WriterBusy {
			pid: record.pid,
			endpoint: record.endpoint,
		}),
	}
}
