//! Single-writer lock
//!
//! At most one process may own the store for writing. Ownership is a JSON
//! record in `<data_dir>/writer.lock`, created with `O_EXCL` semantics and
//! kept fresh by a heartbeat. A record whose holder is gone (dead pid on this
//! host, or a heartbeat older than `stale_after`) may be reclaimed once
//! `grace` has passed since its last heartbeat. Reclaiming goes through a
//! second, short-lived guard file so two reclaimers cannot both win.

use crate::config::LockConfig;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
	io,
	path::{Path, PathBuf},
	time::Duration,
};
use thiserror::Error;
use tokio::{
	fs,
	io::AsyncWriteExt,
	task::JoinHandle,
	time::{interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum LockError {
	#[error("lock file {path}: {source}")]
	Io {
		path: PathBuf,
		#[source]
		source: io::Error,
	},
	#[error("failed to encode lock record: {0}")]
	Encode(#[from] serde_json::Error),
}

impl LockError {
	fn io(path: &Path) -> impl FnOnce(io::Error) -> Self + '_ {
		move |source| Self::Io {
			path: path.to_path_buf(),
			source,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
	pub pid: u32,
	pub hostname: String,
	/// Unique per acquisition, so a reclaimed lock is never mistaken for ours
	pub holder: Uuid,
	/// Where the holder accepts requests
	pub endpoint: PathBuf,
	pub acquired_at: DateTime<Utc>,
	pub heartbeat_at: DateTime<Utc>,
}

impl LockRecord {
	fn new(endpoint: PathBuf) -> Self {
		let now = Utc::now();
		Self {
			pid: std::process::id(),
			hostname: local_hostname(),
			holder: Uuid::new_v4(),
			endpoint,
			acquired_at: now,
			heartbeat_at: now,
		}
	}

	/// Time since the last heartbeat, zero if the clock went backwards
	pub fn heartbeat_age(&self) -> Duration {
		(Utc::now() - self.heartbeat_at)
			.to_std()
			.unwrap_or(Duration::ZERO)
	}
}

/// What a caller sees when it looks at the lock without taking it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockStatus {
	Absent,
	Live(LockRecord),
	/// Holder looks dead but the grace period has not run out
	StaleInGrace(LockRecord),
	Reclaimable(LockRecord),
}

pub enum Acquire {
	Held(WriterLockGuard),
	AlreadyHeld(LockRecord),
}

#[derive(Debug, Clone)]
pub struct WriterLock {
	path: PathBuf,
	reclaim_path: PathBuf,
	endpoint: PathBuf,
	heartbeat_interval: Duration,
	stale_after: Duration,
	grace: Duration,
}

impl WriterLock {
	pub fn new(path: impl Into<PathBuf>, endpoint: impl Into<PathBuf>, config: &LockConfig) -> Self {
		let path = path.into();
		let mut reclaim_path = path.clone().into_os_string();
		reclaim_path.push(".reclaim");

		Self {
			path,
			reclaim_path: reclaim_path.into(),
			endpoint: endpoint.into(),
			heartbeat_interval: config.heartbeat_interval(),
			stale_after: config.stale_after(),
			grace: config.grace(),
		}
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	/// Current record, `None` when nobody holds the lock.
	///
	/// A record that cannot be parsed (a holder died mid-write) is reported
	/// with the file's modification time as its heartbeat.
	pub async fn read(&self) -> Result<Option<LockRecord>, LockError> {
		let bytes = match fs::read(&self.path).await {
			Ok(bytes) => bytes,
			Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
			Err(e) => return Err(LockError::io(&self.path)(e)),
		};

		match serde_json::from_slice(&bytes) {
			Ok(record) => Ok(Some(record)),
			Err(e) => {
				warn!(path = %self.path.display(), "Unreadable lock record: {}", e);
				let modified = match fs::metadata(&self.path).await {
					Ok(metadata) => metadata.modified().map(DateTime::<Utc>::from).ok(),
					Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
					Err(e) => return Err(LockError::io(&self.path)(e)),
				};
				Ok(Some(LockRecord {
					pid: 0,
					hostname: String::new(),
					holder: Uuid::nil(),
					endpoint: self.endpoint.clone(),
					acquired_at: modified.unwrap_or_else(Utc::now),
					heartbeat_at: modified.unwrap_or_else(Utc::now),
				}))
			}
		}
	}

	/// Holder pid is gone on this host, or the heartbeat is too old
	pub fn is_stale(&self, record: &LockRecord) -> bool {
		let dead_here = record.hostname == local_hostname()
			&& record.pid != 0
			&& !process_alive(record.pid);
		dead_here || record.heartbeat_age() >= self.stale_after
	}

	pub async fn status(&self) -> Result<LockStatus, LockError> {
		let Some(record) = self.read().await? else {
			return Ok(LockStatus::Absent);
		};
		Ok(self.classify(record))
	}

	fn classify(&self, record: LockRecord) -> LockStatus {
		if !self.is_stale(&record) {
			LockStatus::Live(record)
		} else if record.heartbeat_age() < self.grace {
			LockStatus::StaleInGrace(record)
		} else {
			LockStatus::Reclaimable(record)
		}
	}

	/// Try to become the writer. Never blocks waiting for a live holder.
	pub async fn acquire(&self) -> Result<Acquire, LockError> {
		if let Some(parent) = self.path.parent() {
			fs::create_dir_all(parent)
				.await
				.map_err(LockError::io(parent))?;
		}

		// Retry after a reclaim or a holder releasing under our feet
		for _ in 0..3 {
			let record = LockRecord::new(self.endpoint.clone());
			match self.create(&self.path, &record).await {
				Ok(()) => {
					info!(holder = %record.holder, pid = record.pid, "Writer lock acquired");
					return Ok(Acquire::Held(WriterLockGuard::new(self.clone(), record)));
				}
				Err(LockError::Io { source, .. })
					if source.kind() == io::ErrorKind::AlreadyExists => {}
				Err(e) => return Err(e),
			}

			match self.status().await? {
				LockStatus::Absent => continue,
				LockStatus::Live(record) | LockStatus::StaleInGrace(record) => {
					return Ok(Acquire::AlreadyHeld(record));
				}
				LockStatus::Reclaimable(record) => {
					if !self.reclaim(&record).await? {
						return Ok(Acquire::AlreadyHeld(record));
					}
				}
			}
		}

		match self.read().await? {
			Some(record) => Ok(Acquire::AlreadyHeld(record)),
			None => Err(LockError::Io {
				path: self.path.clone(),
				source: io::Error::new(io::ErrorKind::WouldBlock, "lock is contended"),
			}),
		}
	}

	/// Take the reclaim guard. Every removal or rewrite of the record happens
	/// while holding it, so an ownership check stays valid until the guard
	/// is dropped. Returns false when somebody else holds it.
	async fn take_guard(&self) -> Result<bool, LockError> {
		let guard = LockRecord::new(self.endpoint.clone());
		match self.create(&self.reclaim_path, &guard).await {
			Ok(()) => Ok(true),
			Err(LockError::Io { source, .. }) if source.kind() == io::ErrorKind::AlreadyExists => {
				self.clear_abandoned_reclaim().await?;
				Ok(false)
			}
			Err(e) => Err(e),
		}
	}

	async fn drop_guard(&self) -> Result<(), LockError> {
		remove_if_exists(&self.reclaim_path).await
	}

	/// Remove a stale record. Returns false when another reclaimer is active
	/// or the holder came back.
	async fn reclaim(&self, stale: &LockRecord) -> Result<bool, LockError> {
		if !self.take_guard().await? {
			return Ok(false);
		}

		let reclaimed = match self.read().await {
			Ok(Some(current)) if current.holder == stale.holder && self.is_stale(&current) => {
				warn!(
					holder = %current.holder,
					pid = current.pid,
					age_ms = current.heartbeat_age().as_millis() as u64,
					"Reclaiming stale writer lock"
				);
				remove_if_exists(&self.path).await.map(|()| true)
			}
			// Released meanwhile
			Ok(None) => Ok(true),
			Ok(Some(_)) => Ok(false),
			Err(e) => Err(e),
		};

		self.drop_guard().await?;
		reclaimed
	}

	/// A reclaimer that died while holding the reclaim guard must not block
	/// reclaiming forever.
	async fn clear_abandoned_reclaim(&self) -> Result<(), LockError> {
		match fs::metadata(&self.reclaim_path).await {
			Ok(metadata) => {
				let age = metadata
					.modified()
					.ok()
					.and_then(|modified| modified.elapsed().ok())
					.unwrap_or(Duration::ZERO);
				if age >= self.stale_after {
					debug!("Removing abandoned reclaim guard");
					remove_if_exists(&self.reclaim_path).await?;
				}
				Ok(())
			}
			Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
			Err(e) => Err(LockError::io(&self.reclaim_path)(e)),
		}
	}

	async fn create(&self, path: &Path, record: &LockRecord) -> Result<(), LockError> {
		let mut file = fs::OpenOptions::new()
			.write(true)
			.create_new(true)
			.open(path)
			.await
			.map_err(LockError::io(path))?;
		file.write_all(&serde_json::to_vec(record)?)
			.await
			.map_err(LockError::io(path))?;
		file.sync_all().await.map_err(LockError::io(path))
	}

	/// Replace the record atomically with a refreshed heartbeat.
	///
	/// Returns false if the lock no longer names `holder`. A tick that finds
	/// the reclaim guard taken is skipped; the next one sees the outcome.
	async fn refresh(&self, record: &mut LockRecord) -> Result<bool, LockError> {
		if !self.take_guard().await? {
			debug!(holder = %record.holder, "Reclaim in progress, skipping heartbeat");
			return Ok(true);
		}
		let refreshed = self.rewrite_if_ours(record).await;
		self.drop_guard().await?;
		refreshed
	}

	async fn rewrite_if_ours(&self, record: &mut LockRecord) -> Result<bool, LockError> {
		match self.read().await? {
			Some(current) if current.holder == record.holder => {}
			_ => return Ok(false),
		}

		record.heartbeat_at = Utc::now();
		let mut tmp = self.path.clone().into_os_string();
		tmp.push(format!(".{}.tmp", record.holder));
		let tmp = PathBuf::from(tmp);

		fs::write(&tmp, serde_json::to_vec(record)?)
			.await
			.map_err(LockError::io(&tmp))?;
		fs::rename(&tmp, &self.path)
			.await
			.map_err(LockError::io(&self.path))?;
		Ok(true)
	}

	/// Remove the record if it still names `holder`
	async fn remove_if_ours(&self, holder: Uuid) -> Result<bool, LockError> {
		for _ in 0..GUARD_ATTEMPTS {
			if self.take_guard().await? {
				let removed = match self.read().await {
					Ok(Some(current)) if current.holder == holder => {
						remove_if_exists(&self.path).await.map(|()| true)
					}
					Ok(_) => Ok(false),
					Err(e) => Err(e),
				};
				self.drop_guard().await?;
				return removed;
			}
			tokio::time::sleep(GUARD_RETRY).await;
		}
		Err(LockError::Io {
			path: self.reclaim_path.clone(),
			source: io::Error::new(io::ErrorKind::WouldBlock, "reclaim guard is held"),
		})
	}
}

const GUARD_ATTEMPTS: usize = 50;
const GUARD_RETRY: Duration = Duration::from_millis(20);

/// Proof of holding the writer lock.
///
/// Dropping it stops the heartbeat but leaves the record in place, exactly as
/// a crash would; call [`release`](Self::release) on orderly shutdown.
pub struct WriterLockGuard {
	lock: WriterLock,
	record: LockRecord,
	stop: CancellationToken,
	lost: CancellationToken,
	heartbeat: Option<JoinHandle<()>>,
}

impl WriterLockGuard {
	fn new(lock: WriterLock, record: LockRecord) -> Self {
		Self {
			lock,
			record,
			stop: CancellationToken::new(),
			lost: CancellationToken::new(),
			heartbeat: None,
		}
	}

	pub fn record(&self) -> &LockRecord {
		&self.record
	}

	/// Fires if another process took the lock over from us
	pub fn lost(&self) -> CancellationToken {
		self.lost.clone()
	}

	pub fn start_heartbeat(&mut self) {
		if self.heartbeat.is_some() {
			return;
		}

		let lock = self.lock.clone();
		let mut record = self.record.clone();
		let stop = self.stop.clone();
		let lost = self.lost.clone();

		self.heartbeat = Some(tokio::spawn(async move {
			let mut ticker = interval(lock.heartbeat_interval);
			ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
			ticker.tick().await;

			loop {
				tokio::select! {
					_ = stop.cancelled() => break,
					_ = ticker.tick() => match lock.refresh(&mut record).await {
						Ok(true) => {}
						Ok(false) => {
							error!(holder = %record.holder, "Writer lock was taken over");
							lost.cancel();
							break;
						}
						Err(e) => warn!("Failed to refresh writer lock heartbeat: {}", e),
					},
				}
			}
		}));
	}

	/// Stop the heartbeat and remove the record if it is still ours.
	pub async fn release(mut self) -> Result<(), LockError> {
		self.stop.cancel();
		if let Some(heartbeat) = self.heartbeat.take() {
			let _ = heartbeat.await;
		}

		if self.lock.remove_if_ours(self.record.holder).await? {
			info!(holder = %self.record.holder, "Writer lock released");
		} else {
			warn!(holder = %self.record.holder, "Writer lock no longer ours at release");
		}
		Ok(())
	}
}

impl Drop for WriterLockGuard {
	fn drop(&mut self) {
		self.stop.cancel();
	}
}

async fn remove_if_exists(path: &Path) -> Result<(), LockError> {
	match fs::remove_file(path).await {
		Ok(()) => Ok(()),
		Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
		Err(e) => Err(LockError::io(path)(e)),
	}
}

fn local_hostname() -> String {
	hostname::get()
		.map(|name| name.to_string_lossy().into_owned())
		.unwrap_or_default()
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
	let Ok(pid) = libc::pid_t::try_from(pid) else {
		return false;
	};
	// Signal 0 only checks for existence
	let rc = unsafe { libc::kill(pid, 0) };
	rc == 0 || io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
	true
}

#[cfg(test)]
mod tests {
	use super::*;

	use tempfile::TempDir;

	fn config(grace_ms: u64) -> LockConfig {
		LockConfig {
			heartbeat_interval_ms: 50,
			stale_after_ms: 10_000,
			grace_ms,
			connect_wait_ms: 1_000,
		}
	}

	fn dead_pid() -> u32 {
		let mut child = std::process::Command::new("true").spawn().unwrap();
		let pid = child.id();
		child.wait().unwrap();
		pid
	}

	async fn plant(lock: &WriterLock, record: &LockRecord) {
		fs::write(lock.path(), serde_json::to_vec(record).unwrap())
			.await
			.unwrap();
	}

	#[tokio::test]
	async fn second_acquire_sees_the_holder() {
		let dir = TempDir::new().unwrap();
		let lock = WriterLock::new(dir.path().join("writer.lock"), "sock", &config(0));

		let Acquire::Held(guard) = lock.acquire().await.unwrap() else {
			panic!("first acquire must succeed");
		};
		let Acquire::AlreadyHeld(record) = lock.acquire().await.unwrap() else {
			panic!("second acquire must fail");
		};
		assert_eq!(record.holder, guard.record().holder);

		guard.release().await.unwrap();
		assert!(lock.read().await.unwrap().is_none());
		assert!(matches!(lock.acquire().await.unwrap(), Acquire::Held(_)));
	}

	#[tokio::test]
	async fn dead_holder_is_reclaimed_after_grace() {
		let dir = TempDir::new().unwrap();
		let lock = WriterLock::new(dir.path().join("writer.lock"), "sock", &config(1_000));

		let mut record = LockRecord::new(PathBuf::from("old.sock"));
		record.pid = dead_pid();
		plant(&lock, &record).await;

		// Dead, but the heartbeat is fresh
		assert!(matches!(
			lock.status().await.unwrap(),
			LockStatus::StaleInGrace(_)
		));
		assert!(matches!(
			lock.acquire().await.unwrap(),
			Acquire::AlreadyHeld(_)
		));

		record.heartbeat_at = Utc::now() - chrono::Duration::seconds(2);
		plant(&lock, &record).await;
		let Acquire::Held(guard) = lock.acquire().await.unwrap() else {
			panic!("stale lock past grace must be reclaimed");
		};
		assert_ne!(guard.record().holder, record.holder);
		assert!(!lock.reclaim_path.exists());
	}

	#[tokio::test]
	async fn live_holder_with_old_heartbeat_is_stale() {
		let dir = TempDir::new().unwrap();
		let lock = WriterLock::new(dir.path().join("writer.lock"), "sock", &config(0));

		let mut record = LockRecord::new(PathBuf::from("old.sock"));
		record.heartbeat_at = Utc::now() - chrono::Duration::seconds(60);
		assert!(lock.is_stale(&record));

		record.heartbeat_at = Utc::now();
		assert!(!lock.is_stale(&record));
	}

	#[tokio::test]
	async fn heartbeat_moves_forward() {
		let dir = TempDir::new().unwrap();
		let lock = WriterLock::new(dir.path().join("writer.lock"), "sock", &config(0));

		let Acquire::Held(mut guard) = lock.acquire().await.unwrap() else {
			panic!("acquire must succeed");
		};
		let first = guard.record().heartbeat_at;
		guard.start_heartbeat();
		tokio::time::sleep(Duration::from_millis(200)).await;

		let current = lock.read().await.unwrap().unwrap();
		assert_eq!(current.holder, guard.record().holder);
		assert!(current.heartbeat_at > first);
		guard.release().await.unwrap();
	}

	#[tokio::test]
	async fn heartbeat_waits_for_a_reclaimer() {
		let dir = TempDir::new().unwrap();
		let lock = WriterLock::new(dir.path().join("writer.lock"), "sock", &config(0));

		let Acquire::Held(guard) = lock.acquire().await.unwrap() else {
			panic!("acquire must succeed");
		};
		let mut record = guard.record().clone();

		// A reclaimer holds the guard, removes our record and a new holder moves in
		assert!(lock.take_guard().await.unwrap());
		remove_if_exists(lock.path()).await.unwrap();
		let newcomer = LockRecord::new(PathBuf::from("new.sock"));
		lock.create(lock.path(), &newcomer).await.unwrap();

		// The stalled holder's heartbeat must not write over the newcomer
		assert!(lock.refresh(&mut record).await.unwrap());
		assert_eq!(lock.read().await.unwrap().unwrap().holder, newcomer.holder);

		lock.drop_guard().await.unwrap();
		assert!(!lock.refresh(&mut record).await.unwrap());
		assert_eq!(lock.read().await.unwrap().unwrap().holder, newcomer.holder);

		// Nor may its release remove the newcomer's record
		guard.release().await.unwrap();
		assert_eq!(lock.read().await.unwrap().unwrap().holder, newcomer.holder);
		assert!(!lock.reclaim_path.exists());
	}

	#[tokio::test]
	async fn takeover_is_noticed() {
		let dir = TempDir::new().unwrap();
		let lock = WriterLock::new(dir.path().join("writer.lock"), "sock", &config(0));

		let Acquire::Held(mut guard) = lock.acquire().await.unwrap() else {
			panic!("acquire must succeed");
		};
		guard.start_heartbeat();
		plant(&lock, &LockRecord::new(PathBuf::from("other.sock"))).await;

		tokio::time::timeout(Duration::from_secs(2), guard.lost().cancelled())
			.await
			.unwrap();
	}
}
