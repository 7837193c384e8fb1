//! Discovery: walk every package, fingerprint, route and enqueue
//!
//! A file is enqueued when its content differs from the last committed
//! content, when its envelope changed, or when it never committed and nothing
//! is queued for it. Files that vanished are retired. Each package's live
//! file set is snapshotted as a content version whenever its manifest changes.

use super::{
	routing::{EnvelopeKind, RoutingTable},
	writer::{ensure_blob_row, StoreWriter, WriterError},
};
use crate::{
	config::CoreConfig,
	domain::{ContentHash, Fingerprint},
	infra::{
		db::entities::{
			package, source_file, ContentVersionActive, Package, PackageActive, PackageModel,
			SourceFile, SourceFileActive, SourceFileModel,
		},
		queue::{BuildId, ItemState, Priority, QueueError},
		store::{check, fingerprint, ContentStore, FingerprintCheck, StoreError},
	},
};

use chrono::Utc;
use sea_orm::{
	ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseTransaction, DbErr, EntityTrait,
	QueryFilter, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::{
	collections::{HashMap, HashSet},
	io,
	path::{Path, PathBuf},
};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Error)]
pub enum DiscoveryError {
	#[error("database error: {0}")]
	Database(#[from] DbErr),
	#[error(transparent)]
	Queue(#[from] QueueError),
	#[error(transparent)]
	Writer(#[from] WriterError),
	#[error(transparent)]
	Store(#[from] StoreError),
	#[error("io error at {path:?}: {source}")]
	Io {
		path: PathBuf,
		#[source]
		source: io::Error,
	},
	#[error("unknown package '{0}'")]
	UnknownPackage(String),
	#[error("path '{0}' is not inside the package")]
	InvalidPath(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryReport {
	pub packages: u64,
	pub scanned: u64,
	pub new_files: u64,
	pub changed: u64,
	/// Metadata changed, content hash did not
	pub touched: u64,
	pub unchanged: u64,
	pub skipped: u64,
	pub deleted: u64,
	pub enqueued: u64,
	pub versions_created: u64,
}

pub struct Discovery<'a> {
	config: &'a CoreConfig,
	routing: &'a RoutingTable,
	blobs: &'a ContentStore,
	writer: &'a StoreWriter,
}

impl<'a> Discovery<'a> {
	pub fn new(
		config: &'a CoreConfig,
		routing: &'a RoutingTable,
		blobs: &'a ContentStore,
		writer: &'a StoreWriter,
	) -> Self {
		Self {
			config,
			routing,
			blobs,
			writer,
		}
	}

	#[instrument(skip(self))]
	pub async fn run(&self, force_hash: bool) -> Result<DiscoveryReport, DiscoveryError> {
		let _gate = self.writer.lock().await;
		let mut report = DiscoveryReport::default();

		let packages = self.sync_packages().await?;
		for package in &packages {
			self.scan_package(package, force_hash, &mut report).await?;
			report.packages += 1;
		}

		info!(?report, "Discovery finished");
		Ok(report)
	}

	/// Upsert package rows in load order. Packages dropped from the
	/// configuration are retired with all their files.
	async fn sync_packages(&self) -> Result<Vec<PackageModel>, DiscoveryError> {
		let conn = self.writer.db().conn();
		let txn = conn.begin().await?;

		let mut existing: HashMap<String, PackageModel> = Package::find()
			.all(&txn)
			.await?
			.into_iter()
			.map(|p| (p.name.clone(), p))
			.collect();

		let mut synced = Vec::new();
		for (load_index, configured) in self.config.load_order().enumerate() {
			let root = self.config.package_root(configured).to_string_lossy().into_owned();
			let replace_paths = serde_json::json!(configured.replace_paths);

			let model = match existing.remove(&configured.name) {
				Some(model)
					if model.root == root
						&& model.load_index == load_index as i32
						&& model.replace_paths == replace_paths =>
				{
					model
				}
				Some(model) => {
					let mut active: PackageActive = model.into();
					active.root = Set(root);
					active.load_index = Set(load_index as i32);
					active.replace_paths = Set(replace_paths);
					active.updated_at = Set(Utc::now());
					active.update(&txn).await?
				}
				None => {
					info!(package = %configured.name, load_index, "Registering package");
					PackageActive {
						name: Set(configured.name.clone()),
						root: Set(root),
						load_index: Set(load_index as i32),
						replace_paths: Set(replace_paths),
						active_version_id: Set(None),
						created_at: Set(Utc::now()),
						updated_at: Set(Utc::now()),
						..Default::default()
					}
					.insert(&txn)
					.await?
				}
			};
			synced.push(model);
		}

		for (name, removed) in existing {
			if removed.load_index < 0 {
				continue;
			}
			warn!(package = %name, "Package no longer configured, retiring its files");
			let files = SourceFile::find()
				.filter(source_file::Column::PackageId.eq(removed.id))
				.filter(source_file::Column::Deleted.eq(false))
				.all(&txn)
				.await?;
			for file in &files {
				self.writer.retire_file(&txn, file).await?;
			}
			let mut active: PackageActive = removed.into();
			active.load_index = Set(-1);
			active.updated_at = Set(Utc::now());
			active.update(&txn).await?;
		}

		txn.commit().await?;
		Ok(synced)
	}

	#[instrument(skip_all, fields(package = %package.name))]
	async fn scan_package(
		&self,
		package: &PackageModel,
		force_hash: bool,
		report: &mut DiscoveryReport,
	) -> Result<(), DiscoveryError> {
		let root = PathBuf::from(&package.root);
		let files = if fs::try_exists(&root).await.unwrap_or(false) {
			walk(&root).await?
		} else {
			// Treated as empty, so every known file is retired
			warn!(root = %root.display(), "Package root is missing");
			Vec::new()
		};
		debug!(count = files.len(), "Walked package");

		let txn = self.writer.db().conn().begin().await?;
		let mut known: HashMap<String, SourceFileModel> = SourceFile::find()
			.filter(source_file::Column::PackageId.eq(package.id))
			.all(&txn)
			.await?
			.into_iter()
			.map(|f| (f.rel_path.clone(), f))
			.collect();

		let mut seen = HashSet::new();
		let mut manifest: Vec<(String, String, u64)> = Vec::new();

		for rel_path in files {
			report.scanned += 1;
			let envelope = self.routing.route(&rel_path);
			let existing = known.remove(&rel_path);

			if envelope == EnvelopeKind::Skip {
				report.skipped += 1;
				if let Some(file) = existing.filter(|f| !f.deleted) {
					self.writer.retire_file(&txn, &file).await?;
				}
				continue;
			}
			seen.insert(rel_path.clone());

			let path = root.join(&rel_path);
			let recorded = existing.as_ref().filter(|f| !f.deleted).map(recorded_fingerprint);
			let outcome = check(&path, recorded.as_ref(), force_hash)
				.await
				.map_err(|source| DiscoveryError::Io {
					path: path.clone(),
					source,
				})?;

			let file = match (outcome, existing) {
				(FingerprintCheck::Unchanged, Some(file)) => {
					report.unchanged += 1;
					if file.envelope == envelope.to_string() {
						file
					} else {
						let mut active: SourceFileActive = file.into();
						active.envelope = Set(envelope.to_string());
						active.updated_at = Set(Utc::now());
						active.update(&txn).await?
					}
				}
				(FingerprintCheck::ContentIdentical(fp), existing) => {
					report.touched += 1;
					self.upsert(&txn, package, &rel_path, envelope, &fp, existing)
						.await?
				}
				(outcome, existing) => {
					let (fp, bytes) = match outcome {
						FingerprintCheck::Changed(fp, bytes) | FingerprintCheck::New(fp, bytes) => {
							(fp, bytes)
						}
						// Metadata matched but there is no row to reuse
						_ => fingerprint(&path).await.map_err(|source| DiscoveryError::Io {
							path: path.clone(),
							source,
						})?,
					};
					if existing.as_ref().is_some_and(|f| !f.deleted) {
						report.changed += 1;
					} else {
						report.new_files += 1;
					}
					self.store_blob(&txn, bytes, &fp).await?;
					self.upsert(&txn, package, &rel_path, envelope, &fp, existing)
						.await?
				}
			};

			manifest.push((rel_path, file.content_hash.clone(), file.size as u64));

			if self.needs_build(&txn, &file, envelope).await? {
				let build_id = self
					.writer
					.queue()
					.enqueue(
						&txn,
						file.id,
						envelope,
						Priority::Normal,
						&ContentHash::from(file.content_hash.clone()),
					)
					.await?;
				report.enqueued += 1;
				debug!(build_id, file = %file.rel_path, "Enqueued");
			}
		}

		for (rel_path, file) in known {
			if file.deleted || seen.contains(&rel_path) {
				continue;
			}
			debug!(file = %rel_path, "File removed from package");
			self.writer.retire_file(&txn, &file).await?;
			report.deleted += 1;
		}

		if snapshot_version(&txn, package, manifest).await? {
			report.versions_created += 1;
		}

		txn.commit().await?;
		Ok(())
	}

	async fn needs_build(
		&self,
		txn: &DatabaseTransaction,
		file: &SourceFileModel,
		envelope: EnvelopeKind,
	) -> Result<bool, DiscoveryError> {
		let committed = file.processed_hash.as_deref() == Some(file.content_hash.as_str());
		let latest = self.writer.queue().latest_for(txn, file.id).await?;

		Ok(match latest {
			Some(item) if item.state.is_active() => false,
			// Known bad content stays failed until it changes or is enqueued explicitly
			Some(item)
				if item.state == ItemState::Error
					&& item.content_hash.as_str() == file.content_hash
					&& item.envelope == envelope =>
			{
				false
			}
			Some(item) => !committed || item.envelope != envelope,
			None => true,
		})
	}

	async fn store_blob(
		&self,
		txn: &DatabaseTransaction,
		bytes: Vec<u8>,
		fp: &Fingerprint,
	) -> Result<(), DiscoveryError> {
		let blobs = self.blobs.clone();
		let hash = tokio::task::spawn_blocking(move || blobs.store(&bytes))
			.await
			.map_err(|e| DiscoveryError::Io {
				path: self.blobs.root().to_path_buf(),
				source: io::Error::other(e),
			})??;
		ensure_blob_row(txn, &hash, fp.size).await?;
		Ok(())
	}

	async fn upsert<C: ConnectionTrait>(
		&self,
		conn: &C,
		package: &PackageModel,
		rel_path: &str,
		envelope: EnvelopeKind,
		fp: &Fingerprint,
		existing: Option<SourceFileModel>,
	) -> Result<SourceFileModel, DiscoveryError> {
		let model = match existing {
			Some(file) => {
				let mut active: SourceFileActive = file.into();
				active.envelope = Set(envelope.to_string());
				active.mtime_ns = Set(fp.mtime_ns);
				active.size = Set(fp.size as i64);
				active.content_hash = Set(fp.hash.to_string());
				active.deleted = Set(false);
				active.updated_at = Set(Utc::now());
				active.update(conn).await?
			}
			None => {
				SourceFileActive {
					package_id: Set(package.id),
					rel_path: Set(rel_path.to_string()),
					envelope: Set(envelope.to_string()),
					mtime_ns: Set(fp.mtime_ns),
					size: Set(fp.size as i64),
					content_hash: Set(fp.hash.to_string()),
					processed_hash: Set(None),
					last_build_id: Set(None),
					deleted: Set(false),
					updated_at: Set(Utc::now()),
					..Default::default()
				}
				.insert(conn)
				.await?
			}
		};
		Ok(model)
	}

	/// Fingerprint, store and enqueue one file regardless of its state.
	/// Returns `None` when the routing table skips the path.
	#[instrument(skip(self))]
	pub async fn enqueue_one(
		&self,
		package_name: &str,
		rel_path: &str,
		priority: Priority,
	) -> Result<Option<BuildId>, DiscoveryError> {
		let rel_path = normalize_rel_path(rel_path)
			.ok_or_else(|| DiscoveryError::InvalidPath(rel_path.to_string()))?;
		let envelope = self.routing.route(&rel_path);
		if envelope == EnvelopeKind::Skip {
			return Ok(None);
		}

		let _gate = self.writer.lock().await;
		let conn = self.writer.db().conn();

		let package = Package::find()
			.filter(package::Column::Name.eq(package_name))
			.one(conn)
			.await?
			.filter(|p| p.load_index >= 0)
			.ok_or_else(|| DiscoveryError::UnknownPackage(package_name.to_string()))?;

		let path = PathBuf::from(&package.root).join(&rel_path);
		let (fp, bytes) = fingerprint(&path)
			.await
			.map_err(|source| DiscoveryError::Io {
				path: path.clone(),
				source,
			})?;

		let txn = conn.begin().await?;
		let existing = SourceFile::find()
			.filter(source_file::Column::PackageId.eq(package.id))
			.filter(source_file::Column::RelPath.eq(rel_path.as_str()))
			.one(&txn)
			.await?;

		self.store_blob(&txn, bytes, &fp).await?;
		let file = self
			.upsert(&txn, &package, &rel_path, envelope, &fp, existing)
			.await?;
		let build_id = self
			.writer
			.queue()
			.enqueue(&txn, file.id, envelope, priority, &fp.hash)
			.await?;
		txn.commit().await?;

		info!(build_id, %priority, "Enqueued single file");
		Ok(Some(build_id))
	}
}

fn recorded_fingerprint(file: &SourceFileModel) -> Fingerprint {
	Fingerprint {
		mtime_ns: file.mtime_ns,
		size: file.size.max(0) as u64,
		hash: ContentHash::from(file.content_hash.clone()),
	}
}

/// `/` separated, relative, without `.` or `..` components
pub fn normalize_rel_path(raw: &str) -> Option<String> {
	let mut parts = Vec::new();
	for part in raw.split(['/', '\\']) {
		match part {
			"" | "." => continue,
			".." => return None,
			part => parts.push(part),
		}
	}
	(!parts.is_empty()).then(|| parts.join("/"))
}

/// Every regular file under `root`, as sorted `/` separated relative paths.
/// Hidden entries are ignored.
pub async fn walk(root: &Path) -> Result<Vec<String>, DiscoveryError> {
	let io_error = |path: &Path| {
		let path = path.to_path_buf();
		move |source| DiscoveryError::Io { path, source }
	};

	let mut files = Vec::new();
	let mut pending = vec![(root.to_path_buf(), String::new())];

	while let Some((dir, prefix)) = pending.pop() {
		let mut entries = fs::read_dir(&dir).await.map_err(io_error(&dir))?;
		while let Some(entry) = entries.next_entry().await.map_err(io_error(&dir))? {
			let name = entry.file_name().to_string_lossy().into_owned();
			if name.starts_with('.') {
				continue;
			}
			let rel = if prefix.is_empty() {
				name
			} else {
				format!("{prefix}/{name}")
			};

			let file_type = entry.file_type().await.map_err(io_error(&entry.path()))?;
			if file_type.is_dir() {
				pending.push((entry.path(), rel));
			} else if file_type.is_file() {
				files.push(rel);
			}
		}
	}

	files.sort();
	Ok(files)
}

/// Record a new content version when the package's manifest changed.
async fn snapshot_version(
	txn: &DatabaseTransaction,
	package: &PackageModel,
	mut manifest: Vec<(String, String, u64)>,
) -> Result<bool, DiscoveryError> {
	manifest.sort();
	let mut hasher = blake3::Hasher::new();
	for (rel_path, hash, _) in &manifest {
		hasher.update(rel_path.as_bytes());
		hasher.update(b"\0");
		hasher.update(hash.as_bytes());
		hasher.update(b"\n");
	}
	let manifest_hash = hasher.finalize().to_hex().to_string();

	let current = match package.active_version_id {
		Some(id) => crate::infra::db::entities::ContentVersion::find_by_id(id)
			.one(txn)
			.await?,
		None => None,
	};
	if current.is_some_and(|v| v.manifest_hash == manifest_hash) {
		return Ok(false);
	}

	let version = ContentVersionActive {
		package_id: Set(package.id),
		manifest_hash: Set(manifest_hash),
		file_count: Set(manifest.len() as i64),
		total_bytes: Set(manifest.iter().map(|(_, _, size)| *size as i64).sum()),
		created_at: Set(Utc::now()),
		..Default::default()
	}
	.insert(txn)
	.await?;

	// Re-read so a package updated earlier in this transaction is not clobbered
	let fresh = Package::find_by_id(package.id)
		.one(txn)
		.await?
		.ok_or_else(|| DbErr::RecordNotFound(format!("package {}", package.id)))?;
	let mut active: PackageActive = fresh.into();
	active.active_version_id = Set(Some(version.id));
	active.update(txn).await?;

	info!(package = %package.name, version = version.id, files = manifest.len(), "New content version");
	Ok(true)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn relative_paths_are_normalized() {
		assert_eq!(
			normalize_rel_path("./common\\traits//t.txt").as_deref(),
			Some("common/traits/t.txt")
		);
		assert_eq!(normalize_rel_path("../escape.txt"), None);
		assert_eq!(normalize_rel_path("/"), None);
	}

	#[tokio::test]
	async fn walk_is_sorted_and_skips_hidden() {
		let dir = tempfile::tempdir().expect("tempdir");
		for rel in ["b.txt", "common/traits/a.txt", ".git/config", "common/.hidden.txt"] {
			let path = dir.path().join(rel);
			std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
			std::fs::write(path, "x").expect("write");
		}

		assert_eq!(
			walk(dir.path()).await.expect("walk"),
			vec!["b.txt".to_string(), "common/traits/a.txt".to_string()]
		);
	}
}
