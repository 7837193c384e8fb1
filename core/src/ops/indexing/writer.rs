//! The single writer path
//!
//! Every mutation of the index goes through [`StoreWriter`], which serializes
//! callers behind one async mutex. A worker result is committed in a single
//! transaction together with its queue transition, or discarded as stale.

use super::{
	envelope::{EnvelopeOutput, WorkerJob},
	routing::EnvelopeKind,
};
use crate::{
	domain::{ContentHash, FileId, SymbolIdentity},
	infra::{
		db::{
			entities::{
				source_file, symbol, symbol_reference, ContentBlob, ContentBlobActive, Package,
				SourceFile, SourceFileActive, SourceFileModel, Symbol, SymbolActive,
				SymbolReference, SymbolReferenceActive,
			},
			Database,
		},
		queue::{BuildId, BuildQueue, CommitOutcome, ItemState, Priority, QueueError, QueueItem},
		store::{fingerprint, stamp},
	},
	ops::parse::{symbol_type_for, LOCALIZATION_SYMBOL_TYPE},
};

use chrono::Utc;
use sea_orm::{
	ActiveModelTrait, ColumnTrait, ConnectionTrait, DbErr, EntityTrait, QueryFilter, Set,
	TransactionTrait,
};
use std::{
	collections::BTreeSet,
	path::{Path, PathBuf},
	str::FromStr,
};
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum WriterError {
	#[error("database error: {0}")]
	Database(#[from] DbErr),
	#[error(transparent)]
	Queue(#[from] QueueError),
	#[error("source file {0} not found")]
	FileNotFound(FileId),
	#[error("package {0} not found")]
	PackageNotFound(i32),
	#[error("failed to encode symbol body: {0}")]
	Encode(#[from] serde_json::Error),
}

pub struct StoreWriter {
	db: Database,
	queue: BuildQueue,
	gate: Mutex<()>,
}

impl StoreWriter {
	pub fn new(db: Database, queue: BuildQueue) -> Self {
		Self {
			db,
			queue,
			gate: Mutex::new(()),
		}
	}

	pub fn db(&self) -> &Database {
		&self.db
	}

	pub fn queue(&self) -> &BuildQueue {
		&self.queue
	}

	/// Exclusive access to the writer path for multi-step mutations
	/// (discovery, single-file enqueue).
	pub async fn lock(&self) -> MutexGuard<'_, ()> {
		self.gate.lock().await
	}

	pub async fn claim(&self, n: u64, holder: &str) -> Result<Vec<QueueItem>, WriterError> {
		let _gate = self.gate.lock().await;
		Ok(self.queue.claim(self.db.conn(), n, holder).await?)
	}

	pub async fn mark_processing(&self, build_id: BuildId) -> Result<(), WriterError> {
		let _gate = self.gate.lock().await;
		Ok(self.queue.mark_processing(self.db.conn(), build_id).await?)
	}

	pub async fn fail(&self, build_id: BuildId, reason: &str) -> Result<(), WriterError> {
		let _gate = self.gate.lock().await;
		Ok(self.queue.fail(self.db.conn(), build_id, reason).await?)
	}

	pub async fn requeue(&self, build_id: BuildId, reason: &str) -> Result<ItemState, WriterError> {
		let _gate = self.gate.lock().await;
		Ok(self.queue.requeue(self.db.conn(), build_id, reason).await?)
	}

	pub async fn recover_abandoned(&self) -> Result<u64, WriterError> {
		let _gate = self.gate.lock().await;
		Ok(self.queue.recover_abandoned(self.db.conn()).await?)
	}

	/// Resolve a claimed item into the job a worker runs
	pub async fn describe(&self, item: &QueueItem) -> Result<WorkerJob, WriterError> {
		let (file, root) = file_with_root(self.db.conn(), item.file_id).await?;
		Ok(WorkerJob {
			build_id: item.build_id,
			path: root.join(&file.rel_path),
			rel_path: file.rel_path,
			envelope: item.envelope,
		})
	}

	/// Commit a worker result for `item`, or record it as stale.
	///
	/// A result is stale when the file was deleted, when a newer build already
	/// committed, or when the bytes on disk no longer match what the worker
	/// read. In the last case a fresh item is enqueued unless one is pending.
	pub async fn commit(
		&self,
		item: &QueueItem,
		output: EnvelopeOutput,
	) -> Result<CommitOutcome, WriterError> {
		let _gate = self.gate.lock().await;
		let txn = self.db.conn().begin().await?;

		let (file, root) = file_with_root(&txn, item.file_id).await?;

		let superseded = file.deleted
			|| file
				.last_build_id
				.is_some_and(|committed| committed >= item.build_id);
		if superseded {
			self.queue
				.complete(&txn, item.build_id, CommitOutcome::Stale)
				.await?;
			txn.commit().await?;
			debug!(build_id = item.build_id, file = %file.rel_path, "Discarded superseded result");
			return Ok(CommitOutcome::Stale);
		}

		let path = root.join(&file.rel_path);
		let Some(current) = current_disk_state(&path, &output).await else {
			self.queue
				.complete(&txn, item.build_id, CommitOutcome::Stale)
				.await?;
			txn.commit().await?;
			debug!(build_id = item.build_id, file = %file.rel_path, "File vanished before commit");
			return Ok(CommitOutcome::Stale);
		};

		if current.hash != output.fingerprint.hash {
			self.queue
				.complete(&txn, item.build_id, CommitOutcome::Stale)
				.await?;
			if !self
				.queue
				.has_newer_for(&txn, file.id, item.build_id)
				.await?
			{
				let build_id = self
					.queue
					.enqueue(&txn, file.id, item.envelope, Priority::Normal, &current.hash)
					.await?;
				debug!(build_id, file = %file.rel_path, "Enqueued rebuild for changed file");
			}
			txn.commit().await?;
			info!(
				build_id = item.build_id,
				file = %file.rel_path,
				"Discarded result for content that changed on disk"
			);
			return Ok(CommitOutcome::Stale);
		}

		ensure_blob(&txn, &output.fingerprint.hash, output.fingerprint.size).await?;

		let previous = owned_identities(&txn, file.id).await?;
		Symbol::delete_many()
			.filter(symbol::Column::FileId.eq(file.id))
			.exec(&txn)
			.await?;
		SymbolReference::delete_many()
			.filter(symbol_reference::Column::FileId.eq(file.id))
			.exec(&txn)
			.await?;

		let mut owned = BTreeSet::new();
		let mut rows = Vec::new();
		for extracted in &output.symbols {
			if !claim_identity(&txn, &file, &extracted.identity).await? {
				continue;
			}
			owned.insert(extracted.identity.clone());
			rows.push(SymbolActive {
				package_id: Set(file.package_id),
				file_id: Set(file.id),
				symbol_type: Set(extracted.identity.symbol_type.clone()),
				scope: Set(extracted.identity.scope.clone()),
				name: Set(extracted.identity.name.clone()),
				line: Set(extracted.line as i32),
				body: Set(serde_json::to_value(&extracted.body)?),
				..Default::default()
			});
		}
		if !rows.is_empty() {
			Symbol::insert_many(rows).exec(&txn).await?;
		}

		let references: Vec<_> = output
			.references
			.iter()
			.map(|reference| SymbolReferenceActive {
				package_id: Set(file.package_id),
				file_id: Set(file.id),
				from_symbol: Set(reference.from.as_ref().map(ToString::to_string)),
				key: Set(reference.key.clone()),
				target_type: Set(reference.target_type.clone()),
				target_name: Set(reference.target_name.clone()),
				line: Set(reference.line as i32),
				..Default::default()
			})
			.collect();
		if !references.is_empty() {
			SymbolReference::insert_many(references).exec(&txn).await?;
		}

		let dropped: BTreeSet<_> = previous.difference(&owned).cloned().collect();
		if !dropped.is_empty() {
			self.requeue_shadowed(&txn, &file, &dropped).await?;
		}

		let mut active: SourceFileActive = file.clone().into();
		active.processed_hash = Set(Some(output.fingerprint.hash.to_string()));
		active.last_build_id = Set(Some(item.build_id));
		active.content_hash = Set(current.hash.to_string());
		active.mtime_ns = Set(current.mtime_ns);
		active.size = Set(current.size as i64);
		active.updated_at = Set(Utc::now());
		active.update(&txn).await?;

		self.queue
			.complete(&txn, item.build_id, CommitOutcome::Committed)
			.await?;
		txn.commit().await?;

		debug!(
			build_id = item.build_id,
			file = %file.rel_path,
			symbols = owned.len(),
			references = output.references.len(),
			"Committed build"
		);
		Ok(CommitOutcome::Committed)
	}

	/// Remove a file's symbols and references, marking it deleted. Runs in the
	/// caller's transaction.
	pub async fn retire_file<C: ConnectionTrait>(
		&self,
		conn: &C,
		file: &SourceFileModel,
	) -> Result<(), WriterError> {
		let previous = owned_identities(conn, file.id).await?;

		Symbol::delete_many()
			.filter(symbol::Column::FileId.eq(file.id))
			.exec(conn)
			.await?;
		SymbolReference::delete_many()
			.filter(symbol_reference::Column::FileId.eq(file.id))
			.exec(conn)
			.await?;

		// A revived row must build again even when its bytes are unchanged
		let mut active: SourceFileActive = file.clone().into();
		active.deleted = Set(true);
		active.processed_hash = Set(None);
		active.updated_at = Set(Utc::now());
		active.update(conn).await?;

		if !previous.is_empty() {
			self.requeue_shadowed(conn, file, &previous).await?;
		}
		Ok(())
	}

	/// A file gave up identities it owned. Other live files of the package
	/// may define them too but lost the in-package tie-break, so rebuild every
	/// file that can define a symbol of a dropped type.
	async fn requeue_shadowed<C: ConnectionTrait>(
		&self,
		conn: &C,
		file: &SourceFileModel,
		dropped: &BTreeSet<SymbolIdentity>,
	) -> Result<(), WriterError> {
		let types: BTreeSet<&str> = dropped.iter().map(|i| i.symbol_type.as_str()).collect();

		let candidates = SourceFile::find()
			.filter(source_file::Column::PackageId.eq(file.package_id))
			.filter(source_file::Column::Id.ne(file.id))
			.filter(source_file::Column::Deleted.eq(false))
			.all(conn)
			.await?;

		for candidate in candidates {
			let Ok(envelope) = EnvelopeKind::from_str(&candidate.envelope) else {
				continue;
			};
			if !may_define(envelope, &candidate.rel_path, &types)
				|| candidate.processed_hash.is_none()
				|| self.queue.has_active_for(conn, candidate.id).await?
			{
				continue;
			}
			self.queue
				.enqueue(
					conn,
					candidate.id,
					envelope,
					Priority::Normal,
					&ContentHash::from(candidate.content_hash.clone()),
				)
				.await?;
			debug!(file = %candidate.rel_path, "Requeued file for shadowed identities");
		}
		Ok(())
	}
}

/// Whether a file routed to `envelope` can produce a symbol of one of `types`
fn may_define(envelope: EnvelopeKind, rel_path: &str, types: &BTreeSet<&str>) -> bool {
	match envelope {
		EnvelopeKind::Full => {
			symbol_type_for(rel_path).is_some_and(|t| types.contains(t.as_str()))
		}
		EnvelopeKind::Localization => types.contains(LOCALIZATION_SYMBOL_TYPE),
		EnvelopeKind::ParseOnly | EnvelopeKind::Skip => false,
	}
}

/// The disk state to commit against, if it still matches the worker's bytes.
/// Returns `None` when the file cannot be read anymore.
async fn current_disk_state(path: &Path, output: &EnvelopeOutput) -> Option<crate::domain::Fingerprint> {
	let metadata = match tokio::fs::metadata(path).await {
		Ok(metadata) => metadata,
		Err(e) => {
			warn!(?path, "Failed to stat file at commit: {}", e);
			return None;
		}
	};

	let (mtime_ns, size) = stamp(&metadata);
	if output.fingerprint.same_metadata(mtime_ns, size) {
		return Some(output.fingerprint.clone());
	}

	match fingerprint(path).await {
		Ok((current, _)) => Some(current),
		Err(e) => {
			warn!(?path, "Failed to rehash file at commit: {}", e);
			None
		}
	}
}

async fn file_with_root<C: ConnectionTrait>(
	conn: &C,
	file_id: FileId,
) -> Result<(SourceFileModel, PathBuf), WriterError> {
	let file = SourceFile::find_by_id(file_id)
		.one(conn)
		.await?
		.ok_or(WriterError::FileNotFound(file_id))?;
	let package = Package::find_by_id(file.package_id)
		.one(conn)
		.await?
		.ok_or(WriterError::PackageNotFound(file.package_id))?;
	Ok((file, PathBuf::from(package.root)))
}

async fn ensure_blob<C: ConnectionTrait>(
	conn: &C,
	hash: &ContentHash,
	size: u64,
) -> Result<(), WriterError> {
	if ContentBlob::find_by_id(hash.to_string())
		.one(conn)
		.await?
		.is_none()
	{
		ContentBlobActive {
			hash: Set(hash.to_string()),
			size: Set(size as i64),
			created_at: Set(Utc::now()),
		}
		.insert(conn)
		.await?;
	}
	Ok(())
}

pub(crate) async fn ensure_blob_row<C: ConnectionTrait>(
	conn: &C,
	hash: &ContentHash,
	size: u64,
) -> Result<(), DbErr> {
	match ensure_blob(conn, hash, size).await {
		Ok(()) => Ok(()),
		Err(WriterError::Database(e)) => Err(e),
		Err(other) => Err(DbErr::Custom(other.to_string())),
	}
}

async fn owned_identities<C: ConnectionTrait>(
	conn: &C,
	file_id: FileId,
) -> Result<BTreeSet<SymbolIdentity>, WriterError> {
	Ok(Symbol::find()
		.filter(symbol::Column::FileId.eq(file_id))
		.all(conn)
		.await?
		.into_iter()
		.map(|row| SymbolIdentity::new(row.symbol_type, row.scope, row.name))
		.collect())
}

/// In-package tie-break: when two files of one package define the same
/// identity, the file whose relative path sorts last owns it. Returns whether
/// `file` may take the identity, evicting the current owner if needed.
async fn claim_identity<C: ConnectionTrait>(
	conn: &C,
	file: &SourceFileModel,
	identity: &SymbolIdentity,
) -> Result<bool, WriterError> {
	let Some(existing) = Symbol::find()
		.filter(symbol::Column::PackageId.eq(file.package_id))
		.filter(symbol::Column::SymbolType.eq(identity.symbol_type.as_str()))
		.filter(symbol::Column::Scope.eq(identity.scope.as_str()))
		.filter(symbol::Column::Name.eq(identity.name.as_str()))
		.one(conn)
		.await?
	else {
		return Ok(true);
	};

	let owner = SourceFile::find_by_id(existing.file_id).one(conn).await?;
	let keep_existing = owner
		.as_ref()
		.is_some_and(|owner| !owner.deleted && owner.rel_path > file.rel_path);
	if keep_existing {
		return Ok(false);
	}

	Symbol::delete_by_id(existing.id).exec(conn).await?;
	Ok(true)
}
