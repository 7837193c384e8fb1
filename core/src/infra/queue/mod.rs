//! Durable build queue
//!
//! Items are claimed highest priority first, then in build id order. Every
//! operation takes a connection so the writer can fold queue transitions into
//! the same transaction as the data they describe.

mod types;

pub use types::{BuildId, CommitOutcome, ItemState, Priority, QueueItem, QueueStats};

use crate::{
	domain::{ContentHash, FileId},
	infra::db::entities::{build_queue, BuildQueueActive, BuildQueueItem},
	ops::indexing::routing::EnvelopeKind,
};

use chrono::Utc;
use sea_orm::{
	sea_query::Expr, ActiveModelTrait, ColumnTrait, ConnectionTrait, DbBackend, DbErr,
	EntityTrait, FromQueryResult, QueryFilter, QueryOrder, QuerySelect, Set, Statement,
	TransactionTrait,
};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum QueueError {
	#[error("database error: {0}")]
	Database(#[from] DbErr),
	#[error("build {0} not found")]
	NotFound(BuildId),
	#[error("build {build_id} cannot move from {from} to {to}")]
	InvalidTransition {
		build_id: BuildId,
		from: ItemState,
		to: ItemState,
	},
	#[error("build {build_id} has corrupt column {detail}")]
	Corrupt { build_id: BuildId, detail: String },
}

#[derive(Debug, Clone)]
pub struct BuildQueue {
	max_attempts: i32,
}

#[derive(FromQueryResult)]
struct StateCount {
	state: String,
	outcome: Option<String>,
	count: i64,
}

#[derive(FromQueryResult)]
struct MaxBuild {
	max_id: Option<i32>,
}

impl BuildQueue {
	pub fn new(max_attempts: i32) -> Self {
		Self {
			max_attempts: max_attempts.max(1),
		}
	}

	pub fn max_attempts(&self) -> i32 {
		self.max_attempts
	}

	pub async fn enqueue<C: ConnectionTrait>(
		&self,
		conn: &C,
		file_id: FileId,
		envelope: EnvelopeKind,
		priority: Priority,
		hash: &ContentHash,
	) -> Result<BuildId, QueueError> {
		let item = BuildQueueActive {
			file_id: Set(file_id),
			envelope: Set(envelope.to_string()),
			priority: Set(priority.value()),
			state: Set(ItemState::Pending.to_string()),
			content_hash: Set(hash.to_string()),
			attempts: Set(0),
			claimed_by: Set(None),
			error: Set(None),
			outcome: Set(None),
			enqueued_at: Set(Utc::now()),
			claimed_at: Set(None),
			finished_at: Set(None),
			..Default::default()
		}
		.insert(conn)
		.await?;

		debug!(build_id = item.build_id, file_id, %priority, %envelope, "Enqueued build");
		Ok(item.build_id)
	}

	pub async fn get<C: ConnectionTrait>(
		&self,
		conn: &C,
		build_id: BuildId,
	) -> Result<QueueItem, QueueError> {
		BuildQueueItem::find_by_id(build_id)
			.one(conn)
			.await?
			.ok_or(QueueError::NotFound(build_id))?
			.try_into()
	}

	/// Atomically move up to `n` pending items to `claimed` for `holder`
	pub async fn claim<C: TransactionTrait>(
		&self,
		db: &C,
		n: u64,
		holder: &str,
	) -> Result<Vec<QueueItem>, QueueError> {
		let txn = db.begin().await?;

		let rows = BuildQueueItem::find()
			.filter(build_queue::Column::State.eq(ItemState::Pending.to_string()))
			.order_by_desc(build_queue::Column::Priority)
			.order_by_asc(build_queue::Column::BuildId)
			.limit(n)
			.all(&txn)
			.await?;

		if rows.is_empty() {
			txn.commit().await?;
			return Ok(Vec::new());
		}

		let ids: Vec<BuildId> = rows.iter().map(|row| row.build_id).collect();
		BuildQueueItem::update_many()
			.col_expr(
				build_queue::Column::State,
				Expr::value(ItemState::Claimed.to_string()),
			)
			.col_expr(build_queue::Column::ClaimedBy, Expr::value(holder))
			.col_expr(build_queue::Column::ClaimedAt, Expr::value(Utc::now()))
			.filter(build_queue::Column::BuildId.is_in(ids))
			.exec(&txn)
			.await?;

		txn.commit().await?;

		rows.into_iter()
			.map(|row| {
				let mut item = QueueItem::try_from(row)?;
				item.state = ItemState::Claimed;
				Ok(item)
			})
			.collect()
	}

	pub async fn mark_processing<C: ConnectionTrait>(
		&self,
		conn: &C,
		build_id: BuildId,
	) -> Result<(), QueueError> {
		self.transition(
			conn,
			build_id,
			&[ItemState::Claimed],
			ItemState::Processing,
			BuildQueueActive {
				state: Set(ItemState::Processing.to_string()),
				..Default::default()
			},
		)
		.await
	}

	pub async fn complete<C: ConnectionTrait>(
		&self,
		conn: &C,
		build_id: BuildId,
		outcome: CommitOutcome,
	) -> Result<(), QueueError> {
		self.transition(
			conn,
			build_id,
			&[ItemState::Claimed, ItemState::Processing],
			ItemState::Completed,
			BuildQueueActive {
				state: Set(ItemState::Completed.to_string()),
				outcome: Set(Some(outcome.to_string())),
				finished_at: Set(Some(Utc::now())),
				..Default::default()
			},
		)
		.await
	}

	/// Terminal failure, never retried
	pub async fn fail<C: ConnectionTrait>(
		&self,
		conn: &C,
		build_id: BuildId,
		reason: &str,
	) -> Result<(), QueueError> {
		warn!(build_id, %reason, "Build failed");
		self.transition(
			conn,
			build_id,
			&[ItemState::Claimed, ItemState::Processing],
			ItemState::Error,
			BuildQueueActive {
				state: Set(ItemState::Error.to_string()),
				error: Set(Some(reason.to_string())),
				finished_at: Set(Some(Utc::now())),
				..Default::default()
			},
		)
		.await
	}

	/// Crash path: count the attempt and put the item back, or give up once
	/// the attempt budget is spent. Returns the state the item ended in.
	pub async fn requeue<C: ConnectionTrait>(
		&self,
		conn: &C,
		build_id: BuildId,
		reason: &str,
	) -> Result<ItemState, QueueError> {
		let item = self.get(conn, build_id).await?;
		let attempts = item.attempts + 1;

		let (state, update) = if attempts >= self.max_attempts {
			warn!(build_id, attempts, %reason, "Build exhausted its attempts");
			(
				ItemState::Error,
				BuildQueueActive {
					state: Set(ItemState::Error.to_string()),
					attempts: Set(attempts),
					error: Set(Some(format!("{reason} (after {attempts} attempts)"))),
					finished_at: Set(Some(Utc::now())),
					..Default::default()
				},
			)
		} else {
			info!(build_id, attempts, %reason, "Requeued build");
			(
				ItemState::Pending,
				BuildQueueActive {
					state: Set(ItemState::Pending.to_string()),
					attempts: Set(attempts),
					error: Set(Some(reason.to_string())),
					claimed_by: Set(None),
					claimed_at: Set(None),
					..Default::default()
				},
			)
		};

		self.transition(
			conn,
			build_id,
			&[ItemState::Claimed, ItemState::Processing],
			state,
			update,
		)
		.await?;
		Ok(state)
	}

	/// Requeue every item left `claimed` or `processing` by a previous holder.
	///
	/// Only called by the process that holds the writer lock, so no live
	/// holder can own such an item.
	pub async fn recover_abandoned<C: ConnectionTrait>(&self, conn: &C) -> Result<u64, QueueError> {
		let abandoned = BuildQueueItem::find()
			.filter(build_queue::Column::State.is_in([
				ItemState::Claimed.to_string(),
				ItemState::Processing.to_string(),
			]))
			.order_by_asc(build_queue::Column::BuildId)
			.all(conn)
			.await?;

		let count = abandoned.len() as u64;
		for row in abandoned {
			let holder = row.claimed_by.clone().unwrap_or_default();
			self.requeue(conn, row.build_id, &format!("abandoned by {holder}"))
				.await?;
		}

		if count > 0 {
			info!(count, "Recovered abandoned builds");
		}
		Ok(count)
	}

	/// Whether a not-yet-finished item exists for the file
	pub async fn has_active_for<C: ConnectionTrait>(
		&self,
		conn: &C,
		file_id: FileId,
	) -> Result<bool, QueueError> {
		let found = BuildQueueItem::find()
			.filter(build_queue::Column::FileId.eq(file_id))
			.filter(build_queue::Column::State.is_in([
				ItemState::Pending.to_string(),
				ItemState::Claimed.to_string(),
				ItemState::Processing.to_string(),
			]))
			.one(conn)
			.await?;
		Ok(found.is_some())
	}

	/// Most recently enqueued item for the file
	pub async fn latest_for<C: ConnectionTrait>(
		&self,
		conn: &C,
		file_id: FileId,
	) -> Result<Option<QueueItem>, QueueError> {
		BuildQueueItem::find()
			.filter(build_queue::Column::FileId.eq(file_id))
			.order_by_desc(build_queue::Column::BuildId)
			.one(conn)
			.await?
			.map(QueueItem::try_from)
			.transpose()
	}

	/// Whether an item newer than `build_id` exists for the file
	pub async fn has_newer_for<C: ConnectionTrait>(
		&self,
		conn: &C,
		file_id: FileId,
		build_id: BuildId,
	) -> Result<bool, QueueError> {
		let found = BuildQueueItem::find()
			.filter(build_queue::Column::FileId.eq(file_id))
			.filter(build_queue::Column::BuildId.gt(build_id))
			.filter(build_queue::Column::State.ne(ItemState::Error.to_string()))
			.one(conn)
			.await?;
		Ok(found.is_some())
	}

	pub async fn stats<C: ConnectionTrait>(&self, conn: &C) -> Result<QueueStats, QueueError> {
		let counts = StateCount::find_by_statement(Statement::from_string(
			DbBackend::Sqlite,
			"SELECT state, outcome, COUNT(*) AS count FROM build_queue GROUP BY state, outcome",
		))
		.all(conn)
		.await?;

		let mut stats = QueueStats::default();
		for row in counts {
			let count = row.count.max(0) as u64;
			match row.state.parse::<ItemState>() {
				Ok(ItemState::Pending) => stats.pending += count,
				Ok(ItemState::Claimed) => stats.claimed += count,
				Ok(ItemState::Processing) => stats.processing += count,
				Ok(ItemState::Completed) => stats.completed += count,
				Ok(ItemState::Error) => stats.error += count,
				Err(_) => warn!(state = %row.state, "Unknown queue state"),
			}
			if row.outcome.as_deref() == Some(CommitOutcome::Stale.to_string().as_str()) {
				stats.stale += count;
			}
		}

		stats.last_build_id = MaxBuild::find_by_statement(Statement::from_string(
			DbBackend::Sqlite,
			"SELECT MAX(build_id) AS max_id FROM build_queue",
		))
		.one(conn)
		.await?
		.and_then(|row| row.max_id);

		Ok(stats)
	}

	async fn transition<C: ConnectionTrait>(
		&self,
		conn: &C,
		build_id: BuildId,
		from: &[ItemState],
		to: ItemState,
		update: BuildQueueActive,
	) -> Result<(), QueueError> {
		let result = BuildQueueItem::update_many()
			.set(update)
			.filter(build_queue::Column::BuildId.eq(build_id))
			.filter(build_queue::Column::State.is_in(from.iter().map(ToString::to_string)))
			.exec(conn)
			.await?;

		if result.rows_affected == 0 {
			let current = self.get(conn, build_id).await?;
			return Err(QueueError::InvalidTransition {
				build_id,
				from: current.state,
				to,
			});
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::infra::db::{
		entities::{PackageActive, SourceFileActive},
		Database,
	};
	use pretty_assertions::assert_eq;

	async fn setup() -> (tempfile::TempDir, Database, FileId) {
		let dir = tempfile::tempdir().expect("tempdir");
		let db = Database::create(&dir.path().join("q.db")).await.expect("db");
		db.migrate().await.expect("migrate");

		let package = PackageActive {
			name: Set("game".into()),
			root: Set("/game".into()),
			load_index: Set(0),
			replace_paths: Set(serde_json::json!([])),
			active_version_id: Set(None),
			created_at: Set(Utc::now()),
			updated_at: Set(Utc::now()),
			..Default::default()
		}
		.insert(db.conn())
		.await
		.expect("package");

		let file = SourceFileActive {
			package_id: Set(package.id),
			rel_path: Set("common/traits/t.txt".into()),
			envelope: Set(EnvelopeKind::Full.to_string()),
			mtime_ns: Set(0),
			size: Set(0),
			content_hash: Set("00".into()),
			processed_hash: Set(None),
			last_build_id: Set(None),
			deleted: Set(false),
			updated_at: Set(Utc::now()),
			..Default::default()
		}
		.insert(db.conn())
		.await
		.expect("file");

		(dir, db, file.id)
	}

	#[tokio::test]
	async fn claims_by_priority_then_build_id() {
		let (_dir, db, file_id) = setup().await;
		let queue = BuildQueue::new(3);
		let hash = ContentHash::of(b"x");

		let a = queue
			.enqueue(db.conn(), file_id, EnvelopeKind::Full, Priority::Normal, &hash)
			.await
			.expect("a");
		let b = queue
			.enqueue(db.conn(), file_id, EnvelopeKind::Full, Priority::Normal, &hash)
			.await
			.expect("b");
		let flash = queue
			.enqueue(db.conn(), file_id, EnvelopeKind::Full, Priority::Flash, &hash)
			.await
			.expect("flash");
		assert!(a < b && b < flash);

		let claimed = queue.claim(db.conn(), 2, "test").await.expect("claim");
		assert_eq!(
			claimed.iter().map(|i| i.build_id).collect::<Vec<_>>(),
			vec![flash, a]
		);
		assert!(claimed.iter().all(|i| i.state == ItemState::Claimed));

		let rest = queue.claim(db.conn(), 10, "test").await.expect("claim");
		assert_eq!(rest.len(), 1);
		assert_eq!(rest[0].build_id, b);
		assert!(queue.claim(db.conn(), 10, "test").await.expect("claim").is_empty());
	}

	#[tokio::test]
	async fn requeue_counts_attempts_until_error() {
		let (_dir, db, file_id) = setup().await;
		let queue = BuildQueue::new(2);
		let id = queue
			.enqueue(
				db.conn(),
				file_id,
				EnvelopeKind::Full,
				Priority::Normal,
				&ContentHash::of(b"x"),
			)
			.await
			.expect("enqueue");

		queue.claim(db.conn(), 1, "w").await.expect("claim");
		assert_eq!(
			queue.requeue(db.conn(), id, "worker exited").await.expect("requeue"),
			ItemState::Pending
		);

		queue.claim(db.conn(), 1, "w").await.expect("claim");
		queue.mark_processing(db.conn(), id).await.expect("processing");
		assert_eq!(
			queue.requeue(db.conn(), id, "worker exited").await.expect("requeue"),
			ItemState::Error
		);

		let item = queue.get(db.conn(), id).await.expect("get");
		assert_eq!(item.attempts, 2);
		assert!(matches!(
			queue.complete(db.conn(), id, CommitOutcome::Committed).await,
			Err(QueueError::InvalidTransition { .. })
		));
	}

	#[tokio::test]
	async fn abandoned_items_return_to_pending() {
		let (_dir, db, file_id) = setup().await;
		let queue = BuildQueue::new(3);
		let hash = ContentHash::of(b"x");
		for _ in 0..3 {
			queue
				.enqueue(db.conn(), file_id, EnvelopeKind::Full, Priority::Normal, &hash)
				.await
				.expect("enqueue");
		}

		let claimed = queue.claim(db.conn(), 2, "dead").await.expect("claim");
		queue
			.mark_processing(db.conn(), claimed[0].build_id)
			.await
			.expect("processing");

		assert_eq!(queue.recover_abandoned(db.conn()).await.expect("recover"), 2);

		let stats = queue.stats(db.conn()).await.expect("stats");
		assert_eq!(stats.pending, 3);
		assert_eq!(stats.active(), 3);
		assert_eq!(stats.last_build_id, Some(claimed[0].build_id + 2));
	}
}
