//! Supervised worker pool
//!
//! The supervisor loop owns the queue: it claims items, hands them to idle
//! workers, funnels results through the [`StoreWriter`], and replaces workers
//! that die or overrun the per-item timeout. One-shot builds and the daemon
//! run the same loop, differing only in when it stops.

mod worker;

pub use worker::{run_worker_stdio, WorkerId, WorkerKind, WorkerReply};

use super::{
	envelope::{EnvelopeOutput, StepError},
	writer::{StoreWriter, WriterError},
};
use crate::infra::queue::{BuildId, CommitOutcome, ItemState, QueueItem};

use serde::{Deserialize, Serialize};
use std::{
	collections::HashMap,
	sync::Arc,
	time::{Duration, Instant},
};
use tokio::{
	sync::{mpsc, Notify},
	time::{interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use worker::WorkerHandle;

const TICK: Duration = Duration::from_millis(200);

#[derive(Debug)]
pub(crate) enum PoolEvent {
	Finished {
		worker_id: WorkerId,
		build_id: BuildId,
		result: Result<EnvelopeOutput, StepError>,
	},
	Exited {
		worker_id: WorkerId,
		/// `None` for an orderly exit after the job channel closed
		reason: Option<String>,
	},
}

/// When the supervisor loop returns
pub enum PoolMode {
	/// Return once the queue is empty and nothing is in flight
	Drain,
	/// Keep serving until `shutdown` fires, then finish in-flight items
	Serve {
		shutdown: CancellationToken,
		wake: Arc<Notify>,
	},
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
	pub workers: usize,
	pub item_timeout: Duration,
	pub claim_batch: u64,
	/// Recorded as `claimed_by` on the queue
	pub holder: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolReport {
	pub committed: u64,
	pub stale: u64,
	pub failed: u64,
	pub requeued: u64,
	pub timed_out: u64,
	pub workers_replaced: u64,
}

struct Slot {
	handle: WorkerHandle,
	current: Option<InFlight>,
}

struct InFlight {
	item: QueueItem,
	deadline: Instant,
}

pub struct WorkerPool {
	writer: Arc<StoreWriter>,
	kind: WorkerKind,
	config: PoolConfig,
}

impl WorkerPool {
	pub fn new(writer: Arc<StoreWriter>, kind: WorkerKind, config: PoolConfig) -> Self {
		Self {
			writer,
			kind,
			config,
		}
	}

	#[instrument(name = "worker_pool", skip_all, fields(workers = self.config.workers))]
	pub async fn run(&self, mode: PoolMode) -> Result<PoolReport, WriterError> {
		let (events_tx, mut events) = mpsc::unbounded_channel();
		let mut slots: HashMap<WorkerId, Slot> = HashMap::new();
		let mut next_id: WorkerId = 0;
		let mut report = PoolReport::default();

		let mut spawn_worker = |slots: &mut HashMap<WorkerId, Slot>| {
			let id = next_id;
			next_id += 1;
			let handle = worker::spawn(id, &self.kind, events_tx.clone());
			slots.insert(
				id,
				Slot {
					handle,
					current: None,
				},
			);
			id
		};

		for _ in 0..self.config.workers.max(1) {
			spawn_worker(&mut slots);
		}
		info!(kind = ?self.kind, "Worker pool started");

		let (shutdown, wake) = match &mode {
			PoolMode::Drain => (CancellationToken::new(), Arc::new(Notify::new())),
			PoolMode::Serve { shutdown, wake } => (shutdown.clone(), Arc::clone(wake)),
		};
		let mut ticker = interval(TICK);
		ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

		loop {
			let accepting = !shutdown.is_cancelled();

			let mut claimed_any = false;
			if accepting {
				claimed_any = self.dispatch(&mut slots, &mut report).await?;
			}

			let in_flight = slots.values().filter(|s| s.current.is_some()).count();
			match mode {
				PoolMode::Drain if in_flight == 0 && !claimed_any => break,
				PoolMode::Serve { .. } if !accepting && in_flight == 0 => break,
				_ => {}
			}

			tokio::select! {
				Some(event) = events.recv() => match event {
					PoolEvent::Finished { worker_id, build_id, result } => {
						self.finished(&mut slots, worker_id, build_id, result, &mut report).await?;
					}
					PoolEvent::Exited { worker_id, reason } => {
						let Some(slot) = slots.remove(&worker_id) else {
							// Already replaced after a timeout
							continue;
						};
						let reason = reason.unwrap_or_else(|| "worker exited".to_string());
						warn!(worker_id, %reason, "Worker exited unexpectedly");
						if let Some(in_flight) = slot.current {
							let state = self.writer.requeue(in_flight.item.build_id, &reason).await?;
							report.requeued += u64::from(state == ItemState::Pending);
							report.failed += u64::from(state == ItemState::Error);
						}
						if !shutdown.is_cancelled() {
							let id = spawn_worker(&mut slots);
							report.workers_replaced += 1;
							info!(worker_id = id, replaces = worker_id, "Spawned replacement worker");
						}
					}
				},
				_ = ticker.tick() => {
					let expired: Vec<WorkerId> = slots
						.iter()
						.filter(|(_, slot)| {
							slot.current
								.as_ref()
								.is_some_and(|f| Instant::now() >= f.deadline)
						})
						.map(|(id, _)| *id)
						.collect();

					for worker_id in expired {
						let Some(slot) = slots.remove(&worker_id) else {
							continue;
						};
						// Kills a child process; an in-process step keeps its
						// blocking thread until it returns
						slot.handle.abort.abort();
						if let Some(in_flight) = slot.current {
							let reason = format!(
								"timed out after {}s",
								self.config.item_timeout.as_secs_f32()
							);
							warn!(worker_id, build_id = in_flight.item.build_id, %reason, "Reclaiming worker");
							self.writer.fail(in_flight.item.build_id, &reason).await?;
							report.timed_out += 1;
						}
						spawn_worker(&mut slots);
						report.workers_replaced += 1;
					}
				},
				_ = wake.notified() => {},
				_ = shutdown.cancelled(), if accepting => {
					info!(in_flight, "Pool draining");
				},
			}
		}

		// Closing the job channels lets workers exit on their own
		for (_, slot) in slots.drain() {
			slot.handle.jobs.close();
		}

		info!(?report, "Worker pool stopped");
		Ok(report)
	}

	/// Claim work for idle workers. Returns whether anything was claimed.
	async fn dispatch(
		&self,
		slots: &mut HashMap<WorkerId, Slot>,
		report: &mut PoolReport,
	) -> Result<bool, WriterError> {
		let mut idle: Vec<WorkerId> = slots
			.iter()
			.filter(|(_, slot)| slot.current.is_none())
			.map(|(id, _)| *id)
			.collect();
		if idle.is_empty() {
			return Ok(false);
		}
		idle.sort_unstable();

		let n = (idle.len() as u64).min(self.config.claim_batch.max(1));
		let items = self.writer.claim(n, &self.config.holder).await?;
		let claimed_any = !items.is_empty();

		for (item, worker_id) in items.into_iter().zip(idle) {
			let job = match self.writer.describe(&item).await {
				Ok(job) => job,
				Err(e) => {
					error!(build_id = item.build_id, "Cannot describe build: {}", e);
					self.writer.fail(item.build_id, &e.to_string()).await?;
					report.failed += 1;
					continue;
				}
			};

			self.writer.mark_processing(item.build_id).await?;

			let Some(slot) = slots.get_mut(&worker_id) else {
				continue;
			};
			if slot.handle.jobs.try_send(job).is_err() {
				let state = self
					.writer
					.requeue(item.build_id, "worker unavailable")
					.await?;
				report.requeued += u64::from(state == ItemState::Pending);
				continue;
			}

			debug!(worker_id, build_id = item.build_id, "Dispatched build");
			slot.current = Some(InFlight {
				item,
				deadline: Instant::now() + self.config.item_timeout,
			});
		}

		Ok(claimed_any)
	}

	async fn finished(
		&self,
		slots: &mut HashMap<WorkerId, Slot>,
		worker_id: WorkerId,
		build_id: BuildId,
		result: Result<EnvelopeOutput, StepError>,
		report: &mut PoolReport,
	) -> Result<(), WriterError> {
		let in_flight = slots
			.get_mut(&worker_id)
			.and_then(|slot| slot.current.take_if(|f| f.item.build_id == build_id));
		let Some(InFlight { item, .. }) = in_flight else {
			// The item was reclaimed (timed out) while the worker finished
			debug!(worker_id, build_id, "Ignoring result for reclaimed build");
			return Ok(());
		};

		match result {
			Ok(output) => match self.writer.commit(&item, output).await {
				Ok(CommitOutcome::Committed) => report.committed += 1,
				Ok(CommitOutcome::Stale) => report.stale += 1,
				Err(e) => {
					error!(build_id, "Commit failed: {}", e);
					let state = self.writer.requeue(build_id, &format!("commit failed: {e}")).await?;
					report.requeued += u64::from(state == ItemState::Pending);
					report.failed += u64::from(state == ItemState::Error);
				}
			},
			Err(step_error) => {
				self.writer.fail(build_id, &step_error.to_string()).await?;
				report.failed += 1;
			}
		}
		Ok(())
	}
}
