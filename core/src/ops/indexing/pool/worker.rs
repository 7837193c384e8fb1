//! Long-lived workers
//!
//! A worker receives jobs on its own bounded channel and reports results on
//! the pool's event channel. It either runs the executor on the blocking pool
//! or drives a `strata worker` child process over JSON lines.

use super::PoolEvent;
use crate::{
	infra::queue::BuildId,
	ops::indexing::envelope::{EnvelopeExecutor, EnvelopeOutput, StepError, WorkerJob},
};

use async_channel as chan;
use serde::{Deserialize, Serialize};
use std::{io, path::PathBuf, process::Stdio, sync::Arc};
use tokio::{
	io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
	process::Command,
	sync::mpsc,
	task::{self, AbortHandle},
};
use tracing::{debug, error, trace, Instrument};

pub type WorkerId = usize;

/// Reply line written by a worker subprocess
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerReply {
	pub build_id: BuildId,
	pub result: Result<EnvelopeOutput, StepError>,
}

/// How workers are realized
#[derive(Clone)]
pub enum WorkerKind {
	/// Tokio task running the executor on the blocking pool
	InProcess(Arc<dyn EnvelopeExecutor>),
	/// Child process speaking JSON lines on stdin/stdout
	Subprocess { program: PathBuf, args: Vec<String> },
}

impl std::fmt::Debug for WorkerKind {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::InProcess(_) => f.write_str("InProcess"),
			Self::Subprocess { program, args } => f
				.debug_struct("Subprocess")
				.field("program", program)
				.field("args", args)
				.finish(),
		}
	}
}

pub(super) struct WorkerHandle {
	pub jobs: chan::Sender<WorkerJob>,
	pub abort: AbortHandle,
}

/// Spawn a worker plus a watcher that reports its exit, however it happens.
pub(super) fn spawn(
	id: WorkerId,
	kind: &WorkerKind,
	events: mpsc::UnboundedSender<PoolEvent>,
) -> WorkerHandle {
	let (jobs_tx, jobs_rx) = chan::bounded(1);

	let span = tracing::debug_span!("pool_worker", worker_id = id);
	let handle = match kind.clone() {
		WorkerKind::InProcess(executor) => task::spawn(
			run_in_process(id, jobs_rx, events.clone(), executor).instrument(span),
		),
		WorkerKind::Subprocess { program, args } => task::spawn(
			run_subprocess(id, jobs_rx, events.clone(), program, args).instrument(span),
		),
	};
	let abort = handle.abort_handle();

	task::spawn(async move {
		let reason = match handle.await {
			Ok(Ok(())) => None,
			Ok(Err(e)) => Some(format!("worker failed: {e}")),
			Err(e) if e.is_panic() => {
				error!(worker_id = id, ?e, "Worker panicked");
				Some("worker panicked".to_string())
			}
			Err(_) => Some("worker aborted".to_string()),
		};
		let _ = events.send(PoolEvent::Exited { worker_id: id, reason });
	});

	WorkerHandle {
		jobs: jobs_tx,
		abort,
	}
}

async fn run_in_process(
	id: WorkerId,
	jobs: chan::Receiver<WorkerJob>,
	events: mpsc::UnboundedSender<PoolEvent>,
	executor: Arc<dyn EnvelopeExecutor>,
) -> io::Result<()> {
	trace!("Worker starting");
	while let Ok(job) = jobs.recv().await {
		let build_id = job.build_id;
		let executor = Arc::clone(&executor);

		let result = match task::spawn_blocking(move || executor.execute(&job)).await {
			Ok(result) => result,
			// Let the watcher see the panic as this worker's death
			Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
			Err(e) => return Err(io::Error::new(io::ErrorKind::Interrupted, e)),
		};

		if events
			.send(PoolEvent::Finished {
				worker_id: id,
				build_id,
				result,
			})
			.is_err()
		{
			break;
		}
	}
	trace!("Worker channel closed, exiting");
	Ok(())
}

async fn run_subprocess(
	id: WorkerId,
	jobs: chan::Receiver<WorkerJob>,
	events: mpsc::UnboundedSender<PoolEvent>,
	program: PathBuf,
	args: Vec<String>,
) -> io::Result<()> {
	let mut child = Command::new(&program)
		.args(&args)
		.stdin(Stdio::piped())
		.stdout(Stdio::piped())
		.stderr(Stdio::inherit())
		.kill_on_drop(true)
		.spawn()?;
	debug!(pid = child.id(), "Spawned worker process");

	let mut stdin = child
		.stdin
		.take()
		.ok_or_else(|| io::Error::other("worker stdin unavailable"))?;
	let mut replies = BufReader::new(
		child
			.stdout
			.take()
			.ok_or_else(|| io::Error::other("worker stdout unavailable"))?,
	)
	.lines();

	while let Ok(job) = jobs.recv().await {
		let build_id = job.build_id;
		let mut line = serde_json::to_string(&job).map_err(io::Error::other)?;
		line.push('\n');
		stdin.write_all(line.as_bytes()).await?;
		stdin.flush().await?;

		let Some(reply) = replies.next_line().await? else {
			let status = child.wait().await?;
			return Err(io::Error::other(format!(
				"worker process exited with {status}"
			)));
		};

		let result = match serde_json::from_str::<WorkerReply>(&reply) {
			Ok(reply) if reply.build_id == build_id => reply.result,
			Ok(reply) => Err(StepError::Protocol(format!(
				"expected reply for build {build_id}, got {}",
				reply.build_id
			))),
			Err(e) => Err(StepError::Protocol(e.to_string())),
		};

		if events
			.send(PoolEvent::Finished {
				worker_id: id,
				build_id,
				result,
			})
			.is_err()
		{
			break;
		}
	}

	drop(stdin);
	let status = child.wait().await?;
	debug!(%status, "Worker process exited");
	Ok(())
}

/// Entry point of a `strata worker` process: one JSON job per stdin line, one
/// JSON [`WorkerReply`] per stdout line, until stdin closes.
pub async fn run_worker_stdio(executor: Arc<dyn EnvelopeExecutor>) -> io::Result<()> {
	let mut lines = BufReader::new(tokio::io::stdin()).lines();
	let mut stdout = tokio::io::stdout();

	while let Some(line) = lines.next_line().await? {
		if line.trim().is_empty() {
			continue;
		}
		let job: WorkerJob = serde_json::from_str(&line).map_err(io::Error::other)?;
		let build_id = job.build_id;

		let executor = Arc::clone(&executor);
		let result = task::spawn_blocking(move || executor.execute(&job))
			.await
			.map_err(io::Error::other)?;

		let mut reply =
			serde_json::to_string(&WorkerReply { build_id, result }).map_err(io::Error::other)?;
		reply.push('\n');
		stdout.write_all(reply.as_bytes()).await?;
		stdout.flush().await?;
	}

	Ok(())
}
