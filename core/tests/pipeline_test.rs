//! Discovery, queue and worker pool behavior against a real store

mod helpers;

use helpers::{bump_mtime, TestEnv};
use pretty_assertions::assert_eq;
use std::{
	fs,
	path::Path,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc,
	},
	time::Duration,
};
use strata_core::{
	infra::queue::{CommitOutcome, Priority},
	ops::{
		indexing::{
			EnvelopeExecutor, EnvelopeOutput, ScriptExecutor, StepError, WorkerJob, WorkerKind,
		},
		merge::MergeVerdict,
	},
	Core, CoreError,
};

fn scalar<'a>(verdicts: &'a [MergeVerdict], identity: &str, key: &str) -> Option<&'a str> {
	verdicts
		.iter()
		.find(|v| v.identity.to_string() == identity)
		.and_then(|v| v.effective.get(key))
		.and_then(|value| value.as_scalar())
}

fn executor(core: &Core) -> ScriptExecutor {
	ScriptExecutor::new(core.blobs().clone())
}

/// Rewrites the file after the first execution, as an editor saving mid-build would
struct RewriteOnce {
	inner: ScriptExecutor,
	replacement: &'static str,
	done: AtomicBool,
}

impl EnvelopeExecutor for RewriteOnce {
	fn execute(&self, job: &WorkerJob) -> Result<EnvelopeOutput, StepError> {
		let output = self.inner.execute(job)?;
		if !self.done.swap(true, Ordering::SeqCst) {
			fs::write(&job.path, self.replacement).expect("rewrite");
		}
		Ok(output)
	}
}

struct PanicOnce {
	inner: ScriptExecutor,
	panicked: AtomicBool,
}

impl EnvelopeExecutor for PanicOnce {
	fn execute(&self, job: &WorkerJob) -> Result<EnvelopeOutput, StepError> {
		if !self.panicked.swap(true, Ordering::SeqCst) {
			panic!("executor blew up on {}", job.rel_path);
		}
		self.inner.execute(job)
	}
}

struct Sleepy {
	inner: ScriptExecutor,
	delay: Duration,
}

impl EnvelopeExecutor for Sleepy {
	fn execute(&self, job: &WorkerJob) -> Result<EnvelopeOutput, StepError> {
		std::thread::sleep(self.delay);
		self.inner.execute(job)
	}
}

#[tokio::test]
async fn test_discovery_is_idempotent() -> Result<(), Box<dyn std::error::Error>> {
	let env = TestEnv::new();
	env.write("game", "common/traits/base.txt", "brave = { level = 1 }\n");
	env.write("mod_a", "events/test.txt", "namespace = test\ntest.1 = { }\n");
	env.write("mod_a", "readme.md", "not routed\n");
	let core = env.core().await;

	let first = core.discover(false).await?;
	assert_eq!(first.packages, 3);
	assert_eq!(first.new_files, 2);
	assert_eq!(first.skipped, 1);
	assert_eq!(first.enqueued, 2);
	// One content version per package, empty ones included
	assert_eq!(first.versions_created, 3);

	// Still pending, nothing new to enqueue
	let second = core.discover(false).await?;
	assert_eq!(second.unchanged, 2);
	assert_eq!(second.enqueued, 0);
	assert_eq!(second.versions_created, 0);

	let report = core.build().await?;
	assert_eq!(report.committed, 2);

	let third = core.discover(false).await?;
	assert_eq!(third.enqueued, 0);
	assert_eq!(core.status().await?.completed, 2);

	let verdicts = core.resolve().await?;
	assert_eq!(scalar(&verdicts, "traits:brave", "level"), Some("1"));
	assert!(verdicts.iter().any(|v| v.identity.to_string() == "event:test:test.1"));

	Ok(())
}

#[tokio::test]
async fn test_touch_without_content_change_is_not_rebuilt() -> Result<(), Box<dyn std::error::Error>>
{
	let env = TestEnv::new();
	let path = env.write("game", "common/traits/base.txt", "brave = { level = 1 }\n");
	let core = env.core().await;

	core.discover(false).await?;
	core.build().await?;

	bump_mtime(&path, 30);
	let report = core.discover(false).await?;
	assert_eq!(report.touched, 1);
	assert_eq!(report.enqueued, 0);

	Ok(())
}

#[tokio::test]
async fn test_content_change_is_rebuilt() -> Result<(), Box<dyn std::error::Error>> {
	let env = TestEnv::new();
	env.write("game", "common/traits/base.txt", "brave = { level = 1 }\n");
	let core = env.core().await;

	core.discover(false).await?;
	core.build().await?;

	env.write("game", "common/traits/base.txt", "brave = { level = 20 }\n");
	let report = core.discover(false).await?;
	assert_eq!(report.changed, 1);
	assert_eq!(report.enqueued, 1);

	assert_eq!(core.build().await?.committed, 1);
	let verdicts = core.resolve().await?;
	assert_eq!(scalar(&verdicts, "traits:brave", "level"), Some("20"));

	Ok(())
}

#[tokio::test]
async fn test_result_for_rewritten_file_is_stale() -> Result<(), Box<dyn std::error::Error>> {
	let env = TestEnv::new();
	env.write("game", "common/traits/base.txt", "brave = { level = 1 }\n");
	let core = env.core().await;
	core.discover(false).await?;

	let kind = WorkerKind::InProcess(Arc::new(RewriteOnce {
		inner: executor(&core),
		replacement: "brave = { level = 22 }\n",
		done: AtomicBool::new(false),
	}));
	let report = core.build_with(kind).await?;

	// The discarded result triggered a rebuild against the new bytes
	assert_eq!(report.stale, 1);
	assert_eq!(report.committed, 1);

	let stats = core.status().await?;
	assert_eq!(stats.stale, 1);
	assert_eq!(stats.active(), 0);

	let verdicts = core.resolve().await?;
	assert_eq!(scalar(&verdicts, "traits:brave", "level"), Some("22"));

	Ok(())
}

#[tokio::test]
async fn test_panicking_worker_is_replaced() -> Result<(), Box<dyn std::error::Error>> {
	let env = TestEnv::new();
	env.write("game", "common/traits/base.txt", "brave = { level = 1 }\n");
	let core = env.core().await;
	core.discover(false).await?;

	let kind = WorkerKind::InProcess(Arc::new(PanicOnce {
		inner: executor(&core),
		panicked: AtomicBool::new(false),
	}));
	let report = core.build_with(kind).await?;

	assert_eq!(report.requeued, 1);
	assert_eq!(report.workers_replaced, 1);
	assert_eq!(report.committed, 1);
	assert_eq!(core.status().await?.error, 0);

	Ok(())
}

#[tokio::test]
async fn test_overrunning_item_is_failed() -> Result<(), Box<dyn std::error::Error>> {
	let mut env = TestEnv::new();
	env.config.pipeline.item_timeout_secs = 1;
	env.write("game", "common/traits/base.txt", "brave = { level = 1 }\n");
	let core = env.core().await;
	core.discover(false).await?;

	let kind = WorkerKind::InProcess(Arc::new(Sleepy {
		inner: executor(&core),
		delay: Duration::from_secs(2),
	}));
	let report = core.build_with(kind).await?;

	assert_eq!(report.timed_out, 1);
	assert_eq!(report.committed, 0);
	assert_eq!(core.status().await?.error, 1);

	// Failed content is not retried until it changes
	assert_eq!(core.discover(false).await?.enqueued, 0);
	env.write("game", "common/traits/base.txt", "brave = { level = 333 }\n");
	assert_eq!(core.discover(false).await?.enqueued, 1);

	Ok(())
}

#[tokio::test]
async fn test_deleted_file_is_retired() -> Result<(), Box<dyn std::error::Error>> {
	let env = TestEnv::new();
	env.write("game", "common/traits/base.txt", "brave = { level = 1 }\n");
	env.write("mod_a", "common/traits/extra.txt", "shy = { level = 1 }\n");
	let core = env.core().await;

	core.discover(false).await?;
	core.build().await?;
	assert_eq!(core.resolve().await?.len(), 2);

	env.remove("mod_a", "common/traits/extra.txt");
	let report = core.discover(false).await?;
	assert_eq!(report.deleted, 1);
	assert_eq!(report.versions_created, 1);

	let verdicts = core.resolve().await?;
	assert_eq!(verdicts.len(), 1);
	assert_eq!(verdicts[0].identity.to_string(), "traits:brave");

	Ok(())
}

#[tokio::test]
async fn test_build_recovers_abandoned_claims() -> Result<(), Box<dyn std::error::Error>> {
	let env = TestEnv::new();
	env.write("game", "common/traits/base.txt", "brave = { level = 1 }\n");
	env.write("mod_b", "common/traits/more.txt", "calm = { level = 1 }\n");
	let core = env.core().await;
	core.discover(false).await?;

	// A previous holder claimed everything and died
	let claimed = core.writer().claim(10, "pid:999999").await?;
	assert_eq!(claimed.len(), 2);
	assert_eq!(core.status().await?.claimed, 2);

	let report = core.build().await?;
	assert_eq!(report.committed, 2);

	let stats = core.status().await?;
	assert_eq!(stats.claimed, 0);
	assert_eq!(stats.completed, 2);

	Ok(())
}

#[tokio::test]
async fn test_enqueue_single_path() -> Result<(), Box<dyn std::error::Error>> {
	let env = TestEnv::new();
	let path = env.write("mod_a", "common/traits/a.txt", "bold = { level = 1 }\n");
	env.write("mod_a", "notes.md", "skip me\n");
	let core = env.core().await;
	core.discover(false).await?;
	core.build().await?;

	// Absolute paths are accepted inside the package root
	let build_id = core.enqueue_path("mod_a", &path, Priority::Flash).await?;
	assert!(build_id.is_some());
	assert_eq!(core.status().await?.pending, 1);

	let skipped = core
		.enqueue_path("mod_a", Path::new("notes.md"), Priority::Flash)
		.await?;
	assert_eq!(skipped, None);

	let unknown = core
		.enqueue_path("nope", Path::new("common/traits/a.txt"), Priority::Normal)
		.await;
	assert!(matches!(unknown, Err(CoreError::Discovery(_))));

	let outside = core
		.enqueue_path("mod_a", &env.root("mod_b").join("x.txt"), Priority::Normal)
		.await;
	assert!(matches!(outside, Err(CoreError::OutsidePackage(_))));

	assert_eq!(core.build().await?.committed, 1);

	Ok(())
}

#[tokio::test]
async fn test_restored_file_is_rebuilt() -> Result<(), Box<dyn std::error::Error>> {
	let env = TestEnv::new();
	env.write("game", "common/traits/base.txt", "brave = { level = 1 }\n");
	let core = env.core().await;
	core.discover(false).await?;
	core.build().await?;

	env.remove("game", "common/traits/base.txt");
	core.discover(false).await?;
	core.build().await?;
	assert!(core.resolve().await?.is_empty());

	// Same bytes as before the deletion
	env.write("game", "common/traits/base.txt", "brave = { level = 1 }\n");
	let report = core.discover(false).await?;
	assert_eq!(report.new_files, 1);
	assert_eq!(report.enqueued, 1);
	assert_eq!(core.build().await?.committed, 1);
	assert_eq!(scalar(&core.resolve().await?, "traits:brave", "level"), Some("1"));

	Ok(())
}

#[tokio::test]
async fn test_package_dropped_and_readded_is_rebuilt() -> Result<(), Box<dyn std::error::Error>> {
	let env = TestEnv::new();
	env.write("mod_a", "common/traits/a.txt", "bold = { level = 1 }\n");
	{
		let core = env.core().await;
		core.discover(false).await?;
		core.build().await?;
	}

	let mut without = env.config.clone();
	without.packages.retain(|p| p.name != "mod_a");
	{
		let core = strata_core::Core::with_config(without).await?;
		assert_eq!(core.discover(false).await?.packages, 2);
		assert!(core.resolve().await?.is_empty());
	}

	let core = env.core().await;
	assert_eq!(core.discover(false).await?.enqueued, 1);
	core.build().await?;
	assert_eq!(scalar(&core.resolve().await?, "traits:bold", "level"), Some("1"));

	Ok(())
}

#[tokio::test]
async fn test_shadowed_definition_anywhere_in_the_type_tree_returns(
) -> Result<(), Box<dyn std::error::Error>> {
	let env = TestEnv::new();
	env.write("game", "common/traits/a.txt", "brave = { level = 1 }\n");
	env.write("game", "common/traits/sub/b.txt", "brave = { level = 2 }\n");
	let core = env.core().await;
	core.discover(false).await?;
	core.build().await?;
	// The later path wins inside one package
	assert_eq!(scalar(&core.resolve().await?, "traits:brave", "level"), Some("2"));

	// The owner stops defining it
	env.write("game", "common/traits/sub/b.txt", "calm = { level = 555 }\n");
	core.discover(false).await?;
	assert_eq!(core.build().await?.committed, 2);
	assert_eq!(scalar(&core.resolve().await?, "traits:brave", "level"), Some("1"));

	env.write("game", "common/traits/sub/b.txt", "brave = { level = 2 }\n");
	core.discover(false).await?;
	core.build().await?;
	assert_eq!(scalar(&core.resolve().await?, "traits:brave", "level"), Some("2"));

	// The owner is deleted
	env.remove("game", "common/traits/sub/b.txt");
	core.discover(false).await?;
	core.build().await?;
	assert_eq!(scalar(&core.resolve().await?, "traits:brave", "level"), Some("1"));

	Ok(())
}

#[tokio::test]
async fn test_deeply_nested_file_fails_alone() -> Result<(), Box<dyn std::error::Error>> {
	let env = TestEnv::new();
	let nested = format!("brave = {}\n", "{".repeat(200_000));
	env.write("game", "common/traits/deep.txt", &nested);
	env.write("game", "common/traits/base.txt", "calm = { level = 1 }\n");
	let core = env.core().await;
	core.discover(false).await?;

	let report = core.build().await?;
	assert_eq!(report.failed, 1);
	assert_eq!(report.committed, 1);
	assert_eq!(report.workers_replaced, 0);
	assert_eq!(core.status().await?.error, 1);

	Ok(())
}

#[tokio::test]
async fn test_older_build_committing_last_is_stale() -> Result<(), Box<dyn std::error::Error>> {
	let env = TestEnv::new();
	env.write("game", "common/traits/base.txt", "brave = { level = 1 }\n");
	let core = env.core().await;
	core.discover(false).await?;
	let writer = core.writer();
	let executor = executor(&core);

	let older = writer.claim(1, "test").await?.remove(0);
	let older_output = executor.execute(&writer.describe(&older).await?)?;

	env.write("game", "common/traits/base.txt", "brave = { level = 42 }\n");
	let newer_id = core
		.enqueue_path("game", Path::new("common/traits/base.txt"), Priority::Flash)
		.await?;
	let newer = writer.claim(1, "test").await?.remove(0);
	assert_eq!(Some(newer.build_id), newer_id);
	assert!(newer.build_id > older.build_id);
	let newer_output = executor.execute(&writer.describe(&newer).await?)?;

	// The newer build lands first, the older one must not overwrite it
	assert_eq!(writer.commit(&newer, newer_output).await?, CommitOutcome::Committed);
	assert_eq!(writer.commit(&older, older_output).await?, CommitOutcome::Stale);

	assert_eq!(scalar(&core.resolve().await?, "traits:brave", "level"), Some("42"));
	let stats = core.status().await?;
	assert_eq!(stats.stale, 1);
	assert_eq!(stats.active(), 0);

	Ok(())
}
