//! Shared setup for integration tests

#![allow(dead_code)]

use std::{
	fs,
	path::{Path, PathBuf},
	time::Duration,
};
use strata_core::{
	config::{CoreConfig, PackageConfig},
	Core,
};
use tempfile::TempDir;

/// A game tree plus two override packages under one temp directory
pub struct TestEnv {
	pub dir: TempDir,
	pub config: CoreConfig,
}

impl TestEnv {
	pub fn new() -> Self {
		let dir = TempDir::new().expect("tempdir");
		let mut config = CoreConfig::default_with_dir(dir.path().join("data"));

		config.game.path = dir.path().join("game");
		config.packages = vec![
			PackageConfig {
				name: "mod_a".to_string(),
				path: dir.path().join("mod_a"),
				replace_paths: Vec::new(),
			},
			PackageConfig {
				name: "mod_b".to_string(),
				path: dir.path().join("mod_b"),
				replace_paths: Vec::new(),
			},
		];
		config.pipeline.workers = 2;
		config.pipeline.item_timeout_secs = 5;
		config.lock.heartbeat_interval_ms = 100;
		config.lock.stale_after_ms = 2_000;
		config.lock.grace_ms = 500;
		config.lock.connect_wait_ms = 3_000;
		config.ipc.request_timeout_ms = 2_000;

		for package in config.load_order() {
			fs::create_dir_all(&package.path).expect("package root");
		}
		config.save().expect("save config");

		Self { dir, config }
	}

	/// Root directory of a configured package
	pub fn root(&self, package: &str) -> PathBuf {
		self.config
			.load_order()
			.find(|p| p.name == package)
			.map(|p| p.path.clone())
			.unwrap_or_else(|| panic!("no package named {package}"))
	}

	pub fn write(&self, package: &str, rel_path: &str, contents: &str) -> PathBuf {
		let path = self.root(package).join(rel_path);
		if let Some(parent) = path.parent() {
			fs::create_dir_all(parent).expect("mkdir");
		}
		fs::write(&path, contents).expect("write");
		path
	}

	pub fn remove(&self, package: &str, rel_path: &str) {
		fs::remove_file(self.root(package).join(rel_path)).expect("remove");
	}

	pub async fn core(&self) -> Core {
		Core::with_config(self.config.clone())
			.await
			.expect("open core")
	}
}

/// Poll `check` until it holds or `limit` passes
pub async fn eventually<F, Fut>(limit: Duration, mut check: F) -> bool
where
	F: FnMut() -> Fut,
	Fut: std::future::Future<Output = bool>,
{
	let deadline = tokio::time::Instant::now() + limit;
	loop {
		if check().await {
			return true;
		}
		if tokio::time::Instant::now() >= deadline {
			return false;
		}
		tokio::time::sleep(Duration::from_millis(50)).await;
	}
}

pub fn bump_mtime(path: &Path, secs: u64) {
	let file = fs::File::options().write(true).open(path).expect("open");
	let modified = fs::metadata(path).expect("metadata").modified().expect("mtime");
	file.set_modified(modified + Duration::from_secs(secs))
		.expect("set mtime");
}
