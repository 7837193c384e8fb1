//! Core configuration, persisted as `strata.toml` in the data directory

use super::{default_data_dir, ConfigError, Migrate, CONFIG_FILE_NAME};
use crate::ops::{indexing::routing::EnvelopeKind, merge::MergePolicy};

use serde::{Deserialize, Serialize};
use std::{
	collections::{BTreeMap, HashSet},
	fs,
	path::{Path, PathBuf},
	time::Duration,
};
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
	/// Config schema version, 0 for hand-written files that omit it
	#[serde(default)]
	pub version: u32,

	/// Data directory path
	pub data_dir: PathBuf,

	/// Default tracing level for the daemon when `RUST_LOG` is unset
	pub log_level: String,

	/// The base game tree, always first in load order
	pub game: PackageConfig,

	/// Override packages in load order
	#[serde(default)]
	pub packages: Vec<PackageConfig>,

	#[serde(default)]
	pub pipeline: PipelineConfig,

	#[serde(default)]
	pub lock: LockConfig,

	#[serde(default)]
	pub ipc: IpcConfig,

	/// First matching rule wins
	#[serde(default = "default_routing")]
	pub routing: Vec<RouteRule>,

	#[serde(default)]
	pub resolver: ResolverConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageConfig {
	pub name: String,
	pub path: PathBuf,
	/// Directories this package deliberately replaces wholesale
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub replace_paths: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerMode {
	/// Tokio tasks running envelope steps on the blocking pool.
	///
	/// A timed-out item is failed and its worker replaced, but the blocking
	/// thread running the step cannot be interrupted and stays busy until the
	/// step returns. Use `Process` when runaway steps must be killed.
	Task,
	/// Long-lived `strata worker` child processes, killed on timeout
	Process,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
	pub workers: usize,
	pub item_timeout_secs: u64,
	/// Crash requeues allowed before an item is marked as error
	pub max_attempts: i32,
	pub claim_batch: u64,
	pub worker_mode: WorkerMode,
	/// Ignore (mtime, size) shortcuts during discovery and always rehash
	pub force_hash: bool,
}

impl Default for PipelineConfig {
	fn default() -> Self {
		Self {
			workers: std::thread::available_parallelism()
				.map(|n| n.get().min(8))
				.unwrap_or(4),
			item_timeout_secs: 60,
			max_attempts: 3,
			claim_batch: 32,
			worker_mode: WorkerMode::Task,
			force_hash: false,
		}
	}
}

impl PipelineConfig {
	pub fn item_timeout(&self) -> Duration {
		Duration::from_secs(self.item_timeout_secs)
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
	pub heartbeat_interval_ms: u64,
	/// Heartbeat age after which a holder is presumed dead
	pub stale_after_ms: u64,
	/// Extra wait past the last heartbeat before a stale lock may be reclaimed
	pub grace_ms: u64,
	/// How long callers wait for a starting daemon's endpoint
	pub connect_wait_ms: u64,
}

impl Default for LockConfig {
	fn default() -> Self {
		Self {
			heartbeat_interval_ms: 2_000,
			stale_after_ms: 10_000,
			grace_ms: 5_000,
			connect_wait_ms: 10_000,
		}
	}
}

impl LockConfig {
	pub fn heartbeat_interval(&self) -> Duration {
		Duration::from_millis(self.heartbeat_interval_ms)
	}

	pub fn stale_after(&self) -> Duration {
		Duration::from_millis(self.stale_after_ms)
	}

	pub fn grace(&self) -> Duration {
		Duration::from_millis(self.grace_ms)
	}

	pub fn connect_wait(&self) -> Duration {
		Duration::from_millis(self.connect_wait_ms)
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IpcConfig {
	/// Defaults to `<data_dir>/strata.sock`
	#[serde(skip_serializing_if = "Option::is_none")]
	pub socket_path: Option<PathBuf>,
	pub request_timeout_ms: u64,
}

impl Default for IpcConfig {
	fn default() -> Self {
		Self {
			socket_path: None,
			request_timeout_ms: 30_000,
		}
	}
}

impl IpcConfig {
	pub fn request_timeout(&self) -> Duration {
		Duration::from_millis(self.request_timeout_ms)
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRule {
	pub pattern: String,
	pub envelope: EnvelopeKind,
}

impl RouteRule {
	pub fn new(pattern: impl Into<String>, envelope: EnvelopeKind) -> Self {
		Self {
			pattern: pattern.into(),
			envelope,
		}
	}
}

fn default_routing() -> Vec<RouteRule> {
	vec![
		RouteRule::new("common/**/*.txt", EnvelopeKind::Full),
		RouteRule::new("events/**/*.txt", EnvelopeKind::Full),
		RouteRule::new("localization/**/*.yml", EnvelopeKind::Localization),
		RouteRule::new("**/*.gui", EnvelopeKind::ParseOnly),
		RouteRule::new("**/*.txt", EnvelopeKind::ParseOnly),
	]
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerConfig {
	/// Keys that accumulate across sources; every other key is single-slot
	pub list_keys: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
	/// Source count at which an override is classified major
	pub major_source_count: usize,
	/// Structural delta (0..=1) at which an override is classified major
	pub major_delta_ratio: f64,
}

impl Default for Thresholds {
	fn default() -> Self {
		Self {
			major_source_count: 3,
			major_delta_ratio: 0.5,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
	/// Policy per symbol type; unlisted types use `default_policy`
	pub policies: BTreeMap<String, MergePolicy>,
	pub default_policy: MergePolicy,
	pub containers: BTreeMap<String, ContainerConfig>,
	pub thresholds: Thresholds,
}

impl Default for ResolverConfig {
	fn default() -> Self {
		let policies = BTreeMap::from([
			("on_action".to_string(), MergePolicy::ContainerMerge),
			("defines".to_string(), MergePolicy::PerKeyOverride),
			("scripted_gui".to_string(), MergePolicy::Fios),
		]);
		let containers = BTreeMap::from([(
			"on_action".to_string(),
			ContainerConfig {
				list_keys: vec![
					"events".to_string(),
					"random_events".to_string(),
					"on_actions".to_string(),
				],
			},
		)]);

		Self {
			policies,
			default_policy: MergePolicy::Override,
			containers,
			thresholds: Thresholds::default(),
		}
	}
}

impl ResolverConfig {
	pub fn policy_for(&self, symbol_type: &str) -> MergePolicy {
		self.policies
			.get(symbol_type)
			.copied()
			.unwrap_or(self.default_policy)
	}
}

impl CoreConfig {
	/// Load configuration from the default location
	pub fn load() -> Result<Self, ConfigError> {
		Self::load_from(&default_data_dir()?)
	}

	/// Load configuration from a specific data directory, creating a default
	/// file when none exists yet.
	pub fn load_from(data_dir: &Path) -> Result<Self, ConfigError> {
		let config_path = data_dir.join(CONFIG_FILE_NAME);

		if !config_path.exists() {
			warn!("No config found, creating default at {:?}", config_path);
			let config = Self::default_with_dir(data_dir.to_path_buf());
			config.save()?;
			return Ok(config);
		}

		info!("Loading config from {:?}", config_path);
		let raw = fs::read_to_string(&config_path).map_err(|source| ConfigError::Io {
			path: config_path.clone(),
			source,
		})?;
		let mut config: CoreConfig = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
			path: config_path.clone(),
			source,
		})?;
		// The file may have been copied from elsewhere
		config.data_dir = data_dir.to_path_buf();

		if config.version > Self::target_version() {
			return Err(ConfigError::UnknownVersion(config.version));
		}
		if config.version < Self::target_version() {
			info!(
				"Migrating config from v{} to v{}",
				config.version,
				Self::target_version()
			);
			config.migrate()?;
			config.save()?;
		}

		config.validate()?;
		Ok(config)
	}

	/// Load, or write a fresh default when the existing file cannot be read
	pub fn load_or_create(data_dir: &Path) -> Result<Self, ConfigError> {
		Self::load_from(data_dir).or_else(|e| {
			warn!("Replacing unreadable config: {}", e);
			let config = Self::default_with_dir(data_dir.to_path_buf());
			config.save()?;
			Ok(config)
		})
	}

	pub fn default_with_dir(data_dir: PathBuf) -> Self {
		Self {
			version: Self::target_version(),
			game: PackageConfig {
				name: "game".to_string(),
				path: data_dir.join("game"),
				replace_paths: Vec::new(),
			},
			data_dir,
			log_level: "info".to_string(),
			packages: Vec::new(),
			pipeline: PipelineConfig::default(),
			lock: LockConfig::default(),
			ipc: IpcConfig::default(),
			routing: default_routing(),
			resolver: ResolverConfig::default(),
		}
	}

	pub fn save(&self) -> Result<(), ConfigError> {
		let io = |path: &Path| {
			let path = path.to_path_buf();
			move |source| ConfigError::Io { path, source }
		};

		fs::create_dir_all(&self.data_dir).map_err(io(&self.data_dir))?;

		let config_path = self.data_dir.join(CONFIG_FILE_NAME);
		let raw = toml::to_string_pretty(self)?;
		fs::write(&config_path, raw).map_err(io(&config_path))?;
		info!("Saved config to {:?}", config_path);
		Ok(())
	}

	pub fn validate(&self) -> Result<(), ConfigError> {
		let mut names = HashSet::new();
		for package in self.load_order() {
			if package.name.trim().is_empty() {
				return Err(ConfigError::Invalid("package with empty name".into()));
			}
			if !names.insert(package.name.as_str()) {
				return Err(ConfigError::Invalid(format!(
					"duplicate package name '{}'",
					package.name
				)));
			}
		}
		if self.pipeline.workers == 0 {
			return Err(ConfigError::Invalid("pipeline.workers must be at least 1".into()));
		}
		if self.pipeline.max_attempts < 1 {
			return Err(ConfigError::Invalid(
				"pipeline.max_attempts must be at least 1".into(),
			));
		}
		if self.lock.heartbeat_interval_ms >= self.lock.stale_after_ms {
			return Err(ConfigError::Invalid(
				"lock.heartbeat_interval_ms must be shorter than lock.stale_after_ms".into(),
			));
		}
		Ok(())
	}

	/// Base game first, then override packages as configured
	pub fn load_order(&self) -> impl Iterator<Item = &PackageConfig> {
		std::iter::once(&self.game).chain(self.packages.iter())
	}

	/// Package paths may be relative to the data directory
	pub fn package_root(&self, package: &PackageConfig) -> PathBuf {
		if package.path.is_absolute() {
			package.path.clone()
		} else {
			self.data_dir.join(&package.path)
		}
	}

	pub fn database_path(&self) -> PathBuf {
		self.data_dir.join("strata.db")
	}

	pub fn blobs_dir(&self) -> PathBuf {
		self.data_dir.join("blobs")
	}

	pub fn logs_dir(&self) -> PathBuf {
		self.data_dir.join("logs")
	}

	pub fn lock_path(&self) -> PathBuf {
		self.data_dir.join("writer.lock")
	}

	pub fn socket_path(&self) -> PathBuf {
		self.ipc
			.socket_path
			.clone()
			.unwrap_or_else(|| self.data_dir.join("strata.sock"))
	}

	pub fn ensure_directories(&self) -> Result<(), ConfigError> {
		for dir in [self.data_dir.clone(), self.blobs_dir(), self.logs_dir()] {
			fs::create_dir_all(&dir).map_err(|source| ConfigError::Io { path: dir, source })?;
		}
		Ok(())
	}
}

impl Migrate for CoreConfig {
	fn current_version(&self) -> u32 {
		self.version
	}

	fn target_version() -> u32 {
		1
	}

	fn migrate(&mut self) -> Result<(), ConfigError> {
		match self.version {
			// Every section already fell back to its serde default
			0 => {
				self.version = 1;
				Ok(())
			}
			1 => Ok(()),
			v => Err(ConfigError::UnknownVersion(v)),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use pretty_assertions::assert_eq;

	#[test]
	fn default_config_round_trips_through_disk() {
		let dir = tempfile::tempdir().expect("tempdir");
		let mut config = CoreConfig::default_with_dir(dir.path().to_path_buf());
		config.packages.push(PackageConfig {
			name: "better_traits".into(),
			path: "mods/better_traits".into(),
			replace_paths: vec!["common/traits".into()],
		});
		config.save().expect("save");

		let loaded = CoreConfig::load_from(dir.path()).expect("load");
		assert_eq!(loaded.packages, config.packages);
		assert_eq!(loaded.routing, config.routing);
		assert_eq!(loaded.resolver, config.resolver);
		assert_eq!(
			loaded.package_root(&loaded.packages[0]),
			dir.path().join("mods/better_traits")
		);
	}

	#[test]
	fn unversioned_file_is_upgraded() {
		let dir = tempfile::tempdir().expect("tempdir");
		let mut config = CoreConfig::default_with_dir(dir.path().to_path_buf());
		config.version = 0;
		config.save().expect("save");
		let raw = std::fs::read_to_string(dir.path().join(CONFIG_FILE_NAME)).expect("read");
		let unversioned: String = raw
			.lines()
			.filter(|line| !line.starts_with("version"))
			.map(|line| format!("{line}\n"))
			.collect();
		std::fs::write(dir.path().join(CONFIG_FILE_NAME), unversioned).expect("write");

		let loaded = CoreConfig::load_from(dir.path()).expect("load");
		assert_eq!(loaded.version, CoreConfig::target_version());
		assert_eq!(loaded.routing, default_routing());

		// The upgrade is written back
		let reloaded = CoreConfig::load_from(dir.path()).expect("reload");
		assert_eq!(reloaded.version, 1);
	}

	#[test]
	fn newer_versions_are_refused() {
		let dir = tempfile::tempdir().expect("tempdir");
		let mut config = CoreConfig::default_with_dir(dir.path().to_path_buf());
		config.version = 7;
		config.save().expect("save");

		assert!(matches!(
			CoreConfig::load_from(dir.path()),
			Err(ConfigError::UnknownVersion(7))
		));
	}

	#[test]
	fn duplicate_package_names_are_rejected() {
		let mut config = CoreConfig::default_with_dir(PathBuf::from("/tmp/strata"));
		config.packages.push(PackageConfig {
			name: "game".into(),
			path: "mods/game".into(),
			replace_paths: Vec::new(),
		});
		assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
	}
}
