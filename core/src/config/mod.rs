//! Configuration management

use std::path::PathBuf;
use thiserror::Error;

pub mod core_config;
pub mod migration;

pub use core_config::{
	ContainerConfig, CoreConfig, IpcConfig, LockConfig, PackageConfig, PipelineConfig,
	ResolverConfig, RouteRule, Thresholds, WorkerMode,
};
pub use migration::Migrate;

pub const CONFIG_FILE_NAME: &str = "strata.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("could not determine a data directory for this platform")]
	NoDataDir,
	#[error("config io error at {path:?}: {source}")]
	Io {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},
	#[error("invalid config file {path:?}: {source}")]
	Parse {
		path: PathBuf,
		#[source]
		source: toml::de::Error,
	},
	#[error("failed to serialize config: {0}")]
	Serialize(#[from] toml::ser::Error),
	#[error("unknown config version: {0}")]
	UnknownVersion(u32),
	#[error("invalid config: {0}")]
	Invalid(String),
}

/// Platform-specific data directory resolution
pub fn default_data_dir() -> Result<PathBuf, ConfigError> {
	#[cfg(target_os = "macos")]
	let dir = dirs::data_dir().ok_or(ConfigError::NoDataDir)?.join("Strata");

	#[cfg(not(target_os = "macos"))]
	let dir = dirs::data_local_dir()
		.ok_or(ConfigError::NoDataDir)?
		.join("strata");

	Ok(dir)
}
