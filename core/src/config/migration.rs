use super::ConfigError;

/// Step-wise upgrade of a versioned config file.
pub trait Migrate {
	fn current_version(&self) -> u32;

	fn target_version() -> u32;

	/// Bring `self` up to `target_version`, one version at a time.
	fn migrate(&mut self) -> Result<(), ConfigError>;
}
