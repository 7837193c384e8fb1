//! Packages and load order

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub type PackageId = i32;

/// A package is one root of script files: the base game or an override package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Package {
	pub id: PackageId,
	pub name: String,
	pub root: PathBuf,
	/// Position in the load order, the base game is always 0
	pub load_index: i32,
	/// Directories this package deliberately replaces wholesale
	pub replace_paths: Vec<String>,
}

impl Package {
	/// Whether `rel_path` lives under one of the package's declared replace paths.
	pub fn replaces(&self, rel_path: &str) -> bool {
		let rel_path = Path::new(rel_path);
		self.replace_paths
			.iter()
			.any(|replaced| rel_path.starts_with(replaced.trim_end_matches('/')))
	}
}
