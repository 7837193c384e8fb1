//! Content-addressed blob store
//!
//! Blobs live at `<root>/<first two hex chars>/<rest of hash>`. The directory
//! is append-only: a blob is written to a temp file and renamed into place, so
//! readers never see partial content and concurrent writers of the same bytes
//! both succeed.

pub mod fingerprint;

pub use fingerprint::{check, fingerprint, stamp, FingerprintCheck};

use crate::domain::ContentHash;

use std::{
	fs, io,
	path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::trace;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
	#[error("blob store io error at {path:?}: {source}")]
	Io {
		path: PathBuf,
		#[source]
		source: io::Error,
	},
	#[error("blob {0} not found")]
	Missing(ContentHash),
	#[error("invalid content hash '{0}'")]
	InvalidHash(String),
}

#[derive(Debug, Clone)]
pub struct ContentStore {
	root: PathBuf,
}

impl ContentStore {
	pub fn new(root: impl Into<PathBuf>) -> Self {
		Self { root: root.into() }
	}

	pub fn root(&self) -> &Path {
		&self.root
	}

	pub fn path_for(&self, hash: &ContentHash) -> Result<PathBuf, StoreError> {
		let hex = hash.as_str();
		if hex.len() < 3 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
			return Err(StoreError::InvalidHash(hex.to_string()));
		}
		Ok(self.root.join(&hex[..2]).join(&hex[2..]))
	}

	/// Store `bytes`, returning their hash. Idempotent.
	pub fn store(&self, bytes: &[u8]) -> Result<ContentHash, StoreError> {
		let hash = ContentHash::of(bytes);
		let path = self.path_for(&hash)?;
		if path.exists() {
			return Ok(hash);
		}

		let io = |path: &Path| {
			let path = path.to_path_buf();
			move |source| StoreError::Io { path, source }
		};

		let dir = path.parent().unwrap_or(&self.root);
		fs::create_dir_all(dir).map_err(io(dir))?;

		let tmp = dir.join(format!(".tmp-{}", Uuid::new_v4()));
		fs::write(&tmp, bytes).map_err(io(&tmp))?;
		if let Err(source) = fs::rename(&tmp, &path) {
			let _ = fs::remove_file(&tmp);
			return Err(StoreError::Io { path, source });
		}

		trace!(%hash, size = bytes.len(), "Stored blob");
		Ok(hash)
	}

	pub fn read(&self, hash: &ContentHash) -> Result<Vec<u8>, StoreError> {
		let path = self.path_for(hash)?;
		fs::read(&path).map_err(|source| match source.kind() {
			io::ErrorKind::NotFound => StoreError::Missing(hash.clone()),
			_ => StoreError::Io { path, source },
		})
	}

	pub fn contains(&self, hash: &ContentHash) -> bool {
		self.path_for(hash).map(|path| path.is_file()).unwrap_or(false)
	}
}
