//! Source file identity and fingerprints

use serde::{Deserialize, Serialize};
use std::fmt;

pub type FileId = i32;

/// Hex encoded blake3 digest of a file's bytes
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(pub String);

impl ContentHash {
	pub fn of(bytes: &[u8]) -> Self {
		Self(blake3::hash(bytes).to_hex().to_string())
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for ContentHash {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl From<String> for ContentHash {
	fn from(hash: String) -> Self {
		Self(hash)
	}
}

/// (modification time, byte size, content hash) of a file at one point in time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
	/// Nanoseconds since the unix epoch
	pub mtime_ns: i64,
	pub size: u64,
	pub hash: ContentHash,
}

impl Fingerprint {
	/// The cheap comparison: metadata only, no bytes involved.
	pub fn same_metadata(&self, mtime_ns: i64, size: u64) -> bool {
		self.mtime_ns == mtime_ns && self.size == size
	}
}
