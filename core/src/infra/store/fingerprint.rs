use crate::domain::{ContentHash, Fingerprint};

use std::{fs::Metadata, io, path::Path, time::UNIX_EPOCH};
use tokio::fs;

/// Result of comparing a file on disk against its recorded fingerprint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FingerprintCheck {
	/// Metadata matched, bytes were not read
	Unchanged,
	/// Metadata changed but the content hash did not
	ContentIdentical(Fingerprint),
	Changed(Fingerprint, Vec<u8>),
	/// No recorded fingerprint
	New(Fingerprint, Vec<u8>),
}

/// (mtime in nanoseconds, size) of a file's metadata
pub fn stamp(metadata: &Metadata) -> (i64, u64) {
	let mtime_ns = metadata
		.modified()
		.ok()
		.and_then(|t| t.duration_since(UNIX_EPOCH).ok())
		.map(|d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
		.unwrap_or(0);
	(mtime_ns, metadata.len())
}

pub async fn fingerprint(path: &Path) -> io::Result<(Fingerprint, Vec<u8>)> {
	let metadata = fs::metadata(path).await?;
	let bytes = fs::read(path).await?;
	Ok((of_bytes(&metadata, &bytes), bytes))
}

pub(crate) fn of_bytes(metadata: &Metadata, bytes: &[u8]) -> Fingerprint {
	let (mtime_ns, _) = stamp(metadata);
	Fingerprint {
		mtime_ns,
		size: bytes.len() as u64,
		hash: ContentHash::of(bytes),
	}
}

pub async fn check(
	path: &Path,
	recorded: Option<&Fingerprint>,
	force_hash: bool,
) -> io::Result<FingerprintCheck> {
	let Some(recorded) = recorded else {
		let (fp, bytes) = fingerprint(path).await?;
		return Ok(FingerprintCheck::New(fp, bytes));
	};

	if !force_hash {
		let (mtime_ns, size) = stamp(&fs::metadata(path).await?);
		if recorded.same_metadata(mtime_ns, size) {
			return Ok(FingerprintCheck::Unchanged);
		}
	}

	let (fp, bytes) = fingerprint(path).await?;
	Ok(if fp.hash == recorded.hash {
		FingerprintCheck::ContentIdentical(fp)
	} else {
		FingerprintCheck::Changed(fp, bytes)
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::time::{Duration, SystemTime};

	fn touch(path: &Path, offset_secs: u64) {
		let file = std::fs::File::options()
			.write(true)
			.open(path)
			.expect("open");
		file.set_modified(SystemTime::now() + Duration::from_secs(offset_secs))
			.expect("set mtime");
	}

	#[tokio::test]
	async fn metadata_churn_is_content_identical() {
		let dir = tempfile::tempdir().expect("tempdir");
		let path = dir.path().join("a.txt");
		std::fs::write(&path, "brave = { }").expect("write");

		let (recorded, _) = fingerprint(&path).await.expect("fingerprint");
		assert_eq!(
			check(&path, Some(&recorded), false).await.expect("check"),
			FingerprintCheck::Unchanged
		);

		touch(&path, 100);
		match check(&path, Some(&recorded), false).await.expect("check") {
			FingerprintCheck::ContentIdentical(fp) => assert_eq!(fp.hash, recorded.hash),
			other => panic!("unexpected {other:?}"),
		}

		std::fs::write(&path, "brave = { x = 1 }").expect("write");
		assert!(matches!(
			check(&path, Some(&recorded), false).await.expect("check"),
			FingerprintCheck::Changed(..)
		));
	}

	#[tokio::test]
	async fn force_hash_ignores_matching_metadata() {
		let dir = tempfile::tempdir().expect("tempdir");
		let path = dir.path().join("a.txt");
		std::fs::write(&path, "a").expect("write");

		let (recorded, _) = fingerprint(&path).await.expect("fingerprint");
		assert!(matches!(
			check(&path, Some(&recorded), true).await.expect("check"),
			FingerprintCheck::ContentIdentical(_)
		));
		assert!(matches!(
			check(&path, None, false).await.expect("check"),
			FingerprintCheck::New(..)
		));
	}
}
