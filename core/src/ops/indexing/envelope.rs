//! Envelope execution
//!
//! A worker turns one job into an [`EnvelopeOutput`] by running the envelope's
//! steps against the file's current bytes. Executors never touch the database;
//! the only side effect allowed is appending the file's bytes to the blob store.

use super::routing::{EnvelopeKind, Step};
use crate::{
	domain::{ExtractedReference, ExtractedSymbol, Fingerprint},
	infra::{
		queue::BuildId,
		store::{fingerprint::of_bytes, ContentStore},
	},
	ops::parse::{
		extract_references, extract_symbols, localization_symbols, parse, parse_localization,
		ParseError,
	},
};

use serde::{Deserialize, Serialize};
use std::{fs, path::PathBuf};
use thiserror::Error;

/// Everything a worker needs to process one queue item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerJob {
	pub build_id: BuildId,
	pub path: PathBuf,
	pub rel_path: String,
	pub envelope: EnvelopeKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeOutput {
	/// Fingerprint of the exact bytes the steps ran against
	pub fingerprint: Fingerprint,
	pub symbols: Vec<ExtractedSymbol>,
	pub references: Vec<ExtractedReference>,
}

/// A step failure. Serializable because it crosses the subprocess boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum StepError {
	#[error("failed to read {path:?}: {message}")]
	Read { path: PathBuf, message: String },
	#[error("{step} failed at {error}")]
	Syntax { step: Step, error: ParseError },
	#[error("failed to store blob: {0}")]
	Store(String),
	#[error("worker protocol error: {0}")]
	Protocol(String),
}

pub trait EnvelopeExecutor: Send + Sync + 'static {
	fn execute(&self, job: &WorkerJob) -> Result<EnvelopeOutput, StepError>;
}

/// Executes the built-in script envelopes
#[derive(Debug, Clone)]
pub struct ScriptExecutor {
	blobs: ContentStore,
}

impl ScriptExecutor {
	pub fn new(blobs: ContentStore) -> Self {
		Self { blobs }
	}
}

impl EnvelopeExecutor for ScriptExecutor {
	fn execute(&self, job: &WorkerJob) -> Result<EnvelopeOutput, StepError> {
		let read_error = |e: std::io::Error| StepError::Read {
			path: job.path.clone(),
			message: e.to_string(),
		};
		let metadata = fs::metadata(&job.path).map_err(read_error)?;
		let bytes = fs::read(&job.path).map_err(read_error)?;
		let fingerprint = of_bytes(&metadata, &bytes);

		self.blobs
			.store(&bytes)
			.map_err(|e| StepError::Store(e.to_string()))?;

		let text = String::from_utf8_lossy(&bytes);
		let mut output = EnvelopeOutput {
			fingerprint,
			symbols: Vec::new(),
			references: Vec::new(),
		};

		let mut entries = Vec::new();
		for &step in job.envelope.steps() {
			let syntax = |error| StepError::Syntax { step, error };
			match step {
				Step::Parse => entries = parse(&text).map_err(syntax)?,
				Step::ExtractSymbols => output.symbols = extract_symbols(&job.rel_path, &entries),
				Step::ExtractReferences => {
					output.references = extract_references(&job.rel_path, &entries)
				}
				Step::ParseLocalization => {
					let table = parse_localization(&text).map_err(syntax)?;
					output.symbols = localization_symbols(&table);
				}
			}
		}

		Ok(output)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use pretty_assertions::assert_eq;

	fn job(dir: &std::path::Path, rel_path: &str, envelope: EnvelopeKind) -> WorkerJob {
		WorkerJob {
			build_id: 1,
			path: dir.join(rel_path),
			rel_path: rel_path.to_string(),
			envelope,
		}
	}

	#[test]
	fn full_envelope_extracts_and_stores() {
		let dir = tempfile::tempdir().expect("tempdir");
		let root = dir.path().join("game");
		std::fs::create_dir_all(root.join("common/traits")).expect("mkdir");
		std::fs::write(
			root.join("common/traits/t.txt"),
			"brave = { opposites = { craven } }\ncraven = { }",
		)
		.expect("write");

		let blobs = ContentStore::new(dir.path().join("blobs"));
		let executor = ScriptExecutor::new(blobs.clone());
		let output = executor
			.execute(&job(&root, "common/traits/t.txt", EnvelopeKind::Full))
			.expect("execute");

		assert_eq!(output.symbols.len(), 2);
		assert_eq!(output.references.len(), 1);
		assert_eq!(output.references[0].target_name, "craven");
		assert!(blobs.contains(&output.fingerprint.hash));
	}

	#[test]
	fn syntax_errors_name_the_step() {
		let dir = tempfile::tempdir().expect("tempdir");
		std::fs::write(dir.path().join("broken.gui"), "window = {").expect("write");

		let executor = ScriptExecutor::new(ContentStore::new(dir.path().join("blobs")));
		let err = executor
			.execute(&job(dir.path(), "broken.gui", EnvelopeKind::ParseOnly))
			.expect_err("unclosed");

		assert!(matches!(err, StepError::Syntax { step: Step::Parse, .. }));
	}

	#[test]
	fn missing_file_is_a_read_error() {
		let dir = tempfile::tempdir().expect("tempdir");
		let executor = ScriptExecutor::new(ContentStore::new(dir.path().join("blobs")));
		assert!(matches!(
			executor.execute(&job(dir.path(), "gone.txt", EnvelopeKind::Full)),
			Err(StepError::Read { .. })
		));
	}
}
