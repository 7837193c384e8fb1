//! Load-order merge resolution
//!
//! Every identity defined by more than one package is a merge unit. The
//! resolver decides which definition is effective once all packages are
//! loaded, under the policy configured for the identity's symbol type, and
//! classifies how risky that outcome is.

pub mod resolve;
pub mod scan;

pub use resolve::{resolve, structural_delta};
pub use scan::{resolve_all, MergeError};

use crate::{domain::SymbolIdentity, ops::parse::Value};

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

#[derive(
	Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MergePolicy {
	/// Last loaded definition replaces all earlier ones
	#[default]
	Override,
	/// List keys accumulate, every other key is a single slot
	ContainerMerge,
	/// Each top level key is resolved on its own
	PerKeyOverride,
	/// First in, only served
	Fios,
}

#[derive(
	Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display,
	EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum RiskLevel {
	Info,
	Minor,
	Major,
	Critical,
}

/// One package's definition of an identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeSource {
	pub package: String,
	pub load_index: i32,
	pub rel_path: String,
	pub line: u32,
	pub body: Value,
	/// The package declares the file's directory as deliberately replaced
	pub intended: bool,
}

/// All definitions of one identity, in load order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeUnit {
	pub identity: SymbolIdentity,
	pub sources: Vec<MergeSource>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Winner {
	pub package: String,
	pub file: String,
	pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Loser {
	pub package: String,
	pub file: String,
}

/// A single-slot key of a container defined by more than one package
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotConflict {
	pub key: String,
	/// Definers in load order, the last one is effective
	pub packages: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeVerdict {
	pub identity: SymbolIdentity,
	pub policy: MergePolicy,
	pub sources: usize,
	pub winner: Winner,
	pub losers: Vec<Loser>,
	pub risk: RiskLevel,
	pub risk_reason: String,
	/// Body that is in effect after the merge
	pub effective: Value,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub slot_conflicts: Vec<SlotConflict>,
}

impl MergeVerdict {
	/// More than one package defines the identity
	pub fn is_conflict(&self) -> bool {
		self.sources > 1
	}
}
