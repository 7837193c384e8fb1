use crate::{
	domain::{ContentHash, FileId},
	infra::db::entities::BuildQueueModel,
	ops::indexing::routing::EnvelopeKind,
};

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Monotonic across the whole queue, never reused
pub type BuildId = i32;

#[derive(
	Debug,
	Clone,
	Copy,
	PartialEq,
	Eq,
	PartialOrd,
	Ord,
	Hash,
	Serialize,
	Deserialize,
	strum::Display,
	strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "lowercase")]
pub enum Priority {
	/// Discovery and full rebuilds
	Normal,
	/// Single file mutations from an interactive caller
	Flash,
}

impl Priority {
	pub fn value(self) -> i32 {
		match self {
			Self::Normal => 0,
			Self::Flash => 10,
		}
	}

	pub fn from_value(value: i32) -> Self {
		if value >= Self::Flash.value() {
			Self::Flash
		} else {
			Self::Normal
		}
	}
}

/// `pending -> claimed -> processing -> completed | error`
#[derive(
	Debug,
	Clone,
	Copy,
	PartialEq,
	Eq,
	Hash,
	Serialize,
	Deserialize,
	strum::Display,
	strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "lowercase")]
pub enum ItemState {
	Pending,
	Claimed,
	Processing,
	Completed,
	Error,
}

impl ItemState {
	pub fn is_active(self) -> bool {
		matches!(self, Self::Pending | Self::Claimed | Self::Processing)
	}
}

/// How a completed item's result was treated by the writer
#[derive(
	Debug,
	Clone,
	Copy,
	PartialEq,
	Eq,
	Serialize,
	Deserialize,
	strum::Display,
	strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "lowercase")]
pub enum CommitOutcome {
	Committed,
	/// Superseded by newer disk state or a newer committed build
	Stale,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueItem {
	pub build_id: BuildId,
	pub file_id: FileId,
	pub envelope: EnvelopeKind,
	pub priority: Priority,
	pub state: ItemState,
	pub content_hash: ContentHash,
	pub attempts: i32,
	pub error: Option<String>,
	pub outcome: Option<CommitOutcome>,
}

impl TryFrom<BuildQueueModel> for QueueItem {
	type Error = super::QueueError;

	fn try_from(model: BuildQueueModel) -> Result<Self, Self::Error> {
		let corrupt = |field: &str, value: &str| super::QueueError::Corrupt {
			build_id: model.build_id,
			detail: format!("{field} = '{value}'"),
		};

		Ok(Self {
			build_id: model.build_id,
			file_id: model.file_id,
			envelope: EnvelopeKind::from_str(&model.envelope)
				.map_err(|_| corrupt("envelope", &model.envelope))?,
			priority: Priority::from_value(model.priority),
			state: ItemState::from_str(&model.state).map_err(|_| corrupt("state", &model.state))?,
			content_hash: ContentHash::from(model.content_hash.clone()),
			attempts: model.attempts,
			error: model.error.clone(),
			outcome: match model.outcome.as_deref() {
				None => None,
				Some(raw) => Some(CommitOutcome::from_str(raw).map_err(|_| corrupt("outcome", raw))?),
			},
		})
	}
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
	pub pending: u64,
	pub claimed: u64,
	pub processing: u64,
	pub completed: u64,
	pub error: u64,
	/// Completed items whose result was discarded
	pub stale: u64,
	pub last_build_id: Option<BuildId>,
}

impl QueueStats {
	pub fn active(&self) -> u64 {
		self.pending + self.claimed + self.processing
	}
}
