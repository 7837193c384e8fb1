//! Build queue entity
//!
//! `build_id` is an AUTOINCREMENT key so ids are never reused, even after the
//! newest row is gone. Rows are never deleted.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "build_queue")]
pub struct Model {
	#[sea_orm(primary_key)]
	pub build_id: i32,
	pub file_id: i32,
	pub envelope: String,
	pub priority: i32,
	pub state: String, // ItemState
	/// Content hash observed when the item was enqueued
	pub content_hash: String,
	pub attempts: i32,
	pub claimed_by: Option<String>,
	pub error: Option<String>,
	pub outcome: Option<String>, // CommitOutcome
	pub enqueued_at: DateTimeUtc,
	pub claimed_at: Option<DateTimeUtc>,
	pub finished_at: Option<DateTimeUtc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
	#[sea_orm(
		belongs_to = "super::source_file::Entity",
		from = "Column::FileId",
		to = "super::source_file::Column::Id",
		on_delete = "Cascade"
	)]
	SourceFile,
}

impl Related<super::source_file::Entity> for Entity {
	fn to() -> RelationDef {
		Relation::SourceFile.def()
	}
}

impl ActiveModelBehavior for ActiveModel {}
