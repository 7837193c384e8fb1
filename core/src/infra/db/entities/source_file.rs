//! Source file entity
//!
//! Identified by (package, rel_path). The fingerprint columns describe the
//! last observed disk state; `processed_hash` and `last_build_id` describe the
//! last committed result.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "source_files")]
pub struct Model {
	#[sea_orm(primary_key)]
	pub id: i32,
	pub package_id: i32,
	pub rel_path: String,
	pub envelope: String,
	pub mtime_ns: i64,
	pub size: i64,
	pub content_hash: String,
	pub processed_hash: Option<String>,
	pub last_build_id: Option<i32>,
	pub deleted: bool,
	pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
	#[sea_orm(
		belongs_to = "super::package::Entity",
		from = "Column::PackageId",
		to = "super::package::Column::Id",
		on_delete = "Cascade"
	)]
	Package,
	#[sea_orm(has_many = "super::symbol::Entity")]
	Symbols,
}

impl Related<super::package::Entity> for Entity {
	fn to() -> RelationDef {
		Relation::Package.def()
	}
}

impl Related<super::symbol::Entity> for Entity {
	fn to() -> RelationDef {
		Relation::Symbols.def()
	}
}

impl ActiveModelBehavior for ActiveModel {}
