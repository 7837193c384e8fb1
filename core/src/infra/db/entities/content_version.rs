//! Immutable snapshot of one package's file set

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "content_versions")]
pub struct Model {
	#[sea_orm(primary_key)]
	pub id: i32,
	pub package_id: i32,
	/// blake3 over the sorted `path\0hash\n` lines of every live file
	pub manifest_hash: String,
	pub file_count: i64,
	pub total_bytes: i64,
	pub created_at: DateTimeUtc,
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
}

impl Related<super::package::Entity> for Entity {
	fn to() -> RelationDef {
		Relation::Package.def()
	}
}

impl ActiveModelBehavior for ActiveModel {}
