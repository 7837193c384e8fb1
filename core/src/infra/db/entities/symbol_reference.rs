use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "symbol_references")]
pub struct Model {
	#[sea_orm(primary_key)]
	pub id: i32,
	pub package_id: i32,
	pub file_id: i32,
	/// Display form of the enclosing symbol identity, if any
	pub from_symbol: Option<String>,
	pub key: String,
	pub target_type: String,
	pub target_name: String,
	pub line: i32,
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
