use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "symbols")]
pub struct Model {
	#[sea_orm(primary_key)]
	pub id: i32,
	pub package_id: i32,
	pub file_id: i32,
	pub symbol_type: String,
	pub scope: String,
	pub name: String,
	pub line: i32,
	pub body: Json, // parse::Value as JSON
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
