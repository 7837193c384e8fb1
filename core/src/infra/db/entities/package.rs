//! Package entity
//!
//! One row per configured package. `load_index` 0 is the base game.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "packages")]
pub struct Model {
	#[sea_orm(primary_key)]
	pub id: i32,
	#[sea_orm(unique)]
	pub name: String,
	pub root: String,
	pub load_index: i32,
	pub replace_paths: Json, // Vec<String> as JSON
	pub active_version_id: Option<i32>,
	pub created_at: DateTimeUtc,
	pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
	#[sea_orm(has_many = "super::source_file::Entity")]
	SourceFiles,
	#[sea_orm(has_many = "super::content_version::Entity")]
	ContentVersions,
}

impl Related<super::source_file::Entity> for Entity {
	fn to() -> RelationDef {
		Relation::SourceFiles.def()
	}
}

impl Related<super::content_version::Entity> for Entity {
	fn to() -> RelationDef {
		Relation::ContentVersions.def()
	}
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
	pub fn replace_paths(&self) -> Vec<String> {
		serde_json::from_value(self.replace_paths.clone()).unwrap_or_default()
	}

	pub fn to_domain(&self) -> crate::domain::Package {
		crate::domain::Package {
			id: self.id,
			name: self.name.clone(),
			root: self.root.clone().into(),
			load_index: self.load_index,
			replace_paths: self.replace_paths(),
		}
	}
}
