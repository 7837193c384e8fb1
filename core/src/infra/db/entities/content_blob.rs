use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Index row for a blob in the content-addressed store. Never updated.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "content_blobs")]
pub struct Model {
	#[sea_orm(primary_key, auto_increment = false)]
	pub hash: String,
	pub size: i64,
	pub created_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
