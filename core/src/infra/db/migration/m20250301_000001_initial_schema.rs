//! Initial schema: packages, content versions and blobs, source files,
//! symbols, references and the build queue

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
	async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
		manager
			.create_table(
				Table::create()
					.table(Packages::Table)
					.if_not_exists()
					.col(
						ColumnDef::new(Packages::Id)
							.integer()
							.not_null()
							.auto_increment()
							.primary_key(),
					)
					.col(ColumnDef::new(Packages::Name).string().not_null().unique_key())
					.col(ColumnDef::new(Packages::Root).string().not_null())
					.col(ColumnDef::new(Packages::LoadIndex).integer().not_null())
					.col(ColumnDef::new(Packages::ReplacePaths).json().not_null())
					.col(ColumnDef::new(Packages::ActiveVersionId).integer())
					.col(
						ColumnDef::new(Packages::CreatedAt)
							.timestamp_with_time_zone()
							.not_null(),
					)
					.col(
						ColumnDef::new(Packages::UpdatedAt)
							.timestamp_with_time_zone()
							.not_null(),
					)
					.to_owned(),
			)
			.await?;

		manager
			.create_table(
				Table::create()
					.table(ContentVersions::Table)
					.if_not_exists()
					.col(
						ColumnDef::new(ContentVersions::Id)
							.integer()
							.not_null()
							.auto_increment()
							.primary_key(),
					)
					.col(ColumnDef::new(ContentVersions::PackageId).integer().not_null())
					.col(ColumnDef::new(ContentVersions::ManifestHash).string().not_null())
					.col(ColumnDef::new(ContentVersions::FileCount).big_integer().not_null())
					.col(ColumnDef::new(ContentVersions::TotalBytes).big_integer().not_null())
					.col(
						ColumnDef::new(ContentVersions::CreatedAt)
							.timestamp_with_time_zone()
							.not_null(),
					)
					.foreign_key(
						ForeignKey::create()
							.name("fk_content_versions_package")
							.from(ContentVersions::Table, ContentVersions::PackageId)
							.to(Packages::Table, Packages::Id)
							.on_delete(ForeignKeyAction::Cascade),
					)
					.to_owned(),
			)
			.await?;

		manager
			.create_table(
				Table::create()
					.table(ContentBlobs::Table)
					.if_not_exists()
					.col(
						ColumnDef::new(ContentBlobs::Hash)
							.string()
							.not_null()
							.primary_key(),
					)
					.col(ColumnDef::new(ContentBlobs::Size).big_integer().not_null())
					.col(
						ColumnDef::new(ContentBlobs::CreatedAt)
							.timestamp_with_time_zone()
							.not_null(),
					)
					.to_owned(),
			)
			.await?;

		manager
			.create_table(
				Table::create()
					.table(SourceFiles::Table)
					.if_not_exists()
					.col(
						ColumnDef::new(SourceFiles::Id)
							.integer()
							.not_null()
							.auto_increment()
							.primary_key(),
					)
					.col(ColumnDef::new(SourceFiles::PackageId).integer().not_null())
					.col(ColumnDef::new(SourceFiles::RelPath).string().not_null())
					.col(ColumnDef::new(SourceFiles::Envelope).string().not_null())
					.col(ColumnDef::new(SourceFiles::MtimeNs).big_integer().not_null())
					.col(ColumnDef::new(SourceFiles::Size).big_integer().not_null())
					.col(ColumnDef::new(SourceFiles::ContentHash).string().not_null())
					.col(ColumnDef::new(SourceFiles::ProcessedHash).string())
					.col(ColumnDef::new(SourceFiles::LastBuildId).integer())
					.col(
						ColumnDef::new(SourceFiles::Deleted)
							.boolean()
							.not_null()
							.default(false),
					)
					.col(
						ColumnDef::new(SourceFiles::UpdatedAt)
							.timestamp_with_time_zone()
							.not_null(),
					)
					.foreign_key(
						ForeignKey::create()
							.name("fk_source_files_package")
							.from(SourceFiles::Table, SourceFiles::PackageId)
							.to(Packages::Table, Packages::Id)
							.on_delete(ForeignKeyAction::Cascade),
					)
					.to_owned(),
			)
			.await?;

		manager
			.create_index(
				Index::create()
					.name("idx_source_files_package_path")
					.table(SourceFiles::Table)
					.col(SourceFiles::PackageId)
					.col(SourceFiles::RelPath)
					.unique()
					.to_owned(),
			)
			.await?;

		manager
			.create_table(
				Table::create()
					.table(Symbols::Table)
					.if_not_exists()
					.col(
						ColumnDef::new(Symbols::Id)
							.integer()
							.not_null()
							.auto_increment()
							.primary_key(),
					)
					.col(ColumnDef::new(Symbols::PackageId).integer().not_null())
					.col(ColumnDef::new(Symbols::FileId).integer().not_null())
					.col(ColumnDef::new(Symbols::SymbolType).string().not_null())
					.col(ColumnDef::new(Symbols::Scope).string().not_null())
					.col(ColumnDef::new(Symbols::Name).string().not_null())
					.col(ColumnDef::new(Symbols::Line).integer().not_null())
					.col(ColumnDef::new(Symbols::Body).json().not_null())
					.foreign_key(
						ForeignKey::create()
							.name("fk_symbols_file")
							.from(Symbols::Table, Symbols::FileId)
							.to(SourceFiles::Table, SourceFiles::Id)
							.on_delete(ForeignKeyAction::Cascade),
					)
					.to_owned(),
			)
			.await?;

		// One definition per identity per package (and so per content version)
		manager
			.create_index(
				Index::create()
					.name("idx_symbols_identity")
					.table(Symbols::Table)
					.col(Symbols::PackageId)
					.col(Symbols::SymbolType)
					.col(Symbols::Scope)
					.col(Symbols::Name)
					.unique()
					.to_owned(),
			)
			.await?;

		manager
			.create_index(
				Index::create()
					.name("idx_symbols_file")
					.table(Symbols::Table)
					.col(Symbols::FileId)
					.to_owned(),
			)
			.await?;

		manager
			.create_table(
				Table::create()
					.table(SymbolReferences::Table)
					.if_not_exists()
					.col(
						ColumnDef::new(SymbolReferences::Id)
							.integer()
							.not_null()
							.auto_increment()
							.primary_key(),
					)
					.col(ColumnDef::new(SymbolReferences::PackageId).integer().not_null())
					.col(ColumnDef::new(SymbolReferences::FileId).integer().not_null())
					.col(ColumnDef::new(SymbolReferences::FromSymbol).string())
					.col(ColumnDef::new(SymbolReferences::Key).string().not_null())
					.col(ColumnDef::new(SymbolReferences::TargetType).string().not_null())
					.col(ColumnDef::new(SymbolReferences::TargetName).string().not_null())
					.col(ColumnDef::new(SymbolReferences::Line).integer().not_null())
					.foreign_key(
						ForeignKey::create()
							.name("fk_symbol_references_file")
							.from(SymbolReferences::Table, SymbolReferences::FileId)
							.to(SourceFiles::Table, SourceFiles::Id)
							.on_delete(ForeignKeyAction::Cascade),
					)
					.to_owned(),
			)
			.await?;

		manager
			.create_index(
				Index::create()
					.name("idx_symbol_references_target")
					.table(SymbolReferences::Table)
					.col(SymbolReferences::TargetType)
					.col(SymbolReferences::TargetName)
					.to_owned(),
			)
			.await?;

		manager
			.create_table(
				Table::create()
					.table(BuildQueue::Table)
					.if_not_exists()
					.col(
						ColumnDef::new(BuildQueue::BuildId)
							.integer()
							.not_null()
							.auto_increment()
							.primary_key(),
					)
					.col(ColumnDef::new(BuildQueue::FileId).integer().not_null())
					.col(ColumnDef::new(BuildQueue::Envelope).string().not_null())
					.col(ColumnDef::new(BuildQueue::Priority).integer().not_null())
					.col(ColumnDef::new(BuildQueue::State).string().not_null())
					.col(ColumnDef::new(BuildQueue::ContentHash).string().not_null())
					.col(
						ColumnDef::new(BuildQueue::Attempts)
							.integer()
							.not_null()
							.default(0),
					)
					.col(ColumnDef::new(BuildQueue::ClaimedBy).string())
					.col(ColumnDef::new(BuildQueue::Error).string())
					.col(ColumnDef::new(BuildQueue::Outcome).string())
					.col(
						ColumnDef::new(BuildQueue::EnqueuedAt)
							.timestamp_with_time_zone()
							.not_null(),
					)
					.col(ColumnDef::new(BuildQueue::ClaimedAt).timestamp_with_time_zone())
					.col(ColumnDef::new(BuildQueue::FinishedAt).timestamp_with_time_zone())
					.foreign_key(
						ForeignKey::create()
							.name("fk_build_queue_file")
							.from(BuildQueue::Table, BuildQueue::FileId)
							.to(SourceFiles::Table, SourceFiles::Id)
							.on_delete(ForeignKeyAction::Cascade),
					)
					.to_owned(),
			)
			.await?;

		manager
			.create_index(
				Index::create()
					.name("idx_build_queue_claim_order")
					.table(BuildQueue::Table)
					.col(BuildQueue::State)
					.col(BuildQueue::Priority)
					.col(BuildQueue::BuildId)
					.to_owned(),
			)
			.await?;

		manager
			.create_index(
				Index::create()
					.name("idx_build_queue_file")
					.table(BuildQueue::Table)
					.col(BuildQueue::FileId)
					.to_owned(),
			)
			.await?;

		Ok(())
	}

	async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
		manager
			.drop_table(Table::drop().table(BuildQueue::Table).if_exists().to_owned())
			.await?;
		manager
			.drop_table(Table::drop().table(SymbolReferences::Table).if_exists().to_owned())
			.await?;
		manager
			.drop_table(Table::drop().table(Symbols::Table).if_exists().to_owned())
			.await?;
		manager
			.drop_table(Table::drop().table(SourceFiles::Table).if_exists().to_owned())
			.await?;
		manager
			.drop_table(Table::drop().table(ContentBlobs::Table).if_exists().to_owned())
			.await?;
		manager
			.drop_table(Table::drop().table(ContentVersions::Table).if_exists().to_owned())
			.await?;
		manager
			.drop_table(Table::drop().table(Packages::Table).if_exists().to_owned())
			.await?;
		Ok(())
	}
}

#[derive(DeriveIden)]
enum Packages {
	Table,
	Id,
	Name,
	Root,
	LoadIndex,
	ReplacePaths,
	ActiveVersionId,
	CreatedAt,
	UpdatedAt,
}

#[derive(DeriveIden)]
enum ContentVersions {
	Table,
	Id,
	PackageId,
	ManifestHash,
	FileCount,
	TotalBytes,
	CreatedAt,
}

#[derive(DeriveIden)]
enum ContentBlobs {
	Table,
	Hash,
	Size,
	CreatedAt,
}

#[derive(DeriveIden)]
enum SourceFiles {
	Table,
	Id,
	PackageId,
	RelPath,
	Envelope,
	MtimeNs,
	Size,
	ContentHash,
	ProcessedHash,
	LastBuildId,
	Deleted,
	UpdatedAt,
}

#[derive(DeriveIden)]
enum Symbols {
	Table,
	Id,
	PackageId,
	FileId,
	SymbolType,
	Scope,
	Name,
	Line,
	Body,
}

#[derive(DeriveIden)]
enum SymbolReferences {
	Table,
	Id,
	PackageId,
	FileId,
	FromSymbol,
	Key,
	TargetType,
	TargetName,
	Line,
}

#[derive(DeriveIden)]
enum BuildQueue {
	Table,
	BuildId,
	FileId,
	Envelope,
	Priority,
	State,
	ContentHash,
	Attempts,
	ClaimedBy,
	Error,
	Outcome,
	EnqueuedAt,
	ClaimedAt,
	FinishedAt,
}
