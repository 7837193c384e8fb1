//! Database infrastructure using SeaORM

use sea_orm::{
	ConnectOptions, ConnectionTrait, Database as SeaDatabase, DatabaseConnection, DbErr,
	Statement,
};
use sea_orm_migration::{MigrationName, MigratorTrait};
use std::{collections::HashSet, path::Path, time::Duration};
use tracing::info;

pub mod entities;
pub mod migration;

/// Database wrapper for the index store
///
/// The pool holds a single SQLite connection: every statement and transaction
/// in the process is serialized through it, which keeps the writer funnel
/// free of `SQLITE_BUSY` upgrades between concurrent transactions.
#[derive(Clone)]
pub struct Database {
	conn: DatabaseConnection,
}

impl Database {
	/// Create (or open) the database at the specified path
	pub async fn create(path: &Path) -> Result<Self, DbErr> {
		if let Some(parent) = path.parent() {
			std::fs::create_dir_all(parent)
				.map_err(|e| DbErr::Custom(format!("Failed to create directory: {}", e)))?;
		}

		let conn = Self::connect(format!("sqlite://{}?mode=rwc", path.display())).await?;
		info!("Opened database at {:?}", path);

		Ok(Self { conn })
	}

	/// Open an existing database
	pub async fn open(path: &Path) -> Result<Self, DbErr> {
		if !path.exists() {
			return Err(DbErr::Custom(format!(
				"Database does not exist: {}",
				path.display()
			)));
		}

		let conn = Self::connect(format!("sqlite://{}", path.display())).await?;
		info!("Opened database at {:?}", path);

		Ok(Self { conn })
	}

	async fn connect(url: String) -> Result<DatabaseConnection, DbErr> {
		let mut opt = ConnectOptions::new(url);
		opt.max_connections(1)
			.min_connections(1)
			.connect_timeout(Duration::from_secs(8))
			.acquire_timeout(Duration::from_secs(30))
			.sqlx_logging(false);

		let conn = SeaDatabase::connect(opt).await?;
		for pragma in [
			"PRAGMA journal_mode = WAL;",
			"PRAGMA synchronous = NORMAL;",
			"PRAGMA foreign_keys = ON;",
			"PRAGMA busy_timeout = 5000;",
		] {
			conn.execute_unprepared(pragma).await?;
		}
		Ok(conn)
	}

	/// Run migrations
	pub async fn migrate(&self) -> Result<(), DbErr> {
		migration::Migrator::up(&self.conn, None).await?;
		info!("Database migrations completed successfully");
		Ok(())
	}

	/// Whether every migration this build knows has been applied. Unlike the
	/// migrator's own status queries this never creates the migrations table.
	pub async fn is_current(&self) -> Result<bool, DbErr> {
		let backend = self.conn.get_database_backend();
		let installed = self
			.conn
			.query_one(Statement::from_string(
				backend,
				"SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'seaql_migrations'",
			))
			.await?
			.is_some();
		if !installed {
			return Ok(false);
		}

		let applied = self
			.conn
			.query_all(Statement::from_string(
				backend,
				"SELECT version FROM seaql_migrations",
			))
			.await?
			.iter()
			.map(|row| row.try_get::<String>("", "version"))
			.collect::<Result<HashSet<_>, _>>()?;

		Ok(migration::Migrator::migrations()
			.iter()
			.all(|m| applied.contains(m.name())))
	}

	/// Get the database connection
	pub fn conn(&self) -> &DatabaseConnection {
		&self.conn
	}
}
