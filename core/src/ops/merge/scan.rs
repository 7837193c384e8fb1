//! Grouping committed symbols into merge units

use super::{resolve, MergeSource, MergeUnit, MergeVerdict};
use crate::{
	config::ResolverConfig,
	domain::SymbolIdentity,
	infra::db::entities::{package, Package},
	ops::parse::Value,
};

use sea_orm::{
	ConnectionTrait, DbBackend, DbErr, EntityTrait, FromQueryResult, JsonValue, Statement,
};
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, instrument};

#[derive(Debug, Error)]
pub enum MergeError {
	#[error("database error: {0}")]
	Database(#[from] DbErr),
	#[error("stored body of {identity} is unreadable: {source}")]
	Decode {
		identity: SymbolIdentity,
		source: serde_json::Error,
	},
}

#[derive(FromQueryResult)]
struct SymbolRow {
	package_id: i32,
	symbol_type: String,
	scope: String,
	name: String,
	line: i32,
	body: JsonValue,
	rel_path: String,
}

/// Live symbols of active packages, grouped by identity and in load order
const LIVE_SYMBOLS: &str = "\
	SELECT s.package_id, s.symbol_type, s.scope, s.name, s.line, s.body, f.rel_path \
	FROM symbols s \
	JOIN source_files f ON f.id = s.file_id \
	JOIN packages p ON p.id = s.package_id \
	WHERE f.deleted = 0 AND p.load_index >= 0 \
	ORDER BY s.symbol_type, s.scope, s.name, p.load_index, f.rel_path";

/// Scan the committed symbol table and resolve every identity.
///
/// Verdicts come out ordered by identity, so two scans over the same store
/// produce the same list.
#[instrument(skip_all)]
pub async fn resolve_all<C: ConnectionTrait>(
	conn: &C,
	config: &ResolverConfig,
) -> Result<Vec<MergeVerdict>, MergeError> {
	let packages: HashMap<i32, crate::domain::Package> = Package::find()
		.all(conn)
		.await?
		.iter()
		.map(|model: &package::Model| (model.id, model.to_domain()))
		.collect();

	let rows = SymbolRow::find_by_statement(Statement::from_string(
		DbBackend::Sqlite,
		LIVE_SYMBOLS,
	))
	.all(conn)
	.await?;

	let mut verdicts = Vec::new();
	let mut current: Option<MergeUnit> = None;

	for row in rows {
		let Some(package) = packages.get(&row.package_id) else {
			continue;
		};
		let identity = SymbolIdentity::new(row.symbol_type, row.scope, row.name);
		let body: Value = serde_json::from_value(row.body).map_err(|source| MergeError::Decode {
			identity: identity.clone(),
			source,
		})?;

		let source = MergeSource {
			package: package.name.clone(),
			load_index: package.load_index,
			intended: package.replaces(&row.rel_path),
			rel_path: row.rel_path,
			line: u32::try_from(row.line).unwrap_or_default(),
			body,
		};

		match current.as_mut() {
			Some(unit) if unit.identity == identity => unit.sources.push(source),
			_ => {
				if let Some(unit) = current.replace(MergeUnit {
					identity,
					sources: vec![source],
				}) {
					verdicts.extend(resolve(&unit, config));
				}
			}
		}
	}
	if let Some(unit) = current {
		verdicts.extend(resolve(&unit, config));
	}

	debug!(
		identities = verdicts.len(),
		conflicts = verdicts.iter().filter(|v| v.is_conflict()).count(),
		"Resolved merge units"
	);
	Ok(verdicts)
}
