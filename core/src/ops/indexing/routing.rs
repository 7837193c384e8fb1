//! Deterministic path → envelope routing
//!
//! Routing is a pure function of the relative path and the rule table loaded
//! at startup. It never looks at file content or the store.

use crate::config::RouteRule;

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The fixed processing recipe a file is routed to
#[derive(
	Debug,
	Clone,
	Copy,
	PartialEq,
	Eq,
	Hash,
	Serialize,
	Deserialize,
	strum::Display,
	strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EnvelopeKind {
	/// parse, extract symbols, extract references
	Full,
	/// parse only (syntax validation)
	ParseOnly,
	/// parse localisation tables
	Localization,
	/// not processed
	Skip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum Step {
	Parse,
	ExtractSymbols,
	ExtractReferences,
	ParseLocalization,
}

impl EnvelopeKind {
	pub fn steps(self) -> &'static [Step] {
		match self {
			Self::Full => &[Step::Parse, Step::ExtractSymbols, Step::ExtractReferences],
			Self::ParseOnly => &[Step::Parse],
			Self::Localization => &[Step::ParseLocalization],
			Self::Skip => &[],
		}
	}
}

#[derive(Debug, Error)]
#[error("invalid routing pattern '{pattern}': {source}")]
pub struct RoutingError {
	pattern: String,
	#[source]
	source: globset::Error,
}

#[derive(Debug, Clone)]
pub struct RoutingTable {
	rules: Vec<RouteRule>,
	set: GlobSet,
}

impl RoutingTable {
	pub fn new(rules: &[RouteRule]) -> Result<Self, RoutingError> {
		let set = rules
			.iter()
			.try_fold(GlobSetBuilder::new(), |mut builder, rule| {
				let glob = GlobBuilder::new(&rule.pattern)
					.literal_separator(true)
					.build()
					.map_err(|source| RoutingError {
						pattern: rule.pattern.clone(),
						source,
					})?;
				builder.add(glob);
				Ok::<_, RoutingError>(builder)
			})?
			.build()
			.map_err(|source| RoutingError {
				pattern: String::new(),
				source,
			})?;

		Ok(Self {
			rules: rules.to_vec(),
			set,
		})
	}

	/// First matching rule wins; unmatched paths are skipped.
	pub fn route(&self, rel_path: &str) -> EnvelopeKind {
		self.set
			.matches(rel_path)
			.into_iter()
			.min()
			.map(|index| self.rules[index].envelope)
			.unwrap_or(EnvelopeKind::Skip)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::CoreConfig;
	use std::path::PathBuf;

	fn default_table() -> RoutingTable {
		let config = CoreConfig::default_with_dir(PathBuf::from("/tmp/strata"));
		RoutingTable::new(&config.routing).expect("routing")
	}

	#[test]
	fn first_match_wins() {
		let table = default_table();
		assert_eq!(table.route("common/traits/00_traits.txt"), EnvelopeKind::Full);
		assert_eq!(table.route("events/flavor.txt"), EnvelopeKind::Full);
		assert_eq!(
			table.route("localization/english/traits_l_english.yml"),
			EnvelopeKind::Localization
		);
		assert_eq!(table.route("gui/window.gui"), EnvelopeKind::ParseOnly);
		assert_eq!(table.route("history/titles/k_france.txt"), EnvelopeKind::ParseOnly);
		assert_eq!(table.route("descriptor.txt"), EnvelopeKind::ParseOnly);
		assert_eq!(table.route("gfx/portrait.dds"), EnvelopeKind::Skip);
	}

	#[test]
	fn routing_is_pure() {
		let table = default_table();
		let paths = ["common/traits/a.txt", "gfx/b.dds", "gui/c.gui"];
		let first: Vec<_> = paths.iter().map(|p| table.route(p)).collect();
		let second: Vec<_> = paths.iter().map(|p| table.route(p)).collect();
		assert_eq!(first, second);
	}

	#[test]
	fn steps_are_fixed_per_envelope() {
		assert_eq!(
			EnvelopeKind::Full.steps(),
			&[Step::Parse, Step::ExtractSymbols, Step::ExtractReferences]
		);
		assert!(EnvelopeKind::Skip.steps().is_empty());
		assert_eq!("parse_only".parse::<EnvelopeKind>().ok(), Some(EnvelopeKind::ParseOnly));
	}

	#[test]
	fn bad_patterns_are_reported() {
		let err = RoutingTable::new(&[RouteRule::new("common/[", EnvelopeKind::Full)])
			.expect_err("invalid glob");
		assert!(err.to_string().contains("common/["));
	}
}
