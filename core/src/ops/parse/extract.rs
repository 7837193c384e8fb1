use super::ast::{Entry, Value};
use crate::domain::{ExtractedReference, ExtractedSymbol, SymbolIdentity};

use std::collections::HashMap;

pub const EVENT_SYMBOL_TYPE: &str = "event";
pub const VARIABLE_SYMBOL_TYPE: &str = "scripted_variable";

/// Keys whose value names another definition.
///
/// `(key, target type, field holding the name when the value is a block)`
const REFERENCE_KEYS: &[(&str, &str, Option<&str>)] = &[
	("has_trait", "traits", None),
	("add_trait", "traits", None),
	("remove_trait", "traits", None),
	("opposites", "traits", None),
	("has_culture", "culture", None),
	("culture", "culture", None),
	("has_faith", "religion", None),
	("faith", "religion", None),
	("add_modifier", "modifiers", Some("modifier")),
	("has_modifier", "modifiers", None),
	("remove_modifier", "modifiers", None),
	("trigger_event", EVENT_SYMBOL_TYPE, Some("id")),
	("events", EVENT_SYMBOL_TYPE, None),
	("random_events", EVENT_SYMBOL_TYPE, None),
	("on_actions", "on_action", None),
	("trigger_on_action", "on_action", Some("on_action")),
];

/// Symbol type implied by a file's location inside its package.
///
/// `common/<type>/...` yields `<type>`, `events/...` yields `event`, any other
/// nested file yields its top directory. Files at the package root yield nothing.
pub fn symbol_type_for(rel_path: &str) -> Option<String> {
	let mut components = rel_path.split('/');
	let top = components.next()?;
	let rest: Vec<_> = components.collect();
	if rest.is_empty() {
		return None;
	}

	match top {
		"common" if rest.len() >= 2 => Some(rest[0].to_string()),
		"common" => None,
		"events" => Some(EVENT_SYMBOL_TYPE.to_string()),
		other => Some(other.to_string()),
	}
}

/// Top level definitions of a parsed file.
///
/// When one file defines the same identity twice the later definition wins,
/// keeping the position of the first occurrence.
pub fn extract_symbols(rel_path: &str, entries: &[Entry]) -> Vec<ExtractedSymbol> {
	let mut symbols: Vec<ExtractedSymbol> = Vec::new();
	let mut positions: HashMap<SymbolIdentity, usize> = HashMap::new();

	for (entry, identity) in definitions(rel_path, entries) {
		let symbol = ExtractedSymbol {
			identity: identity.clone(),
			line: entry.line,
			body: entry.value.clone(),
		};

		match positions.get(&identity) {
			Some(&index) => symbols[index] = symbol,
			None => {
				positions.insert(identity, symbols.len());
				symbols.push(symbol);
			}
		}
	}

	symbols
}

/// Top level entries that define a symbol, in file order, duplicates included.
fn definitions<'a>(rel_path: &str, entries: &'a [Entry]) -> Vec<(&'a Entry, SymbolIdentity)> {
	let symbol_type = symbol_type_for(rel_path);
	let mut namespace = String::new();
	let mut out = Vec::new();

	for entry in entries {
		let Some(key) = entry.key.as_deref() else {
			continue;
		};

		let identity = match (&entry.value, symbol_type.as_deref()) {
			(Value::Scalar(ns), Some(EVENT_SYMBOL_TYPE)) if key == "namespace" => {
				namespace = ns.clone();
				continue;
			}
			(_, _) if key.starts_with('@') => {
				SymbolIdentity::new(VARIABLE_SYMBOL_TYPE, rel_path, key.trim_start_matches('@'))
			}
			(Value::Block(_), Some(EVENT_SYMBOL_TYPE)) => {
				SymbolIdentity::new(EVENT_SYMBOL_TYPE, namespace.clone(), key)
			}
			(Value::Block(_), Some(symbol_type)) => SymbolIdentity::new(symbol_type, "", key),
			_ => continue,
		};
		out.push((entry, identity));
	}

	out
}

/// Every reference found in the file, attributed to the enclosing top level
/// symbol when there is one.
pub fn extract_references(rel_path: &str, entries: &[Entry]) -> Vec<ExtractedReference> {
	let mut owners = definitions(rel_path, entries).into_iter().peekable();
	let mut references = Vec::new();

	for entry in entries {
		let from = match owners.peek() {
			Some((owner, _)) if std::ptr::eq(*owner, entry) => owners.next().map(|(_, id)| id),
			_ => None,
		};
		collect(entry, from.as_ref(), &mut references);
	}
	references
}

fn collect(entry: &Entry, from: Option<&SymbolIdentity>, out: &mut Vec<ExtractedReference>) {
	if let Some(key) = entry.key.as_deref() {
		if let Some(&(_, target_type, block_field)) =
			REFERENCE_KEYS.iter().find(|(name, _, _)| *name == key)
		{
			let mut push = |name: &str, line: u32| {
				if is_identifier(name) {
					out.push(ExtractedReference {
						from: from.cloned(),
						key: key.to_string(),
						target_type: target_type.to_string(),
						target_name: name.to_string(),
						line,
					});
				}
			};

			match (&entry.value, block_field) {
				(Value::Scalar(name), _) => push(name, entry.line),
				(value @ Value::Block(_), Some(field)) => {
					if let Some(name) = value.get(field).and_then(Value::as_scalar) {
						push(name, entry.line);
					}
				}
				(Value::Block(items), None) => {
					// Bare lists (`{ a b }`) and weighted lists (`{ 100 = a }`)
					for item in items {
						let weighted = item
							.key
							.as_deref()
							.is_some_and(|k| k.parse::<f64>().is_ok());
						if item.key.is_none() || weighted {
							if let Some(name) = item.value.as_scalar() {
								push(name, item.line);
							}
						}
					}
				}
			}
		}
	}

	for child in entry.value.entries() {
		collect(child, from, out);
	}
}

fn is_identifier(value: &str) -> bool {
	!value.is_empty()
		&& !value.contains(':')
		&& !value.starts_with('@')
		&& !matches!(value, "yes" | "no")
		&& value.parse::<f64>().is_err()
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::ops::parse::parse;
	use pretty_assertions::assert_eq;

	#[test]
	fn symbol_types_follow_directories() {
		assert_eq!(
			symbol_type_for("common/traits/00_traits.txt").as_deref(),
			Some("traits")
		);
		assert_eq!(
			symbol_type_for("events/flavor.txt").as_deref(),
			Some("event")
		);
		assert_eq!(
			symbol_type_for("history/characters/x.txt").as_deref(),
			Some("history")
		);
		assert_eq!(symbol_type_for("common/loose.txt"), None);
		assert_eq!(symbol_type_for("descriptor.mod"), None);
	}

	#[test]
	fn events_are_scoped_by_namespace() {
		let entries = parse(
			"namespace = flavor\nflavor.0001 = { trigger_event = flavor.0002 }\nflavor.0002 = { }",
		)
		.expect("parse");
		let symbols = extract_symbols("events/flavor.txt", &entries);

		assert_eq!(
			symbols
				.iter()
				.map(|s| s.identity.clone())
				.collect::<Vec<_>>(),
			vec![
				SymbolIdentity::new("event", "flavor", "flavor.0001"),
				SymbolIdentity::new("event", "flavor", "flavor.0002"),
			]
		);
	}

	#[test]
	fn later_duplicate_in_one_file_wins() {
		let entries = parse("brave = { a = 1 }\ncraven = { }\nbrave = { a = 2 }").expect("parse");
		let symbols = extract_symbols("common/traits/t.txt", &entries);

		assert_eq!(symbols.len(), 2);
		assert_eq!(symbols[0].identity.name, "brave");
		assert_eq!(symbols[0].line, 3);
		assert_eq!(symbols[0].body.canonical(), "{a=2}");
	}

	#[test]
	fn variables_are_file_scoped() {
		let entries = parse("@base_cost = 100\nbrave = { cost = @base_cost }").expect("parse");
		let symbols = extract_symbols("common/traits/t.txt", &entries);

		assert_eq!(
			symbols[0].identity,
			SymbolIdentity::new(VARIABLE_SYMBOL_TYPE, "common/traits/t.txt", "base_cost")
		);
	}

	#[test]
	fn references_cover_scalars_blocks_and_lists() {
		let entries = parse(
			r#"
			on_birth = {
				events = { birth.1 birth.2 }
				random_events = { 100 = birth.3 50 = 0 }
				effect = {
					add_trait = brave
					trigger_event = { id = birth.4 days = 3 }
					has_trait = scope:target
				}
			}
			"#,
		)
		.expect("parse");
		let references = extract_references("common/on_action/births.txt", &entries);

		let targets: Vec<_> = references
			.iter()
			.map(|r| (r.target_type.as_str(), r.target_name.as_str()))
			.collect();
		assert_eq!(
			targets,
			vec![
				("event", "birth.1"),
				("event", "birth.2"),
				("event", "birth.3"),
				("traits", "brave"),
				("event", "birth.4"),
			]
		);
		assert!(references.iter().all(|r| r.from
			== Some(SymbolIdentity::new("on_action", "", "on_birth"))));
	}
}
