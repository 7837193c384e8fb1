//! Localization tables (`l_<language>:` header followed by `key:N "text"` lines)

use super::{ast::Value, ParseError};
use crate::domain::{ExtractedSymbol, SymbolIdentity};

use serde::{Deserialize, Serialize};

pub const LOCALIZATION_SYMBOL_TYPE: &str = "localization";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocEntry {
	pub language: String,
	pub key: String,
	pub version: Option<u32>,
	pub text: String,
	pub line: u32,
}

pub fn parse_localization(source: &str) -> Result<Vec<LocEntry>, ParseError> {
	let mut language: Option<String> = None;
	let mut entries = Vec::new();

	for (index, raw) in source.trim_start_matches('\u{feff}').lines().enumerate() {
		let line = index as u32 + 1;
		let trimmed = raw.trim();
		if trimmed.is_empty() || trimmed.starts_with('#') {
			continue;
		}
		let column = (raw.len() - raw.trim_start().len()) as u32 + 1;
		let error = |message: &str| ParseError {
			line,
			column,
			message: message.to_string(),
		};

		if let Some(header) = trimmed
			.strip_prefix("l_")
			.and_then(|rest| rest.strip_suffix(':'))
		{
			language = Some(header.to_string());
			continue;
		}

		let Some(language) = language.as_ref() else {
			return Err(error("entry before language header"));
		};

		let (key, rest) = trimmed
			.split_once(':')
			.ok_or_else(|| error("expected 'key: \"text\"'"))?;
		let key = key.trim();
		if key.is_empty() {
			return Err(error("missing key"));
		}

		let rest = rest.trim_start();
		let digits = rest.chars().take_while(char::is_ascii_digit).count();
		let version = match digits {
			0 => None,
			_ => rest[..digits].parse().ok(),
		};

		let text = rest[digits..].trim();
		let text = text
			.strip_prefix('"')
			.and_then(|t| t.rfind('"').map(|end| &t[..end]))
			.ok_or_else(|| error("expected quoted text"))?;

		entries.push(LocEntry {
			language: language.clone(),
			key: key.to_string(),
			version,
			text: text.to_string(),
			line,
		});
	}

	Ok(entries)
}

/// One symbol per key, scoped by language. Later keys replace earlier ones.
pub fn localization_symbols(entries: &[LocEntry]) -> Vec<ExtractedSymbol> {
	let mut symbols: Vec<ExtractedSymbol> = Vec::new();
	for entry in entries {
		let identity =
			SymbolIdentity::new(LOCALIZATION_SYMBOL_TYPE, entry.language.as_str(), entry.key.as_str());
		let symbol = ExtractedSymbol {
			identity,
			line: entry.line,
			body: Value::Scalar(entry.text.clone()),
		};
		match symbols.iter_mut().find(|s| s.identity == symbol.identity) {
			Some(existing) => *existing = symbol,
			None => symbols.push(symbol),
		}
	}
	symbols
}

#[cfg(test)]
mod tests {
	use super::*;
	use pretty_assertions::assert_eq;

	#[test]
	fn reads_header_and_entries() {
		let source = "\u{feff}l_english:\n # comment\n trait_brave:0 \"Brave\"\n trait_brave_desc: \"Has \\\"no\\\" fear\"\n";
		let entries = parse_localization(source).expect("parse");

		assert_eq!(entries.len(), 2);
		assert_eq!(entries[0].language, "english");
		assert_eq!(entries[0].key, "trait_brave");
		assert_eq!(entries[0].version, Some(0));
		assert_eq!(entries[0].text, "Brave");
		assert_eq!(entries[1].version, None);
		assert_eq!(entries[1].text, "Has \\\"no\\\" fear");
		assert_eq!(entries[1].line, 4);
	}

	#[test]
	fn entry_without_header_is_rejected() {
		let err = parse_localization("  key:0 \"x\"").expect_err("no header");
		assert_eq!((err.line, err.column), (1, 3));
	}

	#[test]
	fn symbols_are_scoped_by_language() {
		let entries =
			parse_localization("l_english:\n a:0 \"A\"\n a:1 \"B\"\nl_french:\n a:0 \"C\"").expect("parse");
		let symbols = localization_symbols(&entries);

		assert_eq!(symbols.len(), 2);
		assert_eq!(symbols[0].identity.to_string(), "localization:english:a");
		assert_eq!(symbols[0].body, Value::Scalar("B".into()));
		assert_eq!(symbols[1].identity.scope, "french");
	}
}
