//! Parser for the brace-and-assignment script format
//!
//! ```text
//! namespace = flavor
//! brave = {
//!     category = personality
//!     opposites = { craven }
//!     monthly_prestige >= 0.5
//! }
//! ```
//!
//! The parser is deliberately schema-less: it produces a tree of keyed and
//! keyless entries and leaves any meaning to the extraction steps.

mod ast;
mod extract;
mod lexer;
mod localization;

pub use ast::{Entry, Operator, Value};
pub use extract::{extract_references, extract_symbols, symbol_type_for};
pub use localization::{
	localization_symbols, parse_localization, LocEntry, LOCALIZATION_SYMBOL_TYPE,
};

use lexer::{Lexer, Token, TokenKind};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{line}:{column}: {message}")]
pub struct ParseError {
	pub line: u32,
	pub column: u32,
	pub message: String,
}

/// Deepest block nesting accepted. Each level costs three levels once a body
/// is stored as JSON, which must stay under serde_json's recursion limit.
pub const MAX_DEPTH: usize = 40;

/// Parse a whole file into its top level entries.
pub fn parse(source: &str) -> Result<Vec<Entry>, ParseError> {
	let mut parser = Parser {
		lexer: Lexer::new(source),
		peeked: None,
		depth: 0,
	};
	parser.entries(None)
}

struct Parser<'a> {
	lexer: Lexer<'a>,
	peeked: Option<Token>,
	depth: usize,
}

impl Parser<'_> {
	fn next(&mut self) -> Result<Option<Token>, ParseError> {
		match self.peeked.take() {
			Some(token) => Ok(Some(token)),
			None => self.lexer.next_token(),
		}
	}

	fn peek(&mut self) -> Result<Option<&Token>, ParseError> {
		if self.peeked.is_none() {
			self.peeked = self.lexer.next_token()?;
		}
		Ok(self.peeked.as_ref())
	}

	/// Reads entries until the matching `}` (when `opened_at` is set) or the end of input.
	fn entries(&mut self, opened_at: Option<&Token>) -> Result<Vec<Entry>, ParseError> {
		let mut entries = Vec::new();

		loop {
			let Some(token) = self.next()? else {
				return match opened_at {
					Some(open) => Err(ParseError {
						line: open.line,
						column: open.column,
						message: "unclosed block".to_string(),
					}),
					None => Ok(entries),
				};
			};

			match token.kind {
				TokenKind::Close => {
					if opened_at.is_some() {
						return Ok(entries);
					}
					return Err(ParseError {
						line: token.line,
						column: token.column,
						message: "unexpected '}'".to_string(),
					});
				}
				TokenKind::Open => {
					let block = self.block(&token)?;
					entries.push(Entry::item(Value::Block(block), token.line));
				}
				TokenKind::Op(op) => {
					return Err(ParseError {
						line: token.line,
						column: token.column,
						message: format!("unexpected operator '{}'", op.as_str()),
					});
				}
				TokenKind::Word(ref word) | TokenKind::Quoted(ref word) => {
					let op = match self.peek()? {
						Some(Token {
							kind: TokenKind::Op(op),
							..
						}) => Some(*op),
						_ => None,
					};

					match op {
						Some(op) => {
							self.next()?;
							let value = self.value(&token)?;
							entries.push(Entry::keyed(word.clone(), op, value, token.line));
						}
						None => entries.push(Entry::item(Value::Scalar(word.clone()), token.line)),
					}
				}
			}
		}
	}

	fn block(&mut self, open: &Token) -> Result<Vec<Entry>, ParseError> {
		if self.depth >= MAX_DEPTH {
			return Err(ParseError {
				line: open.line,
				column: open.column,
				message: format!("blocks nested deeper than {MAX_DEPTH}"),
			});
		}
		self.depth += 1;
		let entries = self.entries(Some(open));
		self.depth -= 1;
		entries
	}

	fn value(&mut self, key: &Token) -> Result<Value, ParseError> {
		let Some(token) = self.next()? else {
			return Err(ParseError {
				line: key.line,
				column: key.column,
				message: "expected a value, found end of input".to_string(),
			});
		};

		match token.kind {
			TokenKind::Open => Ok(Value::Block(self.block(&token)?)),
			TokenKind::Word(word) | TokenKind::Quoted(word) => Ok(Value::Scalar(word)),
			TokenKind::Close | TokenKind::Op(_) => Err(ParseError {
				line: token.line,
				column: token.column,
				message: "expected a value".to_string(),
			}),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use pretty_assertions::assert_eq;

	#[test]
	fn nested_blocks_and_lists() {
		let entries = parse(
			r#"
			brave = {
				opposites = { craven }
				monthly_prestige >= 0.5
				name = "Brave One"
			}
			"#,
		)
		.expect("parse");

		assert_eq!(entries.len(), 1);
		let brave = &entries[0];
		assert_eq!(brave.key.as_deref(), Some("brave"));
		assert_eq!(brave.line, 2);
		assert_eq!(
			brave.value.get("opposites"),
			Some(&Value::Block(vec![Entry::item(
				Value::Scalar("craven".into()),
				3
			)]))
		);
		assert_eq!(
			brave.value.entries()[1].op,
			Operator::GreaterOrEqual
		);
		assert_eq!(
			brave.value.get("name").and_then(Value::as_scalar),
			Some("Brave One")
		);
	}

	#[test]
	fn canonical_form_ignores_lines() {
		let a = parse("x = { a = 1 b = { c } }").expect("a");
		let b = parse("x = {\n a = 1\n\n b = {\n c\n }\n}").expect("b");
		assert_eq!(a[0].canonical(), b[0].canonical());
		assert_eq!(a[0].canonical(), "x={a=1 b={c}}");
	}

	#[test]
	fn unclosed_block_points_at_the_brace() {
		let err = parse("a = {\n b = 1\n").expect_err("unclosed");
		assert_eq!((err.line, err.column), (1, 5));
	}

	#[test]
	fn stray_closing_brace_is_an_error() {
		assert!(parse("a = 1 }").is_err());
	}

	#[test]
	fn runaway_nesting_is_rejected() {
		let deep = format!("a = {}", "{".repeat(200_000));
		let err = parse(&deep).expect_err("too deep");
		assert_eq!(err.line, 1);
		assert!(err.message.contains("nested deeper"));

		let ok = format!("a = {}{}", "{ ".repeat(MAX_DEPTH), "}".repeat(MAX_DEPTH));
		assert!(parse(&ok).is_ok());
	}
}
