//! Symbols and references extracted from parsed files

use crate::ops::parse::Value;

use serde::{Deserialize, Serialize};
use std::fmt;

/// (symbol type, enclosing scope, name)
///
/// Unique within a single content version. Two packages defining the same
/// identity is exactly what the merge resolver looks at.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SymbolIdentity {
	pub symbol_type: String,
	pub scope: String,
	pub name: String,
}

impl SymbolIdentity {
	pub fn new(
		symbol_type: impl Into<String>,
		scope: impl Into<String>,
		name: impl Into<String>,
	) -> Self {
		Self {
			symbol_type: symbol_type.into(),
			scope: scope.into(),
			name: name.into(),
		}
	}
}

impl fmt::Display for SymbolIdentity {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		if self.scope.is_empty() {
			write!(f, "{}:{}", self.symbol_type, self.name)
		} else {
			write!(f, "{}:{}:{}", self.symbol_type, self.scope, self.name)
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedSymbol {
	pub identity: SymbolIdentity,
	pub line: u32,
	pub body: Value,
}

/// A named lookup towards another identity. Resolution is left to consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedReference {
	/// Enclosing symbol, `None` for file level references
	pub from: Option<SymbolIdentity>,
	pub key: String,
	pub target_type: String,
	pub target_name: String,
	pub line: u32,
}
