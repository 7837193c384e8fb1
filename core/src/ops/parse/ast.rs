use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
	/// `=`
	Assign,
	/// `==`
	Equal,
	/// `!=`
	NotEqual,
	/// `<`
	Less,
	/// `<=`
	LessOrEqual,
	/// `>`
	Greater,
	/// `>=`
	GreaterOrEqual,
	/// `?=`
	Exists,
}

impl Operator {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Assign => "=",
			Self::Equal => "==",
			Self::NotEqual => "!=",
			Self::Less => "<",
			Self::LessOrEqual => "<=",
			Self::Greater => ">",
			Self::GreaterOrEqual => ">=",
			Self::Exists => "?=",
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
	Scalar(String),
	Block(Vec<Entry>),
}

/// One statement inside a block.
///
/// Keyless entries are bare list items (`{ a b c }` or `{ { ... } { ... } }`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub key: Option<String>,
	pub op: Operator,
	pub value: Value,
	pub line: u32,
}

impl Entry {
	pub fn keyed(key: impl Into<String>, op: Operator, value: Value, line: u32) -> Self {
		Self {
			key: Some(key.into()),
			op,
			value,
			line,
		}
	}

	pub fn item(value: Value, line: u32) -> Self {
		Self {
			key: None,
			op: Operator::Assign,
			value,
			line,
		}
	}
}

impl Value {
	pub fn as_scalar(&self) -> Option<&str> {
		match self {
			Self::Scalar(s) => Some(s),
			Self::Block(_) => None,
		}
	}

	pub fn entries(&self) -> &[Entry] {
		match self {
			Self::Block(entries) => entries,
			Self::Scalar(_) => &[],
		}
	}

	/// First keyed entry named `key` in a block
	pub fn get(&self, key: &str) -> Option<&Value> {
		self.entries()
			.iter()
			.find(|entry| entry.key.as_deref() == Some(key))
			.map(|entry| &entry.value)
	}

	/// Rendering that ignores source positions, used to compare definitions
	/// coming from different files.
	pub fn canonical(&self) -> String {
		let mut out = String::new();
		self.write_canonical(&mut out);
		out
	}

	fn write_canonical(&self, out: &mut String) {
		match self {
			Self::Scalar(s) => out.push_str(s),
			Self::Block(entries) => {
				out.push('{');
				for (i, entry) in entries.iter().enumerate() {
					if i > 0 {
						out.push(' ');
					}
					entry.write_canonical(out);
				}
				out.push('}');
			}
		}
	}
}

impl Entry {
	pub fn canonical(&self) -> String {
		let mut out = String::new();
		self.write_canonical(&mut out);
		out
	}

	fn write_canonical(&self, out: &mut String) {
		if let Some(key) = &self.key {
			out.push_str(key);
			out.push_str(self.op.as_str());
		}
		self.value.write_canonical(out);
	}
}

impl fmt::Display for Value {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.canonical())
	}
}
