use super::{ast::Operator, ParseError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenKind {
	Word(String),
	Quoted(String),
	Op(Operator),
	Open,
	Close,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
	pub kind: TokenKind,
	pub line: u32,
	pub column: u32,
}

pub struct Lexer<'a> {
	chars: std::iter::Peekable<std::str::Chars<'a>>,
	line: u32,
	column: u32,
}

const fn is_delimiter(c: char) -> bool {
	matches!(c, '=' | '{' | '}' | '<' | '>' | '!' | '?' | '#' | '"')
}

impl<'a> Lexer<'a> {
	pub fn new(source: &'a str) -> Self {
		Self {
			chars: source.trim_start_matches('\u{feff}').chars().peekable(),
			line: 1,
			column: 1,
		}
	}

	fn bump(&mut self) -> Option<char> {
		let c = self.chars.next()?;
		if c == '\n' {
			self.line += 1;
			self.column = 1;
		} else {
			self.column += 1;
		}
		Some(c)
	}

	fn error(&self, line: u32, column: u32, message: impl Into<String>) -> ParseError {
		ParseError {
			line,
			column,
			message: message.into(),
		}
	}

	pub fn next_token(&mut self) -> Result<Option<Token>, ParseError> {
		loop {
			match self.chars.peek().copied() {
				None => return Ok(None),
				Some(c) if c.is_whitespace() => {
					self.bump();
				}
				Some('#') => {
					while let Some(c) = self.bump() {
						if c == '\n' {
							break;
						}
					}
				}
				Some(_) => break,
			}
		}

		let (line, column) = (self.line, self.column);
		let Some(c) = self.bump() else {
			return Ok(None);
		};

		let kind = match c {
			'{' => TokenKind::Open,
			'}' => TokenKind::Close,
			'=' => {
				if self.chars.peek() == Some(&'=') {
					self.bump();
					TokenKind::Op(Operator::Equal)
				} else {
					TokenKind::Op(Operator::Assign)
				}
			}
			'<' | '>' => {
				let or_equal = self.chars.peek() == Some(&'=');
				if or_equal {
					self.bump();
				}
				TokenKind::Op(match (c, or_equal) {
					('<', false) => Operator::Less,
					('<', true) => Operator::LessOrEqual,
					(_, false) => Operator::Greater,
					(_, true) => Operator::GreaterOrEqual,
				})
			}
			'!' | '?' => {
				if self.bump() != Some('=') {
					return Err(self.error(line, column, format!("expected '=' after '{c}'")));
				}
				TokenKind::Op(if c == '!' {
					Operator::NotEqual
				} else {
					Operator::Exists
				})
			}
			'"' => {
				let mut text = String::new();
				loop {
					match self.bump() {
						None => return Err(self.error(line, column, "unterminated string")),
						Some('"') => break,
						Some('\\') => match self.bump() {
							Some(escaped) => text.push(escaped),
							None => return Err(self.error(line, column, "unterminated string")),
						},
						Some(other) => text.push(other),
					}
				}
				TokenKind::Quoted(text)
			}
			first => {
				let mut word = String::from(first);
				while let Some(&next) = self.chars.peek() {
					if next.is_whitespace() || is_delimiter(next) {
						break;
					}
					word.push(next);
					self.bump();
				}
				TokenKind::Word(word)
			}
		};

		Ok(Some(Token { kind, line, column }))
	}
}
